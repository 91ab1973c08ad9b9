//! The probe client: negotiation state machine, liveness monitor, and
//! session lifecycle tracking.
//!
//! [`ProbeClient::run`] drives one session end to end:
//!
//! ```text
//! OPTIONS -> DESCRIBE -> SETUP (per subsession) -> PLAY -> playing
//! ```
//!
//! and then waits for one of the stop conditions: every subsession ends
//! (RTCP BYE or receive-path death), the declared stream duration elapses,
//! the liveness window passes with no data, or a fatal command failure.
//! Failures before PLAY abort the run, except per-subsession SETUP
//! failures, which skip the subsession (recording the error) and carry on
//! with the rest. Whatever the path out, teardown runs exactly once and
//! `run` reports through its `Result` whether anything went wrong along
//! the way.

use std::time::{Duration, Instant};

use url::Url;

use crate::error::{ProbeError, Result};
use crate::runtime::{Event, EventSender, Reactor, TimerKind, Wake};
use crate::session::{SessionDescription, StreamBounds, SubsessionId};
use crate::transport::{
    Command, CommandKind, CommandOutcome, PlayRange, RtspTransport, TcpRtspConnection,
    TransportMode,
};

/// Interval between liveness checks (and keep-alive pings).
const CHECK_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// A session silent for strictly more than this many milliseconds is
/// declared dead. Whole-millisecond comparison: a check landing at
/// exactly the limit does not trigger.
const LIVENESS_TIMEOUT_MS: u128 = 30_000;
/// Grace added to the declared stream duration before the probe stops
/// waiting for the stream to end on its own.
const DURATION_SLACK: Duration = Duration::from_secs(2);

/// Probe parameters. Construct with [`ProbeConfig::new`] and refine with
/// the builder methods.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
    pub transport: TransportMode,
    /// Send keep-alive OPTIONS pings on the liveness interval.
    pub keepalive: bool,
}

impl ProbeConfig {
    pub fn new(url: Url) -> Self {
        ProbeConfig {
            url,
            username: None,
            password: None,
            transport: TransportMode::Udp,
            keepalive: true,
        }
    }

    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn transport(mut self, mode: TransportMode) -> Self {
        self.transport = mode;
        self
    }

    #[must_use]
    pub fn keepalive(mut self, enabled: bool) -> Self {
        self.keepalive = enabled;
        self
    }
}

/// Where the session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    Idle,
    AwaitingOptions,
    AwaitingDescribe,
    SettingUp,
    AwaitingPlay,
    Playing,
    ShuttingDown,
    Closed,
}

/// One RTSP probe session.
pub struct ProbeClient {
    config: ProbeConfig,
    reactor: Reactor,
    transport: Box<dyn RtspTransport>,
    state: ProbeState,
    description: Option<SessionDescription>,
    /// Index of the subsession whose SETUP is next (or in flight).
    setup_cursor: usize,
    /// Declared play duration in seconds; zero means unbounded.
    duration: f64,
    /// Arrival time of the most recent media frame on any subsession.
    last_packet: Instant,
    /// True once any subsession's SETUP succeeded; gates TEARDOWN.
    session_established: bool,
    /// Sticky: set by any failure, fatal or degrading, and reported once
    /// at the end of the run.
    failed: bool,
}

impl ProbeClient {
    /// Connect the control channel and build a client ready to run.
    pub fn connect(config: ProbeConfig) -> Result<Self> {
        let reactor = Reactor::new();
        let credentials = config
            .username
            .clone()
            .map(|user| (user, config.password.clone().unwrap_or_default()));
        let transport = TcpRtspConnection::connect(
            &config.url,
            credentials,
            config.transport,
            reactor.sender(),
        )?;
        Ok(Self::with_transport(config, reactor, Box::new(transport)))
    }

    /// Build a client over an arbitrary transport. The transport must
    /// deliver its command results through `reactor`'s sender.
    pub fn with_transport(
        config: ProbeConfig,
        reactor: Reactor,
        transport: Box<dyn RtspTransport>,
    ) -> Self {
        ProbeClient {
            config,
            reactor,
            transport,
            state: ProbeState::Idle,
            description: None,
            setup_cursor: 0,
            duration: 0.0,
            last_packet: Instant::now(),
            session_established: false,
            failed: false,
        }
    }

    /// Sender for delivering events into this client's dispatch loop.
    pub fn events(&self) -> EventSender {
        self.reactor.sender()
    }

    /// Drive one probe session to completion.
    ///
    /// Returns `Ok(())` only if the whole run was clean; any failure along
    /// the way (even one the session survived, like a skipped subsession)
    /// yields [`ProbeError::ProbeFailed`].
    pub fn run(&mut self) -> Result<()> {
        self.description = None;
        self.setup_cursor = 0;
        self.duration = 0.0;
        self.session_established = false;
        self.failed = false;
        self.last_packet = Instant::now();

        tracing::info!(url = %self.config.url, transport = %self.config.transport, "probing");
        self.state = ProbeState::AwaitingOptions;
        if let Err(e) = self.transport.issue(Command::Options { keepalive: false }) {
            self.fail(format!("could not send OPTIONS: {}", e));
        }

        while self.state != ProbeState::ShuttingDown {
            let wake = self.reactor.wait();
            self.dispatch(wake);
        }

        self.reactor.cancel(TimerKind::Liveness);
        self.reactor.cancel(TimerKind::StreamDuration);
        self.description = None;
        self.transport.close();
        self.state = ProbeState::Closed;

        if self.failed {
            Err(ProbeError::ProbeFailed)
        } else {
            tracing::info!("probe finished cleanly");
            Ok(())
        }
    }

    fn dispatch(&mut self, wake: Wake) {
        match wake {
            Wake::Event(Event::CommandResult { command, outcome }) => {
                self.on_command_result(command, outcome)
            }
            Wake::Event(Event::Frame { subsession, bytes }) => {
                tracing::trace!(%subsession, bytes, "frame");
                self.last_packet = Instant::now();
            }
            Wake::Event(Event::SubsessionBye(id)) => {
                tracing::info!(subsession = %id, "stream ended (BYE)");
                self.on_subsession_finished(id);
            }
            Wake::Event(Event::SubsessionFinished(id)) => self.on_subsession_finished(id),
            Wake::Event(Event::TransportClosed { reason }) => {
                if self.state != ProbeState::ShuttingDown {
                    self.fail(format!("control connection lost: {}", reason));
                }
            }
            Wake::Timer(TimerKind::Liveness) => self.on_liveness_check(),
            Wake::Timer(TimerKind::StreamDuration) => {
                tracing::info!("declared stream duration elapsed");
                self.shutdown();
            }
        }
    }

    fn on_command_result(&mut self, command: CommandKind, outcome: CommandOutcome) {
        match command {
            CommandKind::Keepalive => {
                if let CommandOutcome::Failure { reason } = outcome {
                    // A missed ping is not a verdict on the stream.
                    tracing::warn!(%reason, "keep-alive ping failed");
                }
            }
            CommandKind::Options => match outcome {
                CommandOutcome::Success { .. } if self.state == ProbeState::AwaitingOptions => {
                    tracing::debug!("server reachable, describing");
                    self.state = ProbeState::AwaitingDescribe;
                    if let Err(e) = self.transport.issue(Command::Describe) {
                        self.fail(format!("could not send DESCRIBE: {}", e));
                    }
                }
                CommandOutcome::Failure { reason } => {
                    self.fail(format!("OPTIONS failed: {}", reason))
                }
                CommandOutcome::Success { .. } => self.unexpected(command),
            },
            CommandKind::Describe => match outcome {
                CommandOutcome::Success { body } if self.state == ProbeState::AwaitingDescribe => {
                    self.on_description(body)
                }
                CommandOutcome::Failure { reason } => {
                    self.fail(format!("DESCRIBE failed: {}", reason))
                }
                CommandOutcome::Success { .. } => self.unexpected(command),
            },
            CommandKind::Setup(id) => match outcome {
                CommandOutcome::Success { .. } if self.state == ProbeState::SettingUp => {
                    self.on_setup_success(id);
                    self.setup_cursor = id.0 + 1;
                    self.setup_next();
                }
                CommandOutcome::Failure { reason } if self.state == ProbeState::SettingUp => {
                    tracing::warn!(subsession = %id, %reason, "SETUP failed, skipping subsession");
                    self.failed = true;
                    self.setup_cursor = id.0 + 1;
                    self.setup_next();
                }
                _ => self.unexpected(command),
            },
            CommandKind::Play => match outcome {
                CommandOutcome::Success { .. } if self.state == ProbeState::AwaitingPlay => {
                    self.state = ProbeState::Playing;
                    tracing::info!(duration = self.duration, "playing");
                    if self.duration > 0.0 {
                        self.reactor.arm(
                            TimerKind::StreamDuration,
                            Duration::from_secs_f64(self.duration) + DURATION_SLACK,
                        );
                    }
                }
                CommandOutcome::Failure { reason } => {
                    self.fail(format!("PLAY failed: {}", reason))
                }
                CommandOutcome::Success { .. } => self.unexpected(command),
            },
            // Fire-and-forget; by the time a result could arrive the
            // dispatch loop has normally already stopped.
            CommandKind::Teardown => {}
        }
    }

    fn on_description(&mut self, body: String) {
        let description = match SessionDescription::parse(body.as_bytes(), &self.config.url) {
            Ok(description) => description,
            Err(e) => {
                self.fail(format!("bad session description: {}", e));
                return;
            }
        };
        if description.subsessions.is_empty() {
            self.fail("session description has no media".to_string());
            return;
        }

        self.duration = description.bounds.duration();
        tracing::info!(
            name = %description.name,
            subsessions = description.subsessions.len(),
            duration = self.duration,
            "session described"
        );

        self.description = Some(description);
        self.state = ProbeState::SettingUp;
        self.setup_cursor = 0;
        self.setup_next();
    }

    /// Advance the SETUP loop: initiate and set up the subsession at the
    /// cursor, skipping ones whose local resources cannot be prepared.
    /// Once every subsession has been visited, move on to PLAY.
    fn setup_next(&mut self) {
        loop {
            let Some(description) = self.description.as_mut() else {
                return;
            };
            let Some(subsession) = description.subsessions.get_mut(self.setup_cursor) else {
                break;
            };
            let id = SubsessionId(self.setup_cursor);

            if let Err(e) = self.transport.initiate(id, subsession) {
                tracing::warn!(
                    subsession = %id,
                    label = %subsession.label(),
                    error = %e,
                    "cannot prepare reception, skipping subsession"
                );
                self.failed = true;
                self.setup_cursor += 1;
                continue;
            }

            tracing::info!(subsession = %id, label = %subsession.label(), "setting up");
            match self.transport.issue(Command::Setup(id)) {
                Ok(()) => return, // resumes when the SETUP result arrives
                Err(e) => {
                    tracing::warn!(subsession = %id, error = %e, "could not send SETUP, skipping");
                    self.failed = true;
                    self.setup_cursor += 1;
                }
            }
        }

        // Every subsession has been attempted; PLAY goes out even when all
        // of them were skipped. The sticky flag already reports the damage.
        let range = match self.description.as_ref().map(|d| &d.bounds) {
            Some(StreamBounds::Clock { start, end }) => PlayRange::Clock {
                start: start.clone(),
                end: end.clone(),
            },
            _ => PlayRange::Npt,
        };
        self.state = ProbeState::AwaitingPlay;
        if let Err(e) = self.transport.issue(Command::Play(range)) {
            self.fail(format!("could not send PLAY: {}", e));
        }
    }

    fn on_setup_success(&mut self, id: SubsessionId) {
        let Some(description) = self.description.as_mut() else {
            return;
        };
        let Some(subsession) = description.subsessions.get(id.0) else {
            return;
        };

        tracing::info!(
            subsession = %id,
            label = %subsession.label(),
            rtp_port = subsession.local_rtp_port,
            "subsession set up"
        );
        self.session_established = true;

        match self.transport.start_sink(id, subsession) {
            Ok(sink) => {
                description.subsessions[id.0].sink = Some(sink);
                // The liveness clock starts when the first sink starts;
                // armed once, it rearms itself on every check.
                if !self.reactor.is_armed(TimerKind::Liveness) {
                    self.last_packet = Instant::now();
                    self.reactor.arm(TimerKind::Liveness, CHECK_ALIVE_INTERVAL);
                }
            }
            Err(e) => {
                tracing::warn!(subsession = %id, error = %e, "could not start sink");
                self.failed = true;
            }
        }
    }

    fn on_subsession_finished(&mut self, id: SubsessionId) {
        let Some(description) = self.description.as_mut() else {
            return;
        };
        let Some(subsession) = description.subsessions.get_mut(id.0) else {
            return;
        };
        if let Some(mut sink) = subsession.sink.take() {
            tracing::info!(subsession = %id, label = %subsession.label(), "subsession finished");
            sink.close();
        }
        if !description.any_sink_active() {
            tracing::info!("all subsessions finished");
            self.shutdown();
        }
    }

    fn on_liveness_check(&mut self) {
        if self.state == ProbeState::ShuttingDown {
            return;
        }
        let silent_ms = self.last_packet.elapsed().as_millis();
        if silent_ms > LIVENESS_TIMEOUT_MS {
            self.fail(format!("no data received for {} ms", silent_ms));
            return;
        }
        tracing::debug!(silent_ms = silent_ms as u64, "stream alive");
        if self.config.keepalive {
            if let Err(e) = self.transport.issue(Command::Options { keepalive: true }) {
                tracing::warn!(error = %e, "could not send keep-alive ping");
            }
        }
        self.reactor.arm(TimerKind::Liveness, CHECK_ALIVE_INTERVAL);
    }

    /// Record a failure that ends the run.
    fn fail(&mut self, reason: String) {
        tracing::error!(%reason, "probe failed");
        self.failed = true;
        self.shutdown();
    }

    fn unexpected(&mut self, command: CommandKind) {
        tracing::warn!(?command, state = ?self.state, "result in unexpected state, ignoring");
    }

    /// Stop the session: close every sink, send a single fire-and-forget
    /// TEARDOWN if anything was set up, and let the dispatch loop exit.
    /// Safe to hit from multiple stop paths; only the first one acts.
    fn shutdown(&mut self) {
        if matches!(self.state, ProbeState::ShuttingDown | ProbeState::Closed) {
            return;
        }
        tracing::debug!(state = ?self.state, "shutting down");
        self.state = ProbeState::ShuttingDown;
        self.reactor.cancel(TimerKind::Liveness);
        self.reactor.cancel(TimerKind::StreamDuration);

        if let Some(description) = self.description.as_mut() {
            for subsession in &mut description.subsessions {
                if let Some(mut sink) = subsession.sink.take() {
                    sink.close();
                }
            }
        }

        if self.session_established {
            if let Err(e) = self.transport.issue(Command::Teardown) {
                tracing::debug!(error = %e, "TEARDOWN not sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Subsession;
    use crate::sink::SinkHandle;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    struct RecordingTransport {
        issued: Arc<Mutex<Vec<CommandKind>>>,
    }

    impl RtspTransport for RecordingTransport {
        fn issue(&mut self, command: Command) -> Result<()> {
            self.issued.lock().push(command.kind());
            Ok(())
        }

        fn initiate(&mut self, _id: SubsessionId, _subsession: &mut Subsession) -> Result<()> {
            Ok(())
        }

        fn start_sink(&mut self, _id: SubsessionId, _subsession: &Subsession) -> Result<SinkHandle> {
            Ok(SinkHandle::detached(Arc::new(AtomicBool::new(true))))
        }

        fn close(&mut self) {}
    }

    fn make_client() -> (ProbeClient, Arc<Mutex<Vec<CommandKind>>>) {
        let issued = Arc::new(Mutex::new(Vec::new()));
        let config = ProbeConfig::new(Url::parse("rtsp://host/stream").unwrap());
        let transport = RecordingTransport {
            issued: issued.clone(),
        };
        let client = ProbeClient::with_transport(config, Reactor::new(), Box::new(transport));
        (client, issued)
    }

    fn success() -> CommandOutcome {
        CommandOutcome::Success {
            body: String::new(),
        }
    }

    fn failure() -> CommandOutcome {
        CommandOutcome::Failure {
            reason: "503 Service Unavailable".to_string(),
        }
    }

    #[test]
    fn keepalive_failure_is_not_fatal() {
        let (mut client, _) = make_client();
        client.state = ProbeState::Playing;
        client.on_command_result(CommandKind::Keepalive, failure());
        assert!(!client.failed);
        assert_eq!(client.state, ProbeState::Playing);
    }

    #[test]
    fn quiet_stream_survives_checks_inside_the_window() {
        let (mut client, issued) = make_client();
        client.state = ProbeState::Playing;
        client.last_packet = Instant::now() - Duration::from_secs(29);
        client.on_liveness_check();
        assert!(!client.failed);
        assert!(client.reactor.is_armed(TimerKind::Liveness));
        assert_eq!(issued.lock().as_slice(), &[CommandKind::Keepalive]);
    }

    #[test]
    fn silence_of_exactly_the_window_is_tolerated() {
        let (mut client, _) = make_client();
        client.config.keepalive = false;
        client.state = ProbeState::Playing;
        client.last_packet = Instant::now() - Duration::from_millis(30_000);
        client.on_liveness_check();
        assert!(!client.failed);
        assert!(client.reactor.is_armed(TimerKind::Liveness));
    }

    #[test]
    fn silence_one_millisecond_past_the_window_kills_the_session() {
        let (mut client, issued) = make_client();
        client.state = ProbeState::Playing;
        client.last_packet = Instant::now() - Duration::from_millis(30_001);
        client.on_liveness_check();
        assert!(client.failed);
        assert_eq!(client.state, ProbeState::ShuttingDown);
        assert!(!client.reactor.is_armed(TimerKind::Liveness));
        // Nothing was ever set up, so no TEARDOWN either.
        assert!(issued.lock().is_empty());
    }

    #[test]
    fn pings_can_be_disabled() {
        let (mut client, issued) = make_client();
        client.config.keepalive = false;
        client.state = ProbeState::Playing;
        client.last_packet = Instant::now();
        client.on_liveness_check();
        assert!(issued.lock().is_empty());
        assert!(client.reactor.is_armed(TimerKind::Liveness));
    }

    #[test]
    fn duration_timer_armed_only_for_bounded_streams() {
        let (mut client, _) = make_client();
        client.state = ProbeState::AwaitingPlay;
        client.duration = 0.0;
        client.on_command_result(CommandKind::Play, success());
        assert_eq!(client.state, ProbeState::Playing);
        assert!(!client.reactor.is_armed(TimerKind::StreamDuration));

        let (mut client, _) = make_client();
        client.state = ProbeState::AwaitingPlay;
        client.duration = 12.5;
        client.on_command_result(CommandKind::Play, success());
        assert!(client.reactor.is_armed(TimerKind::StreamDuration));
    }

    #[test]
    fn shutdown_sends_exactly_one_teardown() {
        let (mut client, issued) = make_client();
        client.state = ProbeState::Playing;
        client.session_established = true;
        client.shutdown();
        client.shutdown();
        assert_eq!(issued.lock().as_slice(), &[CommandKind::Teardown]);
    }

    #[test]
    fn stray_results_are_ignored() {
        let (mut client, issued) = make_client();
        client.state = ProbeState::AwaitingOptions;
        client.on_command_result(CommandKind::Play, success());
        assert_eq!(client.state, ProbeState::AwaitingOptions);
        assert!(!client.failed);
        assert!(issued.lock().is_empty());
    }
}
