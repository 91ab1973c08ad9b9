//! The command/response bridge between the state machine and the wire.
//!
//! The negotiator never touches sockets: it issues [`Command`]s through the
//! [`RtspTransport`] trait and consumes the matching
//! [`Event::CommandResult`](crate::runtime::Event::CommandResult) later.
//! Results are delivered in issue order for a given connection; the state
//! machine relies on that to assume, e.g., that a DESCRIBE result cannot
//! arrive before its OPTIONS result.
//!
//! [`tcp::TcpRtspConnection`] is the production implementation; tests drive
//! the state machine with a scripted mock instead.

pub mod auth;
pub mod tcp;
pub mod udp;

use crate::error::Result;
use crate::session::{SubsessionId, Subsession};
use crate::sink::SinkHandle;

pub use tcp::TcpRtspConnection;

/// Media transport mode, chosen once at start and fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// RTP/RTCP over dedicated UDP port pairs (default).
    Udp,
    /// RTP/RTCP interleaved on the control connection (RFC 2326 §10.12).
    Tcp,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Udp => write!(f, "UDP"),
            TransportMode::Tcp => write!(f, "TCP"),
        }
    }
}

/// An outbound RTSP command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// OPTIONS; `keepalive` marks liveness probes whose result must not
    /// affect the state machine.
    Options { keepalive: bool },
    Describe,
    Setup(SubsessionId),
    Play(PlayRange),
    /// Fire-and-forget; the result is never awaited.
    Teardown,
}

/// Range form for the PLAY request.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayRange {
    /// Plain form: `Range: npt=0.000-`.
    Npt,
    /// Absolute form for streams indexed by wall-clock time.
    Clock { start: String, end: Option<String> },
}

/// Which command a [`CommandResult`](crate::runtime::Event::CommandResult)
/// resolves. Keep-alive OPTIONS are tagged separately from the negotiation
/// OPTIONS so their failures stay non-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Options,
    Keepalive,
    Describe,
    Setup(SubsessionId),
    Play,
    Teardown,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Options { keepalive: false } => CommandKind::Options,
            Command::Options { keepalive: true } => CommandKind::Keepalive,
            Command::Describe => CommandKind::Describe,
            Command::Setup(id) => CommandKind::Setup(*id),
            Command::Play(_) => CommandKind::Play,
            Command::Teardown => CommandKind::Teardown,
        }
    }
}

/// Resolution of one issued command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// 2xx response; `body` carries the payload (SDP for DESCRIBE).
    Success { body: String },
    /// Non-2xx response or connection-level failure.
    Failure { reason: String },
}

/// Contract the state machine drives the wire through.
///
/// One implementation per connection; all methods are called from the
/// dispatch thread only.
pub trait RtspTransport: Send {
    /// Send a command. The matching result arrives later as an event;
    /// an `Err` here means the command could not even be written.
    fn issue(&mut self, command: Command) -> Result<()>;

    /// Prepare local receive resources for a subsession before SETUP:
    /// bind the UDP port pair (sizing the receive buffer by medium) or
    /// allocate interleaved channels. Failure is non-fatal to the session;
    /// the negotiator skips the subsession.
    fn initiate(&mut self, id: SubsessionId, subsession: &mut Subsession) -> Result<()>;

    /// Start pulling (and discarding) data for a set-up subsession.
    fn start_sink(&mut self, id: SubsessionId, subsession: &Subsession) -> Result<SinkHandle>;

    /// Release the connection. Called exactly once, after the event loop
    /// has stopped.
    fn close(&mut self);
}
