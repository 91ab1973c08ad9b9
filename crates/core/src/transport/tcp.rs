//! The RTSP control connection.
//!
//! [`TcpRtspConnection`] owns the TCP stream to the server and a reader
//! thread. Requests are written from the dispatch thread; the reader
//! thread parses whatever comes back (responses and interleaved `$` data
//! frames) and pushes [`Event`]s into the reactor. Responses are matched
//! to requests in FIFO order, which RTSP guarantees on a single
//! connection (RFC 2326 §12.17).
//!
//! A 401 response is answered once per request: the `WWW-Authenticate`
//! challenge is parsed, stored for the rest of the connection, and the
//! request is re-sent with an `Authorization` header. A second 401 for
//! the same command is delivered as a plain failure.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rtsp_types::{HeaderName, Message, Method, Request, Response, StatusCode, Version, headers};
use url::Url;

use crate::error::{ProbeError, Result};
use crate::runtime::{Event, EventSender};
use crate::session::{SubsessionId, Subsession};
use crate::sink::{self, SinkHandle};
use crate::transport::auth::Challenge;
use crate::transport::udp;
use crate::transport::{Command, CommandKind, CommandOutcome, PlayRange, RtspTransport, TransportMode};

const USER_AGENT: &str = concat!("rtsp-probe/", env!("CARGO_PKG_VERSION"));
const DEFAULT_RTSP_PORT: u16 = 554;
const READ_CHUNK: usize = 8192;

/// Local receive resources prepared for one subsession.
enum LocalMedia {
    /// Dedicated port pair; sockets are handed to the sink thread when
    /// playback starts.
    Udp {
        rtp: Option<UdpSocket>,
        rtcp: Option<UdpSocket>,
        rtp_port: u16,
    },
    /// Interleaved channel pair `rtp_channel`/`rtp_channel + 1` on this
    /// connection.
    Tcp { rtp_channel: u8 },
}

struct SetupTarget {
    control: Url,
    local: LocalMedia,
}

/// Routing entry for one interleaved channel.
struct ChannelSink {
    id: SubsessionId,
    rtcp: bool,
    running: Arc<AtomicBool>,
}

/// One queued request awaiting its response, with everything needed to
/// re-send it after an authentication challenge.
struct Pending {
    cseq: u32,
    kind: CommandKind,
    method: Method,
    uri: Url,
    extra_headers: Vec<(HeaderName, String)>,
    retried: bool,
}

/// State shared between the dispatch thread and the reader thread.
struct Shared {
    writer: Mutex<TcpStream>,
    url: Url,
    credentials: Option<(String, String)>,
    cseq: AtomicU32,
    auth: Mutex<Option<Challenge>>,
    session_id: Mutex<Option<String>>,
    pending: Mutex<VecDeque<Pending>>,
    channels: Mutex<HashMap<u8, ChannelSink>>,
    events: EventSender,
}

impl Shared {
    /// Serialize and write one request, registering it as pending first so
    /// the reader can never see a response for an unregistered request.
    fn send_request(
        &self,
        kind: CommandKind,
        method: Method,
        uri: Url,
        extra_headers: Vec<(HeaderName, String)>,
        retried: bool,
    ) -> Result<()> {
        let cseq = self.cseq.fetch_add(1, Ordering::SeqCst);

        let mut builder = Request::builder(method.clone(), Version::V1_0)
            .request_uri(uri.clone())
            .header(headers::CSEQ, cseq.to_string())
            .header(headers::USER_AGENT, USER_AGENT);

        let session_id = self.session_id.lock().clone();
        if let Some(session_id) = session_id {
            builder = builder.header(headers::SESSION, session_id);
        }

        if let Some((username, password)) = &self.credentials {
            if let Some(challenge) = self.auth.lock().as_mut() {
                let value =
                    challenge.authorization(username, password, method_token(&method), uri.as_str());
                builder = builder.header(headers::AUTHORIZATION, value);
            }
        }

        for (name, value) in &extra_headers {
            builder = builder.header(name.clone(), value.clone());
        }

        let request = builder.build(Vec::<u8>::new());
        let mut wire = Vec::new();
        request.write(&mut wire).map_err(|e| ProbeError::Protocol {
            details: format!("failed to serialize request: {:?}", e),
        })?;

        tracing::debug!(?method, cseq, "sending request");
        tracing::trace!(raw = %String::from_utf8_lossy(&wire), "request on the wire");

        // The writer lock is held across both the pending push and the
        // write so the pending queue stays in wire order even when the
        // reader thread re-sends a challenged request concurrently.
        let mut writer = self.writer.lock();
        self.pending.lock().push_back(Pending {
            cseq,
            kind,
            method: method.clone(),
            uri,
            extra_headers,
            retried,
        });
        if let Err(e) = writer.write_all(&wire) {
            // The write failed; the reader will never see a response.
            self.pending.lock().pop_back();
            return Err(e.into());
        }
        Ok(())
    }
}

/// Production transport: one TCP control connection plus per-subsession
/// media reception (UDP port pairs or interleaved channels).
pub struct TcpRtspConnection {
    shared: Arc<Shared>,
    mode: TransportMode,
    targets: HashMap<SubsessionId, SetupTarget>,
    next_channel: u8,
    reader: Option<JoinHandle<()>>,
}

impl TcpRtspConnection {
    /// Connect to the server named by `url` and start the reader thread.
    ///
    /// Credentials embedded in the URL are used when no explicit ones are
    /// given, and stripped from the request URL either way.
    pub fn connect(
        url: &Url,
        credentials: Option<(String, String)>,
        mode: TransportMode,
        events: EventSender,
    ) -> Result<Self> {
        let host = url.host_str().ok_or_else(|| ProbeError::InvalidUrl {
            url: url.as_str().to_string(),
            reason: "missing host".to_string(),
        })?;
        let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);

        let credentials = credentials.or_else(|| {
            if url.username().is_empty() {
                None
            } else {
                Some((
                    url.username().to_string(),
                    url.password().unwrap_or_default().to_string(),
                ))
            }
        });

        let mut request_url = url.clone();
        let _ = request_url.set_username("");
        let _ = request_url.set_password(None);

        tracing::info!(host, port, %mode, "connecting");
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        let reader_stream = stream.try_clone()?;

        let shared = Arc::new(Shared {
            writer: Mutex::new(stream),
            url: request_url,
            credentials,
            cseq: AtomicU32::new(1),
            auth: Mutex::new(None),
            session_id: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            channels: Mutex::new(HashMap::new()),
            events,
        });

        let reader = {
            let shared = shared.clone();
            std::thread::spawn(move || reader_loop(reader_stream, shared))
        };

        Ok(TcpRtspConnection {
            shared,
            mode,
            targets: HashMap::new(),
            next_channel: 0,
            reader: Some(reader),
        })
    }

    /// Method, target URL, and command-specific headers for a command.
    fn request_parts(&self, command: &Command) -> Result<(Method, Url, Vec<(HeaderName, String)>)> {
        let base = self.shared.url.clone();
        match command {
            Command::Options { .. } => Ok((Method::Options, base, Vec::new())),
            Command::Describe => Ok((
                Method::Describe,
                base,
                vec![(headers::ACCEPT, "application/sdp".to_string())],
            )),
            Command::Setup(id) => {
                let target = self.targets.get(id).ok_or_else(|| ProbeError::Protocol {
                    details: format!("subsession {} was not initiated", id),
                })?;
                let transport = match &target.local {
                    LocalMedia::Udp { rtp_port, .. } => format!(
                        "RTP/AVP;unicast;client_port={}-{}",
                        rtp_port,
                        rtp_port + 1
                    ),
                    LocalMedia::Tcp { rtp_channel } => format!(
                        "RTP/AVP/TCP;unicast;interleaved={}-{}",
                        rtp_channel,
                        rtp_channel + 1
                    ),
                };
                Ok((
                    Method::Setup,
                    target.control.clone(),
                    vec![(headers::TRANSPORT, transport)],
                ))
            }
            Command::Play(range) => {
                let value = match range {
                    PlayRange::Npt => "npt=0.000-".to_string(),
                    PlayRange::Clock { start, end } => {
                        format!("clock={}-{}", start, end.as_deref().unwrap_or(""))
                    }
                };
                Ok((Method::Play, base, vec![(headers::RANGE, value)]))
            }
            Command::Teardown => Ok((Method::Teardown, base, Vec::new())),
        }
    }
}

impl RtspTransport for TcpRtspConnection {
    fn issue(&mut self, command: Command) -> Result<()> {
        let kind = command.kind();
        let (method, uri, extra) = self.request_parts(&command)?;
        self.shared.send_request(kind, method, uri, extra, false)
    }

    fn initiate(&mut self, id: SubsessionId, subsession: &mut Subsession) -> Result<()> {
        let control =
            Url::parse(&subsession.control).map_err(|e| ProbeError::InvalidUrl {
                url: subsession.control.clone(),
                reason: e.to_string(),
            })?;

        let local = match self.mode {
            TransportMode::Udp => {
                let (rtp, rtcp, rtp_port) = udp::bind_media_pair(&subsession.medium)?;
                subsession.local_rtp_port = Some(rtp_port);
                LocalMedia::Udp {
                    rtp: Some(rtp),
                    rtcp: Some(rtcp),
                    rtp_port,
                }
            }
            TransportMode::Tcp => {
                let rtp_channel = self.next_channel;
                self.next_channel += 2;
                LocalMedia::Tcp { rtp_channel }
            }
        };

        self.targets.insert(id, SetupTarget { control, local });
        Ok(())
    }

    fn start_sink(&mut self, id: SubsessionId, subsession: &Subsession) -> Result<SinkHandle> {
        let target = self.targets.get_mut(&id).ok_or_else(|| ProbeError::Protocol {
            details: format!("subsession {} was not initiated", id),
        })?;

        match &mut target.local {
            LocalMedia::Udp { rtp, rtcp, .. } => {
                let (rtp, rtcp) = match (rtp.take(), rtcp.take()) {
                    (Some(rtp), Some(rtcp)) => (rtp, rtcp),
                    _ => {
                        return Err(ProbeError::Protocol {
                            details: format!("sink for subsession {} already started", id),
                        });
                    }
                };
                let handle = sink::spawn_udp_sink(
                    id,
                    subsession.label(),
                    rtp,
                    rtcp,
                    self.shared.events.clone(),
                    tracing::enabled!(tracing::Level::TRACE),
                )?;
                Ok(handle)
            }
            LocalMedia::Tcp { rtp_channel } => {
                let running = Arc::new(AtomicBool::new(true));
                let mut channels = self.shared.channels.lock();
                channels.insert(
                    *rtp_channel,
                    ChannelSink {
                        id,
                        rtcp: false,
                        running: running.clone(),
                    },
                );
                channels.insert(
                    *rtp_channel + 1,
                    ChannelSink {
                        id,
                        rtcp: true,
                        running: running.clone(),
                    },
                );
                Ok(SinkHandle::detached(running))
            }
        }
    }

    fn close(&mut self) {
        {
            let writer = self.shared.writer.lock();
            let _ = writer.shutdown(Shutdown::Both);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.shared.channels.lock().clear();
        tracing::debug!("control connection closed");
    }
}

impl Drop for TcpRtspConnection {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.close();
        }
    }
}

/// Request-method token as it appears on the wire (used in the Digest
/// response hash, where case matters).
fn method_token(method: &Method) -> &'static str {
    match method {
        Method::Options => "OPTIONS",
        Method::Describe => "DESCRIBE",
        Method::Setup => "SETUP",
        Method::Play => "PLAY",
        Method::Teardown => "TEARDOWN",
        // The probe never sends anything else.
        _ => "OPTIONS",
    }
}

/// Reader-thread main loop: accumulate bytes, parse out complete RTSP
/// messages, dispatch each one. Exits (announcing [`Event::TransportClosed`])
/// on EOF, a read error, or unparseable input.
fn reader_loop(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => {
                shared.events.send(Event::TransportClosed {
                    reason: "connection closed by server".to_string(),
                });
                return;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                shared.events.send(Event::TransportClosed {
                    reason: e.to_string(),
                });
                return;
            }
        }

        loop {
            match Message::<Vec<u8>>::parse(&buf) {
                Ok((message, consumed)) => {
                    buf.drain(..consumed);
                    handle_message(&shared, message);
                }
                Err(rtsp_types::ParseError::Incomplete(_)) => break,
                Err(e) => {
                    shared.events.send(Event::TransportClosed {
                        reason: format!("unparseable RTSP message: {:?}", e),
                    });
                    return;
                }
            }
        }
    }
}

fn handle_message(shared: &Shared, message: Message<Vec<u8>>) {
    match message {
        Message::Response(response) => handle_response(shared, response),
        Message::Data(data) => {
            let channel_id = data.channel_id();
            let (id, rtcp) = {
                let channels = shared.channels.lock();
                match channels.get(&channel_id) {
                    Some(channel) if channel.running.load(Ordering::SeqCst) => {
                        (channel.id, channel.rtcp)
                    }
                    Some(_) => return,
                    None => {
                        tracing::trace!(channel = channel_id, "data on unmapped channel");
                        return;
                    }
                }
            };
            let body = data.into_body();
            if rtcp {
                if sink::is_rtcp_bye(&body) {
                    tracing::debug!(subsession = %id, "RTCP BYE received");
                    shared.events.send(Event::SubsessionBye(id));
                }
            } else {
                shared.events.send(Event::Frame {
                    subsession: id,
                    bytes: body.len(),
                });
            }
        }
        Message::Request(request) => {
            // Servers may ping clients with OPTIONS or announce state
            // changes; none of it affects the probe.
            tracing::trace!(method = ?request.method(), "ignoring server-initiated request");
        }
    }
}

fn handle_response(shared: &Shared, response: Response<Vec<u8>>) {
    let Some(pending) = shared.pending.lock().pop_front() else {
        tracing::warn!(status = ?response.status(), "response with no pending request");
        return;
    };

    if let Some(cseq) = response.header(&headers::CSEQ) {
        if cseq.as_str().trim() != pending.cseq.to_string() {
            tracing::warn!(
                expected = pending.cseq,
                got = cseq.as_str(),
                "CSeq mismatch, matching by order",
            );
        }
    }

    let status = response.status();
    tracing::debug!(?status, cseq = pending.cseq, command = ?pending.kind, "response");

    if status == StatusCode::Unauthorized && !pending.retried && shared.credentials.is_some() {
        let challenge = response
            .header(&headers::WWW_AUTHENTICATE)
            .ok_or_else(|| ProbeError::Auth {
                reason: "401 without WWW-Authenticate".to_string(),
            })
            .and_then(|header| Challenge::parse(header.as_str()));
        match challenge {
            Ok(challenge) => {
                tracing::debug!(realm = %challenge.realm, scheme = ?challenge.scheme, "authenticating");
                *shared.auth.lock() = Some(challenge);
                if let Err(e) = shared.send_request(
                    pending.kind,
                    pending.method,
                    pending.uri,
                    pending.extra_headers,
                    true,
                ) {
                    shared.events.send(Event::CommandResult {
                        command: pending.kind,
                        outcome: CommandOutcome::Failure {
                            reason: format!("authentication retry failed: {}", e),
                        },
                    });
                }
            }
            Err(e) => {
                shared.events.send(Event::CommandResult {
                    command: pending.kind,
                    outcome: CommandOutcome::Failure {
                        reason: e.to_string(),
                    },
                });
            }
        }
        return;
    }

    let outcome = if status == StatusCode::Ok {
        if matches!(pending.kind, CommandKind::Setup(_)) {
            if let Some(session) = response.header(&headers::SESSION) {
                // Strip the optional `;timeout=` parameter.
                let id = session
                    .as_str()
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                *shared.session_id.lock() = Some(id);
            }
        }
        CommandOutcome::Success {
            body: String::from_utf8_lossy(response.body()).into_owned(),
        }
    } else {
        CommandOutcome::Failure {
            reason: format!("server answered {:?}", status),
        }
    };

    shared.events.send(Event::CommandResult {
        command: pending.kind,
        outcome,
    });
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::runtime::Reactor;

    fn shared_over_loopback() -> (Arc<Shared>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let reactor = Reactor::new();
        let shared = Arc::new(Shared {
            writer: Mutex::new(client),
            url: Url::parse("rtsp://127.0.0.1/stream").unwrap(),
            credentials: None,
            cseq: AtomicU32::new(1),
            auth: Mutex::new(None),
            session_id: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            channels: Mutex::new(HashMap::new()),
            events: reactor.sender(),
        });
        (shared, server)
    }

    #[test]
    fn pending_queue_matches_wire_order_under_contention() {
        let (shared, mut server) = shared_over_loopback();

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        shared
                            .send_request(
                                CommandKind::Options,
                                Method::Options,
                                shared.url.clone(),
                                Vec::new(),
                                false,
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        shared.writer.lock().shutdown(Shutdown::Write).unwrap();

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).unwrap();
        let text = String::from_utf8_lossy(&wire);
        let wire_order: Vec<u32> = text
            .lines()
            .filter_map(|line| line.strip_prefix("CSeq:"))
            .map(|value| value.trim().parse().unwrap())
            .collect();

        let queued: Vec<u32> = shared.pending.lock().iter().map(|p| p.cseq).collect();
        assert_eq!(wire_order.len(), 100);
        assert_eq!(queued, wire_order);
    }
}
