//! Session-description model for a negotiated RTSP session.
//!
//! A [`SessionDescription`] is built from the SDP body of a successful
//! DESCRIBE (RFC 2326 §10.2, RFC 4566) and owns one [`Subsession`] per
//! media section. Subsessions are addressed by index ([`SubsessionId`])
//! so that asynchronous per-subsession events (end-of-playing, BYE) can
//! name their subsession without back-references into session state.
//!
//! ## Lifecycle
//!
//! ```text
//! DESCRIBE ok   -> SessionDescription created, one Subsession per m= line
//! SETUP loop    -> each Subsession initiated and set up (or skipped)
//! SETUP ok      -> sink attached (Subsession::sink = Some)
//! end/BYE/close -> sink detached; no active sinks left ends the session
//! ```

use url::Url;

use crate::error::Result;
use crate::sink::SinkHandle;

/// Index of a subsession within its owning [`SessionDescription`].
///
/// Carried through events instead of a pointer to the subsession so the
/// dispatch loop remains the only place that touches session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubsessionId(pub usize);

impl std::fmt::Display for SubsessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Media kind of a subsession, from the SDP `m=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediumKind {
    Video,
    Audio,
    Other(String),
}

/// Socket receive-buffer budget for video subsessions (2 MB).
pub const VIDEO_RECEIVE_BUFFER: usize = 2_000_000;
/// Socket receive-buffer budget for audio subsessions (100 KB).
pub const AUDIO_RECEIVE_BUFFER: usize = 100_000;

impl MediumKind {
    pub fn from_sdp(media: &str) -> Self {
        match media {
            "video" => MediumKind::Video,
            "audio" => MediumKind::Audio,
            other => MediumKind::Other(other.to_string()),
        }
    }

    /// Receive-buffer size to request for this medium, if any.
    pub fn receive_buffer(&self) -> Option<usize> {
        match self {
            MediumKind::Video => Some(VIDEO_RECEIVE_BUFFER),
            MediumKind::Audio => Some(AUDIO_RECEIVE_BUFFER),
            MediumKind::Other(_) => None,
        }
    }
}

impl std::fmt::Display for MediumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediumKind::Video => write!(f, "video"),
            MediumKind::Audio => write!(f, "audio"),
            MediumKind::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Declared playback bounds of the session, from the SDP `a=range` line.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamBounds {
    /// Live or open-ended stream; no duration timer is armed.
    Unbounded,
    /// Normal play time range in seconds.
    Npt { start: f64, end: f64 },
    /// Absolute (wall-clock) range; sent verbatim in the PLAY Range header.
    Clock { start: String, end: Option<String> },
}

impl StreamBounds {
    /// Expected play duration in seconds. Zero means unbounded/unknown.
    pub fn duration(&self) -> f64 {
        match self {
            StreamBounds::Npt { start, end } => (end - start).max(0.0),
            _ => 0.0,
        }
    }
}

/// One media stream (video or audio track) within the session.
#[derive(Debug)]
pub struct Subsession {
    pub medium: MediumKind,
    /// Codec name from `a=rtpmap` (e.g. `H264`, `MPEG4-GENERIC`).
    pub codec: String,
    /// Fully resolved SETUP target URL for this subsession.
    pub control: String,
    /// Local RTP receive port, set by transport initiation (UDP mode).
    pub local_rtp_port: Option<u16>,
    /// Present iff the subsession is actively consuming data.
    pub sink: Option<SinkHandle>,
}

impl Subsession {
    /// Diagnostic label, e.g. `video/H264`.
    pub fn label(&self) -> String {
        format!("{}/{}", self.medium, self.codec)
    }

    pub fn is_active(&self) -> bool {
        self.sink.is_some()
    }
}

/// A parsed RTSP session description and its subsessions.
#[derive(Debug)]
pub struct SessionDescription {
    /// SDP session name (`s=` line).
    pub name: String,
    pub bounds: StreamBounds,
    pub subsessions: Vec<Subsession>,
}

impl SessionDescription {
    /// Build the session model from a DESCRIBE response body.
    ///
    /// `base` is the request URL, used to resolve relative `a=control`
    /// attributes. Zero media sections is not an error here; the caller
    /// treats an empty subsession list as a failed DESCRIBE.
    pub fn parse(body: &[u8], base: &Url) -> Result<Self> {
        let sdp = sdp_types::Session::parse(body)?;

        let bounds = sdp
            .attributes
            .iter()
            .find(|attr| attr.attribute == "range")
            .and_then(|attr| attr.value.as_deref())
            .map(parse_range)
            .unwrap_or(StreamBounds::Unbounded);

        let subsessions = sdp
            .medias
            .iter()
            .map(|media| Subsession {
                medium: MediumKind::from_sdp(&media.media),
                codec: rtpmap_codec(media)
                    .unwrap_or_else(|| format!("PT{}", media.fmt.trim())),
                control: resolve_control(media, base),
                local_rtp_port: None,
                sink: None,
            })
            .collect();

        Ok(SessionDescription {
            name: sdp.session_name,
            bounds,
            subsessions,
        })
    }

    /// Whether any subsession still has an active sink.
    pub fn any_sink_active(&self) -> bool {
        self.subsessions.iter().any(Subsession::is_active)
    }
}

/// Parse an SDP `a=range` value (RFC 2326 §3.6).
///
/// `npt=0-30.2` gives a bounded NPT range; `npt=0-` and `npt=now-` are
/// open-ended; `clock=...` carries absolute times through untouched.
fn parse_range(value: &str) -> StreamBounds {
    if let Some(npt) = value.strip_prefix("npt=") {
        let (start, end) = match npt.split_once('-') {
            Some(parts) => parts,
            None => return StreamBounds::Unbounded,
        };
        let start = parse_npt_time(start);
        let end = parse_npt_time(end);
        match (start, end) {
            (Some(start), Some(end)) => StreamBounds::Npt { start, end },
            _ => StreamBounds::Unbounded,
        }
    } else if let Some(clock) = value.strip_prefix("clock=") {
        let (start, end) = match clock.split_once('-') {
            Some((s, e)) => (s, e),
            None => (clock, ""),
        };
        if start.is_empty() {
            return StreamBounds::Unbounded;
        }
        StreamBounds::Clock {
            start: start.to_string(),
            end: if end.is_empty() {
                None
            } else {
                Some(end.to_string())
            },
        }
    } else {
        StreamBounds::Unbounded
    }
}

fn parse_npt_time(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() || value == "now" {
        return None;
    }
    value.parse::<f64>().ok()
}

/// Codec name from the media section's `a=rtpmap` attribute
/// (`96 H264/90000` -> `H264`).
fn rtpmap_codec(media: &sdp_types::Media) -> Option<String> {
    media.attributes.iter().find_map(|attr| {
        if attr.attribute != "rtpmap" {
            return None;
        }
        let value = attr.value.as_ref()?;
        let codec = value.split_whitespace().nth(1)?.split('/').next()?;
        Some(codec.to_string())
    })
}

/// Resolve the media section's `a=control` attribute against the request
/// URL (RFC 2326 §C.1.1). Absolute URLs pass through; `*` or a missing
/// attribute means the session URL itself.
fn resolve_control(media: &sdp_types::Media, base: &Url) -> String {
    let base_str = base.as_str().trim_end_matches('/');
    let control = media.attributes.iter().find_map(|attr| {
        if attr.attribute == "control" {
            Some(attr.value.clone().unwrap_or_default())
        } else {
            None
        }
    });
    match control.as_deref() {
        None | Some("") | Some("*") => base_str.to_string(),
        Some(value) if value.starts_with("rtsp://") || value.starts_with("rtsps://") => {
            value.to_string()
        }
        Some(value) => format!("{}/{}", base_str, value.trim_start_matches('/')),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 10.0.0.1\r\n\
        s=Camera Feed\r\n\
        t=0 0\r\n\
        a=range:npt=0-30.5\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:track1\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 MPEG4-GENERIC/48000/2\r\n\
        a=control:track2\r\n";

    fn base() -> Url {
        Url::parse("rtsp://10.0.0.1:554/cam").unwrap()
    }

    #[test]
    fn parse_two_subsessions() {
        let desc = SessionDescription::parse(SDP.as_bytes(), &base()).unwrap();
        assert_eq!(desc.name, "Camera Feed");
        assert_eq!(desc.subsessions.len(), 2);

        let video = &desc.subsessions[0];
        assert_eq!(video.medium, MediumKind::Video);
        assert_eq!(video.codec, "H264");
        assert_eq!(video.control, "rtsp://10.0.0.1:554/cam/track1");
        assert!(!video.is_active());

        let audio = &desc.subsessions[1];
        assert_eq!(audio.medium, MediumKind::Audio);
        assert_eq!(audio.codec, "MPEG4-GENERIC");
        assert_eq!(audio.label(), "audio/MPEG4-GENERIC");
    }

    #[test]
    fn npt_range_gives_duration() {
        let desc = SessionDescription::parse(SDP.as_bytes(), &base()).unwrap();
        assert_eq!(desc.bounds, StreamBounds::Npt { start: 0.0, end: 30.5 });
        assert!((desc.bounds.duration() - 30.5).abs() < 1e-9);
    }

    #[test]
    fn open_ended_range_is_unbounded() {
        assert_eq!(parse_range("npt=0-"), StreamBounds::Unbounded);
        assert_eq!(parse_range("npt=now-"), StreamBounds::Unbounded);
        assert_eq!(StreamBounds::Unbounded.duration(), 0.0);
    }

    #[test]
    fn clock_range_passes_through() {
        let bounds = parse_range("clock=20260101T000000Z-20260101T001000Z");
        assert_eq!(
            bounds,
            StreamBounds::Clock {
                start: "20260101T000000Z".to_string(),
                end: Some("20260101T001000Z".to_string()),
            }
        );
        assert_eq!(bounds.duration(), 0.0);
    }

    #[test]
    fn control_star_resolves_to_base() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=X\r\nt=0 0\r\n\
                   m=video 0 RTP/AVP 96\r\na=control:*\r\n";
        let desc = SessionDescription::parse(sdp.as_bytes(), &base()).unwrap();
        assert_eq!(desc.subsessions[0].control, "rtsp://10.0.0.1:554/cam");
    }

    #[test]
    fn absolute_control_passes_through() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=X\r\nt=0 0\r\n\
                   m=video 0 RTP/AVP 96\r\na=control:rtsp://10.0.0.2/other\r\n";
        let desc = SessionDescription::parse(sdp.as_bytes(), &base()).unwrap();
        assert_eq!(desc.subsessions[0].control, "rtsp://10.0.0.2/other");
    }

    #[test]
    fn missing_rtpmap_falls_back_to_payload_type() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=X\r\nt=0 0\r\n\
                   m=application 0 RTP/AVP 107\r\n";
        let desc = SessionDescription::parse(sdp.as_bytes(), &base()).unwrap();
        assert_eq!(desc.subsessions[0].codec, "PT107");
        assert_eq!(
            desc.subsessions[0].medium,
            MediumKind::Other("application".to_string())
        );
        assert_eq!(desc.subsessions[0].medium.receive_buffer(), None);
    }

    #[test]
    fn receive_buffer_keyed_by_medium() {
        assert_eq!(
            MediumKind::Video.receive_buffer(),
            Some(VIDEO_RECEIVE_BUFFER)
        );
        assert_eq!(
            MediumKind::Audio.receive_buffer(),
            Some(AUDIO_RECEIVE_BUFFER)
        );
    }

    #[test]
    fn malformed_sdp_is_an_error() {
        assert!(SessionDescription::parse(b"not sdp at all", &base()).is_err());
    }
}
