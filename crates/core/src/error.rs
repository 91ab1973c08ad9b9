//! Error types for the RTSP probe library.

/// Errors that can occur while driving an RTSP probe session.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Io`](Self::Io), socket/network failures.
/// - **Protocol**: [`Protocol`](Self::Protocol) for malformed or unexpected
///   RTSP messages, [`Sdp`](Self::Sdp) for unparseable session descriptions.
/// - **Setup**: [`InvalidUrl`](Self::InvalidUrl), [`Auth`](Self::Auth).
/// - **Outcome**: [`ProbeFailed`](Self::ProbeFailed), returned by
///   [`ProbeClient::run`](crate::ProbeClient::run) when the sticky error
///   flag was set at any point during the run.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The RTSP URL could not be parsed or is missing required parts.
    #[error("invalid RTSP URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Failed to parse the SDP body of a DESCRIBE response.
    #[error("SDP parse error: {0}")]
    Sdp(#[from] sdp_types::ParserError),

    /// Malformed or unexpected RTSP message on the control connection.
    #[error("RTSP protocol error: {details}")]
    Protocol { details: String },

    /// Authentication challenge could not be answered (unsupported scheme
    /// or missing credentials).
    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    /// The run completed but at least one fatal or degrading condition
    /// occurred (command failure, liveness timeout, malformed description,
    /// or a subsession SETUP failure).
    #[error("probe finished with errors")]
    ProbeFailed,
}

/// Convenience alias for `Result<T, ProbeError>`.
pub type Result<T> = std::result::Result<T, ProbeError>;
