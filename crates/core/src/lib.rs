pub mod client;
pub mod error;
pub mod runtime;
pub mod session;
pub mod sink;
pub mod transport;

pub use client::{ProbeClient, ProbeConfig};
pub use error::{ProbeError, Result};
pub use session::{SessionDescription, StreamBounds, Subsession, SubsessionId};
pub use transport::TransportMode;
