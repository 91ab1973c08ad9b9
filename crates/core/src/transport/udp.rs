//! UDP media-socket allocation for RTP/RTCP reception.
//!
//! Each UDP subsession needs an adjacent port pair with an even RTP port
//! (RFC 3550 §11). Pairs are probed starting from a random even port, and
//! the RTP socket's receive buffer is sized by medium before SETUP
//! advertises the ports.

use std::net::UdpSocket;

use rand::RngExt;

use crate::error::{ProbeError, Result};
use crate::session::MediumKind;

const PORT_MIN: u16 = 5000;
const PORT_MAX: u16 = 65000;
const BIND_ATTEMPTS: u32 = 40;

/// Bind an (RTP, RTCP) socket pair for one subsession.
///
/// Returns the sockets and the RTP port to advertise in the SETUP
/// Transport header. The RTP receive buffer is enlarged for video (2 MB)
/// and audio (100 KB); a kernel refusal to grow it is logged, not fatal.
pub fn bind_media_pair(medium: &MediumKind) -> Result<(UdpSocket, UdpSocket, u16)> {
    let mut port = rand::rng().random_range(PORT_MIN / 2..PORT_MAX / 2) * 2;

    for _ in 0..BIND_ATTEMPTS {
        if port >= PORT_MAX {
            port = PORT_MIN;
        }
        if let Ok(rtp) = UdpSocket::bind(("0.0.0.0", port)) {
            if let Ok(rtcp) = UdpSocket::bind(("0.0.0.0", port + 1)) {
                if let Some(size) = medium.receive_buffer() {
                    if let Err(e) = socket2::SockRef::from(&rtp).set_recv_buffer_size(size) {
                        tracing::warn!(%medium, size, error = %e, "could not grow receive buffer");
                    } else {
                        tracing::debug!(%medium, size, "receive buffer sized");
                    }
                }
                tracing::debug!(%medium, rtp_port = port, "bound media port pair");
                return Ok((rtp, rtcp, port));
            }
        }
        port += 2;
    }

    Err(ProbeError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "no free UDP port pair for media reception",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_adjacent_with_even_rtp_port() {
        let (rtp, rtcp, port) = bind_media_pair(&MediumKind::Video).unwrap();
        assert_eq!(port % 2, 0);
        assert_eq!(rtp.local_addr().unwrap().port(), port);
        assert_eq!(rtcp.local_addr().unwrap().port(), port + 1);
    }

    #[test]
    fn pairs_do_not_collide() {
        let a = bind_media_pair(&MediumKind::Video).unwrap();
        let b = bind_media_pair(&MediumKind::Audio).unwrap();
        assert_ne!(a.2, b.2);
    }
}
