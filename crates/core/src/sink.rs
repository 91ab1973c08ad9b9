//! Null data sinks: pull media frames and discard them.
//!
//! The probe never interprets payload bytes; the only things a sink
//! produces are [`Event::Frame`] notifications (feeding the liveness
//! monitor), [`Event::SubsessionBye`] when an RTCP BYE arrives, and
//! [`Event::SubsessionFinished`] when the receive path dies.
//!
//! UDP subsessions get a reader thread per sink, stopped through a shared
//! flag. TCP-interleaved subsessions have no thread of their own (frames
//! arrive on the control connection and its reader delivers the events),
//! so their handle carries
//! only the flag.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::runtime::{Event, EventSender};
use crate::session::SubsessionId;

/// RTCP BYE packet type (RFC 3550 §6.6).
const RTCP_BYE: u8 = 203;

/// Poll interval for the stop flag while no frames arrive.
const RECV_POLL: Duration = Duration::from_millis(250);

/// Handle to one subsession's active sink.
///
/// Present on a [`Subsession`](crate::session::Subsession) iff the
/// subsession is consuming data; [`close`](Self::close) stops the reader
/// thread (if any) and is the single trigger the lifecycle tracker's
/// "any subsession still active?" scan looks at.
#[derive(Debug)]
pub struct SinkHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SinkHandle {
    /// Handle backed by a reader thread (UDP sinks).
    pub fn threaded(running: Arc<AtomicBool>, thread: JoinHandle<()>) -> Self {
        SinkHandle {
            running,
            thread: Some(thread),
        }
    }

    /// Handle without a thread (TCP-interleaved sinks: the control
    /// connection reader delivers the frames).
    pub fn detached(running: Arc<AtomicBool>) -> Self {
        SinkHandle {
            running,
            thread: None,
        }
    }

    /// Stop the sink and reap its thread.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        // Threads check this flag between receives; a dropped handle must
        // not leave one running.
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Spawn the discard-loop thread for a UDP subsession.
///
/// `rtp` is polled with a short timeout so the stop flag is honored
/// promptly; `rtcp` is drained non-blocking and scanned for BYE.
pub fn spawn_udp_sink(
    id: SubsessionId,
    label: String,
    rtp: UdpSocket,
    rtcp: UdpSocket,
    events: EventSender,
    log_frames: bool,
) -> std::io::Result<SinkHandle> {
    rtp.set_read_timeout(Some(RECV_POLL))?;
    rtcp.set_nonblocking(true)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();

    let thread = std::thread::spawn(move || {
        let mut buf = [0u8; 65536];
        while flag.load(Ordering::SeqCst) {
            match rtp.recv(&mut buf) {
                Ok(n) => {
                    if log_frames {
                        tracing::trace!(subsession = %id, %label, bytes = n, "received frame");
                    }
                    events.send(Event::Frame {
                        subsession: id,
                        bytes: n,
                    });
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    tracing::warn!(subsession = %id, %label, error = %e, "RTP receive error");
                    events.send(Event::SubsessionFinished(id));
                    break;
                }
            }

            // Drain any pending RTCP, watching for BYE.
            loop {
                match rtcp.recv(&mut buf) {
                    Ok(n) => {
                        if is_rtcp_bye(&buf[..n]) {
                            tracing::debug!(subsession = %id, %label, "RTCP BYE received");
                            events.send(Event::SubsessionBye(id));
                        }
                    }
                    Err(_) => break,
                }
            }
        }
        tracing::debug!(subsession = %id, %label, "sink thread exited");
    });

    Ok(SinkHandle::threaded(running, thread))
}

/// Scan a (possibly compound) RTCP packet for a BYE (RFC 3550 §6.1, §6.6).
pub fn is_rtcp_bye(packet: &[u8]) -> bool {
    let mut offset = 0;
    while offset + 4 <= packet.len() {
        // Two version bits must be 2 for every packet in the compound.
        if packet[offset] >> 6 != 2 {
            return false;
        }
        if packet[offset + 1] == RTCP_BYE {
            return true;
        }
        let words = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) as usize;
        offset += 4 * (words + 1);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Reactor;
    use crate::runtime::Wake;

    /// Minimal RTCP packet: version 2, given packet type, given body words.
    fn rtcp_packet(pt: u8, words: u16) -> Vec<u8> {
        let mut p = vec![0x80, pt, 0, 0];
        p[2..4].copy_from_slice(&words.to_be_bytes());
        p.extend(std::iter::repeat_n(0u8, words as usize * 4));
        p
    }

    #[test]
    fn bye_detected_standalone() {
        assert!(is_rtcp_bye(&rtcp_packet(RTCP_BYE, 1)));
    }

    #[test]
    fn bye_detected_in_compound() {
        let mut compound = rtcp_packet(201, 1); // receiver report first
        compound.extend(rtcp_packet(RTCP_BYE, 1));
        assert!(is_rtcp_bye(&compound));
    }

    #[test]
    fn report_without_bye_ignored() {
        assert!(!is_rtcp_bye(&rtcp_packet(200, 6)));
        assert!(!is_rtcp_bye(&[]));
        assert!(!is_rtcp_bye(&[0x80, 200])); // truncated header
    }

    #[test]
    fn garbage_rejected_by_version_check() {
        assert!(!is_rtcp_bye(&[0x00, RTCP_BYE, 0, 1, 0, 0, 0, 0]));
    }

    #[test]
    fn udp_sink_reports_frames_and_bye() {
        let reactor = Reactor::new();
        let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let rtcp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let rtp_addr = rtp.local_addr().unwrap();
        let rtcp_addr = rtcp.local_addr().unwrap();

        let mut sink = spawn_udp_sink(
            SubsessionId(0),
            "video/H264".to_string(),
            rtp,
            rtcp,
            reactor.sender(),
            false,
        )
        .unwrap();

        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(&[0u8; 120], rtp_addr).unwrap();
        tx.send_to(&rtcp_packet(RTCP_BYE, 1), rtcp_addr).unwrap();

        let mut got_frame = false;
        let mut got_bye = false;
        let mut reactor = reactor;
        for _ in 0..2 {
            match reactor.wait() {
                Wake::Event(Event::Frame { subsession, bytes }) => {
                    assert_eq!(subsession, SubsessionId(0));
                    assert_eq!(bytes, 120);
                    got_frame = true;
                }
                Wake::Event(Event::SubsessionBye(id)) => {
                    assert_eq!(id, SubsessionId(0));
                    got_bye = true;
                }
                other => panic!("unexpected wake: {:?}", other),
            }
        }
        assert!(got_frame && got_bye);

        sink.close();
    }
}
