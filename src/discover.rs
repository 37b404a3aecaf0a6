//! LAN discovery: clients broadcast a 4-byte probe on UDP, servers answer
//! unicast with one JSON [`ServerDescriptor`] datagram. Best-effort on both
//! sides; lost packets mean missing servers, never failures.

use crate::protocol::ServerDescriptor;
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// A descriptor reply fits comfortably; probes are 4 bytes
const REPLY_BUF_SIZE: usize = 64 * 1024;

/// Start the discovery daemon. `make_descriptor` is called per probe so the
/// reply always carries a fresh snapshot. Returns the bound port.
pub fn spawn_daemon<F>(bind_ip: std::net::IpAddr, port: u16, make_descriptor: F) -> anyhow::Result<u16>
where
    F: Fn() -> ServerDescriptor + Send + Sync + 'static,
{
    let sock = UdpSocket::bind(SocketAddr::new(bind_ip, port))?;
    let local_port = sock.local_addr()?.port();
    info!(port = local_port, "discovery daemon listening");

    let make = Arc::new(make_descriptor);
    thread::Builder::new().name("discover".into()).spawn(move || {
        let mut buf = [0u8; 64];
        loop {
            let (n, src) = match sock.recv_from(&mut buf) {
                Ok(x) => x,
                Err(e) => {
                    warn!(error = %e, "discovery recv failed");
                    continue;
                }
            };
            debug!(%src, bytes = n, "discovery probe");
            let descriptor = make();
            let payload = match serde_json::to_vec(&descriptor) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "descriptor serialization failed");
                    continue;
                }
            };
            if let Err(e) = sock.send_to(&payload, src) {
                debug!(%src, error = %e, "discovery reply failed");
            }
        }
    })?;
    Ok(local_port)
}

/// Collects discovery replies for a bounded window, yielding each distinct
/// server as it arrives.
pub struct Scanner {
    sock: UdpSocket,
    deadline: Instant,
    seen: HashSet<(String, u16)>,
}

impl Scanner {
    /// Probe the LAN broadcast address.
    pub fn broadcast(discover_port: u16, wait: Duration) -> io::Result<Scanner> {
        let target = SocketAddr::new(Ipv4Addr::BROADCAST.into(), discover_port);
        Scanner::probe(&[target], wait, true)
    }

    /// Probe specific endpoints (used for direct host lookups and tests).
    pub fn unicast(targets: &[SocketAddr], wait: Duration) -> io::Result<Scanner> {
        Scanner::probe(targets, wait, false)
    }

    fn probe(targets: &[SocketAddr], wait: Duration, broadcast: bool) -> io::Result<Scanner> {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        if broadcast {
            sock.set_broadcast(true)?;
        }
        let token: [u8; 4] = rand::random();
        for target in targets {
            if let Err(e) = sock.send_to(&token, target) {
                debug!(%target, error = %e, "discovery probe failed");
            }
        }
        Ok(Scanner {
            sock,
            deadline: Instant::now() + wait,
            seen: HashSet::new(),
        })
    }
}

impl Iterator for Scanner {
    type Item = ServerDescriptor;

    fn next(&mut self) -> Option<ServerDescriptor> {
        let mut buf = vec![0u8; REPLY_BUF_SIZE];
        loop {
            let remaining = self.deadline.checked_duration_since(Instant::now())?;
            if self.sock.set_read_timeout(Some(remaining)).is_err() {
                return None;
            }
            let (n, src) = match self.sock.recv_from(&mut buf) {
                Ok(x) => x,
                // Window elapsed
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return None
                }
                // Transient errors just consume window time
                Err(_) => continue,
            };
            // Malformed replies are dropped silently
            let Ok(mut descriptor) = serde_json::from_slice::<ServerDescriptor>(&buf[..n]) else {
                debug!(%src, "dropping malformed discovery reply");
                continue;
            };
            if descriptor.address.is_empty() || descriptor.address == "0.0.0.0" {
                descriptor.address = src.ip().to_string();
            }
            let key = (descriptor.address.clone(), descriptor.port);
            if self.seen.insert(key) {
                return Some(descriptor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerDescriptor, SharingDescriptor, SharingKind};

    fn descriptor() -> ServerDescriptor {
        ServerDescriptor {
            name: "testsrv".into(),
            address: String::new(),
            port: 12020,
            discover_port: 0,
            ssl: false,
            auth: false,
            rexec: false,
            version: "0.5.0".into(),
            sharings: vec![SharingDescriptor {
                name: "stuff".into(),
                kind: SharingKind::Directory,
                read_only: false,
            }],
            fingerprint: None,
        }
    }

    #[test]
    fn probe_gets_a_reply() {
        let port = spawn_daemon("127.0.0.1".parse().unwrap(), 0, descriptor).unwrap();
        let target = SocketAddr::new([127, 0, 0, 1].into(), port);

        let found: Vec<_> =
            Scanner::unicast(&[target], Duration::from_millis(500)).unwrap().collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "testsrv");
        assert_eq!(found[0].sharings[0].name, "stuff");
        // Empty advertised address is replaced by the reply's source
        assert_eq!(found[0].address, "127.0.0.1");
    }

    #[test]
    fn duplicate_replies_are_deduplicated() {
        let port = spawn_daemon("127.0.0.1".parse().unwrap(), 0, descriptor).unwrap();
        let target = SocketAddr::new([127, 0, 0, 1].into(), port);

        // Two probes to the same daemon produce two replies, one descriptor
        let found: Vec<_> = Scanner::unicast(&[target, target], Duration::from_millis(500))
            .unwrap()
            .collect();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn window_elapses_without_servers() {
        let start = Instant::now();
        let target = SocketAddr::new([127, 0, 0, 1].into(), 1);
        let found: Vec<_> =
            Scanner::unicast(&[target], Duration::from_millis(200)).unwrap().collect();
        assert!(found.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
