//! Simulated ICMP echo.
//!
//! The host does not give us raw sockets, so an echo request written by the
//! guest becomes a reachability probe on a background thread. The channel's
//! receive worker polls the resulting [`Ping`] and fabricates the reply.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// TCP echo service; any answer (even a refusal) proves the host is up.
const PROBE_PORT: u16 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Reachable,
    Timeout,
    Error,
}

/// Decides whether an address answers. Runs on a probe thread, so it may
/// block.
pub trait Prober: Send + Sync {
    fn probe(&self, addr: Ipv4Addr) -> PingOutcome;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HostProber;

impl Prober for HostProber {
    fn probe(&self, addr: Ipv4Addr) -> PingOutcome {
        if addr.is_loopback() {
            return PingOutcome::Reachable;
        }
        let target = SocketAddr::from((addr, PROBE_PORT));
        match TcpStream::connect_timeout(&target, PROBE_TIMEOUT) {
            Ok(_) => PingOutcome::Reachable,
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => PingOutcome::Reachable,
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                PingOutcome::Timeout
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "ping probe failed");
                PingOutcome::Error
            }
        }
    }
}

/// One outstanding echo request.
pub struct Ping {
    pub addr: Ipv4Addr,
    pub payload: Vec<u8>,
    rx: Receiver<PingOutcome>,
}

impl Ping {
    /// The outcome, once. `None` while the probe is still running.
    pub fn poll(&self) -> Option<PingOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            // Probe thread died without answering.
            Err(TryRecvError::Disconnected) => Some(PingOutcome::Error),
        }
    }
}

#[derive(Clone)]
pub struct PingSimulator {
    prober: Arc<dyn Prober>,
}

impl PingSimulator {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }

    pub fn probe(&self, addr: Ipv4Addr, payload: Vec<u8>) -> Ping {
        let (tx, rx) = mpsc::sync_channel(1);
        let prober = self.prober.clone();
        let spawned = thread::Builder::new()
            .name(format!("uther-ping-{}", addr))
            .spawn(move || {
                let _ = tx.send(prober.probe(addr));
            });
        if let Err(e) = spawned {
            // Sender was dropped with the closure, so poll() reports Error.
            tracing::debug!(error = %e, "spawn ping probe");
        }
        Ping { addr, payload, rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct Fixed(PingOutcome);

    impl Prober for Fixed {
        fn probe(&self, _addr: Ipv4Addr) -> PingOutcome {
            self.0
        }
    }

    fn wait(ping: &Ping) -> PingOutcome {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(outcome) = ping.poll() {
                return outcome;
            }
            assert!(Instant::now() < deadline, "ping never resolved");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_loopback_is_reachable() {
        let sim = PingSimulator::new(Arc::new(HostProber));
        let ping = sim.probe(Ipv4Addr::LOCALHOST, vec![1, 2, 3]);
        assert_eq!(wait(&ping), PingOutcome::Reachable);
        assert_eq!(ping.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_injected_outcome() {
        let sim = PingSimulator::new(Arc::new(Fixed(PingOutcome::Timeout)));
        let ping = sim.probe(Ipv4Addr::new(10, 1, 2, 3), Vec::new());
        assert_eq!(wait(&ping), PingOutcome::Timeout);
        assert_eq!(ping.addr, Ipv4Addr::new(10, 1, 2, 3));
    }
}
