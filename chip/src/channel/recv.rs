//! Receive worker: moves inbound host data into the RX ring while the
//! guest has receiving enabled.

use super::{Channel, POLL_INTERVAL};
use crate::icmp;
use crate::ping::{Ping, PingOutcome};
use crate::types::{Protocol, Status, irq};
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::thread;
use std::time::Duration;

const MAX_DATAGRAM: usize = 65535;
/// Ping results are checked more often than sockets are polled.
const PING_POLL: Duration = Duration::from_millis(10);

enum Source {
    Stream(TcpStream),
    /// Receiving is off but the peer may still hang up.
    Watch(TcpStream),
    Udp(UdpSocket),
    Pings,
    Idle,
}

impl Channel {
    pub(super) fn receive_loop(self, generation: u64) {
        tracing::trace!(channel = self.index, generation, "receive worker started");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while let Some(source) = self.wait_for_receive(generation) {
            match source {
                Source::Stream(stream) => self.receive_stream(stream, &mut buf, generation),
                Source::Watch(stream) => self.watch_stream(stream, generation),
                Source::Udp(socket) => self.receive_datagram(socket, &mut buf, generation),
                Source::Pings => self.receive_ping(generation),
                Source::Idle => thread::sleep(POLL_INTERVAL),
            }
        }
        tracing::trace!(channel = self.index, generation, "receive worker stopped");
    }

    /// Block until the guest has receiving enabled. `None` once this
    /// worker's generation is over.
    fn wait_for_receive(&self, generation: u64) -> Option<Source> {
        let mut st = self.state();
        loop {
            if st.generation != generation {
                return None;
            }
            if st.rx_enabled {
                break;
            }
            if let Some(stream) = st.binding.stream()
                && let Ok(stream) = stream.try_clone()
            {
                return Some(Source::Watch(stream));
            }
            st = match self.inner.rx_wake.wait_timeout(st, POLL_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        let source = if let Some(stream) = st.binding.stream() {
            stream.try_clone().map(Source::Stream).unwrap_or(Source::Idle)
        } else if let Some(socket) = st.binding.udp() {
            socket.try_clone().map(Source::Udp).unwrap_or(Source::Idle)
        } else if st.protocol == Protocol::IpRaw {
            Source::Pings
        } else {
            Source::Idle
        };
        Some(source)
    }

    /// Free RX bytes. One byte is always left unused so a full ring can't
    /// read back as empty.
    fn rx_space(&self, generation: u64) -> Option<usize> {
        let (regs, st) = self.lock_current(generation)?;
        let window = regs.layout().rx[self.index];
        if !window.is_usable() {
            return Some(0);
        }
        Some((window.free(st.rx_rd, st.rx_wr) - 1) as usize)
    }

    fn receive_stream(&self, mut stream: TcpStream, buf: &mut [u8], generation: u64) {
        let Some(space) = self.rx_space(generation) else {
            return;
        };
        if space == 0 {
            thread::sleep(POLL_INTERVAL);
            return;
        }
        let want = space.min(buf.len());
        match stream.read(&mut buf[..want]) {
            Ok(0) => self.peer_closed(generation),
            Ok(n) => {
                self.deliver(generation, &[&buf[..n]]);
            }
            Err(e) if is_poll_timeout(&e) => {}
            Err(e) => {
                tracing::debug!(channel = self.index, error = %e, "stream read failed");
                self.peer_closed(generation);
            }
        }
    }

    fn watch_stream(&self, stream: TcpStream, generation: u64) {
        let mut peeked = [0u8; 1];
        match stream.peek(&mut peeked) {
            Ok(0) => self.peer_closed(generation),
            // Data is waiting for the guest's next RECV.
            Ok(_) => thread::sleep(POLL_INTERVAL),
            Err(e) if is_poll_timeout(&e) => {}
            Err(e) => {
                tracing::debug!(channel = self.index, error = %e, "stream peek failed");
                self.peer_closed(generation);
            }
        }
    }

    fn receive_datagram(&self, socket: UdpSocket, buf: &mut [u8], generation: u64) {
        match socket.recv_from(buf) {
            Ok((n, SocketAddr::V4(src))) => {
                let mut header = [0u8; 8];
                header[..4].copy_from_slice(&src.ip().octets());
                header[4..6].copy_from_slice(&src.port().to_be_bytes());
                header[6..8].copy_from_slice(&(n as u16).to_be_bytes());
                self.deliver(generation, &[&header, &buf[..n]]);
            }
            Ok((_, src)) => {
                tracing::trace!(channel = self.index, %src, "non-IPv4 datagram dropped");
            }
            Err(e) if is_poll_timeout(&e) => {}
            Err(e) => {
                tracing::debug!(channel = self.index, error = %e, "datagram receive failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    fn receive_ping(&self, generation: u64) {
        let resolved = {
            let mut st = self.state();
            if st.generation != generation {
                return;
            }
            take_resolved(&mut st.pings)
        };
        let Some((ping, outcome)) = resolved else {
            thread::sleep(PING_POLL);
            return;
        };

        let message = match outcome {
            PingOutcome::Reachable => icmp::echo_reply(&ping.payload),
            PingOutcome::Error => icmp::host_unreachable(&ping.payload),
            PingOutcome::Timeout => {
                tracing::debug!(channel = self.index, addr = %ping.addr, "ping timed out");
                return;
            }
        };
        let mut header = [0u8; 6];
        header[..4].copy_from_slice(&ping.addr.octets());
        header[4..6].copy_from_slice(&(message.len() as u16).to_be_bytes());
        self.deliver(generation, &[&header, &message]);
    }

    /// Append `parts` to the RX ring as one unit and raise RECV. Data that
    /// does not fit is dropped, as the chip drops packets it has no room for.
    fn deliver(&self, generation: u64, parts: &[&[u8]]) -> bool {
        let Some((mut regs, mut st)) = self.lock_current(generation) else {
            return false;
        };
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let window = regs.layout().rx[self.index];
        let space = if window.is_usable() {
            (window.free(st.rx_rd, st.rx_wr) - 1) as usize
        } else {
            0
        };
        if total > space {
            tracing::debug!(channel = self.index, total, space, "rx ring full, dropping");
            return false;
        }

        let mut wr = st.rx_wr;
        for part in parts {
            wr = regs.write_rx(self.index, wr, part);
        }
        st.rx_wr = wr;
        st.rx_enabled = false;
        self.raise(&mut regs, irq::RECV);
        true
    }

    /// The host stream ended. Passes through CLOSE_WAIT to CLOSED and lets
    /// firmware know via DISCON; unread RX data stays in the ring.
    fn peer_closed(&self, generation: u64) {
        let Some((mut regs, mut st)) = self.lock_current(generation) else {
            return;
        };
        self.set_status(&mut regs, Status::CloseWait);
        drop(self.release(&mut st));
        st.protocol = Protocol::Closed;
        self.set_status(&mut regs, Status::Closed);
        self.raise(&mut regs, irq::DISCON);
        self.finish_command(&mut regs);
        tracing::info!(channel = self.index, "peer closed connection");
    }
}

fn take_resolved(pings: &mut Vec<Ping>) -> Option<(Ping, PingOutcome)> {
    let (index, outcome) = pings
        .iter()
        .enumerate()
        .find_map(|(i, ping)| ping.poll().map(|outcome| (i, outcome)))?;
    Some((pings.remove(index), outcome))
}

fn is_poll_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}
