//! Command worker: performs the blocking half of OPEN(UDP), LISTEN,
//! CONNECT, SEND and SEND_KEEP.

use super::binding::Binding;
use super::{Channel, MAX_PINGS, POLL_INTERVAL};
use crate::error::ChipError;
use crate::icmp::{self, IP_PROTO_ICMP};
use crate::regs::sock;
use crate::shared::retry_timeout;
use crate::types::{Status, irq};
use std::io::{ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(20);

pub(crate) enum Job {
    BindUdp {
        port: u16,
        group: Option<Ipv4Addr>,
    },
    Accept(TcpListener),
    Connect {
        addr: SocketAddr,
        timeout: Duration,
    },
    Send,
    KeepAlive,
}

/// Where a SEND drains the TX ring to.
enum Target {
    Stream(TcpStream),
    Udp(UdpSocket, SocketAddr),
    Raw { proto: u8, dest: Ipv4Addr },
}

struct SendPlan {
    data: Vec<u8>,
    /// TX write pointer at the time the ring was drained.
    end: u16,
    target: Result<Target, ChipError>,
}

impl Channel {
    pub(super) fn command_loop(self, jobs: Receiver<Job>, generation: u64) {
        tracing::trace!(channel = self.index, generation, "command worker started");
        loop {
            match jobs.recv_timeout(POLL_INTERVAL) {
                Ok(job) => {
                    if !self.is_current(generation) {
                        break;
                    }
                    self.run(job, generation);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.is_current(generation) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::trace!(channel = self.index, generation, "command worker stopped");
    }

    fn run(&self, job: Job, generation: u64) {
        match job {
            Job::BindUdp { port, group } => self.bind_udp(port, group, generation),
            Job::Accept(listener) => self.accept(listener, generation),
            Job::Connect { addr, timeout } => self.connect_to(addr, timeout, generation),
            Job::Send => self.send(generation),
            Job::KeepAlive => self.keep_alive(generation),
        }
    }

    fn bind_udp(&self, port: u16, group: Option<Ipv4Addr>, generation: u64) {
        let bound = self.shared.sockets.udp(port, group).and_then(|socket| {
            socket.set_read_timeout(Some(POLL_INTERVAL))?;
            Ok(socket)
        });

        let Some((mut regs, mut st)) = self.lock_current(generation) else {
            return;
        };
        match bound {
            Ok(socket) => {
                if port == 0
                    && let Ok(local) = socket.local_addr()
                {
                    regs.set16(self.base() + sock::PORT, local.port());
                }
                tracing::debug!(channel = self.index, port, ?group, "udp socket bound");
                st.binding = Binding::Udp(socket);
                st.rx_enabled = true;
                self.inner.rx_wake.notify_all();
            }
            Err(e) => {
                if e.is_bind_failure() {
                    self.shared
                        .report_bind_failure(port, &format!("channel {}: {}", self.index, e));
                }
                tracing::debug!(channel = self.index, error = %e, "udp open failed");
                self.fail(&mut regs, &mut st);
            }
        }
        self.finish_command(&mut regs);
    }

    fn accept(&self, listener: TcpListener, generation: u64) {
        if let Err(e) = listener.set_nonblocking(true) {
            tracing::debug!(channel = self.index, error = %e, "listener setup failed");
            if let Some((mut regs, mut st)) = self.lock_current(generation) {
                self.fail(&mut regs, &mut st);
            }
            return;
        }

        let (stream, peer) = loop {
            if !self.is_current(generation) {
                return;
            }
            match listener.accept() {
                Ok(conn) => break conn,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::debug!(channel = self.index, error = %e, "accept failed");
                    if let Some((mut regs, mut st)) = self.lock_current(generation) {
                        self.fail(&mut regs, &mut st);
                    }
                    return;
                }
            }
        };

        // Accepted sockets may inherit O_NONBLOCK from the listener.
        let configured = stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_read_timeout(Some(POLL_INTERVAL)));

        let Some((mut regs, mut st)) = self.lock_current(generation) else {
            return;
        };
        if self.status(&regs) != Status::Listen {
            return;
        }
        if let Err(e) = configured {
            tracing::debug!(channel = self.index, error = %e, "accepted socket setup failed");
            self.fail(&mut regs, &mut st);
            return;
        }
        stream.set_write_timeout(Some(retry_timeout(&regs))).ok();
        stream.set_nodelay(true).ok();

        if let SocketAddr::V4(peer) = peer {
            regs.set_bytes(self.base() + sock::DIPR, &peer.ip().octets());
            regs.set16(self.base() + sock::DPORT, peer.port());
        }
        st.binding.accept(stream);
        self.set_status(&mut regs, Status::Established);
        self.raise(&mut regs, irq::CON);
        st.rx_enabled = true;
        self.inner.rx_wake.notify_all();
        tracing::info!(channel = self.index, %peer, "connection accepted");
    }

    fn connect_to(&self, addr: SocketAddr, timeout: Duration, generation: u64) {
        tracing::debug!(channel = self.index, %addr, ?timeout, "connecting");
        let cancelled = || !self.is_current(generation);
        let connected = self
            .shared
            .sockets
            .connect(addr, timeout, &cancelled)
            .and_then(|stream| {
                stream.set_read_timeout(Some(POLL_INTERVAL))?;
                stream.set_write_timeout(Some(timeout))?;
                Ok(stream)
            });

        // A CLOSE or reset bumps the generation, which abandons a pending
        // connect; a stream that completed anyway is dropped here.
        let Some((mut regs, mut st)) = self.lock_current(generation) else {
            return;
        };
        match connected {
            Ok(stream) if self.status(&regs) == Status::Init => {
                st.binding = Binding::Stream(stream);
                self.set_status(&mut regs, Status::Established);
                self.raise(&mut regs, irq::CON);
                st.rx_enabled = true;
                self.inner.rx_wake.notify_all();
                tracing::info!(channel = self.index, %addr, "connected");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(channel = self.index, error = %e, "connect failed");
                self.fail(&mut regs, &mut st);
            }
        }
        self.finish_command(&mut regs);
    }

    fn send(&self, generation: u64) {
        let Some(plan) = self.plan_send(generation) else {
            return;
        };
        let end = plan.end;
        let len = plan.data.len();
        let sent = self.transmit(plan, generation);

        let Some((mut regs, mut st)) = self.lock_current(generation) else {
            return;
        };
        // The chip consumes the ring whether or not delivery worked.
        st.tx_rd = end;
        match sent {
            Ok(()) => {
                tracing::trace!(channel = self.index, len, "send ok");
                self.raise(&mut regs, irq::SEND_OK);
            }
            Err(e) => {
                tracing::debug!(channel = self.index, error = %e, "send failed");
                self.raise(&mut regs, irq::TIMEOUT);
            }
        }
        self.finish_command(&mut regs);
    }

    fn plan_send(&self, generation: u64) -> Option<SendPlan> {
        let (regs, st) = self.lock_current(generation)?;
        let window = regs.layout().tx[self.index];
        let len = window.pending(st.tx_rd, st.tx_wr);
        let data = regs.read_tx(self.index, st.tx_rd, len);

        let target = match self.status(&regs) {
            Status::Established => match st.binding.stream() {
                Some(stream) => stream.try_clone().map(Target::Stream).map_err(Into::into),
                None => Err(ChipError::NotBound),
            },
            Status::Udp => match st.binding.udp() {
                Some(socket) => {
                    let dest = SocketAddr::from((
                        self.dest_ip(&regs),
                        regs.sock16(self.index, sock::DPORT),
                    ));
                    socket
                        .try_clone()
                        .map(|socket| Target::Udp(socket, dest))
                        .map_err(Into::into)
                }
                None => Err(ChipError::NotBound),
            },
            Status::IpRaw => Ok(Target::Raw {
                proto: regs.sock_byte(self.index, sock::PROTO),
                dest: self.dest_ip(&regs),
            }),
            _ => Err(ChipError::NotBound),
        };

        Some(SendPlan {
            data,
            end: st.tx_wr,
            target,
        })
    }

    fn transmit(&self, plan: SendPlan, generation: u64) -> Result<(), ChipError> {
        let target = plan.target?;
        if plan.data.is_empty() {
            return Ok(());
        }
        match target {
            Target::Stream(mut stream) => {
                stream.write_all(&plan.data)?;
                Ok(())
            }
            Target::Udp(socket, dest) => {
                let n = socket.send_to(&plan.data, dest)?;
                if n != plan.data.len() {
                    return Err(std::io::Error::from(ErrorKind::WriteZero).into());
                }
                Ok(())
            }
            Target::Raw { proto, dest } => self.transmit_raw(proto, dest, plan.data, generation),
        }
    }

    fn transmit_raw(
        &self,
        proto: u8,
        dest: Ipv4Addr,
        message: Vec<u8>,
        generation: u64,
    ) -> Result<(), ChipError> {
        if proto != IP_PROTO_ICMP {
            return Err(ChipError::UnsupportedProtocol(proto));
        }
        if !icmp::is_echo_request(&message) {
            tracing::debug!(channel = self.index, %dest, "non-echo ICMP dropped");
            return Ok(());
        }
        let mut st = self.state();
        if st.generation != generation {
            return Ok(());
        }
        if st.pings.len() >= MAX_PINGS {
            return Err(ChipError::PingBacklog(st.pings.len()));
        }
        st.pings.push(self.shared.pings.probe(dest, message));
        Ok(())
    }

    fn keep_alive(&self, generation: u64) {
        let stream = {
            let Some((_regs, st)) = self.lock_current(generation) else {
                return;
            };
            st.binding.stream().and_then(|s| s.try_clone().ok())
        };
        let alive = stream.is_some_and(|s| matches!(s.take_error(), Ok(None)) && s.peer_addr().is_ok());

        let Some((mut regs, mut st)) = self.lock_current(generation) else {
            return;
        };
        if alive {
            self.raise(&mut regs, irq::SEND_OK);
        } else {
            tracing::debug!(channel = self.index, "keep-alive found connection dead");
            self.fail(&mut regs, &mut st);
        }
        self.finish_command(&mut regs);
    }
}
