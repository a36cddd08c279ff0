//! One hardware channel ("socket") and its two background workers.
//!
//! The guest side (`read`/`write`) runs with the controller lock held and
//! never blocks. Anything that touches the host network is queued to the
//! command worker; incoming data is pumped by the receive worker. Both
//! workers report back purely by mutating registers.
//!
//! Lock order is always controller registers first, then channel state.
//! Neither lock is held across blocking I/O.

mod binding;
mod recv;
mod worker;

use crate::ping::Ping;
use crate::regs::{RegisterSpace, channel_base, global, sock};
use crate::shared::{Shared, lock, retry_timeout};
use crate::types::{Command, MODE_MULTICAST, Protocol, Status, irq};
use binding::Binding;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use worker::Job;

/// Upper bound on how long a worker can go without noticing teardown.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

const JOB_QUEUE_DEPTH: usize = 4;

/// Echo requests a channel may have in flight before SEND fails.
pub(crate) const MAX_PINGS: usize = 16;

/// The six latched 16-bit counters, TX_FSR through RX_WR.
const COUNTERS: usize = 6;

pub(crate) struct ChannelState {
    pub tx_rd: u16,
    pub tx_wr: u16,
    pub rx_rd: u16,
    pub rx_wr: u16,
    pub rx_enabled: bool,
    pub protocol: Protocol,
    pub binding: Binding,
    pub pings: Vec<Ping>,
    /// Bumped on every teardown; worker results tagged with an older value
    /// are discarded.
    pub generation: u64,
    workers: Option<Workers>,
    latched: [bool; COUNTERS],
}

impl ChannelState {
    fn new() -> Self {
        Self {
            tx_rd: 0,
            tx_wr: 0,
            rx_rd: 0,
            rx_wr: 0,
            rx_enabled: false,
            protocol: Protocol::Closed,
            binding: Binding::None,
            pings: Vec::new(),
            generation: 0,
            workers: None,
            latched: [false; COUNTERS],
        }
    }

    fn reset_pointers(&mut self) {
        self.tx_rd = 0;
        self.tx_wr = 0;
        self.rx_rd = 0;
        self.rx_wr = 0;
        self.latched = [false; COUNTERS];
    }
}

/// Handles for one open session's workers.
pub(crate) struct Workers {
    jobs: SyncSender<Job>,
    command: JoinHandle<()>,
    receive: JoinHandle<()>,
}

impl Workers {
    /// Wait for both workers to exit. Must be called without holding the
    /// controller or channel locks.
    pub fn join(self) {
        drop(self.jobs);
        let current = thread::current().id();
        for handle in [self.command, self.receive] {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

struct Inner {
    state: Mutex<ChannelState>,
    rx_wake: Condvar,
}

#[derive(Clone)]
pub(crate) struct Channel {
    index: usize,
    shared: Arc<Shared>,
    inner: Arc<Inner>,
}

impl Channel {
    pub fn new(index: usize, shared: Arc<Shared>) -> Self {
        Self {
            index,
            shared,
            inner: Arc::new(Inner {
                state: Mutex::new(ChannelState::new()),
                rx_wake: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        lock(&self.inner.state)
    }

    fn base(&self) -> u16 {
        channel_base(self.index)
    }

    pub fn status(&self, regs: &RegisterSpace) -> Status {
        Status::from_code(regs.sock_byte(self.index, sock::SR))
    }

    fn set_status(&self, regs: &mut RegisterSpace, status: Status) {
        tracing::trace!(channel = self.index, %status, "status");
        regs.set_sock_byte(self.index, sock::SR, status.code());
    }

    fn raise(&self, regs: &mut RegisterSpace, bits: u8) {
        let ir = regs.sock_byte(self.index, sock::IR) | bits;
        regs.set_sock_byte(self.index, sock::IR, ir);
        self.sync_global_ir(regs);
    }

    fn sync_global_ir(&self, regs: &mut RegisterSpace) {
        let bit = 1u8 << self.index;
        let global_ir = regs.get_byte(global::IR);
        let global_ir = if regs.sock_byte(self.index, sock::IR) != 0 {
            global_ir | bit
        } else {
            global_ir & !bit
        };
        regs.set_byte(global::IR, global_ir);
    }

    fn finish_command(&self, regs: &mut RegisterSpace) {
        regs.set_sock_byte(self.index, sock::CR, 0);
    }

    fn dest_ip(&self, regs: &RegisterSpace) -> Ipv4Addr {
        Ipv4Addr::from(regs.get_bytes::<4>(self.base() + sock::DIPR))
    }

    /// Guest read of a channel register.
    pub fn read(&self, regs: &mut RegisterSpace, reg: u16) -> u8 {
        if (sock::TX_FSR..sock::TX_FSR + 2 * COUNTERS as u16).contains(&reg) {
            let mut st = self.state();
            let word = reg & !1;
            let slot = ((word - sock::TX_FSR) / 2) as usize;
            if reg == word {
                let value = self.counter(regs, &st, word);
                regs.set16(self.base() + word, value);
                st.latched[slot] = true;
            } else {
                if !st.latched[slot] {
                    let value = self.counter(regs, &st, word);
                    regs.set16(self.base() + word, value);
                }
                st.latched[slot] = false;
            }
        }
        regs.sock_byte(self.index, reg)
    }

    fn counter(&self, regs: &RegisterSpace, st: &ChannelState, word: u16) -> u16 {
        let layout = regs.layout();
        match word {
            sock::TX_FSR => layout.tx[self.index].free(st.tx_rd, st.tx_wr),
            sock::TX_RD => st.tx_rd,
            sock::TX_WR => st.tx_wr,
            sock::RX_RSR => layout.rx[self.index].pending(st.rx_rd, st.rx_wr),
            sock::RX_RD => st.rx_rd,
            sock::RX_WR => st.rx_wr,
            _ => 0,
        }
    }

    /// Guest write of a channel register.
    pub fn write(&self, regs: &mut RegisterSpace, reg: u16, value: u8) {
        let word = reg & !1;
        match reg {
            sock::CR => {
                regs.set_sock_byte(self.index, sock::CR, value);
                self.command(regs, value);
            }
            sock::IR => {
                let ir = regs.sock_byte(self.index, sock::IR) & !value;
                regs.set_sock_byte(self.index, sock::IR, ir);
                self.sync_global_ir(regs);
            }
            sock::SR => {
                tracing::debug!(channel = self.index, value, "write to status ignored");
            }
            _ if word == sock::TX_FSR || word == sock::RX_RSR => {
                tracing::debug!(channel = self.index, reg, value, "write to size ignored");
            }
            _ if matches!(word, sock::TX_RD | sock::TX_WR | sock::RX_RD | sock::RX_WR) => {
                regs.set_sock_byte(self.index, reg, value);
                // High byte only stages; the low byte commits the pair.
                if reg != word {
                    let committed = regs.sock16(self.index, word);
                    let mut st = self.state();
                    match word {
                        sock::TX_RD => st.tx_rd = committed,
                        sock::TX_WR => st.tx_wr = committed,
                        sock::RX_RD => st.rx_rd = committed,
                        _ => st.rx_wr = committed,
                    }
                }
            }
            _ => regs.set_sock_byte(self.index, reg, value),
        }
    }

    fn command(&self, regs: &mut RegisterSpace, value: u8) {
        let Some(cmd) = Command::from_code(value) else {
            tracing::debug!(channel = self.index, value, "unknown command ignored");
            self.finish_command(regs);
            return;
        };
        let status = self.status(regs);
        let mut st = self.state();
        tracing::debug!(channel = self.index, ?cmd, %status, "command");

        let deferred = match cmd {
            Command::Open => self.open(regs, &mut st, status),
            Command::Listen => self.listen(regs, &mut st, status),
            Command::Connect => self.connect(regs, &mut st, status),
            Command::Discon | Command::Close => {
                self.close(regs, &mut st);
                false
            }
            Command::Send => status.can_send() && self.queue(regs, &st, Job::Send),
            Command::SendMac => {
                matches!(status, Status::Udp | Status::IpRaw) && self.queue(regs, &st, Job::Send)
            }
            Command::SendKeep => {
                status == Status::Established && self.queue(regs, &st, Job::KeepAlive)
            }
            Command::Recv => {
                if status.can_send() {
                    st.rx_enabled = true;
                    self.inner.rx_wake.notify_all();
                }
                false
            }
        };

        // Deferred commands are cleared by the worker once applied.
        if !deferred {
            self.finish_command(regs);
        }
    }

    fn open(&self, regs: &mut RegisterSpace, st: &mut ChannelState, status: Status) -> bool {
        if status != Status::Closed {
            return false;
        }
        let mode = regs.sock_byte(self.index, sock::MR);
        let protocol = Protocol::from_mode(mode);
        st.reset_pointers();
        st.protocol = protocol;

        match protocol {
            Protocol::Closed => {
                tracing::debug!(channel = self.index, mode, "open without protocol ignored");
                false
            }
            Protocol::Tcp => {
                if self.ensure_workers(regs, st) {
                    self.set_status(regs, Status::Init);
                }
                false
            }
            Protocol::Udp => {
                let port = regs.sock16(self.index, sock::PORT);
                let group = (mode & MODE_MULTICAST != 0).then(|| self.dest_ip(regs));
                self.set_status(regs, Status::Udp);
                if !self.ensure_workers(regs, st) {
                    return false;
                }
                if self.queue(regs, st, Job::BindUdp { port, group }) {
                    true
                } else {
                    self.fail(regs, st);
                    false
                }
            }
            Protocol::IpRaw => {
                if self.ensure_workers(regs, st) {
                    self.set_status(regs, Status::IpRaw);
                    st.rx_enabled = true;
                    self.inner.rx_wake.notify_all();
                }
                false
            }
            Protocol::MacRaw => {
                tracing::debug!(channel = self.index, "MACRAW accepted but not emulated");
                self.set_status(regs, Status::MacRaw);
                false
            }
            Protocol::Pppoe => {
                tracing::debug!(channel = self.index, "PPPoE accepted but not emulated");
                self.set_status(regs, Status::Pppoe);
                false
            }
        }
    }

    fn listen(&self, regs: &mut RegisterSpace, st: &mut ChannelState, status: Status) -> bool {
        if status != Status::Init {
            return false;
        }
        let port = regs.sock16(self.index, sock::PORT);
        let bound = self.shared.sockets.listen(port).and_then(|listener| {
            let handle = listener.try_clone()?;
            Ok((listener, handle))
        });

        match bound {
            Ok((listener, handle)) => {
                if port == 0
                    && let Ok(local) = listener.local_addr()
                {
                    regs.set16(self.base() + sock::PORT, local.port());
                }
                st.binding = Binding::Listener(listener);
                self.set_status(regs, Status::Listen);
                if !self.queue(regs, st, Job::Accept(handle)) {
                    self.fail(regs, st);
                }
            }
            Err(e) => {
                if e.is_bind_failure() {
                    self.shared
                        .report_bind_failure(port, &format!("channel {}: {}", self.index, e));
                }
                tracing::debug!(channel = self.index, error = %e, "listen failed");
                self.fail(regs, st);
            }
        }
        false
    }

    fn connect(&self, regs: &mut RegisterSpace, st: &mut ChannelState, status: Status) -> bool {
        if status != Status::Init {
            return false;
        }
        let addr = SocketAddr::from((self.dest_ip(regs), regs.sock16(self.index, sock::DPORT)));
        let timeout = retry_timeout(regs);
        if self.queue(regs, st, Job::Connect { addr, timeout }) {
            true
        } else {
            self.fail(regs, st);
            false
        }
    }

    /// Guest-initiated CLOSE/DISCON. Safe on an already closed channel.
    fn close(&self, regs: &mut RegisterSpace, st: &mut ChannelState) {
        // Detach: workers notice the new generation within one poll.
        drop(self.release(st));
        st.reset_pointers();
        st.protocol = Protocol::Closed;
        self.set_status(regs, Status::Closed);
    }

    /// Host I/O failed: back to CLOSED with TIMEOUT, like the chip does when
    /// its retransmissions run out.
    fn fail(&self, regs: &mut RegisterSpace, st: &mut ChannelState) {
        drop(self.release(st));
        st.protocol = Protocol::Closed;
        self.set_status(regs, Status::Closed);
        self.raise(regs, irq::TIMEOUT);
    }

    /// Drop the host resource and invalidate the current workers. Returns
    /// their handles exactly once; later calls return `None`.
    fn release(&self, st: &mut ChannelState) -> Option<Workers> {
        if st.binding.is_bound() {
            tracing::debug!(channel = self.index, "releasing host socket");
        }
        st.generation = st.generation.wrapping_add(1);
        st.binding.close();
        st.pings.clear();
        st.rx_enabled = false;
        self.inner.rx_wake.notify_all();
        st.workers.take()
    }

    /// Controller reset/teardown path. The caller joins the returned
    /// workers after releasing the locks.
    pub fn shutdown(&self, regs: &mut RegisterSpace) -> Option<Workers> {
        let mut st = self.state();
        let workers = self.release(&mut st);
        st.reset_pointers();
        st.protocol = Protocol::Closed;
        self.set_status(regs, Status::Closed);
        workers
    }

    fn ensure_workers(&self, regs: &mut RegisterSpace, st: &mut ChannelState) -> bool {
        if st.workers.is_some() {
            return true;
        }
        match self.spawn_workers(st.generation) {
            Ok(workers) => {
                st.workers = Some(workers);
                true
            }
            Err(e) => {
                tracing::warn!(channel = self.index, error = %e, "failed to spawn channel workers");
                self.fail(regs, st);
                false
            }
        }
    }

    fn spawn_workers(&self, generation: u64) -> std::io::Result<Workers> {
        let (jobs, queue) = mpsc::sync_channel(JOB_QUEUE_DEPTH);

        let channel = self.clone();
        let command = thread::Builder::new()
            .name(format!("uther-ch{}-cmd", self.index))
            .spawn(move || channel.command_loop(queue, generation))?;

        let channel = self.clone();
        let receive = thread::Builder::new()
            .name(format!("uther-ch{}-rx", self.index))
            .spawn(move || channel.receive_loop(generation))?;

        Ok(Workers {
            jobs,
            command,
            receive,
        })
    }

    /// Hand a job to the command worker. A full queue drops the command and
    /// reports TIMEOUT; firmware is expected to wait for Sn_CR to clear.
    fn queue(&self, regs: &mut RegisterSpace, st: &ChannelState, job: Job) -> bool {
        let Some(workers) = st.workers.as_ref() else {
            return false;
        };
        match workers.jobs.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(channel = self.index, "command queue full, dropping command");
                self.raise(regs, irq::TIMEOUT);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state().generation == generation
    }

    /// Take both locks for a worker finishing work started in `generation`.
    /// `None` when the channel has been torn down since.
    fn lock_current(
        &self,
        generation: u64,
    ) -> Option<(MutexGuard<'_, RegisterSpace>, MutexGuard<'_, ChannelState>)> {
        let regs = self.shared.regs();
        let st = self.state();
        (st.generation == generation).then_some((regs, st))
    }
}
