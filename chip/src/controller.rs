//! The chip as the guest bus sees it.

use crate::channel::{Channel, Workers};
use crate::config::NetworkConfigProvider;
use crate::host::{DiagnosticSink, HostSockets, SocketFactory, TracingDiagnostics};
use crate::layout::BufferLayout;
use crate::ping::{HostProber, PingSimulator, Prober};
use crate::regs::{
    CHANNEL_BASE, CHANNEL_STRIDE, CHANNELS, RegisterSpace, channel_of, global, sock,
};
use crate::shared::{DEFAULT_RCR, DEFAULT_RTR, Shared};
use crate::types::{Status, mode};
use std::sync::Arc;

const DEFAULT_MEMORY_SIZE: u8 = 0x55;
const DEFAULT_TTL: u8 = 0x80;

/// Global IR bits owned by the channels (one per channel).
const CHANNEL_IR_MASK: u8 = (1 << CHANNELS) - 1;

/// Host-side collaborators the chip bridges to.
pub struct HostParts {
    pub sockets: Arc<dyn SocketFactory>,
    pub prober: Arc<dyn Prober>,
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

impl Default for HostParts {
    fn default() -> Self {
        Self {
            sockets: Arc::new(HostSockets),
            prober: Arc::new(HostProber),
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }
}

pub struct Controller {
    shared: Arc<Shared>,
    channels: Vec<Channel>,
    config: Arc<dyn NetworkConfigProvider>,
}

impl Controller {
    /// A powered-on chip bridged to the host network stack.
    pub fn new(config: Arc<dyn NetworkConfigProvider>) -> Self {
        Self::with_host(config, HostParts::default())
    }

    pub fn with_host(config: Arc<dyn NetworkConfigProvider>, host: HostParts) -> Self {
        let shared = Arc::new(Shared::new(
            host.sockets,
            PingSimulator::new(host.prober),
            host.diagnostics,
        ));
        let channels = (0..CHANNELS)
            .map(|n| Channel::new(n, shared.clone()))
            .collect();
        let controller = Self {
            shared,
            channels,
            config,
        };
        controller.reset(true);
        controller
    }

    /// Guest bus read. Never blocks on host I/O.
    pub fn read(&self, addr: u16) -> u8 {
        let mut regs = self.shared.regs();
        match channel_of(addr) {
            Some((n, reg)) => self.channels[n].read(&mut regs, reg),
            None => regs.get_byte(addr),
        }
    }

    /// Guest bus write. Never blocks on host I/O.
    pub fn write(&self, addr: u16, value: u8) {
        let mut regs = self.shared.regs();
        if let Some((n, reg)) = channel_of(addr) {
            self.channels[n].write(&mut regs, reg, value);
            return;
        }
        match addr {
            global::MR if value & mode::RESET != 0 => {
                tracing::debug!("software reset");
                let workers = self.reset_locked(&mut regs, true);
                drop(regs);
                drop(workers);
            }
            global::IR => {
                // Channel bits mirror Sn_IR; the rest are write-one-to-clear.
                let current = regs.get_byte(addr);
                let cleared = (current & !CHANNEL_IR_MASK) & !value;
                regs.set_byte(addr, (current & CHANNEL_IR_MASK) | cleared);
            }
            global::RMSR | global::TMSR => {
                regs.set_byte(addr, value);
                regs.recompute_layout();
            }
            _ => regs.set_byte(addr, value),
        }
    }

    /// Power-on reset reloads everything, including the network identity
    /// from the config provider. A warm reset only closes the channels and
    /// clears their registers.
    pub fn reset(&self, power_on: bool) {
        let workers = {
            let mut regs = self.shared.regs();
            self.reset_locked(&mut regs, power_on)
        };
        // Detached: in-flight I/O was force-closed and the workers exit on
        // their next poll.
        drop(workers);
    }

    fn reset_locked(&self, regs: &mut RegisterSpace, power_on: bool) -> Vec<Workers> {
        let workers = self
            .channels
            .iter()
            .filter_map(|ch| ch.shutdown(regs))
            .collect();

        if power_on {
            // Always rebuild the space rather than clearing in place.
            *regs = RegisterSpace::new();
            self.load_defaults(regs);
        } else {
            let end = CHANNEL_BASE + CHANNEL_STRIDE * CHANNELS as u16;
            regs.fill(CHANNEL_BASE, end, 0);
            let ir = regs.get_byte(global::IR) & !CHANNEL_IR_MASK;
            regs.set_byte(global::IR, ir);
        }
        tracing::debug!(power_on, "controller reset");
        workers
    }

    fn load_defaults(&self, regs: &mut RegisterSpace) {
        let net = self.config.network_config();
        regs.set_bytes(global::GAR, &net.gateway.octets());
        regs.set_bytes(global::SUBR, &net.subnet.octets());
        regs.set_bytes(global::SHAR, &net.mac);
        regs.set_bytes(global::SIPR, &net.ip.octets());
        regs.set16(global::RTR, DEFAULT_RTR);
        regs.set_byte(global::RCR, DEFAULT_RCR);
        regs.set_byte(global::RMSR, DEFAULT_MEMORY_SIZE);
        regs.set_byte(global::TMSR, DEFAULT_MEMORY_SIZE);
        regs.recompute_layout();
        for n in 0..CHANNELS {
            regs.set_sock_byte(n, sock::TTL, DEFAULT_TTL);
        }
    }

    /// Ordered teardown for application shutdown: every channel is closed
    /// and its workers joined, channel 0 first.
    pub fn die(&self) {
        let workers: Vec<Workers> = {
            let mut regs = self.shared.regs();
            self.channels
                .iter()
                .filter_map(|ch| ch.shutdown(&mut regs))
                .collect()
        };
        for w in workers {
            w.join();
        }
        tracing::debug!("controller stopped");
    }

    pub fn status(&self, channel: usize) -> Status {
        let regs = self.shared.regs();
        self.channels[channel].status(&regs)
    }

    pub fn interrupts(&self, channel: usize) -> u8 {
        self.shared.regs().sock_byte(channel, sock::IR)
    }

    pub fn layout(&self) -> BufferLayout {
        *self.shared.regs().layout()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.die();
    }
}
