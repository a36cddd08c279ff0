//! State shared between the controller and every channel worker.

use crate::host::{DiagnosticSink, SocketFactory};
use crate::ping::PingSimulator;
use crate::regs::{RegisterSpace, global};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Retry time unit: RTR counts in 100µs steps.
const RETRY_UNIT_MICROS: u64 = 100;
pub(crate) const DEFAULT_RTR: u16 = 0x07D0;
pub(crate) const DEFAULT_RCR: u8 = 0x08;

pub(crate) struct Shared {
    /// The controller-wide lock. Always taken before any channel lock.
    pub regs: Mutex<RegisterSpace>,
    pub sockets: Arc<dyn SocketFactory>,
    pub pings: PingSimulator,
    diagnostics: Arc<dyn DiagnosticSink>,
    reported_ports: Mutex<HashSet<u16>>,
}

impl Shared {
    pub fn new(
        sockets: Arc<dyn SocketFactory>,
        pings: PingSimulator,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            regs: Mutex::new(RegisterSpace::new()),
            sockets,
            pings,
            diagnostics,
            reported_ports: Mutex::new(HashSet::new()),
        }
    }

    pub fn regs(&self) -> MutexGuard<'_, RegisterSpace> {
        lock(&self.regs)
    }

    /// Tell the operator about a bind failure, once per port.
    pub fn report_bind_failure(&self, port: u16, message: &str) {
        if lock(&self.reported_ports).insert(port) {
            self.diagnostics.report(message);
        }
    }
}

/// How long a TCP connect or send may take before the channel reports
/// TIMEOUT, from RTR (100µs units) times RCR.
pub(crate) fn retry_timeout(regs: &RegisterSpace) -> Duration {
    let rtr = regs.get16(global::RTR);
    let rcr = regs.get_byte(global::RCR);
    let (rtr, rcr) = if rtr == 0 || rcr == 0 {
        (DEFAULT_RTR, DEFAULT_RCR)
    } else {
        (rtr, rcr)
    };
    Duration::from_micros(rtr as u64 * RETRY_UNIT_MICROS * rcr as u64)
}

/// Lock a mutex, ignoring poisoning. A panicked worker must not wedge the
/// guest's register accesses.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
