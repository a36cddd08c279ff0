//! Firmware-side channel driver.
//!
//! Talks to the chip purely through [`Bus`] register accesses, the way
//! guest network firmware does. Used by the harness binary and by the
//! end-to-end tests.

use crate::bus::Bus;
use crate::error::ChipError;
use crate::layout::{BufferLayout, Window};
use crate::regs::{channel_base, global, sock};
use crate::types::{Command, Status, irq};
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(2);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Driver<B> {
    bus: B,
    channel: usize,
}

impl<B: Bus> Driver<B> {
    pub fn new(bus: B, channel: usize) -> Self {
        Self { bus, channel }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn bus(&mut self) -> &mut B {
        &mut self.bus
    }

    fn addr(&self, reg: u16) -> u16 {
        channel_base(self.channel) + reg
    }

    pub fn read_reg(&mut self, reg: u16) -> u8 {
        let addr = self.addr(reg);
        self.bus.read(addr)
    }

    pub fn write_reg(&mut self, reg: u16, value: u8) {
        let addr = self.addr(reg);
        self.bus.write(addr, value);
    }

    /// 16-bit read, high byte first so counters latch.
    pub fn read16(&mut self, reg: u16) -> u16 {
        let hi = self.read_reg(reg);
        let lo = self.read_reg(reg + 1);
        u16::from_be_bytes([hi, lo])
    }

    /// 16-bit write, high byte first so pointers commit on the low byte.
    pub fn write16(&mut self, reg: u16, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.write_reg(reg, hi);
        self.write_reg(reg + 1, lo);
    }

    pub fn status(&mut self) -> Status {
        Status::from_code(self.read_reg(sock::SR))
    }

    pub fn interrupts(&mut self) -> u8 {
        self.read_reg(sock::IR)
    }

    pub fn clear_interrupts(&mut self, bits: u8) {
        self.write_reg(sock::IR, bits);
    }

    fn layout(&mut self) -> BufferLayout {
        let rmsr = self.bus.read(global::RMSR);
        let tmsr = self.bus.read(global::TMSR);
        BufferLayout::compute(rmsr, tmsr)
    }

    fn tx_window(&mut self) -> Window {
        self.layout().tx[self.channel]
    }

    fn rx_window(&mut self) -> Window {
        self.layout().rx[self.channel]
    }

    /// Poll `done` until it holds or `timeout` passes.
    pub fn wait_until(
        &mut self,
        what: &'static str,
        timeout: Duration,
        mut done: impl FnMut(&mut Self) -> Result<bool, ChipError>,
    ) -> Result<(), ChipError> {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ChipError::Timeout(what));
            }
            thread::sleep(POLL);
        }
    }

    /// Issue `cmd` and wait for the chip to accept it (Sn_CR back to 0).
    pub fn command(&mut self, cmd: Command) -> Result<(), ChipError> {
        tracing::trace!(channel = self.channel, ?cmd, "issue command");
        self.write_reg(sock::CR, cmd.code());
        self.wait_until("command", COMMAND_TIMEOUT, |d| Ok(d.read_reg(sock::CR) == 0))
    }

    /// Set the protocol mode and source port, then OPEN.
    pub fn open(&mut self, mode: u8, port: u16) -> Result<Status, ChipError> {
        self.write_reg(sock::MR, mode);
        self.write16(sock::PORT, port);
        self.command(Command::Open)?;
        Ok(self.status())
    }

    pub fn set_dest(&mut self, ip: Ipv4Addr, port: u16) {
        for (i, b) in ip.octets().into_iter().enumerate() {
            self.write_reg(sock::DIPR + i as u16, b);
        }
        self.write16(sock::DPORT, port);
    }

    /// LISTEN and return the bound port (the ephemeral one when 0 was set).
    pub fn listen(&mut self) -> Result<u16, ChipError> {
        self.command(Command::Listen)?;
        if self.status() != Status::Listen {
            return Err(ChipError::Closed("listen"));
        }
        Ok(self.read16(sock::PORT))
    }

    pub fn wait_established(&mut self, timeout: Duration) -> Result<(), ChipError> {
        self.wait_until("connection", timeout, |d| match d.status() {
            Status::Established => Ok(true),
            Status::Init | Status::Listen => Ok(false),
            _ => Err(ChipError::Closed("connection")),
        })
    }

    pub fn connect(
        &mut self,
        ip: Ipv4Addr,
        port: u16,
        timeout: Duration,
    ) -> Result<(), ChipError> {
        self.set_dest(ip, port);
        self.write_reg(sock::CR, Command::Connect.code());
        self.wait_established(timeout)
    }

    /// Copy `data` into the TX ring, SEND it and wait for SEND_OK.
    ///
    /// A full window cannot be told apart from an empty one, so at most
    /// `size - 1` bytes fit in a single SEND.
    pub fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), ChipError> {
        let window = self.tx_window();
        if data.len() >= window.size as usize {
            return Err(ChipError::InvalidConfig(format!(
                "{} bytes does not fit the {} byte TX window",
                data.len(),
                window.size
            )));
        }
        let len = data.len() as u16;
        self.wait_until("tx space", timeout, |d| Ok(d.read16(sock::TX_FSR) >= len))?;

        let wr = self.read16(sock::TX_WR);
        for (i, b) in data.iter().enumerate() {
            let addr = window.addr(wr.wrapping_add(i as u16));
            self.bus.write(addr, *b);
        }
        self.write16(sock::TX_WR, wr.wrapping_add(len));

        self.clear_interrupts(irq::SEND_OK | irq::TIMEOUT);
        self.command(Command::Send)?;
        self.wait_until("send", timeout, |d| {
            let ir = d.interrupts();
            if ir & irq::TIMEOUT != 0 {
                return Err(ChipError::Timeout("send completion"));
            }
            Ok(ir & irq::SEND_OK != 0)
        })?;
        self.clear_interrupts(irq::SEND_OK);
        Ok(())
    }

    /// Drain everything in the RX ring and re-arm receiving.
    pub fn recv(&mut self) -> Result<Vec<u8>, ChipError> {
        let window = self.rx_window();
        let size = self.read16(sock::RX_RSR);
        let rd = self.read16(sock::RX_RD);
        let data = (0..size)
            .map(|i| {
                let addr = window.addr(rd.wrapping_add(i));
                self.bus.read(addr)
            })
            .collect();
        self.write16(sock::RX_RD, rd.wrapping_add(size));
        self.clear_interrupts(irq::RECV);
        self.command(Command::Recv)?;
        Ok(data)
    }

    /// Wait for received data. An empty result means the peer closed.
    pub fn wait_recv(&mut self, timeout: Duration) -> Result<Vec<u8>, ChipError> {
        let mut closed = false;
        self.wait_until("receive", timeout, |d| {
            if d.read16(sock::RX_RSR) > 0 {
                return Ok(true);
            }
            closed = matches!(d.status(), Status::Closed | Status::CloseWait);
            Ok(closed)
        })?;
        if closed {
            return Ok(Vec::new());
        }
        self.recv()
    }

    pub fn close(&mut self) -> Result<(), ChipError> {
        self.command(Command::Close)
    }
}
