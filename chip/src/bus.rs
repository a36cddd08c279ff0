//! Guest-side access paths to the register window.

use crate::controller::Controller;
use crate::regs::global;
use crate::types::mode;
use std::sync::Arc;

/// Byte-wide register access as the guest performs it.
pub trait Bus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
}

impl Bus for &Controller {
    fn read(&mut self, addr: u16) -> u8 {
        Controller::read(self, addr)
    }

    fn write(&mut self, addr: u16, value: u8) {
        Controller::write(self, addr, value)
    }
}

impl Bus for Arc<Controller> {
    fn read(&mut self, addr: u16) -> u8 {
        Controller::read(self, addr)
    }

    fn write(&mut self, addr: u16, value: u8) {
        Controller::write(self, addr, value)
    }
}

impl<B: Bus + ?Sized> Bus for Box<B> {
    fn read(&mut self, addr: u16) -> u8 {
        (**self).read(addr)
    }

    fn write(&mut self, addr: u16, value: u8) {
        (**self).write(addr, value)
    }
}

/// Indirect bus interface ports.
pub mod port {
    pub const MODE: u8 = 0;
    pub const ADDR_HI: u8 = 1;
    pub const ADDR_LO: u8 = 2;
    pub const DATA: u8 = 3;
}

/// The four-port indirect interface exposed by the Apple II card: an
/// address latch plus a data port, with optional auto-increment.
pub struct IndirectBus {
    controller: Arc<Controller>,
    address: u16,
}

impl IndirectBus {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self {
            controller,
            address: 0,
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Read one of the four ports. Only the low two bits of `port` decode.
    pub fn read_port(&mut self, port: u8) -> u8 {
        match port & 0x03 {
            port::MODE => self.controller.read(global::MR),
            port::ADDR_HI => (self.address >> 8) as u8,
            port::ADDR_LO => self.address as u8,
            _ => {
                let value = self.controller.read(self.address);
                self.advance();
                value
            }
        }
    }

    pub fn write_port(&mut self, port: u8, value: u8) {
        match port & 0x03 {
            port::MODE => self.controller.write(global::MR, value),
            port::ADDR_HI => self.address = (self.address & 0x00FF) | (value as u16) << 8,
            port::ADDR_LO => self.address = (self.address & 0xFF00) | value as u16,
            _ => {
                self.controller.write(self.address, value);
                self.advance();
            }
        }
    }

    fn advance(&mut self) {
        if self.controller.read(global::MR) & mode::AUTO_INCREMENT != 0 {
            self.address = self.address.wrapping_add(1);
        }
    }

    fn select(&mut self, addr: u16) {
        let [hi, lo] = addr.to_be_bytes();
        self.write_port(port::ADDR_HI, hi);
        self.write_port(port::ADDR_LO, lo);
    }
}

impl Bus for IndirectBus {
    fn read(&mut self, addr: u16) -> u8 {
        self.select(addr);
        self.read_port(port::DATA)
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.select(addr);
        self.write_port(port::DATA, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkConfig, StaticConfig};
    use crate::regs::{TX_BASE, channel_base, sock};

    fn bus() -> IndirectBus {
        let controller = Controller::new(Arc::new(StaticConfig(NetworkConfig::default())));
        IndirectBus::new(Arc::new(controller))
    }

    #[test]
    fn test_address_latch() {
        let mut bus = bus();
        bus.write_port(port::ADDR_HI, 0x12);
        bus.write_port(port::ADDR_LO, 0x34);
        assert_eq!(bus.address(), 0x1234);
        assert_eq!(bus.read_port(port::ADDR_HI), 0x12);
        assert_eq!(bus.read_port(port::ADDR_LO), 0x34);
    }

    #[test]
    fn test_data_port_without_auto_increment() {
        let mut bus = bus();
        bus.select(TX_BASE);
        bus.write_port(port::DATA, 0xAB);
        bus.write_port(port::DATA, 0xCD);
        assert_eq!(bus.address(), TX_BASE);
        assert_eq!(bus.read_port(port::DATA), 0xCD);
    }

    #[test]
    fn test_auto_increment_streams_bytes() {
        let mut bus = bus();
        bus.write_port(port::MODE, mode::INDIRECT | mode::AUTO_INCREMENT);
        bus.select(global::SIPR);
        let ip: Vec<u8> = (0..4).map(|_| bus.read_port(port::DATA)).collect();
        assert_eq!(ip, vec![192, 168, 65, 100]);
        assert_eq!(bus.address(), global::SIPR + 4);
    }

    #[test]
    fn test_auto_increment_wraps() {
        let mut bus = bus();
        bus.write_port(port::MODE, mode::AUTO_INCREMENT);
        bus.select(0xFFFF);
        bus.read_port(port::DATA);
        assert_eq!(bus.address(), 0x0000);
    }

    #[test]
    fn test_bus_trait_reaches_channel_registers() {
        let mut bus = bus();
        let port_reg = channel_base(2) + sock::PORT;
        Bus::write(&mut bus, port_reg, 0x1F);
        Bus::write(&mut bus, port_reg + 1, 0x90);
        assert_eq!(Bus::read(&mut bus, port_reg), 0x1F);
        assert_eq!(Bus::read(&mut bus, port_reg + 1), 0x90);
    }

    #[test]
    fn test_mode_port_reset() {
        let mut bus = bus();
        Bus::write(&mut bus, global::RTR, 0x00);
        bus.write_port(port::MODE, mode::RESET);
        assert_eq!(Bus::read(&mut bus, global::RTR), 0x07);
    }
}
