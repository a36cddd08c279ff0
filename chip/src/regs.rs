//! Raw register address space.
//!
//! Byte-addressable storage for the whole chip window. Global registers,
//! the four channel blocks and both buffer regions all live here.

use crate::layout::BufferLayout;

pub const CHANNELS: usize = 4;

/// Size of the addressable window.
pub const SPACE_SIZE: usize = 0x8000;

pub const TX_BASE: u16 = 0x4000;
pub const RX_BASE: u16 = 0x6000;

/// Global register offsets.
pub mod global {
    pub const MR: u16 = 0x0000;
    pub const GAR: u16 = 0x0001;
    pub const SUBR: u16 = 0x0005;
    pub const SHAR: u16 = 0x0009;
    pub const SIPR: u16 = 0x000F;
    pub const IR: u16 = 0x0015;
    pub const IMR: u16 = 0x0016;
    pub const RTR: u16 = 0x0017;
    pub const RCR: u16 = 0x0019;
    pub const RMSR: u16 = 0x001A;
    pub const TMSR: u16 = 0x001B;
    pub const END: u16 = 0x0030;
}

/// Channel register offsets, relative to the channel block base.
pub mod sock {
    pub const MR: u16 = 0x00;
    pub const CR: u16 = 0x01;
    pub const IR: u16 = 0x02;
    pub const SR: u16 = 0x03;
    pub const PORT: u16 = 0x04;
    pub const DHAR: u16 = 0x06;
    pub const DIPR: u16 = 0x0C;
    pub const DPORT: u16 = 0x10;
    pub const MSSR: u16 = 0x12;
    pub const PROTO: u16 = 0x14;
    pub const TOS: u16 = 0x15;
    pub const TTL: u16 = 0x16;
    pub const TX_FSR: u16 = 0x20;
    pub const TX_RD: u16 = 0x22;
    pub const TX_WR: u16 = 0x24;
    pub const RX_RSR: u16 = 0x26;
    pub const RX_RD: u16 = 0x28;
    pub const RX_WR: u16 = 0x2A;
}

pub const CHANNEL_BASE: u16 = 0x0400;
pub const CHANNEL_STRIDE: u16 = 0x0100;

pub fn channel_base(n: usize) -> u16 {
    CHANNEL_BASE + CHANNEL_STRIDE * n as u16
}

/// Which channel block `addr` falls in, if any, with the offset inside it.
pub fn channel_of(addr: u16) -> Option<(usize, u16)> {
    if addr < CHANNEL_BASE {
        return None;
    }
    let n = ((addr - CHANNEL_BASE) / CHANNEL_STRIDE) as usize;
    if n >= CHANNELS {
        return None;
    }
    Some((n, (addr - CHANNEL_BASE) % CHANNEL_STRIDE))
}

pub struct RegisterSpace {
    bytes: Box<[u8]>,
    layout: BufferLayout,
}

impl RegisterSpace {
    pub fn new() -> Self {
        Self {
            bytes: vec![0u8; SPACE_SIZE].into_boxed_slice(),
            layout: BufferLayout::default(),
        }
    }

    pub fn get_byte(&self, addr: u16) -> u8 {
        self.bytes.get(addr as usize).copied().unwrap_or(0)
    }

    pub fn set_byte(&mut self, addr: u16, value: u8) {
        if let Some(b) = self.bytes.get_mut(addr as usize) {
            *b = value;
        }
    }

    pub fn get16(&self, addr: u16) -> u16 {
        u16::from_be_bytes([self.get_byte(addr), self.get_byte(addr.wrapping_add(1))])
    }

    pub fn set16(&mut self, addr: u16, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.set_byte(addr, hi);
        self.set_byte(addr.wrapping_add(1), lo);
    }

    pub fn get_bytes<const N: usize>(&self, addr: u16) -> [u8; N] {
        let mut out = [0u8; N];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.get_byte(addr.wrapping_add(i as u16));
        }
        out
    }

    pub fn set_bytes(&mut self, addr: u16, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.set_byte(addr.wrapping_add(i as u16), *b);
        }
    }

    pub fn fill(&mut self, start: u16, end: u16, value: u8) {
        let end = (end as usize).min(SPACE_SIZE);
        let start = (start as usize).min(end);
        self.bytes[start..end].fill(value);
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Rebuild the buffer layout from the current RMSR/TMSR values.
    pub fn recompute_layout(&mut self) {
        self.layout =
            BufferLayout::compute(self.get_byte(global::RMSR), self.get_byte(global::TMSR));
    }

    /// Channel register accessors.
    pub fn sock_byte(&self, n: usize, reg: u16) -> u8 {
        self.get_byte(channel_base(n) + reg)
    }

    pub fn set_sock_byte(&mut self, n: usize, reg: u16, value: u8) {
        self.set_byte(channel_base(n) + reg, value);
    }

    pub fn sock16(&self, n: usize, reg: u16) -> u16 {
        self.get16(channel_base(n) + reg)
    }

    /// Copy `len` bytes out of channel `n`'s TX ring starting at pointer `rd`.
    pub fn read_tx(&self, n: usize, rd: u16, len: u16) -> Vec<u8> {
        let window = self.layout.tx[n];
        (0..len)
            .map(|i| self.get_byte(window.addr(rd.wrapping_add(i))))
            .collect()
    }

    /// Copy `data` into channel `n`'s RX ring starting at pointer `wr`.
    /// Returns the advanced write pointer.
    pub fn write_rx(&mut self, n: usize, wr: u16, data: &[u8]) -> u16 {
        let window = self.layout.rx[n];
        let mut ptr = wr;
        for b in data {
            self.set_byte(window.addr(ptr), *b);
            ptr = ptr.wrapping_add(1);
        }
        ptr
    }
}

impl Default for RegisterSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_is_noop() {
        let mut regs = RegisterSpace::new();
        regs.set_byte(0x8000, 0xAA);
        regs.set_byte(0xFFFF, 0xAA);
        assert_eq!(regs.get_byte(0x8000), 0);
        assert_eq!(regs.get_byte(0xFFFF), 0);
        assert_eq!(regs.get16(0x7FFF), 0);
    }

    #[test]
    fn test_word_access_is_big_endian() {
        let mut regs = RegisterSpace::new();
        regs.set16(global::RTR, 0x07D0);
        assert_eq!(regs.get_byte(global::RTR), 0x07);
        assert_eq!(regs.get_byte(global::RTR + 1), 0xD0);
        assert_eq!(regs.get16(global::RTR), 0x07D0);
    }

    #[test]
    fn test_channel_of() {
        assert_eq!(channel_of(0x0015), None);
        assert_eq!(channel_of(0x0401), Some((0, sock::CR)));
        assert_eq!(channel_of(0x0703), Some((3, sock::SR)));
        assert_eq!(channel_of(0x0800), None);
        assert_eq!(channel_of(TX_BASE), None);
    }

    #[test]
    fn test_rx_ring_write_wraps() {
        let mut regs = RegisterSpace::new();
        let window = regs.layout().rx[1];
        let start = window.size - 2;
        let end = regs.write_rx(1, start, &[1, 2, 3, 4]);
        assert_eq!(end, start + 4);
        assert_eq!(regs.get_byte(window.base + window.size - 2), 1);
        assert_eq!(regs.get_byte(window.base + window.size - 1), 2);
        assert_eq!(regs.get_byte(window.base), 3);
        assert_eq!(regs.get_byte(window.base + 1), 4);
    }

    #[test]
    fn test_tx_ring_read_wraps() {
        let mut regs = RegisterSpace::new();
        let window = regs.layout().tx[0];
        regs.set_byte(window.base + window.size - 1, 0xAB);
        regs.set_byte(window.base, 0xCD);
        assert_eq!(regs.read_tx(0, window.size - 1, 2), vec![0xAB, 0xCD]);
    }
}
