//! TX/RX buffer memory layout and ring arithmetic.
//!
//! Each direction has 8 KiB shared by the four channels. RMSR/TMSR hold a
//! 2-bit size code per channel (channel 0 in bits 1:0). Windows are packed
//! in channel order, so a channel's base depends on every lower channel.

use crate::regs::{CHANNELS, RX_BASE, TX_BASE};

/// Bytes of buffer memory per direction.
pub const REGION_SIZE: u16 = 0x2000;

/// One channel's slice of TX or RX memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub base: u16,
    /// Power of two in 1024..=8192, or 0 when the region is exhausted.
    pub size: u16,
}

impl Window {
    pub fn mask(&self) -> u16 {
        self.size.wrapping_sub(1)
    }

    pub fn is_usable(&self) -> bool {
        self.size != 0
    }

    /// Absolute register-space address for ring pointer `ptr`.
    pub fn addr(&self, ptr: u16) -> u16 {
        self.base + (ptr & self.mask())
    }

    /// Bytes between the read and write pointers.
    pub fn pending(&self, rd: u16, wr: u16) -> u16 {
        if !self.is_usable() {
            return 0;
        }
        wr.wrapping_sub(rd) & self.mask()
    }

    pub fn free(&self, rd: u16, wr: u16) -> u16 {
        self.size - self.pending(rd, wr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub tx: [Window; CHANNELS],
    pub rx: [Window; CHANNELS],
}

impl BufferLayout {
    pub fn compute(rmsr: u8, tmsr: u8) -> Self {
        Self {
            tx: pack(TX_BASE, tmsr),
            rx: pack(RX_BASE, rmsr),
        }
    }
}

impl Default for BufferLayout {
    fn default() -> Self {
        Self::compute(0x55, 0x55)
    }
}

fn size_for_code(code: u8) -> u16 {
    1024 << (code & 0x03)
}

fn pack(region_base: u16, codes: u8) -> [Window; CHANNELS] {
    let mut windows = [Window { base: region_base, size: 0 }; CHANNELS];
    let mut used = 0u16;
    for (n, window) in windows.iter_mut().enumerate() {
        let size = size_for_code(codes >> (n * 2));
        window.base = region_base + used.min(REGION_SIZE);
        if used + size <= REGION_SIZE {
            window.size = size;
            used += size;
        } else {
            used = REGION_SIZE;
        }
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_is_2k_each() {
        let layout = BufferLayout::default();
        for n in 0..CHANNELS {
            assert_eq!(layout.tx[n].size, 2048);
            assert_eq!(layout.tx[n].base, TX_BASE + 2048 * n as u16);
            assert_eq!(layout.rx[n].base, RX_BASE + 2048 * n as u16);
        }
    }

    #[test]
    fn test_mixed_codes_are_cumulative() {
        // ch0 8K, rest would overflow.
        let layout = BufferLayout::compute(0x03, 0b00_01_10_00);
        assert_eq!(layout.rx[0].size, 8192);
        assert!(!layout.rx[1].is_usable());
        assert!(!layout.rx[3].is_usable());

        assert_eq!(layout.tx[0].size, 1024);
        assert_eq!(layout.tx[1].base, TX_BASE + 1024);
        assert_eq!(layout.tx[1].size, 4096);
        assert_eq!(layout.tx[2].base, TX_BASE + 1024 + 4096);
        assert_eq!(layout.tx[2].size, 2048);
        assert_eq!(layout.tx[3].base, TX_BASE + 1024 + 4096 + 2048);
        assert_eq!(layout.tx[3].size, 1024);
    }

    #[test]
    fn test_pending_matches_modulo_for_all_sizes() {
        for size in [1024u16, 2048, 4096, 8192] {
            let w = Window { base: TX_BASE, size };
            let samples = [0u16, 1, 5, size - 1, size, size + 3, 0x7FFF, 0xFFFE, 0xFFFF];
            for &rd in &samples {
                for &wr in &samples {
                    let expected = ((wr as i64 - rd as i64).rem_euclid(size as i64)) as u16;
                    assert_eq!(w.pending(rd, wr), expected, "size={size} rd={rd} wr={wr}");
                    assert_eq!(w.free(rd, wr), size - expected);
                }
            }
        }
    }

    #[test]
    fn test_pending_wraparound() {
        let w = Window { base: RX_BASE, size: 2048 };
        // Write pointer has wrapped the 16-bit counter.
        assert_eq!(w.pending(0xFFFC, 0x0004), 8);
        assert_eq!(w.addr(0xFFFC), RX_BASE + 2044);
        assert_eq!(w.addr(0x0004), RX_BASE + 4);
    }
}
