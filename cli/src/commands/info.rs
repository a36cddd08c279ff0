use uther_chip::regs::{CHANNELS, global};
use uther_chip::{Controller, format_mac};

use crate::utils::{format_size, ip_from};

pub fn show_info(chip: &Controller) {
    let read = |addr: u16, len: u16| -> Vec<u8> { (0..len).map(|i| chip.read(addr + i)).collect() };

    let mac: [u8; 6] = read(global::SHAR, 6).try_into().unwrap_or_default();
    let show_ip = |addr: u16| {
        ip_from(&read(addr, 4))
            .map(|ip| ip.to_string())
            .unwrap_or_default()
    };

    println!("Network:");
    println!("  MAC:     {}", format_mac(&mac));
    println!("  IP:      {}", show_ip(global::SIPR));
    println!("  Subnet:  {}", show_ip(global::SUBR));
    println!("  Gateway: {}", show_ip(global::GAR));

    let layout = chip.layout();
    println!("Channels:");
    println!("  {:<4} {:<12} {:<8} {:<8}", "CH", "STATUS", "TX", "RX");
    for n in 0..CHANNELS {
        println!(
            "  {:<4} {:<12} {:<8} {:<8}",
            n,
            chip.status(n).to_string(),
            format_size(layout.tx[n].size),
            format_size(layout.rx[n].size)
        );
    }
}
