use clap::Args;
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};
use uther_chip::{Bus, ChipError, Driver, Protocol, icmp, regs::sock};

use crate::utils::ip_from;

const PING_ID: u16 = 0x5554;
const PAYLOAD: &[u8] = b"uther-ping";

#[derive(Args)]
pub struct PingArgs {
    /// Address to ping
    pub addr: Ipv4Addr,

    /// Number of echo requests
    #[arg(long, short = 'n', default_value_t = 4)]
    pub count: u16,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 2)]
    pub wait: u64,

    /// Channel to ping from
    #[arg(long, short, default_value_t = 3)]
    pub channel: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Echo { from: Ipv4Addr, seq: u16 },
    Unreachable { from: Ipv4Addr },
    Other(u8),
}

/// Decode an IPRAW receive frame: source address, length, ICMP message.
pub fn parse_reply(frame: &[u8]) -> Option<Reply> {
    let from = ip_from(frame)?;
    let len = u16::from_be_bytes([*frame.get(4)?, *frame.get(5)?]) as usize;
    let message = frame.get(6..6 + len)?;
    let kind = *message.first()?;
    let reply = match kind {
        icmp::TYPE_ECHO_REPLY => Reply::Echo {
            from,
            seq: u16::from_be_bytes([*message.get(6)?, *message.get(7)?]),
        },
        icmp::TYPE_DEST_UNREACHABLE => Reply::Unreachable { from },
        other => Reply::Other(other),
    };
    Some(reply)
}

pub fn run_ping<B: Bus>(mut driver: Driver<B>, args: &PingArgs) -> Result<(), ChipError> {
    driver.write_reg(sock::PROTO, icmp::IP_PROTO_ICMP);
    driver.open(Protocol::IpRaw.mode(), 0)?;
    driver.set_dest(args.addr, 0);

    let wait = Duration::from_secs(args.wait);
    let mut received = 0;
    println!("PING {} ({} bytes of data)", args.addr, PAYLOAD.len());

    for seq in 1..=args.count {
        let started = Instant::now();
        driver.send(&icmp::echo_request(PING_ID, seq, PAYLOAD), wait)?;
        match driver.wait_recv(wait) {
            Ok(frame) => match parse_reply(&frame) {
                Some(Reply::Echo { from, seq }) => {
                    received += 1;
                    println!(
                        "reply from {}: seq={} time={:.1}ms",
                        from,
                        seq,
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                }
                Some(Reply::Unreachable { from }) => {
                    println!("from {}: destination host unreachable", from);
                }
                Some(Reply::Other(kind)) => println!("unexpected ICMP type {}", kind),
                None => tracing::debug!(len = frame.len(), "short receive frame"),
            },
            Err(ChipError::Timeout(_)) => println!("request timed out: seq={}", seq),
            Err(e) => return Err(e),
        }
        if seq < args.count {
            thread::sleep(Duration::from_secs(1));
        }
    }

    println!("{} packets transmitted, {} received", args.count, received);
    driver.close()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(from: [u8; 4], message: &[u8]) -> Vec<u8> {
        let mut frame = from.to_vec();
        frame.extend_from_slice(&(message.len() as u16).to_be_bytes());
        frame.extend_from_slice(message);
        frame
    }

    #[test]
    fn test_parse_echo_reply() {
        let reply = icmp::echo_reply(&icmp::echo_request(PING_ID, 3, PAYLOAD));
        assert_eq!(
            parse_reply(&frame([10, 0, 0, 1], &reply)),
            Some(Reply::Echo {
                from: Ipv4Addr::new(10, 0, 0, 1),
                seq: 3
            })
        );
    }

    #[test]
    fn test_parse_unreachable() {
        let msg = icmp::host_unreachable(&icmp::echo_request(PING_ID, 1, b""));
        assert_eq!(
            parse_reply(&frame([10, 0, 0, 2], &msg)),
            Some(Reply::Unreachable {
                from: Ipv4Addr::new(10, 0, 0, 2)
            })
        );
    }

    #[test]
    fn test_parse_truncated_frame() {
        assert_eq!(parse_reply(&[10, 0, 0, 1, 0, 20, 0]), None);
        assert_eq!(parse_reply(&[10, 0]), None);
    }
}
