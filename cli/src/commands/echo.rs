use clap::Args;
use std::time::Duration;
use uther_chip::{Bus, ChipError, Driver, Protocol, Status};

/// How often the accept and receive waits give up and re-check.
const WAIT_SLICE: Duration = Duration::from_secs(1);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args)]
pub struct EchoArgs {
    /// TCP port to listen on (0 picks one)
    #[arg(long, short, default_value_t = 7)]
    pub port: u16,

    /// Channel to run the service on
    #[arg(long, short, default_value_t = 0)]
    pub channel: usize,

    /// Exit after the first connection closes
    #[arg(long)]
    pub once: bool,
}

pub fn run_echo<B: Bus>(mut driver: Driver<B>, args: &EchoArgs) -> Result<(), ChipError> {
    loop {
        driver.open(Protocol::Tcp.mode(), args.port)?;
        let port = driver.listen()?;
        println!("Listening on port {} (channel {})", port, driver.channel());

        while let Err(e) = driver.wait_established(WAIT_SLICE) {
            if !matches!(e, ChipError::Timeout(_)) {
                return Err(e);
            }
        }
        println!("Client connected");

        let echoed = serve(&mut driver)?;
        println!("Client disconnected after {} bytes", echoed);
        driver.close()?;

        if args.once {
            return Ok(());
        }
    }
}

/// Echo until the peer hangs up. Returns the byte count.
fn serve<B: Bus>(driver: &mut Driver<B>) -> Result<usize, ChipError> {
    let mut total = 0;
    loop {
        let data = match driver.wait_recv(WAIT_SLICE) {
            Ok(data) => data,
            Err(ChipError::Timeout(_)) => continue,
            Err(e) => return Err(e),
        };
        if data.is_empty() {
            return Ok(total);
        }
        tracing::debug!(len = data.len(), "echoing");
        total += data.len();
        if driver.status() != Status::Established {
            return Ok(total);
        }
        driver.send(&data, SEND_TIMEOUT)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};
    use std::sync::Arc;
    use std::thread;
    use uther_chip::{Controller, NetworkConfig, StaticConfig, regs::sock};

    #[test]
    fn test_echo_once() {
        let chip = Arc::new(Controller::new(Arc::new(StaticConfig(
            NetworkConfig::default(),
        ))));
        let args = EchoArgs {
            port: 0,
            channel: 1,
            once: true,
        };

        let server_chip = chip.clone();
        let server = thread::spawn(move || run_echo(Driver::new(server_chip, 1), &args));

        let mut watcher = Driver::new(chip.clone(), 1);
        let mut port = 0;
        for _ in 0..500 {
            if watcher.status() == Status::Listen {
                port = watcher.read16(sock::PORT);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_ne!(port, 0);

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"echo me").unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"echo me");
        drop(client);

        server.join().unwrap().unwrap();
        chip.die();
    }
}
