//! Host socket bridge.
//!
//! Channels never touch `std::net` constructors directly; they go through a
//! [`SocketFactory`] so the controller can be pointed at a different host
//! stack (or a fake one) at construction.

use crate::error::ChipError;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{
    self, AddressFamily, SockFlag, SockType, SockaddrIn, bind, getsockopt, setsockopt, sockopt,
};
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

/// Longest single wait inside a connect before `cancelled` is checked again.
const CONNECT_SLICE: Duration = Duration::from_millis(100);

pub trait SocketFactory: Send + Sync {
    /// Open a TCP connection, giving up after `timeout`. Implementations must
    /// poll `cancelled` while waiting and abandon the attempt once it returns
    /// true, so a CLOSE or reset never waits out the retry timeout.
    fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<TcpStream, ChipError>;

    fn listen(&self, port: u16) -> Result<TcpListener, ChipError>;

    /// Bind a UDP socket on `port` (ephemeral when 0), joining `group` when
    /// one is given.
    fn udp(&self, port: u16, group: Option<Ipv4Addr>) -> Result<UdpSocket, ChipError>;
}

/// Sockets on the host's own network stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSockets;

impl SocketFactory for HostSockets {
    fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<TcpStream, ChipError> {
        let stream = connect_nonblocking(addr, timeout, cancelled)
            .map_err(|source| ChipError::Connect { addr, source })?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    fn listen(&self, port: u16) -> Result<TcpListener, ChipError> {
        TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .map_err(|source| ChipError::Bind { port, source })
    }

    fn udp(&self, port: u16, group: Option<Ipv4Addr>) -> Result<UdpSocket, ChipError> {
        let bind_err = |source: io::Error| ChipError::Bind { port, source };

        let fd = socket::socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::empty(),
            None,
        )
        .map_err(|e| bind_err(e.into()))?;

        // Several guests (or a restarted one) may share a multicast port.
        if group.is_some() {
            setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(|e| bind_err(e.into()))?;
        }

        let addr = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        bind(fd.as_raw_fd(), &addr).map_err(|e| bind_err(e.into()))?;

        let socket = UdpSocket::from(fd);
        if let Some(group) = group {
            socket
                .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                .map_err(bind_err)?;
        }
        Ok(socket)
    }
}

fn connect_nonblocking(
    addr: SocketAddr,
    timeout: Duration,
    cancelled: &dyn Fn() -> bool,
) -> io::Result<TcpStream> {
    let SocketAddr::V4(v4) = addr else {
        return Err(io::Error::from(ErrorKind::Unsupported));
    };
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )?;
    match socket::connect(fd.as_raw_fd(), &SockaddrIn::from(v4)) {
        Ok(()) => {}
        Err(Errno::EINPROGRESS) => wait_connected(&fd, timeout, cancelled)?,
        Err(e) => return Err(e.into()),
    }

    let stream = TcpStream::from(fd);
    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Wait for a pending connect to finish, in slices short enough to notice
/// cancellation. Dropping `fd` on any error path aborts the attempt.
fn wait_connected(
    fd: &OwnedFd,
    timeout: Duration,
    cancelled: &dyn Fn() -> bool,
) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancelled() {
            return Err(io::Error::new(ErrorKind::Interrupted, "connect cancelled"));
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(io::Error::from(ErrorKind::TimedOut));
        }
        let slice = left.min(CONNECT_SLICE).as_millis().max(1) as u16;
        let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];
        match poll(&mut fds, PollTimeout::from(slice)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => break,
            Err(e) => return Err(e.into()),
        }
    }

    match getsockopt(fd, sockopt::SocketError)? {
        0 => Ok(()),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

/// Operator-facing sink for host failures the guest can only see as a
/// TIMEOUT. Purely informational.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn report(&self, message: &str) {
        tracing::warn!("{}", message);
    }
}
