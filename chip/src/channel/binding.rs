//! The host resource a channel is bridged to.

use std::net::{Shutdown, TcpListener, TcpStream, UdpSocket};

#[derive(Default)]
pub(crate) enum Binding {
    #[default]
    None,
    /// Outbound connection made by CONNECT.
    Stream(TcpStream),
    /// Bound by LISTEN, waiting for a peer.
    Listener(TcpListener),
    /// LISTEN completed. The listener is kept so the port stays reserved.
    Accepted {
        listener: TcpListener,
        stream: TcpStream,
    },
    Udp(UdpSocket),
}

impl Binding {
    pub fn is_bound(&self) -> bool {
        !matches!(self, Binding::None)
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        match self {
            Binding::Stream(stream) | Binding::Accepted { stream, .. } => Some(stream),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpSocket> {
        match self {
            Binding::Udp(socket) => Some(socket),
            _ => None,
        }
    }

    /// Promote a listening binding once a peer has been accepted.
    pub fn accept(&mut self, stream: TcpStream) {
        *self = match std::mem::take(self) {
            Binding::Listener(listener) => Binding::Accepted { listener, stream },
            // Torn down between accept() returning and us getting the lock.
            other => {
                let _ = stream.shutdown(Shutdown::Both);
                other
            }
        };
    }

    /// Force-close whatever is bound. Workers blocked on a cloned stream
    /// handle wake up immediately; cloned UDP sockets and listeners are
    /// dropped by their worker on its next poll.
    pub fn close(&mut self) {
        match std::mem::take(self) {
            Binding::Stream(stream) | Binding::Accepted { stream, .. } => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Binding::Listener(_) | Binding::Udp(_) | Binding::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_close_unblocks_cloned_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let mut reader = client.try_clone().unwrap();
        let mut binding = Binding::Stream(client);
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            reader.read(&mut buf)
        });

        binding.close();
        assert!(!binding.is_bound());
        let res = handle.join().unwrap();
        assert!(matches!(res, Ok(0) | Err(_)));
    }

    #[test]
    fn test_accept_promotes_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut binding = Binding::Listener(listener.try_clone().unwrap());
        let _client = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();

        binding.accept(stream);
        assert!(binding.stream().is_some());
        assert!(matches!(binding, Binding::Accepted { .. }));
    }

    #[test]
    fn test_accept_after_close_drops_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();

        let mut binding = Binding::None;
        binding.accept(stream);
        assert!(!binding.is_bound());

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }
}
