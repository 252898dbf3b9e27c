//! Datagram transport abstraction under the request dispatcher.

use std::fmt::Debug;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::trace;

/// Largest accepted datagram.
const MTU: usize = 2048;

/// How long [UdpTransport::recv] blocks waiting for a datagram.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The transport was shut down and can no longer send or receive.
    #[error("Transport closed")]
    Closed,
}

/// A datagram endpoint the dispatcher sends and receives through.
///
/// Implementations are polled from the node's single thread; [Transport::recv]
/// should block only briefly so the tick loop keeps turning.
pub trait Transport: Debug + Send {
    fn local_addr(&self) -> SocketAddr;

    fn send(&mut self, to: SocketAddr, bytes: &[u8]) -> Result<(), TransportError>;

    /// The next incoming datagram, or `None` if nothing arrived in time.
    fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)>;
}

#[derive(Debug)]
/// [Transport] over a nonblocking UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to `0.0.0.0:port`; a `None` port picks any available one.
    pub fn bind(port: Option<u16>) -> Result<UdpTransport, std::io::Error> {
        let socket = match port {
            Some(port) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?,
            None => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?,
        };

        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let local_addr = socket.local_addr()?;

        Ok(UdpTransport { socket, local_addr })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send(&mut self, to: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(bytes, to)?;
        Ok(())
    }

    fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buffer = [0u8; MTU];

        match self.socket.recv_from(&mut buffer) {
            Ok((amount, SocketAddr::V4(from))) => {
                // A source port of zero can not be responded to.
                if from.port() == 0 {
                    trace!(?from, "Ignored datagram from port 0");
                    return None;
                }

                Some((buffer[..amount].to_vec(), SocketAddr::V4(from)))
            }
            Ok((amount, from)) => Some((buffer[..amount].to_vec(), from)),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug)]
    /// Discards sends and never receives; for unit tests that drive state
    /// machines by hand.
    pub(crate) struct NullTransport;

    impl Transport for NullTransport {
        fn local_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 1))
        }

        fn send(&mut self, _: SocketAddr, _: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
            None
        }
    }
}
