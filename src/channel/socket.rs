use std::io;
use std::net::SocketAddr;
#[cfg(test)] use mockall::automock;
use socket2::{SockAddr, SockRef};
use tokio::net::UdpSocket;

/// This is an abstraction for non-blocking I/O on a datagram socket, introduced to decouple the
///  channel from tokio and to facilitate mocking the I/O part away for testing.
///
/// All operations must return immediately: if there is nothing to read or the socket's send
///  buffer is full, they return an error of kind [io::ErrorKind::WouldBlock].
///
/// NB: The tokio implementation relies on readiness that tokio has already observed. Callers
///      must await `readable()` / `writable()` on the socket before each call, otherwise the
///      call reports [io::ErrorKind::WouldBlock] even if the socket is ready. The event loop does
///      this for every event it dispatches.
#[cfg_attr(test, automock)]
pub trait DatagramSocket: Send + Sync + 'static {
    /// receive a single datagram, returning the sender's address
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// receive a single datagram from the connected peer
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// send a single datagram to the connected peer
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Restrict the socket to a single peer: after this, [DatagramSocket::send] goes to this peer,
    ///  and only datagrams from this peer are received
    fn connect(&self, peer: SocketAddr) -> io::Result<()>;
}

impl DatagramSocket for UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.try_recv_from(buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_recv(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.try_send(buf)
    }

    fn connect(&self, peer: SocketAddr) -> io::Result<()> {
        // tokio's connect() is async; connecting a UDP socket does not block, so we do it directly
        SockRef::from(self).connect(&SockAddr::from(peer))
    }
}
