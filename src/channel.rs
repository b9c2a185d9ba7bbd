//! The channel connects a [ReliableProtocol] to a datagram socket, driven by reactor events.
//!
//! A channel talks to a single peer. It is either created for a known peer (see
//!  [Channel::connected]), or it waits for the first datagram to arrive and then binds to its
//!  sender for the rest of its lifetime ('pinning'). Datagrams from other senders are not
//!  demultiplexed - serving several peers requires one channel (and one socket) per peer.

pub mod event_loop;
pub mod reactor;
pub mod socket;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use crate::config::ZincConfig;
use crate::protocol::{MessageId, ReliableProtocol};
use crate::util::clock::Clock;
use reactor::{Reactor, Registrations};
use socket::DatagramSocket;

/// Application callback for received messages. It is called once per message, in the order in
///  which the messages were sent, and it may send messages on the channel it is passed.
pub trait MessageHandler<R: Reactor>: Send + 'static {
    fn on_message(&mut self, channel: &mut Channel<R>, payload: Bytes);
}

impl <R: Reactor, F> MessageHandler<R> for F
where F: FnMut(&mut Channel<R>, Bytes) + Send + 'static
{
    fn on_message(&mut self, channel: &mut Channel<R>, payload: Bytes) {
        self(channel, payload)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Peer {
    Unbound,
    Bound(SocketAddr),
}

pub struct Channel<R: Reactor = Registrations> {
    socket: Arc<dyn DatagramSocket>,
    reactor: R,
    protocol: ReliableProtocol,
    peer: Peer,
    max_datagram_size: usize,
    /// `None` only while the handler is being called
    handler: Option<Box<dyn MessageHandler<R>>>,
    is_write_registered: bool,
}

impl <R: Reactor> Channel<R> {
    pub fn new(
        config: &ZincConfig,
        socket: Arc<dyn DatagramSocket>,
        mut reactor: R,
        clock: Arc<dyn Clock>,
        handler: impl MessageHandler<R>,
    ) -> Channel<R> {
        reactor.register_read();

        Channel {
            socket,
            reactor,
            protocol: ReliableProtocol::with_retry_interval(clock, config.retry_interval),
            peer: Peer::Unbound,
            max_datagram_size: config.max_datagram_size,
            handler: Some(Box::new(handler)),
            is_write_registered: false,
        }
    }

    /// Create a channel that is bound to a given peer from the start. This is necessary for the
    ///  side of a conversation that sends the first message.
    pub fn connected(
        config: &ZincConfig,
        socket: Arc<dyn DatagramSocket>,
        reactor: R,
        clock: Arc<dyn Clock>,
        peer: SocketAddr,
        handler: impl MessageHandler<R>,
    ) -> anyhow::Result<Channel<R>> {
        let mut channel = Self::new(config, socket, reactor, clock, handler);
        channel.socket.connect(peer)?;
        debug!("channel connected to {:?}", peer);
        channel.peer = Peer::Bound(peer);
        Ok(channel)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.peer {
            Peer::Unbound => None,
            Peer::Bound(addr) => Some(addr),
        }
    }

    pub fn protocol(&self) -> &ReliableProtocol {
        &self.protocol
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    /// Send a message to the peer, returning the id it was assigned.
    ///
    /// NB: Before the channel is bound to a peer, frames can not be delivered - they are dropped
    ///      and re-sent until the peer is known
    pub fn send(&mut self, payload: impl Into<Bytes>) -> MessageId {
        let id = self.protocol.send(payload);
        self.schedule_retry_timer();
        self.update_write_registration();
        id
    }

    /// the socket has data to read
    pub fn on_readable(&mut self) {
        let mut buf = vec![0u8; self.max_datagram_size];
        let num_read = self.read_datagram(&mut buf);
        buf.truncate(num_read);

        if num_read > 0 {
            trace!("received datagram of {} bytes", num_read);
            self.protocol.feed(buf);
        }

        self.deliver_received_messages();
        self.update_write_registration();
    }

    /// the socket can accept a datagram for sending
    pub fn on_writable(&mut self) {
        let frame = match self.protocol.pop_send_ready() {
            Some(frame) => frame,
            None => {
                trace!("nothing left to send");
                self.set_write_registration(false);
                return;
            }
        };

        // a frame that can not be sent is lost - the protocol's re-sending takes care of it
        match self.socket.send(&frame) {
            Ok(_) => trace!("sent frame of {} bytes", frame.len()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => debug!("socket is not ready for sending - dropping frame"),
            Err(e) => warn!("error sending frame to {:?}: {} - dropping it", self.peer_addr(), e),
        }
    }

    /// the retry timer expired
    pub fn on_timer(&mut self) {
        self.schedule_retry_timer();
        self.update_write_registration();
    }

    fn read_datagram(&mut self, buf: &mut [u8]) -> usize {
        let result = match self.peer {
            Peer::Unbound => {
                self.socket.recv_from(buf)
                    .map(|(num_read, from)| {
                        self.pin_peer(from);
                        num_read
                    })
            }
            Peer::Bound(_) => self.socket.recv(buf),
        };

        match result {
            Ok(num_read) => num_read,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("spurious read readiness");
                0
            }
            Err(e) => {
                debug!("error reading from socket: {}", e);
                0
            }
        }
    }

    fn pin_peer(&mut self, from: SocketAddr) {
        match self.socket.connect(from) {
            Ok(()) => {
                debug!("first datagram received from {:?} - binding channel to this peer", from);
                self.peer = Peer::Bound(from);
            }
            Err(e) => {
                warn!("could not bind channel to peer {:?}: {} - remaining unbound", from, e);
            }
        }
    }

    fn deliver_received_messages(&mut self) {
        // the handler may call back into this channel, so it is moved out while it is running
        let mut handler = match self.handler.take() {
            Some(handler) => handler,
            None => return,
        };

        while let Some(payload) = self.protocol.read_chunk() {
            handler.on_message(self, payload);
        }
        self.handler = Some(handler);
    }

    fn schedule_retry_timer(&mut self) {
        let next_update = self.protocol.update();
        self.reactor.schedule_timer(next_update);
    }

    fn update_write_registration(&mut self) {
        self.set_write_registration(self.protocol.send_ready_count() > 0);
    }

    fn set_write_registration(&mut self, register: bool) {
        if register == self.is_write_registered {
            return;
        }
        if register {
            self.reactor.register_write();
        }
        else {
            self.reactor.deregister_write();
        }
        self.is_write_registered = register;
    }
}

impl <R: Reactor> Drop for Channel<R> {
    fn drop(&mut self) {
        self.reactor.deregister_read();
        self.reactor.deregister_write();
        self.reactor.cancel_timer();
    }
}
