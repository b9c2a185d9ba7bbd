use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::anyhow;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};
use crate::channel::{Channel, MessageHandler};
use crate::channel::reactor::Registrations;
use crate::config::ZincConfig;
use crate::util::clock::TokioClock;

enum Command {
    Send(Bytes),
    Shutdown,
}

/// A handle for interacting with a running [EventLoop] from other tasks.
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle {
    /// Queue a message for sending. This fails only if the event loop was shut down.
    pub fn send(&self, payload: impl Into<Bytes>) -> anyhow::Result<()> {
        self.commands.send(Command::Send(payload.into()))
            .map_err(|_| anyhow!("event loop is shut down"))
    }

    pub fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).is_err() {
            debug!("event loop was already shut down");
        }
    }
}

/// Drives a single [Channel] on a tokio UDP socket: the channel's [Registrations] say which
///  events it is waiting for, and the loop waits for them and dispatches them one at a time.
///
/// The loop runs until [ChannelHandle::shutdown] is called. Dropping all handles does *not* stop
///  it, the loop keeps serving the socket.
pub struct EventLoop {
    socket: Arc<UdpSocket>,
    channel: Channel<Registrations>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_sender: mpsc::UnboundedSender<Command>,
}

impl EventLoop {
    /// `channel` must be a channel on `socket`
    pub fn new(socket: Arc<UdpSocket>, channel: Channel<Registrations>) -> EventLoop {
        let (command_sender, commands) = mpsc::unbounded_channel();
        EventLoop {
            socket,
            channel,
            commands,
            command_sender,
        }
    }

    /// Create an event loop for a channel on a newly bound socket. The channel binds to the
    ///  first peer it receives a datagram from.
    pub async fn bind(config: &ZincConfig, local_addr: SocketAddr, handler: impl MessageHandler<Registrations>) -> anyhow::Result<EventLoop> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        let channel = Channel::new(config, socket.clone(), Registrations::default(), Arc::new(TokioClock), handler);
        Ok(Self::new(socket, channel))
    }

    /// Create an event loop for a channel on a newly bound socket, talking to a given peer.
    pub async fn connect(config: &ZincConfig, local_addr: SocketAddr, peer: SocketAddr, handler: impl MessageHandler<Registrations>) -> anyhow::Result<EventLoop> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        let channel = Channel::connected(config, socket.clone(), Registrations::default(), Arc::new(TokioClock), peer, handler)?;
        Ok(Self::new(socket, channel))
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            commands: self.command_sender.clone(),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn channel(&self) -> &Channel<Registrations> {
        &self.channel
    }

    /// Process events until the loop is shut down. Waiting for socket readiness fails only for
    ///  a broken socket, and that terminates the loop.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!("starting event loop on {:?}", self.socket.local_addr()?);

        loop {
            let registrations = self.channel.reactor();
            let read_registered = registrations.is_read_registered();
            let write_registered = registrations.is_write_registered();
            let timer_deadline = registrations.timer_deadline();

            select! {
                r = self.socket.readable(), if read_registered => {
                    r?;
                    self.channel.on_readable();
                }
                r = self.socket.writable(), if write_registered => {
                    r?;
                    self.channel.on_writable();
                }
                _ = sleep_until(timer_deadline.unwrap_or_else(Instant::now)), if timer_deadline.is_some() => {
                    self.channel.reactor_mut().on_timer_expired();
                    self.channel.on_timer();
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Send(payload)) => {
                            self.channel.send(payload);
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
            }
        }

        info!("event loop on {:?} shut down", self.socket.local_addr()?);
        Ok(())
    }
}
