//! A simple-stupid protocol for reliable, ordered delivery of messages over UDP.
//!
//! [protocol::ReliableProtocol] is the I/O-free state machine, [channel::Channel] connects it
//!  to a socket and a reactor, and [channel::event_loop::EventLoop] runs a channel on tokio.

pub mod channel;
pub mod config;
pub mod protocol;
pub mod test_util;
pub mod util;
