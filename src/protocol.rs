//! The reliability layer: message ids, the wire format and the state machine for acknowledgement,
//!  re-sending and in-order delivery. Nothing in here does I/O.

pub mod frame;
pub mod message_id;
pub mod reliable_protocol;

pub use message_id::MessageId;
pub use reliable_protocol::ReliableProtocol;
