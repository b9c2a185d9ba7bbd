//! Helpers for testing code that sits on top of the protocol.

pub mod lossy_link;
