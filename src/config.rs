use std::time::Duration;
use anyhow::bail;
use crate::protocol::frame::Frame;

#[derive(Clone, Debug)]
pub struct ZincConfig {
    /// The interval after which the head message is re-sent if it was not acknowledged. There is
    ///  no backoff: the head message is re-sent once per interval until an ACK arrives.
    pub retry_interval: Duration,

    /// Size of the receive buffer, i.e. the maximum datagram size that can be received without
    ///  truncation. Longer datagrams are truncated by the OS, which the protocol can not detect.
    pub max_datagram_size: usize,
}

impl Default for ZincConfig {
    fn default() -> Self {
        ZincConfig {
            retry_interval: ReliableDefaults::RETRY_INTERVAL,
            max_datagram_size: ReliableDefaults::MAX_DATAGRAM_SIZE,
        }
    }
}

impl ZincConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_interval.is_zero() {
            bail!("retry interval must be greater than zero");
        }
        if self.max_datagram_size <= Frame::ID_LEN {
            bail!("max datagram size of {} leaves no room for a payload", self.max_datagram_size);
        }
        if self.max_datagram_size > ReliableDefaults::MAX_DATAGRAM_SIZE {
            bail!("max datagram size of {} exceeds the UDP limit of {}", self.max_datagram_size, ReliableDefaults::MAX_DATAGRAM_SIZE);
        }
        Ok(())
    }
}

pub struct ReliableDefaults;
impl ReliableDefaults {
    pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
    pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;
}
