use std::fmt::{Display, Formatter};

/// Sequence number of an application message. Ids are assigned by the sender, starting at 0 and
///  incremented by one per message; the receiver delivers messages strictly in id order.
///
/// NB: There is no wraparound handling - after 2^32 messages on a single channel, `next()` wraps
///      to zero and ordering breaks down. Channels are not expected to live that long.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct MessageId(u32);

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl MessageId {
    pub const ZERO: MessageId = MessageId(0);

    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> MessageId {
        MessageId(self.0.wrapping_add(1))
    }
}
