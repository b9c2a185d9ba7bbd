use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::protocol::message_id::MessageId;

/// A frame is the unit of transmission, i.e. the full payload of a single UDP datagram. There is
///  no header beyond the message id (u32 BE):
///
/// ```ascii
/// ACK:   0: message id (u32 BE)
///
/// DATA:  0: message id (u32 BE)
///        4: payload (raw bytes, everything up to the end of the datagram)
/// ```
///
/// The kind of frame is determined by its length alone: a frame of exactly 4 bytes is an ACK,
///  a longer frame carries data.
///
/// NB: This means that a DATA frame with an empty payload is indistinguishable from an ACK
///      on the wire and is interpreted as an ACK by the receiver
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Ack(MessageId),
    Data(MessageId, Bytes),
}

impl Frame {
    pub const ID_LEN: usize = std::mem::size_of::<u32>();

    pub fn id(&self) -> MessageId {
        match self {
            Frame::Ack(id) => *id,
            Frame::Data(id, _) => *id,
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            Frame::Ack(_) => Self::ID_LEN,
            Frame::Data(_, payload) => Self::ID_LEN + payload.len(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.id().to_raw());
        if let Frame::Data(_, payload) = self {
            buf.put_slice(payload);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Parses a received datagram. The payload of a DATA frame is a zero-copy slice of the
    ///  datagram buffer.
    pub fn deser(mut buf: Bytes) -> anyhow::Result<Frame> {
        if buf.len() < Self::ID_LEN {
            bail!("frame of {} bytes is too short to contain a message id", buf.len());
        }

        let id = MessageId::from_raw(buf.get_u32());
        if buf.is_empty() {
            Ok(Frame::Ack(id))
        }
        else {
            Ok(Frame::Data(id, buf))
        }
    }
}
