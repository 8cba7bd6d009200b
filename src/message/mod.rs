
pub mod message_channel_ack;
pub mod message_channel_open;
pub mod message_type;

use bytes::{Buf, BufMut, Bytes};
use message_channel_ack::*;
use message_channel_open::*;
use message_type::*;
use util::marshal::*;

use crate::data_channel::data_channel_init::DataChannelInit;
use crate::error::{Error, Result};

/// A parsed DataChannel control message.
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum Message {
    DataChannelAck(DataChannelAck),
    DataChannelOpen(DataChannelOpen),
}

impl MarshalSize for Message {
    fn marshal_size(&self) -> usize {
        match self {
            Message::DataChannelAck(m) => m.marshal_size() + MESSAGE_TYPE_LEN,
            Message::DataChannelOpen(m) => m.marshal_size() + MESSAGE_TYPE_LEN,
        }
    }
}

impl Marshal for Message {
    fn marshal_to(&self, mut buf: &mut [u8]) -> std::result::Result<usize, util::Error> {
        let mut bytes_written = 0;
        let n = self.message_type().marshal_to(buf)?;
        buf = &mut buf[n..];
        bytes_written += n;
        bytes_written += match self {
            Message::DataChannelAck(_) => 0,
            Message::DataChannelOpen(open) => open.marshal_to(buf)?,
        };
        Ok(bytes_written)
    }
}

impl Unmarshal for Message {
    fn unmarshal<B>(buf: &mut B) -> std::result::Result<Self, util::Error>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < MESSAGE_TYPE_LEN {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: MESSAGE_TYPE_LEN,
                actual: buf.remaining(),
            }
            .into());
        }

        match MessageType::unmarshal(buf)? {
            MessageType::DataChannelAck => Ok(Self::DataChannelAck(DataChannelAck)),
            MessageType::DataChannelOpen => {
                Ok(Self::DataChannelOpen(DataChannelOpen::unmarshal(buf)?))
            }
        }
    }
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::DataChannelAck(_) => MessageType::DataChannelAck,
            Self::DataChannelOpen(_) => MessageType::DataChannelOpen,
        }
    }
}

/// Peeks whether `buf` starts a DATA_CHANNEL_OPEN message. Empty input is
/// not an OPEN message; this never fails.
pub fn is_open_message(buf: &[u8]) -> bool {
    buf.first() == Some(&MESSAGE_TYPE_OPEN)
}

/// Serializes the DATA_CHANNEL_OPEN message announcing `label` and the
/// reliability parameters of `config`.
pub fn write_open_message(label: &str, config: &DataChannelInit) -> Result<Bytes> {
    let msg = Message::DataChannelOpen(DataChannelOpen::from_config(label, config)?);
    Ok(msg.marshal()?)
}

/// Parses a DATA_CHANNEL_OPEN message back into the label and channel
/// configuration it carries. The priority field is read but not surfaced.
pub fn parse_open_message(buf: &[u8]) -> Result<(String, DataChannelInit)> {
    let mut buf = buf;
    match Message::unmarshal(&mut buf)? {
        Message::DataChannelOpen(open) => open.into_config(),
        Message::DataChannelAck(_) => Err(Error::InvalidMessageType(MESSAGE_TYPE_ACK)),
    }
}

/// Serializes the single-byte DATA_CHANNEL_ACK message.
pub fn write_open_ack_message() -> Result<Bytes> {
    Ok(Message::DataChannelAck(DataChannelAck).marshal()?)
}

/// Checks that `buf` holds exactly a DATA_CHANNEL_ACK message.
pub fn parse_open_ack_message(buf: &[u8]) -> Result<()> {
    let mut buf = buf;
    match Message::unmarshal(&mut buf)? {
        Message::DataChannelAck(_) => Ok(()),
        Message::DataChannelOpen(_) => Err(Error::InvalidMessageType(MESSAGE_TYPE_OPEN)),
    }
}
