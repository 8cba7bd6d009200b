use super::*;

type Result<T> = std::result::Result<T, util::Error>;

/// The data-part of a DATA_CHANNEL_ACK message without the message type.
/// The message carries nothing beyond its type byte.
#[derive(Eq, PartialEq, Clone, Debug, Default)]
pub struct DataChannelAck;

impl MarshalSize for DataChannelAck {
    fn marshal_size(&self) -> usize {
        0
    }
}

impl Marshal for DataChannelAck {
    fn marshal_to(&self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }
}

impl Unmarshal for DataChannelAck {
    fn unmarshal<B>(_buf: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        Ok(Self)
    }
}
