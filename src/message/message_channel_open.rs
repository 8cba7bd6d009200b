use super::*;
use crate::data_channel::data_channel_init::DataChannelInit;
use crate::error::Error;

type Result<T> = std::result::Result<T, util::Error>;

const CHANNEL_TYPE_RELIABLE: u8 = 0x00;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT: u8 = 0x01;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED: u8 = 0x02;
const CHANNEL_TYPE_RELIABLE_UNORDERED: u8 = 0x80;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED: u8 = 0x81;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED: u8 = 0x82;
const CHANNEL_TYPE_LEN: usize = 1;

/// The six reliability/ordering quadrants a channel can be opened with.
///
/// The high bit of the wire byte selects unordered delivery, the low bits
/// select the reliability mode. The reliability parameter in the OPEN header
/// is a retransmit count for the `Rexmit` modes and a lifetime in
/// milliseconds for the `Timed` modes.
#[derive(Eq, PartialEq, Copy, Clone, Debug, Default)]
pub enum ChannelType {
    #[default]
    Reliable,
    ReliableUnordered,
    PartialReliableRexmit,
    PartialReliableRexmitUnordered,
    PartialReliableTimed,
    PartialReliableTimedUnordered,
}

impl ChannelType {
    /// Whether messages on a channel of this type are delivered in order.
    pub fn ordered(&self) -> bool {
        matches!(
            self,
            ChannelType::Reliable
                | ChannelType::PartialReliableRexmit
                | ChannelType::PartialReliableTimed
        )
    }

    /// Picks the quadrant matching a channel configuration. At most one of
    /// the reliability limits may be set; the retransmit count wins when the
    /// caller violates that.
    pub fn for_config(config: &DataChannelInit) -> Self {
        match (config.ordered, config.max_retransmits >= 0, config.max_retransmit_time >= 0) {
            (true, true, _) => ChannelType::PartialReliableRexmit,
            (true, false, true) => ChannelType::PartialReliableTimed,
            (true, false, false) => ChannelType::Reliable,
            (false, true, _) => ChannelType::PartialReliableRexmitUnordered,
            (false, false, true) => ChannelType::PartialReliableTimedUnordered,
            (false, false, false) => ChannelType::ReliableUnordered,
        }
    }
}

impl MarshalSize for ChannelType {
    fn marshal_size(&self) -> usize {
        CHANNEL_TYPE_LEN
    }
}

impl Marshal for ChannelType {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < CHANNEL_TYPE_LEN {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: CHANNEL_TYPE_LEN,
                actual: buf.remaining_mut(),
            }
            .into());
        }

        let b = match self {
            Self::Reliable => CHANNEL_TYPE_RELIABLE,
            Self::ReliableUnordered => CHANNEL_TYPE_RELIABLE_UNORDERED,
            Self::PartialReliableRexmit => CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT,
            Self::PartialReliableRexmitUnordered => CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED,
            Self::PartialReliableTimed => CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED,
            Self::PartialReliableTimedUnordered => CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED,
        };

        buf.put_u8(b);

        Ok(CHANNEL_TYPE_LEN)
    }
}

impl Unmarshal for ChannelType {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        if buf.remaining() < CHANNEL_TYPE_LEN {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: CHANNEL_TYPE_LEN,
                actual: buf.remaining(),
            }
            .into());
        }

        match buf.get_u8() {
            CHANNEL_TYPE_RELIABLE => Ok(Self::Reliable),
            CHANNEL_TYPE_RELIABLE_UNORDERED => Ok(Self::ReliableUnordered),
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT => Ok(Self::PartialReliableRexmit),
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED => {
                Ok(Self::PartialReliableRexmitUnordered)
            }
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED => Ok(Self::PartialReliableTimed),
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED => {
                Ok(Self::PartialReliableTimedUnordered)
            }
            b => Err(Error::InvalidChannelType(b).into()),
        }
    }
}

const CHANNEL_OPEN_HEADER_LEN: usize = 11;
const MAX_STRING_FIELD_LEN: usize = u16::MAX as usize;

/// The data-part of a DATA_CHANNEL_OPEN message without the message type.
///
/// # Memory layout
///
/// ```plain
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | (Message Type)|  Channel Type |            Priority           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Reliability Parameter                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Label Length          |       Protocol Length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             Label                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Protocol                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct DataChannelOpen {
    pub channel_type: ChannelType,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: Vec<u8>,
    pub protocol: Vec<u8>,
}

impl DataChannelOpen {
    /// Builds the OPEN message announcing `label` with the reliability
    /// parameters of `config`. Priority is reserved and written as zero.
    pub fn from_config(label: &str, config: &DataChannelInit) -> crate::error::Result<Self> {
        if label.len() > MAX_STRING_FIELD_LEN {
            return Err(Error::LabelTooLong(label.len()));
        }
        if config.protocol.len() > MAX_STRING_FIELD_LEN {
            return Err(Error::ProtocolTooLong(config.protocol.len()));
        }

        let reliability_parameter = if config.max_retransmits >= 0 {
            config.max_retransmits as u32
        } else if config.max_retransmit_time >= 0 {
            config.max_retransmit_time as u32
        } else {
            0
        };

        Ok(Self {
            channel_type: ChannelType::for_config(config),
            priority: 0,
            reliability_parameter,
            label: label.as_bytes().to_vec(),
            protocol: config.protocol.as_bytes().to_vec(),
        })
    }

    /// Recovers the label and channel configuration this OPEN message
    /// describes. The unused reliability limit stays -1; the stream id and
    /// the negotiated flag are not carried on the wire and stay unset.
    pub fn into_config(self) -> crate::error::Result<(String, DataChannelInit)> {
        let mut config = DataChannelInit {
            ordered: self.channel_type.ordered(),
            protocol: String::from_utf8(self.protocol)?,
            ..Default::default()
        };

        match self.channel_type {
            ChannelType::PartialReliableRexmit | ChannelType::PartialReliableRexmitUnordered => {
                config.max_retransmits = self.reliability_parameter as i32;
            }
            ChannelType::PartialReliableTimed | ChannelType::PartialReliableTimedUnordered => {
                config.max_retransmit_time = self.reliability_parameter as i32;
            }
            ChannelType::Reliable | ChannelType::ReliableUnordered => {}
        }

        Ok((String::from_utf8(self.label)?, config))
    }
}

impl MarshalSize for DataChannelOpen {
    fn marshal_size(&self) -> usize {
        CHANNEL_OPEN_HEADER_LEN + self.label.len() + self.protocol.len()
    }
}

impl Marshal for DataChannelOpen {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let required_len = self.marshal_size();
        if buf.remaining_mut() < required_len {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: required_len,
                actual: buf.remaining_mut(),
            }
            .into());
        }

        let n = self.channel_type.marshal_to(buf)?;
        buf = &mut buf[n..];
        buf.put_u16(self.priority);
        buf.put_u32(self.reliability_parameter);
        buf.put_u16(self.label.len() as u16);
        buf.put_u16(self.protocol.len() as u16);
        buf.put_slice(self.label.as_slice());
        buf.put_slice(self.protocol.as_slice());

        Ok(required_len)
    }
}

impl Unmarshal for DataChannelOpen {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        if buf.remaining() < CHANNEL_OPEN_HEADER_LEN {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: CHANNEL_OPEN_HEADER_LEN,
                actual: buf.remaining(),
            }
            .into());
        }

        let channel_type = ChannelType::unmarshal(buf)?;
        let priority = buf.get_u16();
        let reliability_parameter = buf.get_u32();
        let label_len = buf.get_u16() as usize;
        let protocol_len = buf.get_u16() as usize;

        if buf.remaining() < label_len + protocol_len {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: label_len + protocol_len,
                actual: buf.remaining(),
            }
            .into());
        }

        let mut label = vec![0; label_len];
        let mut protocol = vec![0; protocol_len];
        buf.copy_to_slice(&mut label[..]);
        buf.copy_to_slice(&mut protocol[..]);

        Ok(Self {
            channel_type,
            priority,
            reliability_parameter,
            label,
            protocol,
        })
    }
}
