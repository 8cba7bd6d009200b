use std::string::FromUtf8Error;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error(
        "DataChannel message is not long enough to determine type: (expected: {expected}, actual: {actual})"
    )]
    UnexpectedEndOfBuffer { expected: usize, actual: usize },
    #[error("Unknown MessageType {0}")]
    InvalidMessageType(u8),
    #[error("Unknown ChannelType {0}")]
    InvalidChannelType(u8),
    #[error("DataChannel label length {0} exceeds 65535 bytes")]
    LabelTooLong(usize),
    #[error("DataChannel protocol length {0} exceeds 65535 bytes")]
    ProtocolTooLong(usize),

    #[error("maxRetransmits and maxRetransmitTime should not be both set")]
    BothRetransmitLimitsSet,
    #[error("RTP data channels do not support reliability options or a stream id")]
    InvalidRtpDataChannelInit,
    #[error("Invalid DataChannelInit for an SCTP data channel")]
    InvalidSctpDataChannelInit,

    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("utf-8 error: {0}")]
    Utf8(#[from] FromUtf8Error),
}

impl From<Error> for util::Error {
    fn from(e: Error) -> Self {
        util::Error::from_std(e)
    }
}

impl PartialEq<util::Error> for Error {
    fn eq(&self, other: &util::Error) -> bool {
        if let Some(down) = other.downcast_ref::<Error>() {
            return self == down;
        }
        false
    }
}

impl PartialEq<Error> for util::Error {
    fn eq(&self, other: &Error) -> bool {
        if let Some(down) = self.downcast_ref::<Error>() {
            return other == down;
        }
        false
    }
}
