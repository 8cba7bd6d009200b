/// Configuration a DataChannel is created with. Immutable after creation
/// except for the stream id, which may be assigned once SCTP negotiation
/// settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelInit {
    /// Deliver messages in the order they were sent.
    pub ordered: bool,
    /// Cap on retransmissions per message, -1 when unset.
    pub max_retransmits: i32,
    /// Deadline in milliseconds for retransmissions, -1 when unset.
    pub max_retransmit_time: i32,
    /// Application subprotocol tag carried in the OPEN message.
    pub protocol: String,
    /// Both sides were preconfigured; the OPEN exchange is suppressed.
    pub negotiated: bool,
    /// SCTP stream identifier, -1 when unset.
    pub id: i32,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: -1,
            max_retransmit_time: -1,
            protocol: String::new(),
            negotiated: false,
            id: -1,
        }
    }
}

impl DataChannelInit {
    /// A channel is reliable when neither retransmit limit is set.
    pub fn reliable(&self) -> bool {
        self.max_retransmits == -1 && self.max_retransmit_time == -1
    }
}

/// Which side of the OPEN handshake this channel plays once the transport
/// becomes writable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum OpenHandshakeRole {
    /// Neither message is sent; both sides were configured out of band.
    #[default]
    None,
    /// Sends DATA_CHANNEL_OPEN and waits for the ACK.
    Opener,
    /// Answers an incoming OPEN with DATA_CHANNEL_ACK.
    Acker,
}

/// `DataChannelInit` plus the handshake bookkeeping that is not part of the
/// application-facing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InternalDataChannelInit {
    pub config: DataChannelInit,
    pub open_handshake_role: OpenHandshakeRole,
}

impl From<DataChannelInit> for InternalDataChannelInit {
    fn from(config: DataChannelInit) -> Self {
        let open_handshake_role = if config.negotiated {
            OpenHandshakeRole::None
        } else {
            OpenHandshakeRole::Opener
        };
        Self {
            config,
            open_handshake_role,
        }
    }
}
