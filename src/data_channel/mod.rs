#[cfg(test)]
mod data_channel_test;

pub mod data_channel_init;

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, info, trace, warn};

pub use data_channel_init::*;

use crate::error::{Error, Result};
use crate::message::{parse_open_ack_message, write_open_ack_message, write_open_message};

/// Cap on messages parked while the transport is back-pressured.
const MAX_QUEUED_SEND_PACKETS: usize = 100;
/// Cap on messages parked before an observer is registered. Overflow clears
/// the whole queue rather than growing without bound.
const MAX_QUEUED_RECEIVED_PACKETS: usize = 100;

/// Lifecycle of a channel, mirroring the RTCDataChannelState readyState.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// The envelope protocol the channel's messages travel over.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataChannelType {
    Rtp,
    Sctp,
}

/// Message classification on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DataMessageType {
    Control,
    Binary,
    #[default]
    Text,
}

/// An application message: an opaque payload plus the text/binary flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBuffer {
    pub data: Bytes,
    pub binary: bool,
}

impl DataBuffer {
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: false,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: true,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-send transport parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendDataParams {
    pub ssrc: u32,
    pub ordered: bool,
    pub max_rtx_count: i32,
    pub max_rtx_ms: i32,
    pub data_type: DataMessageType,
}

impl Default for SendDataParams {
    fn default() -> Self {
        Self {
            ssrc: 0,
            ordered: false,
            max_rtx_count: -1,
            max_rtx_ms: -1,
            data_type: DataMessageType::Text,
        }
    }
}

/// Parameters accompanying an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveDataParams {
    pub ssrc: u32,
    pub data_type: DataMessageType,
}

/// Outcome of handing a payload to the transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendDataResult {
    Success,
    /// The transport is temporarily back-pressured; retry after the next
    /// writable notification.
    Blocked,
    Failure,
}

/// The session-side collaborator a channel sends through. The session owns
/// the transport and outlives every channel attached to it.
pub trait DataChannelProvider {
    fn send_data(&self, params: &SendDataParams, payload: &Bytes) -> SendDataResult;
    /// Subscribes the channel to the session's ready-to-send and
    /// data-received notifications. Returns false if the transport channel
    /// does not exist yet.
    fn connect_data_channel(&self) -> bool;
    fn disconnect_data_channel(&self);
    fn add_sctp_data_stream(&self, sid: i32);
    fn remove_sctp_data_stream(&self, sid: i32);
    fn ready_to_send_data(&self) -> bool;
}

/// Application-side sink for channel events. Registered and unregistered by
/// the application, which also manages its lifetime.
pub trait DataChannelObserver {
    /// Invoked after every state transition, once the state field has been
    /// updated.
    fn on_state_change(&self);
    /// Invoked for each inbound message, in arrival order.
    fn on_message(&self, buffer: &DataBuffer);
}

/// Bounded FIFO of data buffers with a running byte count.
#[derive(Debug, Default)]
struct PacketQueue {
    packets: VecDeque<DataBuffer>,
    byte_count: usize,
}

impl PacketQueue {
    fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    fn len(&self) -> usize {
        self.packets.len()
    }

    fn byte_count(&self) -> usize {
        self.byte_count
    }

    fn push_back(&mut self, packet: DataBuffer) {
        self.byte_count += packet.len();
        self.packets.push_back(packet);
    }

    fn push_front(&mut self, packet: DataBuffer) {
        self.byte_count += packet.len();
        self.packets.push_front(packet);
    }

    fn pop_front(&mut self) -> Option<DataBuffer> {
        let packet = self.packets.pop_front()?;
        self.byte_count -= packet.len();
        Some(packet)
    }

    fn clear(&mut self) {
        self.packets.clear();
        self.byte_count = 0;
    }
}

/// One logical application-level data channel.
///
/// The channel, the session it sends through and the observer all live on a
/// single signaling thread; no method blocks and no internal locking is
/// needed. Callers on other threads must post onto that thread.
pub struct DataChannel {
    label: String,
    config: InternalDataChannelInit,
    state: DataChannelState,
    data_channel_type: DataChannelType,
    provider: Arc<dyn DataChannelProvider>,
    observer: Option<Arc<dyn DataChannelObserver>>,

    waiting_for_open_ack: bool,
    was_ever_writable: bool,
    connected_to_provider: bool,
    send_ssrc_set: bool,
    receive_ssrc_set: bool,
    send_ssrc: u32,
    receive_ssrc: u32,

    queued_received_data: PacketQueue,
    queued_send_data: PacketQueue,
    queued_control_data: PacketQueue,
}

impl DataChannel {
    /// Creates a channel in the Connecting state after validating `init`
    /// against the transport kind.
    pub fn new(
        provider: Arc<dyn DataChannelProvider>,
        data_channel_type: DataChannelType,
        label: impl Into<String>,
        init: InternalDataChannelInit,
    ) -> Result<Self> {
        match data_channel_type {
            DataChannelType::Rtp => {
                if init.config.id != -1
                    || init.config.max_retransmits != -1
                    || init.config.max_retransmit_time != -1
                {
                    error!("Failed to initialize the RTP data channel due to invalid DataChannelInit");
                    return Err(Error::InvalidRtpDataChannelInit);
                }
            }
            DataChannelType::Sctp => {
                if init.config.id < -1
                    || init.config.max_retransmits < -1
                    || init.config.max_retransmit_time < -1
                {
                    error!("Failed to initialize the SCTP data channel due to invalid DataChannelInit");
                    return Err(Error::InvalidSctpDataChannelInit);
                }
                if init.config.max_retransmits != -1 && init.config.max_retransmit_time != -1 {
                    error!("maxRetransmits and maxRetransmitTime should not be both set");
                    return Err(Error::BothRetransmitLimitsSet);
                }
            }
        }

        let mut channel = Self {
            label: label.into(),
            config: init,
            state: DataChannelState::Connecting,
            data_channel_type,
            provider,
            observer: None,
            waiting_for_open_ack: false,
            was_ever_writable: false,
            connected_to_provider: false,
            send_ssrc_set: false,
            receive_ssrc_set: false,
            send_ssrc: 0,
            receive_ssrc: 0,
            queued_received_data: PacketQueue::default(),
            queued_send_data: PacketQueue::default(),
            queued_control_data: PacketQueue::default(),
        };

        if channel.data_channel_type == DataChannelType::Sctp {
            // The transport channel may already exist.
            channel.on_transport_channel_created();

            // The initial ready signal may have fired before this channel
            // was created; catch up on it here.
            let ready = channel.provider.ready_to_send_data();
            if ready {
                channel.on_channel_ready(true);
            }
        }

        Ok(channel)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> DataChannelState {
        self.state
    }

    pub fn data_channel_type(&self) -> DataChannelType {
        self.data_channel_type
    }

    pub fn config(&self) -> &DataChannelInit {
        &self.config.config
    }

    pub fn id(&self) -> i32 {
        self.config.config.id
    }

    /// An RTP channel is never reliable; an SCTP channel is reliable when
    /// neither retransmit limit is set.
    pub fn reliable(&self) -> bool {
        match self.data_channel_type {
            DataChannelType::Rtp => false,
            DataChannelType::Sctp => self.config.config.reliable(),
        }
    }

    /// Sum of the payload sizes currently parked in the send queue.
    pub fn buffered_amount(&self) -> usize {
        self.queued_send_data.byte_count()
    }

    /// Attaches the observer and flushes any messages that arrived before
    /// it was registered, in arrival order.
    pub fn register_observer(&mut self, observer: Arc<dyn DataChannelObserver>) {
        self.observer = Some(observer);
        self.deliver_queued_received_data();
    }

    pub fn unregister_observer(&mut self) {
        self.observer = None;
    }

    /// Local close request. Clears the send-side negotiation bookkeeping so
    /// Closed is only entered once negotiation has settled again.
    pub fn close(&mut self) {
        if self.state == DataChannelState::Closed {
            return;
        }
        self.send_ssrc = 0;
        self.send_ssrc_set = false;
        self.set_state(DataChannelState::Closing);
        self.update_state();
    }

    /// Hands `buffer` to the transport, parking it in the send queue when
    /// the transport is back-pressured. Returns false when the channel is
    /// not open, the queue is full or the transport failed outright.
    pub fn send(&mut self, buffer: &DataBuffer) -> bool {
        if self.state != DataChannelState::Open {
            return false;
        }

        // A non-empty queue means we are waiting for a writable signal;
        // append behind the parked messages to keep FIFO order.
        if !self.queued_send_data.is_empty() {
            debug_assert_eq!(self.data_channel_type, DataChannelType::Sctp);
            return self.queue_send_data(buffer.clone());
        }

        self.send_data_message(buffer)
    }

    /// RTP mode: records the inbound identifier assigned by negotiation.
    /// Idempotent on re-assertion of the same value; a conflicting value is
    /// ignored with a log.
    pub fn set_receive_ssrc(&mut self, receive_ssrc: u32) {
        debug_assert_eq!(self.data_channel_type, DataChannelType::Rtp);
        if self.receive_ssrc_set {
            if self.receive_ssrc != receive_ssrc {
                warn!(
                    "Ignoring conflicting receive ssrc {} on channel {} (already {})",
                    receive_ssrc, self.label, self.receive_ssrc
                );
            }
            return;
        }
        self.receive_ssrc = receive_ssrc;
        self.receive_ssrc_set = true;
        self.update_state();
    }

    /// RTP mode: records the outbound identifier assigned by negotiation.
    pub fn set_send_ssrc(&mut self, send_ssrc: u32) {
        debug_assert_eq!(self.data_channel_type, DataChannelType::Rtp);
        if self.send_ssrc_set {
            if self.send_ssrc != send_ssrc {
                warn!(
                    "Ignoring conflicting send ssrc {} on channel {} (already {})",
                    send_ssrc, self.label, self.send_ssrc
                );
            }
            return;
        }
        self.send_ssrc = send_ssrc;
        self.send_ssrc_set = true;
        self.update_state();
    }

    /// The remote peer requested that this channel be closed.
    pub fn remote_peer_request_close(&mut self) {
        self.do_close();
    }

    /// The underlying data engine is being torn down.
    pub fn on_data_engine_close(&mut self) {
        self.do_close();
    }

    /// Assigns the SCTP stream id once negotiation has settled and registers
    /// the stream with the session.
    pub fn set_sctp_sid(&mut self, sid: i32) {
        debug_assert!(sid >= 0 && self.data_channel_type == DataChannelType::Sctp);
        if self.config.config.id == sid {
            return;
        }
        self.config.config.id = sid;
        self.provider.add_sctp_data_stream(sid);
    }

    /// The session created its transport channel (possibly after this
    /// channel was constructed); connect and register the stream id if it
    /// is already known.
    pub fn on_transport_channel_created(&mut self) {
        debug_assert_eq!(self.data_channel_type, DataChannelType::Sctp);
        if !self.connected_to_provider {
            self.connected_to_provider = self.provider.connect_data_channel();
        }
        // The sid may have been unassigned when the channel first connected,
        // so register the stream whenever it is known.
        if self.config.config.id >= 0 {
            self.provider.add_sctp_data_stream(self.config.config.id);
        }
    }

    /// Transport writability notification. The first writable signal latches
    /// `was_ever_writable`, runs the open handshake and may move the channel
    /// to Open; later signals drain the queued control and data messages.
    pub fn on_channel_ready(&mut self, writable: bool) {
        if !writable {
            return;
        }

        if !self.was_ever_writable {
            self.was_ever_writable = true;

            if self.data_channel_type == DataChannelType::Sctp {
                match self.config.open_handshake_role {
                    OpenHandshakeRole::Opener => {
                        match write_open_message(&self.label, &self.config.config) {
                            Ok(payload) => {
                                self.send_control_message(payload);
                            }
                            Err(err) => error!(
                                "Failed to serialize OPEN message for channel {}: {}",
                                self.label, err
                            ),
                        }
                    }
                    OpenHandshakeRole::Acker => match write_open_ack_message() {
                        Ok(payload) => {
                            self.send_control_message(payload);
                        }
                        Err(err) => error!(
                            "Failed to serialize OPEN_ACK message for channel {}: {}",
                            self.label, err
                        ),
                    },
                    OpenHandshakeRole::None => {}
                }
            }

            self.update_state();
        } else if self.state == DataChannelState::Open {
            self.send_queued_control_messages();
            self.send_queued_data_messages();
        }
    }

    /// Inbound message from the session. Control messages feed the open
    /// handshake; data messages go to the observer or the receive queue.
    pub fn on_data_received(&mut self, params: &ReceiveDataParams, payload: &Bytes) {
        let expected_ssrc = match self.data_channel_type {
            DataChannelType::Rtp => self.receive_ssrc,
            DataChannelType::Sctp => self.config.config.id as u32,
        };
        if params.ssrc != expected_ssrc {
            return;
        }

        if params.data_type == DataMessageType::Control {
            debug_assert_eq!(self.data_channel_type, DataChannelType::Sctp);
            if !self.waiting_for_open_ack {
                // Not expecting an ACK.
                warn!(
                    "DataChannel received unexpected CONTROL message, sid = {}",
                    params.ssrc
                );
                return;
            }
            match parse_open_ack_message(payload) {
                Ok(()) => {
                    // Unordered sends are allowed as soon as the ACK arrives.
                    self.waiting_for_open_ack = false;
                    info!(
                        "DataChannel received OPEN_ACK message, sid = {}",
                        params.ssrc
                    );
                }
                Err(err) => {
                    warn!(
                        "DataChannel failed to parse OPEN_ACK message, sid = {}: {}",
                        params.ssrc, err
                    );
                }
            }
            return;
        }

        trace!(
            "DataChannel received DATA message, sid = {}",
            params.ssrc
        );
        // Any data message proves the remote side has seen the OPEN, even
        // from old clients that never send OPEN_ACK.
        self.waiting_for_open_ack = false;

        let buffer = DataBuffer {
            data: payload.clone(),
            binary: params.data_type == DataMessageType::Binary,
        };

        if self.was_ever_writable && self.observer.is_some() {
            if let Some(observer) = &self.observer {
                observer.on_message(&buffer);
            }
        } else {
            if self.queued_received_data.len() >= MAX_QUEUED_RECEIVED_PACKETS {
                error!(
                    "Queued received data exceeds the limit on channel {}; dropping the queue",
                    self.label
                );
                self.queued_received_data.clear();
                return;
            }
            self.queued_received_data.push_back(buffer);
        }
    }

    fn do_close(&mut self) {
        if self.state == DataChannelState::Closed {
            return;
        }
        self.receive_ssrc_set = false;
        self.send_ssrc_set = false;
        self.set_state(DataChannelState::Closing);
        self.update_state();
    }

    fn update_state(&mut self) {
        match self.state {
            DataChannelState::Connecting => {
                if self.send_ssrc_set == self.receive_ssrc_set {
                    if self.data_channel_type == DataChannelType::Rtp
                        && !self.connected_to_provider
                    {
                        self.connected_to_provider = self.provider.connect_data_channel();
                    }
                    if self.was_ever_writable {
                        self.send_queued_control_messages();
                        self.set_state(DataChannelState::Open);
                        // Flush anything received before the channel got
                        // writable.
                        self.deliver_queued_received_data();
                    }
                }
            }
            DataChannelState::Open => {}
            DataChannelState::Closing => {
                self.disconnect_from_transport();

                if !self.send_ssrc_set && !self.receive_ssrc_set {
                    self.set_state(DataChannelState::Closed);
                }
            }
            DataChannelState::Closed => {}
        }
    }

    fn set_state(&mut self, state: DataChannelState) {
        if self.state == state {
            return;
        }
        self.state = state;
        if let Some(observer) = &self.observer {
            observer.on_state_change();
        }
    }

    fn disconnect_from_transport(&mut self) {
        if !self.connected_to_provider {
            return;
        }
        self.provider.disconnect_data_channel();
        self.connected_to_provider = false;

        if self.data_channel_type == DataChannelType::Sctp {
            self.provider.remove_sctp_data_stream(self.config.config.id);
        }
    }

    fn deliver_queued_received_data(&mut self) {
        if !self.was_ever_writable || self.observer.is_none() {
            return;
        }
        while let Some(buffer) = self.queued_received_data.pop_front() {
            if let Some(observer) = &self.observer {
                observer.on_message(&buffer);
            }
        }
    }

    /// Re-attempts the parked sends front-to-back. Stops at the first
    /// Blocked result, leaving the remainder queued; a hard failure is
    /// logged and stops the drain without discarding the message.
    fn send_queued_data_messages(&mut self) {
        debug_assert!(self.was_ever_writable && self.state == DataChannelState::Open);

        while let Some(buffer) = self.queued_send_data.pop_front() {
            let params = self.data_send_params(&buffer);
            match self.provider.send_data(&params, &buffer.data) {
                SendDataResult::Success => {}
                SendDataResult::Blocked => {
                    self.queued_send_data.push_front(buffer);
                    break;
                }
                SendDataResult::Failure => {
                    error!(
                        "Failed to send queued data message on channel {}",
                        self.label
                    );
                    self.queued_send_data.push_front(buffer);
                    break;
                }
            }
        }
    }

    fn data_send_params(&self, buffer: &DataBuffer) -> SendDataParams {
        let mut params = SendDataParams::default();
        match self.data_channel_type {
            DataChannelType::Sctp => {
                params.ordered = self.config.config.ordered;
                if self.waiting_for_open_ack && !self.config.config.ordered {
                    // The remote peer must not receive data before the OPEN
                    // message.
                    params.ordered = true;
                    debug!(
                        "Sending data as ordered on unordered channel {} until OPEN_ACK arrives",
                        self.label
                    );
                }
                params.max_rtx_count = self.config.config.max_retransmits;
                params.max_rtx_ms = self.config.config.max_retransmit_time;
                params.ssrc = self.config.config.id as u32;
            }
            DataChannelType::Rtp => {
                params.ssrc = self.send_ssrc;
            }
        }
        params.data_type = if buffer.binary {
            DataMessageType::Binary
        } else {
            DataMessageType::Text
        };
        params
    }

    fn send_data_message(&mut self, buffer: &DataBuffer) -> bool {
        let params = self.data_send_params(buffer);
        match self.provider.send_data(&params, &buffer.data) {
            SendDataResult::Success => true,
            SendDataResult::Blocked => {
                if self.data_channel_type == DataChannelType::Sctp {
                    self.queue_send_data(buffer.clone())
                } else {
                    false
                }
            }
            SendDataResult::Failure => {
                error!("Failed to send data message on channel {}", self.label);
                false
            }
        }
    }

    fn queue_send_data(&mut self, buffer: DataBuffer) -> bool {
        if self.queued_send_data.len() >= MAX_QUEUED_SEND_PACKETS {
            error!(
                "Can't buffer any more data in the send queue of channel {}",
                self.label
            );
            return false;
        }
        self.queued_send_data.push_back(buffer);
        true
    }

    fn send_control_message(&mut self, payload: Bytes) -> bool {
        let is_open_message = self.config.open_handshake_role == OpenHandshakeRole::Opener;
        debug_assert!(
            self.data_channel_type == DataChannelType::Sctp
                && self.was_ever_writable
                && self.config.config.id >= 0
                && (!is_open_message || !self.config.config.negotiated)
        );

        let params = SendDataParams {
            ssrc: self.config.config.id as u32,
            // OPEN must arrive before any data, so it always goes ordered.
            ordered: self.config.config.ordered || is_open_message,
            data_type: DataMessageType::Control,
            ..Default::default()
        };

        match self.provider.send_data(&params, &payload) {
            SendDataResult::Success => {
                info!(
                    "Sent CONTROL message on channel {}",
                    self.config.config.id
                );
                if is_open_message {
                    self.waiting_for_open_ack = true;
                }
                true
            }
            SendDataResult::Blocked => {
                self.queued_control_data.push_back(DataBuffer::binary(payload));
                false
            }
            SendDataResult::Failure => {
                error!(
                    "Failed to send CONTROL message on channel {}",
                    self.config.config.id
                );
                false
            }
        }
    }

    fn send_queued_control_messages(&mut self) {
        debug_assert!(self.was_ever_writable);

        let mut pending = std::mem::take(&mut self.queued_control_data);
        while let Some(buffer) = pending.pop_front() {
            // A Blocked result lands the message back on the member queue.
            self.send_control_message(buffer.data);
        }
    }
}
