use std::cell::RefCell;

use super::*;
use crate::message::{is_open_message, write_open_ack_message};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct FakeProvider {
    state: RefCell<FakeProviderState>,
}

#[derive(Default)]
struct FakeProviderState {
    ready: bool,
    send_blocked: bool,
    fail_sends: bool,
    connected: bool,
    streams: Vec<i32>,
    sent: Vec<(SendDataParams, Bytes)>,
}

impl FakeProvider {
    fn set_ready(&self, ready: bool) {
        self.state.borrow_mut().ready = ready;
    }

    fn set_send_blocked(&self, blocked: bool) {
        self.state.borrow_mut().send_blocked = blocked;
    }

    fn set_fail_sends(&self, fail: bool) {
        self.state.borrow_mut().fail_sends = fail;
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn has_stream(&self, sid: i32) -> bool {
        self.state.borrow().streams.contains(&sid)
    }

    fn sent(&self) -> Vec<(SendDataParams, Bytes)> {
        self.state.borrow().sent.clone()
    }

    fn sent_payloads(&self) -> Vec<Bytes> {
        self.state
            .borrow()
            .sent
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl DataChannelProvider for FakeProvider {
    fn send_data(&self, params: &SendDataParams, payload: &Bytes) -> SendDataResult {
        let mut state = self.state.borrow_mut();
        if state.fail_sends {
            return SendDataResult::Failure;
        }
        if !state.ready || state.send_blocked {
            return SendDataResult::Blocked;
        }
        state.sent.push((params.clone(), payload.clone()));
        SendDataResult::Success
    }

    fn connect_data_channel(&self) -> bool {
        self.state.borrow_mut().connected = true;
        true
    }

    fn disconnect_data_channel(&self) {
        self.state.borrow_mut().connected = false;
    }

    fn add_sctp_data_stream(&self, sid: i32) {
        let mut state = self.state.borrow_mut();
        if !state.streams.contains(&sid) {
            state.streams.push(sid);
        }
    }

    fn remove_sctp_data_stream(&self, sid: i32) {
        self.state.borrow_mut().streams.retain(|s| *s != sid);
    }

    fn ready_to_send_data(&self) -> bool {
        self.state.borrow().ready
    }
}

#[derive(Default)]
struct FakeObserver {
    messages: RefCell<Vec<DataBuffer>>,
    state_changes: RefCell<usize>,
}

impl FakeObserver {
    fn message_count(&self) -> usize {
        self.messages.borrow().len()
    }

    fn messages(&self) -> Vec<DataBuffer> {
        self.messages.borrow().clone()
    }

    fn state_change_count(&self) -> usize {
        *self.state_changes.borrow()
    }
}

impl DataChannelObserver for FakeObserver {
    fn on_state_change(&self) {
        *self.state_changes.borrow_mut() += 1;
    }

    fn on_message(&self, buffer: &DataBuffer) {
        self.messages.borrow_mut().push(buffer.clone());
    }
}

fn negotiated_config(id: i32) -> InternalDataChannelInit {
    DataChannelInit {
        negotiated: true,
        id,
        ..Default::default()
    }
    .into()
}

fn open_sctp_channel(provider: &Arc<FakeProvider>) -> DataChannel {
    provider.set_ready(true);
    let channel = DataChannel::new(
        provider.clone(),
        DataChannelType::Sctp,
        "test",
        negotiated_config(1),
    )
    .unwrap();
    assert_eq!(channel.state(), DataChannelState::Open);
    channel
}

fn data_params(ssrc: u32) -> ReceiveDataParams {
    ReceiveDataParams {
        ssrc,
        data_type: DataMessageType::Text,
    }
}

#[test]
fn test_invalid_config_rejected() {
    let provider = Arc::new(FakeProvider::default());

    let both_limits = DataChannelInit {
        max_retransmits: 3,
        max_retransmit_time: 1000,
        ..Default::default()
    };
    assert_eq!(
        DataChannel::new(
            provider.clone(),
            DataChannelType::Sctp,
            "bad",
            both_limits.into()
        )
        .err(),
        Some(Error::BothRetransmitLimitsSet)
    );

    let negative_id = DataChannelInit {
        id: -2,
        ..Default::default()
    };
    assert_eq!(
        DataChannel::new(
            provider.clone(),
            DataChannelType::Sctp,
            "bad",
            negative_id.into()
        )
        .err(),
        Some(Error::InvalidSctpDataChannelInit)
    );

    let rtp_with_reliability = DataChannelInit {
        max_retransmits: 1,
        ..Default::default()
    };
    assert_eq!(
        DataChannel::new(
            provider.clone(),
            DataChannelType::Rtp,
            "bad",
            rtp_with_reliability.into()
        )
        .err(),
        Some(Error::InvalidRtpDataChannelInit)
    );

    let rtp_with_id = DataChannelInit {
        id: 2,
        ..Default::default()
    };
    assert_eq!(
        DataChannel::new(provider, DataChannelType::Rtp, "bad", rtp_with_id.into()).err(),
        Some(Error::InvalidRtpDataChannelInit)
    );
}

#[test]
fn test_sctp_channel_opens_when_transport_ready() {
    let provider = Arc::new(FakeProvider::default());
    let channel = open_sctp_channel(&provider);

    assert!(provider.is_connected());
    assert!(provider.has_stream(1));
    assert!(channel.reliable());
}

#[test]
fn test_sctp_channel_waits_for_writable() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = DataChannel::new(
        provider.clone(),
        DataChannelType::Sctp,
        "test",
        negotiated_config(1),
    )
    .unwrap();
    assert_eq!(channel.state(), DataChannelState::Connecting);

    // Not-writable notifications leave the channel alone.
    channel.on_channel_ready(false);
    assert_eq!(channel.state(), DataChannelState::Connecting);

    provider.set_ready(true);
    channel.on_channel_ready(true);
    assert_eq!(channel.state(), DataChannelState::Open);
}

#[test]
fn test_send_requires_open() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = DataChannel::new(
        provider,
        DataChannelType::Sctp,
        "test",
        negotiated_config(1),
    )
    .unwrap();
    assert_eq!(channel.state(), DataChannelState::Connecting);

    assert!(!channel.send(&DataBuffer::text("too early")));
}

#[test]
fn test_ordered_reliable_send_params() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_sctp_channel(&provider);

    assert!(channel.send(&DataBuffer::text("hello")));

    let sent = provider.sent();
    assert_eq!(sent.len(), 1);
    let (params, payload) = &sent[0];
    assert!(params.ordered);
    assert_eq!(params.max_rtx_count, -1);
    assert_eq!(params.max_rtx_ms, -1);
    assert_eq!(params.ssrc, 1);
    assert_eq!(params.data_type, DataMessageType::Text);
    assert_eq!(payload.as_ref(), b"hello");
}

#[test]
fn test_unreliable_send_params() {
    let provider = Arc::new(FakeProvider::default());
    provider.set_ready(true);
    let config = DataChannelInit {
        ordered: false,
        max_retransmits: 3,
        negotiated: true,
        id: 2,
        ..Default::default()
    };
    let mut channel = DataChannel::new(
        provider.clone(),
        DataChannelType::Sctp,
        "lossy",
        config.into(),
    )
    .unwrap();
    assert!(!channel.reliable());

    assert!(channel.send(&DataBuffer::binary(Bytes::from_static(&[1, 2, 3]))));

    let (params, _) = &provider.sent()[0];
    assert!(!params.ordered);
    assert_eq!(params.max_rtx_count, 3);
    assert_eq!(params.max_rtx_ms, -1);
    assert_eq!(params.data_type, DataMessageType::Binary);
}

#[test]
fn test_send_queues_on_blocked() {
    init_log();
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_sctp_channel(&provider);

    provider.set_send_blocked(true);
    assert!(channel.send(&DataBuffer::text("hello")));
    assert_eq!(channel.buffered_amount(), 5);
    assert!(provider.sent().is_empty());

    provider.set_send_blocked(false);
    channel.on_channel_ready(true);

    assert_eq!(provider.sent_payloads(), vec![Bytes::from_static(b"hello")]);
    assert_eq!(channel.buffered_amount(), 0);
}

#[test]
fn test_send_preserves_fifo_across_block() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_sctp_channel(&provider);

    assert!(channel.send(&DataBuffer::text("a")));

    provider.set_send_blocked(true);
    assert!(channel.send(&DataBuffer::text("b")));
    assert!(channel.send(&DataBuffer::text("c")));
    assert_eq!(channel.buffered_amount(), 2);

    provider.set_send_blocked(false);
    channel.on_channel_ready(true);

    assert_eq!(
        provider.sent_payloads(),
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ]
    );
}

#[test]
fn test_send_queue_cap() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_sctp_channel(&provider);

    provider.set_send_blocked(true);
    for _ in 0..100 {
        assert!(channel.send(&DataBuffer::text("x")));
    }
    assert!(!channel.send(&DataBuffer::text("overflow")));
    assert_eq!(channel.buffered_amount(), 100);
    // The overflowing send did not disturb the channel.
    assert_eq!(channel.state(), DataChannelState::Open);
}

#[test]
fn test_send_failure_returns_false_without_closing() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_sctp_channel(&provider);

    provider.set_fail_sends(true);
    assert!(!channel.send(&DataBuffer::text("doomed")));
    assert_eq!(channel.state(), DataChannelState::Open);
    assert_eq!(channel.buffered_amount(), 0);
}

#[test]
fn test_receive_before_observer() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_sctp_channel(&provider);

    for i in 0..5u8 {
        channel.on_data_received(&data_params(1), &Bytes::copy_from_slice(&[i]));
    }

    let observer = Arc::new(FakeObserver::default());
    channel.register_observer(observer.clone());

    let messages = observer.messages();
    assert_eq!(messages.len(), 5);
    for (i, buffer) in messages.iter().enumerate() {
        assert_eq!(buffer.data.as_ref(), &[i as u8]);
        assert!(!buffer.binary);
    }
}

#[test]
fn test_receive_overflow_clears_queue() {
    init_log();
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_sctp_channel(&provider);

    for _ in 0..101 {
        channel.on_data_received(&data_params(1), &Bytes::from_static(b"m"));
    }

    let observer = Arc::new(FakeObserver::default());
    channel.register_observer(observer.clone());
    assert_eq!(observer.message_count(), 0);

    // The channel keeps working after the destructive drop.
    channel.on_data_received(&data_params(1), &Bytes::from_static(b"after"));
    assert_eq!(observer.message_count(), 1);
}

#[test]
fn test_receive_delivered_directly_with_observer() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_sctp_channel(&provider);
    let observer = Arc::new(FakeObserver::default());
    channel.register_observer(observer.clone());

    let params = ReceiveDataParams {
        ssrc: 1,
        data_type: DataMessageType::Binary,
    };
    channel.on_data_received(&params, &Bytes::from_static(&[0xde, 0xad]));

    let messages = observer.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].binary);
}

#[test]
fn test_sctp_receive_ignores_other_streams() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_sctp_channel(&provider);
    let observer = Arc::new(FakeObserver::default());
    channel.register_observer(observer.clone());

    channel.on_data_received(&data_params(2), &Bytes::from_static(b"stray"));
    assert_eq!(observer.message_count(), 0);
}

fn open_rtp_channel(provider: &Arc<FakeProvider>, ssrc: u32) -> DataChannel {
    let mut channel = DataChannel::new(
        provider.clone(),
        DataChannelType::Rtp,
        "rtp",
        DataChannelInit::default().into(),
    )
    .unwrap();
    channel.set_receive_ssrc(ssrc);
    channel.set_send_ssrc(ssrc);
    provider.set_ready(true);
    channel.on_channel_ready(true);
    assert_eq!(channel.state(), DataChannelState::Open);
    channel
}

#[test]
fn test_rtp_ssrc_mismatch_dropped() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_rtp_channel(&provider, 42);
    let observer = Arc::new(FakeObserver::default());
    channel.register_observer(observer.clone());

    channel.on_data_received(&data_params(43), &Bytes::from_static(b"stray"));
    assert_eq!(observer.message_count(), 0);

    channel.on_data_received(&data_params(42), &Bytes::from_static(b"mine"));
    assert_eq!(observer.message_count(), 1);
}

#[test]
fn test_rtp_ssrc_reassertion_and_conflict() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_rtp_channel(&provider, 42);

    // Re-asserting the same value is a no-op; a conflicting value is
    // ignored.
    channel.set_receive_ssrc(42);
    channel.set_receive_ssrc(99);
    let observer = Arc::new(FakeObserver::default());
    channel.register_observer(observer.clone());

    channel.on_data_received(&data_params(42), &Bytes::from_static(b"mine"));
    assert_eq!(observer.message_count(), 1);
}

#[test]
fn test_rtp_send_uses_send_ssrc() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_rtp_channel(&provider, 42);

    assert!(channel.send(&DataBuffer::text("hi")));
    let (params, _) = &provider.sent()[0];
    assert_eq!(params.ssrc, 42);
    assert_eq!(params.max_rtx_count, -1);
    assert_eq!(params.max_rtx_ms, -1);
}

#[test]
fn test_close_transitions_to_closed() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_sctp_channel(&provider);
    let observer = Arc::new(FakeObserver::default());
    channel.register_observer(observer.clone());

    channel.close();

    assert_eq!(channel.state(), DataChannelState::Closed);
    // Closing and Closed are observed as two transitions.
    assert_eq!(observer.state_change_count(), 2);
    assert!(!provider.is_connected());
    assert!(!provider.has_stream(1));

    // Closed is terminal.
    channel.close();
    assert_eq!(channel.state(), DataChannelState::Closed);
    assert_eq!(observer.state_change_count(), 2);
    assert!(!channel.send(&DataBuffer::text("late")));
}

#[test]
fn test_remote_close_and_engine_close() {
    let provider = Arc::new(FakeProvider::default());
    let mut channel = open_sctp_channel(&provider);
    channel.remote_peer_request_close();
    assert_eq!(channel.state(), DataChannelState::Closed);

    let mut channel = open_sctp_channel(&provider);
    channel.on_data_engine_close();
    assert_eq!(channel.state(), DataChannelState::Closed);
}

#[test]
fn test_set_sctp_sid_registers_stream() {
    let provider = Arc::new(FakeProvider::default());
    let config: InternalDataChannelInit = DataChannelInit {
        negotiated: true,
        ..Default::default()
    }
    .into();
    let mut channel =
        DataChannel::new(provider.clone(), DataChannelType::Sctp, "test", config).unwrap();
    assert!(!provider.has_stream(5));

    channel.set_sctp_sid(5);
    assert_eq!(channel.id(), 5);
    assert!(provider.has_stream(5));
}

#[test]
fn test_opener_sends_open_and_waits_for_ack() {
    let provider = Arc::new(FakeProvider::default());
    provider.set_ready(true);
    let config = DataChannelInit {
        ordered: false,
        id: 1,
        ..Default::default()
    };
    let mut channel = DataChannel::new(
        provider.clone(),
        DataChannelType::Sctp,
        "handshake",
        config.into(),
    )
    .unwrap();
    assert_eq!(channel.state(), DataChannelState::Open);

    let sent = provider.sent();
    assert_eq!(sent.len(), 1);
    let (params, payload) = &sent[0];
    assert_eq!(params.data_type, DataMessageType::Control);
    assert!(params.ordered);
    assert!(is_open_message(payload));

    // Until the ACK arrives, even unordered channels send ordered.
    assert!(channel.send(&DataBuffer::text("early")));
    let (params, _) = &provider.sent()[1];
    assert!(params.ordered);

    let ack = write_open_ack_message().unwrap();
    let control = ReceiveDataParams {
        ssrc: 1,
        data_type: DataMessageType::Control,
    };
    channel.on_data_received(&control, &ack);

    assert!(channel.send(&DataBuffer::text("late")));
    let (params, _) = &provider.sent()[2];
    assert!(!params.ordered);
}

#[test]
fn test_data_message_also_clears_open_ack_wait() {
    let provider = Arc::new(FakeProvider::default());
    provider.set_ready(true);
    let config = DataChannelInit {
        ordered: false,
        id: 1,
        ..Default::default()
    };
    let mut channel = DataChannel::new(
        provider.clone(),
        DataChannelType::Sctp,
        "handshake",
        config.into(),
    )
    .unwrap();

    // Old clients never send OPEN_ACK; any data message proves the OPEN
    // arrived.
    channel.on_data_received(&data_params(1), &Bytes::from_static(b"hello"));

    assert!(channel.send(&DataBuffer::text("unordered")));
    let sent = provider.sent();
    let (params, _) = sent.last().unwrap();
    assert!(!params.ordered);
}

#[test]
fn test_acker_sends_open_ack() {
    let provider = Arc::new(FakeProvider::default());
    provider.set_ready(true);
    let config: InternalDataChannelInit = InternalDataChannelInit {
        config: DataChannelInit {
            id: 1,
            ..Default::default()
        },
        open_handshake_role: OpenHandshakeRole::Acker,
    };
    let channel =
        DataChannel::new(provider.clone(), DataChannelType::Sctp, "answer", config).unwrap();
    assert_eq!(channel.state(), DataChannelState::Open);

    let sent = provider.sent();
    assert_eq!(sent.len(), 1);
    let (params, payload) = &sent[0];
    assert_eq!(params.data_type, DataMessageType::Control);
    assert_eq!(payload.as_ref(), &[0x02]);
}

#[test]
fn test_control_message_queued_while_blocked() {
    let provider = Arc::new(FakeProvider::default());
    provider.set_ready(true);
    provider.set_send_blocked(true);
    let config = DataChannelInit {
        id: 1,
        ..Default::default()
    };
    let mut channel = DataChannel::new(
        provider.clone(),
        DataChannelType::Sctp,
        "handshake",
        config.into(),
    )
    .unwrap();
    assert!(provider.sent().is_empty());

    provider.set_send_blocked(false);
    channel.on_channel_ready(true);

    let sent = provider.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.data_type, DataMessageType::Control);
    assert!(is_open_message(&sent[0].1));
}
