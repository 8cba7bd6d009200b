
use log::warn;

/// Minimum length of an RTP packet: the fixed header through the SSRC word.
const RTP_MIN_PACKET_LEN: usize = 12;
/// Byte offset of the SSRC field in the fixed RTP header.
const RTP_SSRC_OFFSET: usize = 8;

/// Minimum length of an RTCP packet: common header plus the sender SSRC.
const RTCP_MIN_PACKET_LEN: usize = 8;
/// Byte offset of the payload-type field in the common RTCP header.
const RTCP_PAYLOAD_TYPE_OFFSET: usize = 1;
/// Byte offset of the sender SSRC in the common RTCP header.
const RTCP_SSRC_OFFSET: usize = 4;

/// RTCP SDES (source description), RFC 3550 6.5. Not demultiplexable by a
/// single SSRC, delivered to every channel on the transport.
const RTCP_PACKET_TYPE_SDES: u8 = 202;

/// Reserved sender SSRC used by non-compound generic feedback (RFC 5506);
/// always delivered.
const SSRC_GENERIC_FEEDBACK: u32 = 0x0000_0001;

/// Declares the SSRCs one logical media stream sends under, together with
/// the stream's application-level identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamParams {
    pub id: String,
    pub ssrcs: Vec<u32>,
}

impl StreamParams {
    pub fn new(id: impl Into<String>, ssrcs: Vec<u32>) -> Self {
        Self {
            id: id.into(),
            ssrcs,
        }
    }

    /// The stream's primary SSRC, which keys it inside a filter.
    pub fn first_ssrc(&self) -> Option<u32> {
        self.ssrcs.first().copied()
    }

    pub fn has_ssrc(&self, ssrc: u32) -> bool {
        self.ssrcs.contains(&ssrc)
    }
}

/// Routes inbound RTP/RTCP packets to the media channel owning this filter.
///
/// Several media channels can share one transport; each consults its own
/// filter on every inbound packet and keeps the packet only when the filter
/// accepts it.
#[derive(Debug, Default)]
pub struct SsrcMuxFilter {
    streams: Vec<StreamParams>,
}

impl SsrcMuxFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once at least one stream is registered.
    pub fn is_active(&self) -> bool {
        !self.streams.is_empty()
    }

    /// Registers a stream. Fails when the stream declares no SSRC or its
    /// primary SSRC is already claimed by a registered stream.
    pub fn add_stream(&mut self, stream: StreamParams) -> bool {
        let Some(first_ssrc) = stream.first_ssrc() else {
            warn!("Stream {} declares no ssrcs", stream.id);
            return false;
        };
        if self.find_stream(first_ssrc) {
            warn!("Stream with ssrc {first_ssrc} already exists");
            return false;
        }
        self.streams.push(stream);
        true
    }

    /// Unregisters the stream keyed by `first_ssrc`. Returns whether a
    /// stream was removed.
    pub fn remove_stream(&mut self, first_ssrc: u32) -> bool {
        let len_before = self.streams.len();
        self.streams
            .retain(|s| s.first_ssrc() != Some(first_ssrc));
        self.streams.len() != len_before
    }

    /// Whether any registered stream claims `ssrc`.
    pub fn find_stream(&self, ssrc: u32) -> bool {
        self.streams.iter().any(|s| s.has_ssrc(ssrc))
    }

    /// The routing decision: should this channel keep the packet?
    pub fn demux_packet(&self, packet: &[u8], is_rtcp: bool) -> bool {
        if is_rtcp {
            self.demux_rtcp(packet)
        } else {
            self.demux_rtp(packet)
        }
    }

    fn demux_rtp(&self, packet: &[u8]) -> bool {
        if packet.len() < RTP_MIN_PACKET_LEN {
            return false;
        }
        self.find_stream(read_u32_be(packet, RTP_SSRC_OFFSET))
    }

    fn demux_rtcp(&self, packet: &[u8]) -> bool {
        if packet.len() < RTCP_MIN_PACKET_LEN {
            return false;
        }
        if packet[RTCP_PAYLOAD_TYPE_OFFSET] == RTCP_PACKET_TYPE_SDES {
            return true;
        }
        match read_u32_be(packet, RTCP_SSRC_OFFSET) {
            0 => false,
            SSRC_GENERIC_FEEDBACK => true,
            ssrc => self.find_stream(ssrc),
        }
    }
}

fn read_u32_be(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(word)
}
