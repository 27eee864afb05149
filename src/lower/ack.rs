//! Block acknowledgement engine.
//!
//! Builds SAR acknowledgement control PDUs for reassembly sessions and
//! remembers recently completed sessions so that late retransmissions are
//! answered with the final bitmap instead of opening a fresh session.

use crate::address::{Address, UnicastAddress};
use crate::lower::{checked_sequence, DeviceError, LowerContext};
use crate::pdu::lower::{
    BlockAck, LowerControl, LowerControlMessage, LowerPDU, Opcode, SegmentedAcknowledgement,
};
use crate::pdu::network::CleartextNetworkPDU;
use embassy_time::Duration;
use heapless::Vec;
use uluru::LRUCache;

/// The acknowledgement timer runs for 150ms plus 50ms per hop.
pub(crate) fn ack_timeout(ttl: u8) -> Duration {
    Duration::from_millis(150 + 50 * (ttl & 0x7F) as u64)
}

/// Incomplete sessions are abandoned after 10s plus 100ms per hop.
pub(crate) fn incomplete_timeout(ttl: u8) -> Duration {
    Duration::from_millis(10_000 + 100 * (ttl & 0x7F) as u64)
}

/// Where a session's acknowledgements go: the received PDU's destination
/// becomes the source and vice versa, at the observed TTL.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct AckPeer {
    pub src: UnicastAddress,
    pub dst: UnicastAddress,
    pub ttl: u8,
    pub nid: u8,
}

/// Segments addressed to a group or virtual destination are not
/// acknowledged; there is no unicast source to answer from.
pub(crate) fn ack_peer(pdu: &CleartextNetworkPDU) -> Option<AckPeer> {
    match pdu.dst {
        Address::Unicast(local) => Some(AckPeer {
            src: local,
            dst: pdu.src,
            ttl: pdu.ttl & 0x7F,
            nid: pdu.nid,
        }),
        _ => None,
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct BlockAckRequest {
    pub peer: AckPeer,
    pub seq_zero: u16,
    pub block_ack: BlockAck,
}

/// Wrap the current bitmap into a control message and hand it to the host
/// for network-layer processing.
pub(crate) fn send_block_ack<C: LowerContext>(
    ctx: &C,
    request: &BlockAckRequest,
) -> Result<(), DeviceError> {
    let mut parameters = Vec::new();
    SegmentedAcknowledgement {
        obo: false,
        seq_zero: request.seq_zero,
        block_ack: request.block_ack,
    }
    .emit(&mut parameters)
    .map_err(|_| DeviceError::InsufficientBuffer)?;

    let seq = checked_sequence(ctx.next_sequence()?)?;
    let iv_index = ctx.iv_index().ok_or(DeviceError::InvalidState)?;
    let pdu = CleartextNetworkPDU {
        ivi: (iv_index & 1) as u8,
        nid: request.peer.nid,
        ttl: request.peer.ttl,
        seq,
        src: request.peer.src,
        dst: Address::Unicast(request.peer.dst),
        transport_pdu: LowerPDU::Control(LowerControl {
            opcode: Opcode::SegmentedAcknowledgement,
            message: LowerControlMessage::Unsegmented { parameters },
        }),
    };
    ctx.send_segment_acknowledgement(&pdu)
}

struct Mirrored {
    ctl: bool,
    src: UnicastAddress,
    seq_zero: u16,
    request: BlockAckRequest,
}

/// Recently completed sessions, most recent first.
pub(crate) struct AckMirror {
    lru: LRUCache<Mirrored, 8>,
}

impl Default for AckMirror {
    fn default() -> Self {
        Self {
            lru: Default::default(),
        }
    }
}

impl AckMirror {
    pub(crate) fn record(
        &mut self,
        ctl: bool,
        src: UnicastAddress,
        seq_zero: u16,
        request: BlockAckRequest,
    ) {
        if let Some(entry) = self
            .lru
            .find(|e| e.ctl == ctl && e.src == src && e.seq_zero == seq_zero)
        {
            entry.request = request;
        } else {
            self.lru.insert(Mirrored {
                ctl,
                src,
                seq_zero,
                request,
            });
        }
    }

    pub(crate) fn lookup(
        &mut self,
        ctl: bool,
        src: UnicastAddress,
        seq_zero: u16,
    ) -> Option<BlockAckRequest> {
        self.lru
            .find(|e| e.ctl == ctl && e.src == src && e.seq_zero == seq_zero)
            .map(|e| e.request)
    }
}
