//! Inbound reassembly.
//!
//! One session per (source, SeqZero) pair collects segments into a buffer
//! and mirrors them in a [`BlockAck`] bitmap. A session either completes,
//! returning the assembled upper transport PDU, or is dropped when its
//! incomplete deadline passes.

use crate::address::{Address, UnicastAddress};
use crate::app::ApplicationKeyIdentifier;
use crate::lower::ack::{self, AckPeer, BlockAckRequest};
use crate::lower::{recover_full_sequence, DeviceError};
use crate::pdu::lower::{BlockAck, Opcode, SzMic};
use crate::pdu::network::CleartextNetworkPDU;
use crate::pdu::upper::MAX_ACCESS_PAYLOAD;
use crate::MAX_SEGMENTS;
use embassy_time::Instant;
use heapless::Vec;

/// Concurrent reassembly sessions held per direction.
pub(crate) const SESSIONS: usize = 3;

/// Header fields every segment of a session must agree on.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum SegmentedMeta {
    Access {
        akf: bool,
        aid: ApplicationKeyIdentifier,
        szmic: SzMic,
    },
    Control {
        opcode: Opcode,
    },
}

pub(crate) struct Reassembled {
    pub meta: SegmentedMeta,
    pub ivi: u8,
    pub nid: u8,
    pub ttl: u8,
    pub seq: u32,
    pub src: UnicastAddress,
    pub dst: Address,
    pub payload: Vec<u8, MAX_ACCESS_PAYLOAD>,
}

pub(crate) enum Inbound {
    /// Segment stored, ignored, or dropped; nothing to hand up yet.
    Pending,
    /// Every segment has arrived. The acknowledgement is requested even when
    /// the assembled message itself had to be discarded.
    Complete {
        ack: Option<BlockAckRequest>,
        message: Option<Reassembled>,
    },
}

pub(crate) struct InboundSegmentation<const MTU: usize> {
    in_flight: [Option<InFlight<MTU>>; SESSIONS],
}

impl<const MTU: usize> Default for InboundSegmentation<MTU> {
    fn default() -> Self {
        Self {
            in_flight: Default::default(),
        }
    }
}

impl<const MTU: usize> InboundSegmentation<MTU> {
    pub(crate) fn process_inbound(
        &mut self,
        now: Instant,
        pdu: &CleartextNetworkPDU,
        meta: SegmentedMeta,
        seq_zero: u16,
        seg_o: u8,
        seg_n: u8,
        segment_m: &[u8],
    ) -> Result<Inbound, DeviceError> {
        let index = self.find_or_create(now, pdu, meta, seq_zero, seg_n)?;
        let slot = &mut self.in_flight[index];
        let session = match slot {
            Some(session) => session,
            None => return Err(DeviceError::InsufficientBuffer),
        };

        if session.seg_n != seg_n || session.meta != meta {
            warn!(
                "conflicting segment for seq_zero {}, segment dropped",
                seq_zero
            );
            return Ok(Inbound::Pending);
        }

        // The acknowledgement timer is started on whichever segment arrives
        // first, duplicates included.
        if session.peer.is_some() && session.ack_deadline.is_none() {
            session.ack_deadline = Some(now + ack::ack_timeout(session.ttl));
            session.block_ack_sent = false;
        }

        if session.block_ack.contains(seg_o) {
            trace!("duplicate segment {} for seq_zero {}", seg_o, seq_zero);
            return Ok(Inbound::Pending);
        }

        session.block_ack.set(seg_o);
        let mut segment = Vec::new();
        segment
            .extend_from_slice(segment_m)
            .map_err(|_| DeviceError::InsufficientBuffer)?;
        session.segments[seg_o as usize] = Some(segment);

        if !session.block_ack.is_complete(seg_n) {
            return Ok(Inbound::Pending);
        }

        let ack = if session.block_ack_sent {
            None
        } else {
            session.peer.map(|peer| BlockAckRequest {
                peer,
                seq_zero,
                block_ack: session.block_ack,
            })
        };

        let message = match recover_full_sequence(pdu.seq, seq_zero) {
            Ok(seq) => Some(Reassembled {
                meta,
                ivi: session.ivi,
                nid: session.nid,
                ttl: session.ttl,
                seq,
                src: session.src,
                dst: session.dst,
                payload: session.assemble()?,
            }),
            Err(_) => {
                warn!(
                    "sequence rewind past zero for seq_zero {}, message dropped",
                    seq_zero
                );
                None
            }
        };

        *slot = None;
        Ok(Inbound::Complete { ack, message })
    }

    fn find_or_create(
        &mut self,
        now: Instant,
        pdu: &CleartextNetworkPDU,
        meta: SegmentedMeta,
        seq_zero: u16,
        seg_n: u8,
    ) -> Result<usize, DeviceError> {
        if let Some(index) = self.in_flight.iter().position(|slot| {
            slot.as_ref()
                .map_or(false, |s| s.src == pdu.src && s.seq_zero == seq_zero)
        }) {
            return Ok(index);
        }
        if let Some(index) = self.in_flight.iter().position(Option::is_none) {
            self.in_flight[index] = Some(InFlight::new(now, pdu, meta, seq_zero, seg_n)?);
            debug!("reassembly session started for seq_zero {}", seq_zero);
            Ok(index)
        } else {
            warn!("no reassembly session available, segment dropped");
            Err(DeviceError::InsufficientBuffer)
        }
    }

    /// Earliest pending acknowledgement or incomplete deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        for session in self.in_flight.iter().flatten() {
            for candidate in [session.ack_deadline, Some(session.drop_deadline)] {
                if let Some(candidate) = candidate {
                    match earliest {
                        Some(prev) if prev <= candidate => {}
                        _ => earliest = Some(candidate),
                    }
                }
            }
        }
        earliest
    }

    /// Fire due acknowledgement timers and drop sessions whose incomplete
    /// deadline has passed. Returns the acknowledgements to emit.
    pub(crate) fn process_timeouts(&mut self, now: Instant) -> Vec<BlockAckRequest, SESSIONS> {
        let mut acks = Vec::new();
        for slot in self.in_flight.iter_mut() {
            if let Some(session) = slot {
                if session.drop_deadline <= now {
                    warn!(
                        "reassembly incomplete for seq_zero {}, session dropped",
                        session.seq_zero
                    );
                    *slot = None;
                    continue;
                }
                if let Some(deadline) = session.ack_deadline {
                    if deadline <= now {
                        if let Some(peer) = session.peer {
                            acks.push(BlockAckRequest {
                                peer,
                                seq_zero: session.seq_zero,
                                block_ack: session.block_ack,
                            })
                            .ok();
                        }
                        session.ack_deadline = None;
                        session.block_ack_sent = true;
                    }
                }
            }
        }
        acks
    }
}

struct InFlight<const MTU: usize> {
    src: UnicastAddress,
    dst: Address,
    ivi: u8,
    nid: u8,
    ttl: u8,
    seq_zero: u16,
    seg_n: u8,
    meta: SegmentedMeta,
    peer: Option<AckPeer>,
    block_ack: BlockAck,
    block_ack_sent: bool,
    ack_deadline: Option<Instant>,
    drop_deadline: Instant,
    segments: Vec<Option<Vec<u8, MTU>>, MAX_SEGMENTS>,
}

impl<const MTU: usize> InFlight<MTU> {
    fn new(
        now: Instant,
        pdu: &CleartextNetworkPDU,
        meta: SegmentedMeta,
        seq_zero: u16,
        seg_n: u8,
    ) -> Result<Self, DeviceError> {
        let mut segments = Vec::new();
        for _ in 0..=seg_n {
            segments
                .push(None)
                .map_err(|_| DeviceError::InsufficientBuffer)?;
        }
        let ttl = pdu.ttl & 0x7F;
        Ok(Self {
            src: pdu.src,
            dst: pdu.dst,
            ivi: pdu.ivi,
            nid: pdu.nid,
            ttl,
            seq_zero,
            seg_n,
            meta,
            peer: ack::ack_peer(pdu),
            block_ack: BlockAck::default(),
            block_ack_sent: false,
            ack_deadline: None,
            drop_deadline: now + ack::incomplete_timeout(ttl),
            segments,
        })
    }

    fn assemble(&self) -> Result<Vec<u8, MAX_ACCESS_PAYLOAD>, DeviceError> {
        let mut assembled = Vec::new();
        for segment in self.segments.iter() {
            let segment = segment.as_ref().ok_or(DeviceError::InvalidState)?;
            assembled
                .extend_from_slice(segment)
                .map_err(|_| DeviceError::InsufficientBuffer)?;
        }
        Ok(assembled)
    }
}
