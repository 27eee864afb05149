//! Outbound segmentation.
//!
//! Splits an upper transport PDU into lower transport segments wrapped in
//! network PDUs, emitted in SegO order, and keeps segmented transmissions
//! in flight until the peer's block acknowledgement clears them.

use crate::lower::{checked_sequence, DeviceError, LowerContext};
use crate::pdu::lower::{
    seq_zero, BlockAck, LowerAccess, LowerAccessMessage, LowerControl, LowerControlMessage,
    LowerPDU,
};
use crate::pdu::network::CleartextNetworkPDU;
use crate::pdu::upper::{UpperAccess, UpperControl};
use crate::{
    MAX_SEGMENTED_ACCESS_PAYLOAD, MAX_SEGMENTED_CONTROL_PAYLOAD, MAX_SEGMENTS,
    MAX_UNSEGMENTED_CONTROL_PAYLOAD,
};
use embassy_time::{Duration, Instant};
use heapless::Vec;

/// An unacknowledged transmission is given up on after this long without
/// hearing from the peer.
const ABANDON_TIMEOUT: Duration = Duration::from_secs(7);

/// Network PDUs for one message, ordered by SegO.
pub struct OutboundSegments<const N: usize = MAX_SEGMENTS> {
    segments: Vec<CleartextNetworkPDU, N>,
}

impl<const N: usize> OutboundSegments<N> {
    pub fn iter(&self) -> core::slice::Iter<'_, CleartextNetworkPDU> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub(crate) fn is_segmented(&self) -> bool {
        self.segments
            .first()
            .map_or(false, |pdu| pdu.transport_pdu.is_segmented())
    }
}

impl<'a, const N: usize> IntoIterator for &'a OutboundSegments<N> {
    type Item = &'a CleartextNetworkPDU;
    type IntoIter = core::slice::Iter<'a, CleartextNetworkPDU>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

pub(crate) fn number_of_segments(len: usize, mtu: usize) -> Result<usize, DeviceError> {
    let count = (len + mtu - 1) / mtu;
    if count > MAX_SEGMENTS {
        Err(DeviceError::PayloadTooLarge)
    } else {
        Ok(count)
    }
}

/// Segment 0 reuses the message's own sequence number, which SeqZero is
/// derived from; every following segment draws a fresh one.
pub(crate) fn segment_access<C: LowerContext>(
    ctx: &C,
    msg: &UpperAccess,
) -> Result<OutboundSegments, DeviceError> {
    let first_seq = checked_sequence(msg.seq)?;
    let mut segments = Vec::new();

    if msg.payload.len() <= MAX_SEGMENTED_ACCESS_PAYLOAD {
        let payload =
            Vec::from_slice(&msg.payload).map_err(|_| DeviceError::InsufficientBuffer)?;
        segments
            .push(network_pdu(
                msg.ivi,
                msg.nid,
                msg.ttl,
                first_seq,
                msg,
                LowerPDU::Access(LowerAccess {
                    akf: msg.akf,
                    aid: msg.aid,
                    message: LowerAccessMessage::Unsegmented(payload),
                }),
            ))
            .map_err(|_| DeviceError::InsufficientBuffer)?;
        return Ok(OutboundSegments { segments });
    }

    let count = number_of_segments(msg.payload.len(), MAX_SEGMENTED_ACCESS_PAYLOAD)?;
    let seg_n = (count - 1) as u8;
    let seq_zero = seq_zero(first_seq);
    for seg_o in 0..count {
        let offset = seg_o * MAX_SEGMENTED_ACCESS_PAYLOAD;
        let end = usize::min(msg.payload.len(), offset + MAX_SEGMENTED_ACCESS_PAYLOAD);
        let segment_m =
            Vec::from_slice(&msg.payload[offset..end]).map_err(|_| DeviceError::InsufficientBuffer)?;
        let seq = if seg_o == 0 {
            first_seq
        } else {
            checked_sequence(ctx.next_sequence()?)?
        };
        segments
            .push(network_pdu(
                msg.ivi,
                msg.nid,
                msg.ttl,
                seq,
                msg,
                LowerPDU::Access(LowerAccess {
                    akf: msg.akf,
                    aid: msg.aid,
                    message: LowerAccessMessage::Segmented {
                        szmic: msg.szmic,
                        seq_zero,
                        seg_o: seg_o as u8,
                        seg_n,
                        segment_m,
                    },
                }),
            ))
            .map_err(|_| DeviceError::InsufficientBuffer)?;
    }
    Ok(OutboundSegments { segments })
}

pub(crate) fn segment_control<C: LowerContext>(
    ctx: &C,
    msg: &UpperControl,
) -> Result<OutboundSegments, DeviceError> {
    let first_seq = checked_sequence(msg.seq)?;
    let mut segments = Vec::new();

    if msg.parameters.len() + msg.payload.len() <= MAX_UNSEGMENTED_CONTROL_PAYLOAD {
        let mut parameters: Vec<u8, 11> = Vec::new();
        parameters
            .extend_from_slice(&msg.parameters)
            .map_err(|_| DeviceError::InsufficientBuffer)?;
        parameters
            .extend_from_slice(&msg.payload)
            .map_err(|_| DeviceError::InsufficientBuffer)?;
        segments
            .push(control_pdu(
                msg,
                first_seq,
                LowerControlMessage::Unsegmented { parameters },
            ))
            .map_err(|_| DeviceError::InsufficientBuffer)?;
        return Ok(OutboundSegments { segments });
    }

    // The parameters prefix only exists on the unsegmented form.
    if !msg.parameters.is_empty() {
        return Err(DeviceError::InvalidState);
    }

    let count = number_of_segments(msg.payload.len(), MAX_SEGMENTED_CONTROL_PAYLOAD)?;
    let seg_n = (count - 1) as u8;
    let seq_zero = seq_zero(first_seq);
    for seg_o in 0..count {
        let offset = seg_o * MAX_SEGMENTED_CONTROL_PAYLOAD;
        let end = usize::min(msg.payload.len(), offset + MAX_SEGMENTED_CONTROL_PAYLOAD);
        let segment_m =
            Vec::from_slice(&msg.payload[offset..end]).map_err(|_| DeviceError::InsufficientBuffer)?;
        let seq = if seg_o == 0 {
            first_seq
        } else {
            checked_sequence(ctx.next_sequence()?)?
        };
        segments
            .push(control_pdu(
                msg,
                seq,
                LowerControlMessage::Segmented {
                    seq_zero,
                    seg_o: seg_o as u8,
                    seg_n,
                    segment_m,
                },
            ))
            .map_err(|_| DeviceError::InsufficientBuffer)?;
    }
    Ok(OutboundSegments { segments })
}

fn network_pdu(
    ivi: u8,
    nid: u8,
    ttl: u8,
    seq: u32,
    msg: &UpperAccess,
    transport_pdu: LowerPDU,
) -> CleartextNetworkPDU {
    CleartextNetworkPDU {
        ivi,
        nid,
        ttl,
        seq,
        src: msg.src,
        dst: msg.dst,
        transport_pdu,
    }
}

fn control_pdu(msg: &UpperControl, seq: u32, message: LowerControlMessage) -> CleartextNetworkPDU {
    CleartextNetworkPDU {
        ivi: msg.ivi,
        nid: msg.nid,
        ttl: msg.ttl,
        seq,
        src: msg.src,
        dst: msg.dst,
        transport_pdu: LowerPDU::Control(LowerControl {
            opcode: msg.opcode,
            message,
        }),
    }
}

struct Entry {
    seq_zero: u16,
    ts: Instant,
    segments: Vec<Option<CleartextNetworkPDU>, MAX_SEGMENTS>,
}

/// Segmented transmissions awaiting acknowledgement.
pub(crate) struct OutboundSegmentation {
    in_flight: [Option<Entry>; 3],
}

impl Default for OutboundSegmentation {
    fn default() -> Self {
        Self {
            in_flight: Default::default(),
        }
    }
}

impl OutboundSegmentation {
    pub(crate) fn register(
        &mut self,
        now: Instant,
        seq_zero: u16,
        segments: &OutboundSegments,
    ) -> Result<(), DeviceError> {
        if let Some(entry) = self.in_flight.iter_mut().find(|e| e.is_none()) {
            let mut pending = Vec::new();
            for segment in segments.iter() {
                pending
                    .push(Some(segment.clone()))
                    .map_err(|_| DeviceError::InsufficientBuffer)?;
            }
            *entry = Some(Entry {
                seq_zero,
                ts: now,
                segments: pending,
            });
            Ok(())
        } else {
            Err(DeviceError::InsufficientBuffer)
        }
    }

    /// Apply a received block acknowledgement: clear acknowledged segments
    /// and retire the transmission once nothing is left.
    pub(crate) fn ack(&mut self, now: Instant, seq_zero: u16, block_ack: BlockAck) {
        for slot in self.in_flight.iter_mut() {
            let matches = slot
                .as_ref()
                .map_or(false, |entry| entry.seq_zero == seq_zero);
            if !matches {
                continue;
            }
            if let Some(entry) = slot {
                entry.ts = now;
                for (seg_o, segment) in entry.segments.iter_mut().enumerate() {
                    if block_ack.contains(seg_o as u8) {
                        *segment = None;
                    }
                }
                if entry.segments.iter().all(Option::is_none) {
                    debug!("transmission for seq_zero {} fully acknowledged", seq_zero);
                    *slot = None;
                }
            }
            return;
        }
    }

    /// Collect every still-unacknowledged segment for retransmission,
    /// abandoning transmissions the peer has gone quiet on.
    pub(crate) fn process_retransmits(
        &mut self,
        now: Instant,
    ) -> Result<OutboundSegments<96>, DeviceError> {
        let mut segments = Vec::new();
        for slot in self.in_flight.iter_mut() {
            if let Some(entry) = slot {
                if now.duration_since(entry.ts) > ABANDON_TIMEOUT {
                    warn!(
                        "transmission for seq_zero {} unacknowledged, abandoned",
                        entry.seq_zero
                    );
                    *slot = None;
                    continue;
                }
                for segment in entry.segments.iter().flatten() {
                    segments
                        .push(segment.clone())
                        .map_err(|_| DeviceError::InsufficientBuffer)?;
                }
            }
        }
        Ok(OutboundSegments { segments })
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::address::{Address, UnicastAddress};
    use crate::pdu::lower::{Opcode, SzMic};
    use core::cell::Cell;

    struct TestContext {
        seq: Cell<u32>,
    }

    impl crate::lower::LowerContext for TestContext {
        fn now(&self) -> Instant {
            Instant::from_millis(0)
        }

        fn iv_index(&self) -> Option<u32> {
            Some(0)
        }

        fn next_sequence(&self) -> Result<u32, DeviceError> {
            let seq = self.seq.get();
            self.seq.set(seq + 1);
            Ok(seq)
        }

        fn send_segment_acknowledgement(
            &self,
            _pdu: &CleartextNetworkPDU,
        ) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn ctx() -> TestContext {
        TestContext {
            seq: Cell::new(0x2000),
        }
    }

    fn addr(val: u16) -> UnicastAddress {
        UnicastAddress::parse(val.to_be_bytes()).unwrap()
    }

    fn access(seq: u32, payload: &[u8]) -> UpperAccess {
        UpperAccess {
            ivi: 0,
            nid: 0x68,
            ttl: 3,
            seq,
            src: addr(0x0001),
            dst: Address::Unicast(addr(0x0002)),
            akf: false,
            aid: 0.into(),
            szmic: SzMic::Bit32,
            segmented: false,
            payload: Vec::from_slice(payload).unwrap(),
        }
    }

    fn control(seq: u32, parameters: &[u8], payload: &[u8]) -> UpperControl {
        UpperControl {
            ivi: 0,
            nid: 0x68,
            ttl: 3,
            seq,
            src: addr(0x0001),
            dst: Address::Unicast(addr(0x0002)),
            opcode: Opcode::FriendRequest,
            parameters: Vec::from_slice(parameters).unwrap(),
            segmented: false,
            payload: Vec::from_slice(payload).unwrap(),
        }
    }

    fn transport_bytes(pdu: &CleartextNetworkPDU) -> Vec<u8, 32> {
        let mut xmit = Vec::new();
        pdu.transport_pdu.emit(&mut xmit).unwrap();
        xmit
    }

    #[test]
    fn short_access_payload_stays_unsegmented() {
        let msg = access(0x0001, &[0xAA, 0xBB, 0xCC]);
        let segments = segment_access(&ctx(), &msg).unwrap();
        assert_eq!(segments.len(), 1);
        assert!(!segments.is_segmented());
        assert_eq!(
            transport_bytes(segments.iter().next().unwrap()).as_slice(),
            &[0x00, 0xAA, 0xBB, 0xCC]
        );
    }

    #[test]
    fn sixteen_byte_access_payload_splits_in_two() {
        let payload: std::vec::Vec<u8> = (0u8..16).collect();
        let msg = access(0x0001, &payload);
        let segments = segment_access(&ctx(), &msg).unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments.is_segmented());

        let first = transport_bytes(segments.iter().next().unwrap());
        assert_eq!(&first[..4], &[0x80, 0x00, 0x04, 0x01]);
        assert_eq!(&first[4..], &payload[..12]);

        let second = transport_bytes(segments.iter().nth(1).unwrap());
        assert_eq!(&second[..4], &[0x80, 0x00, 0x04, 0x21]);
        assert_eq!(&second[4..], &payload[12..]);
    }

    #[test]
    fn segments_are_ordered_and_draw_fresh_sequence_numbers() {
        let msg = access(0x0100, &[0x11; 30]);
        let segments = segment_access(&ctx(), &msg).unwrap();
        assert_eq!(segments.len(), 3);
        let seqs: std::vec::Vec<u32> = segments.iter().map(|pdu| pdu.seq).collect();
        assert_eq!(seqs, std::vec![0x0100, 0x2000, 0x2001]);
        for (expected, pdu) in segments.iter().enumerate() {
            match &pdu.transport_pdu {
                LowerPDU::Access(LowerAccess {
                    message:
                        LowerAccessMessage::Segmented {
                            seq_zero, seg_o, seg_n, ..
                        },
                    ..
                }) => {
                    assert_eq!(*seq_zero, 0x0100);
                    assert_eq!(*seg_o as usize, expected);
                    assert_eq!(*seg_n, 2);
                }
                _ => panic!("expected segmented access"),
            }
        }
    }

    #[test]
    fn unsegmented_control_carries_parameters_prefix() {
        let msg = control(0x0001, &[0x01, 0x02], &[0x03, 0x04, 0x05]);
        let segments = segment_control(&ctx(), &msg).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(
            transport_bytes(segments.iter().next().unwrap()).as_slice(),
            &[0x03, 0x01, 0x02, 0x03, 0x04, 0x05]
        );
    }

    #[test]
    fn long_control_payload_segments_at_eight_bytes() {
        let msg = control(0x0001, &[], &[0x22; 20]);
        let segments = segment_control(&ctx(), &msg).unwrap();
        assert_eq!(segments.len(), 3);
        let lengths: std::vec::Vec<usize> = segments
            .iter()
            .map(|pdu| transport_bytes(pdu).len() - 4)
            .collect();
        assert_eq!(lengths, std::vec![8, 8, 4]);
    }

    #[test]
    fn segmented_control_rejects_parameters() {
        let msg = control(0x0001, &[0x01], &[0x22; 20]);
        assert_eq!(
            segment_control(&ctx(), &msg).map(|_| ()),
            Err(DeviceError::InvalidState)
        );
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert_eq!(number_of_segments(384, MAX_SEGMENTED_ACCESS_PAYLOAD), Ok(32));
        assert_eq!(
            number_of_segments(385, MAX_SEGMENTED_ACCESS_PAYLOAD),
            Err(DeviceError::PayloadTooLarge)
        );
        assert_eq!(
            number_of_segments(400, MAX_SEGMENTED_CONTROL_PAYLOAD),
            Err(DeviceError::PayloadTooLarge)
        );
    }

    #[test]
    fn retransmission_abandoned_when_peer_stays_quiet() {
        let msg = access(0x0100, &[0x11; 30]);
        let segments = segment_access(&ctx(), &msg).unwrap();
        let mut outbound = OutboundSegmentation::default();
        outbound
            .register(Instant::from_millis(0), seq_zero(0x0100), &segments)
            .unwrap();

        // Partial acknowledgement keeps the rest alive.
        outbound.ack(Instant::from_millis(100), 0x0100, 0x0000_0002.into());
        let remaining = outbound
            .process_retransmits(Instant::from_millis(200))
            .unwrap();
        assert_eq!(remaining.len(), 2);

        // Quiet past the abandon window: nothing left to retransmit.
        let remaining = outbound
            .process_retransmits(Instant::from_millis(7201))
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[test]
    fn fully_acknowledged_transmission_is_retired() {
        let msg = access(0x0100, &[0x11; 16]);
        let segments = segment_access(&ctx(), &msg).unwrap();
        let mut outbound = OutboundSegmentation::default();
        outbound
            .register(Instant::from_millis(0), seq_zero(0x0100), &segments)
            .unwrap();
        outbound.ack(Instant::from_millis(50), 0x0100, 0x0000_0003.into());
        let remaining = outbound
            .process_retransmits(Instant::from_millis(60))
            .unwrap();
        assert!(remaining.is_empty());
    }
}
