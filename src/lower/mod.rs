//! The lower transport layer state machine.
//!
//! [`LowerTransport`] owns the inbound reassembly sessions, the outbound
//! in-flight table and the acknowledgement state. It is driven from a single
//! event loop: the host feeds it decrypted network PDUs one at a time, asks
//! [`LowerTransport::next_deadline`] how long it may sleep, and calls
//! [`LowerTransport::process_timeouts`] once that deadline passes. Everything
//! the layer needs from the surrounding stack arrives through the
//! [`LowerContext`] capabilities.

use crate::address::UnicastAddress;
use crate::pdu::lower::{
    seq_zero, LowerAccessMessage, LowerControlMessage, LowerPDU, Opcode, SegmentedAcknowledgement,
    SzMic,
};
use crate::pdu::network::CleartextNetworkPDU;
use crate::pdu::upper::{UpperAccess, UpperControl, UpperPDU};
use crate::pdu::ParseError;
use crate::{InsufficientBuffer, MAX_SEGMENTED_ACCESS_PAYLOAD, MAX_SEGMENTED_CONTROL_PAYLOAD};
use embassy_time::Instant;
use heapless::Vec;

pub(crate) mod ack;
pub mod outbound;
pub(crate) mod segmentation;

pub use outbound::OutboundSegments;

use ack::AckMirror;
use segmentation::{Inbound, InboundSegmentation, Reassembled, SegmentedMeta};

#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceError {
    InsufficientBuffer,
    ParseError(ParseError),
    PayloadTooLarge,
    SequenceOverflow,
    InvalidState,
    TransmitError,
}

impl From<ParseError> for DeviceError {
    fn from(inner: ParseError) -> Self {
        DeviceError::ParseError(inner)
    }
}

impl From<InsufficientBuffer> for DeviceError {
    fn from(_: InsufficientBuffer) -> Self {
        DeviceError::InsufficientBuffer
    }
}

/// Capabilities the surrounding stack provides to this layer.
pub trait LowerContext {
    /// Monotonic clock driving the acknowledgement and reassembly deadlines.
    fn now(&self) -> Instant;

    /// Current IV index, shared with the network layer. `None` before the
    /// node is provisioned.
    fn iv_index(&self) -> Option<u32>;

    /// Next outbound sequence number. The host owns persistence and the
    /// IV index interaction; returned values must fit 24 bits.
    fn next_sequence(&self) -> Result<u32, DeviceError>;

    /// Submit a finished block acknowledgement for network-layer
    /// encryption and transmission.
    fn send_segment_acknowledgement(&self, pdu: &CleartextNetworkPDU) -> Result<(), DeviceError>;
}

/// Sequence numbers are 24 bits on the wire.
pub(crate) fn checked_sequence(seq: u32) -> Result<u32, DeviceError> {
    if seq > 0x00FF_FFFF {
        Err(DeviceError::SequenceOverflow)
    } else {
        Ok(seq)
    }
}

/// Recover the 24-bit sequence number of a segmented message: the largest
/// value no greater than `received_seq` whose low 13 bits equal `seq_zero`.
/// Rewinding below zero is refused rather than wrapped.
pub fn recover_full_sequence(received_seq: u32, seq_zero: u16) -> Result<u32, ParseError> {
    let seq_zero = (seq_zero & 0x1FFF) as u32;
    let mut upper = received_seq >> 13;
    if (received_seq & 0x1FFF) < seq_zero {
        upper = upper.checked_sub(1).ok_or(ParseError::InvalidValue)?;
    }
    Ok((upper << 13) | seq_zero)
}

pub struct LowerTransport {
    access: InboundSegmentation<MAX_SEGMENTED_ACCESS_PAYLOAD>,
    control: InboundSegmentation<MAX_SEGMENTED_CONTROL_PAYLOAD>,
    outbound: outbound::OutboundSegmentation,
    mirror: AckMirror,
}

impl Default for LowerTransport {
    fn default() -> Self {
        Self {
            access: Default::default(),
            control: Default::default(),
            outbound: Default::default(),
            mirror: Default::default(),
        }
    }
}

impl LowerTransport {
    pub fn new() -> Self {
        Default::default()
    }

    /// Feed one decrypted network frame, raw. Malformed or unprocessable
    /// PDUs are logged and discarded rather than surfaced to the caller.
    pub fn receive<C: LowerContext>(&mut self, ctx: &C, data: &[u8]) -> Option<UpperPDU> {
        match CleartextNetworkPDU::parse(data) {
            Ok(pdu) => match self.process_inbound(ctx, &pdu) {
                Ok(result) => result,
                Err(_e) => {
                    warn!("inbound transport PDU dropped");
                    None
                }
            },
            Err(_e) => {
                warn!("malformed network PDU dropped");
                None
            }
        }
    }

    /// Process one decrypted network PDU. Unsegmented messages complete
    /// immediately; segments are folded into their reassembly session and
    /// the assembled message is returned once the last one arrives.
    pub fn process_inbound<C: LowerContext>(
        &mut self,
        ctx: &C,
        pdu: &CleartextNetworkPDU,
    ) -> Result<Option<UpperPDU>, DeviceError> {
        match &pdu.transport_pdu {
            LowerPDU::Access(access) => match &access.message {
                LowerAccessMessage::Unsegmented(payload) => {
                    let payload =
                        Vec::from_slice(payload).map_err(|_| DeviceError::InsufficientBuffer)?;
                    Ok(Some(UpperPDU::Access(UpperAccess {
                        ivi: pdu.ivi,
                        nid: pdu.nid,
                        ttl: pdu.ttl,
                        seq: pdu.seq,
                        src: pdu.src,
                        dst: pdu.dst,
                        akf: access.akf,
                        aid: access.aid,
                        // The upper MIC is always 32 bits when unsegmented.
                        szmic: SzMic::Bit32,
                        segmented: false,
                        payload,
                    })))
                }
                LowerAccessMessage::Segmented {
                    szmic,
                    seq_zero,
                    seg_o,
                    seg_n,
                    segment_m,
                } => {
                    if self.mirror_ack(ctx, false, pdu.src, *seq_zero) {
                        return Ok(None);
                    }
                    let meta = SegmentedMeta::Access {
                        akf: access.akf,
                        aid: access.aid,
                        szmic: *szmic,
                    };
                    let event = self.access.process_inbound(
                        ctx.now(),
                        pdu,
                        meta,
                        *seq_zero,
                        *seg_o,
                        *seg_n,
                        segment_m,
                    )?;
                    self.handle_event(ctx, false, pdu.src, *seq_zero, event)
                }
            },
            LowerPDU::Control(control) => match &control.message {
                LowerControlMessage::Unsegmented { parameters } => {
                    if let Opcode::SegmentedAcknowledgement = control.opcode {
                        let ack = SegmentedAcknowledgement::parse(parameters)?;
                        debug!(
                            "block acknowledgement for seq_zero {}: {}",
                            ack.seq_zero,
                            ack.block_ack.value()
                        );
                        self.outbound.ack(ctx.now(), ack.seq_zero, ack.block_ack);
                    }
                    let payload =
                        Vec::from_slice(parameters).map_err(|_| DeviceError::InsufficientBuffer)?;
                    Ok(Some(UpperPDU::Control(UpperControl {
                        ivi: pdu.ivi,
                        nid: pdu.nid,
                        ttl: pdu.ttl,
                        seq: pdu.seq,
                        src: pdu.src,
                        dst: pdu.dst,
                        opcode: control.opcode,
                        parameters: Vec::new(),
                        segmented: false,
                        payload,
                    })))
                }
                LowerControlMessage::Segmented {
                    seq_zero,
                    seg_o,
                    seg_n,
                    segment_m,
                } => {
                    if self.mirror_ack(ctx, true, pdu.src, *seq_zero) {
                        return Ok(None);
                    }
                    let meta = SegmentedMeta::Control {
                        opcode: control.opcode,
                    };
                    let event = self.control.process_inbound(
                        ctx.now(),
                        pdu,
                        meta,
                        *seq_zero,
                        *seg_o,
                        *seg_n,
                        segment_m,
                    )?;
                    self.handle_event(ctx, true, pdu.src, *seq_zero, event)
                }
            },
        }
    }

    /// Turn an upper transport PDU into network PDUs, in SegO order.
    /// Segmented transmissions are kept in flight until acknowledged.
    pub fn process_outbound<C: LowerContext>(
        &mut self,
        ctx: &C,
        pdu: &mut UpperPDU,
    ) -> Result<OutboundSegments, DeviceError> {
        let segments = match &*pdu {
            UpperPDU::Access(inner) => outbound::segment_access(ctx, inner)?,
            UpperPDU::Control(inner) => outbound::segment_control(ctx, inner)?,
        };
        pdu.set_segmented(segments.is_segmented());
        if segments.is_segmented() {
            self.outbound
                .register(ctx.now(), seq_zero(pdu.seq()), &segments)?;
        }
        Ok(segments)
    }

    /// The host event loop may sleep until this instant.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.access.next_deadline(), self.control.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire due acknowledgement timers and drop timed-out sessions. Call
    /// whenever the deadline from [`Self::next_deadline`] has passed.
    pub fn process_timeouts<C: LowerContext>(&mut self, ctx: &C) {
        let now = ctx.now();
        for request in self
            .access
            .process_timeouts(now)
            .iter()
            .chain(self.control.process_timeouts(now).iter())
        {
            if let Err(_e) = ack::send_block_ack(ctx, request) {
                warn!("block acknowledgement not sent");
            }
        }
    }

    /// Unacknowledged segments due for another transmission round.
    pub fn process_retransmits<C: LowerContext>(
        &mut self,
        ctx: &C,
    ) -> Result<OutboundSegments<96>, DeviceError> {
        self.outbound.process_retransmits(ctx.now())
    }

    /// Late segments for an already-completed message are answered with the
    /// final bitmap so the sender stops retransmitting.
    fn mirror_ack<C: LowerContext>(
        &mut self,
        ctx: &C,
        ctl: bool,
        src: UnicastAddress,
        seq_zero: u16,
    ) -> bool {
        if let Some(request) = self.mirror.lookup(ctl, src, seq_zero) {
            debug!(
                "segment for completed seq_zero {}, repeating acknowledgement",
                seq_zero
            );
            if let Err(_e) = ack::send_block_ack(ctx, &request) {
                warn!("block acknowledgement not sent");
            }
            true
        } else {
            false
        }
    }

    fn handle_event<C: LowerContext>(
        &mut self,
        ctx: &C,
        ctl: bool,
        src: UnicastAddress,
        seq_zero: u16,
        event: Inbound,
    ) -> Result<Option<UpperPDU>, DeviceError> {
        match event {
            Inbound::Pending => Ok(None),
            Inbound::Complete { ack: request, message } => {
                if let Some(request) = request {
                    if let Err(_e) = ack::send_block_ack(ctx, &request) {
                        warn!("block acknowledgement not sent");
                    }
                    self.mirror.record(ctl, src, seq_zero, request);
                }
                match message {
                    Some(message) => Ok(Some(Self::upper_pdu(message)?)),
                    None => Ok(None),
                }
            }
        }
    }

    fn upper_pdu(message: Reassembled) -> Result<UpperPDU, DeviceError> {
        match message.meta {
            SegmentedMeta::Access { akf, aid, szmic } => Ok(UpperPDU::Access(UpperAccess {
                ivi: message.ivi,
                nid: message.nid,
                ttl: message.ttl,
                seq: message.seq,
                src: message.src,
                dst: message.dst,
                akf,
                aid,
                szmic,
                segmented: true,
                payload: message.payload,
            })),
            SegmentedMeta::Control { opcode } => Ok(UpperPDU::Control(UpperControl {
                ivi: message.ivi,
                nid: message.nid,
                ttl: message.ttl,
                seq: message.seq,
                src: message.src,
                dst: message.dst,
                opcode,
                parameters: Vec::new(),
                segmented: true,
                payload: Vec::from_slice(&message.payload)
                    .map_err(|_| DeviceError::InsufficientBuffer)?,
            })),
        }
    }
}
