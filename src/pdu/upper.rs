//! Upper transport PDUs: what reassembly hands up and what segmentation
//! takes down. Payloads are still encrypted at this layer.

use crate::address::{Address, UnicastAddress};
use crate::app::ApplicationKeyIdentifier;
use crate::pdu::lower::{Opcode, SzMic};
use heapless::Vec;

/// 32 access segments of 12 octets.
pub const MAX_ACCESS_PAYLOAD: usize = 384;

/// 32 control segments of 8 octets.
pub const MAX_CONTROL_PAYLOAD: usize = 256;

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpperPDU {
    Access(UpperAccess),
    Control(UpperControl),
}

impl UpperPDU {
    pub fn src(&self) -> UnicastAddress {
        match self {
            UpperPDU::Access(inner) => inner.src,
            UpperPDU::Control(inner) => inner.src,
        }
    }

    pub fn dst(&self) -> Address {
        match self {
            UpperPDU::Access(inner) => inner.dst,
            UpperPDU::Control(inner) => inner.dst,
        }
    }

    pub fn ttl(&self) -> u8 {
        match self {
            UpperPDU::Access(inner) => inner.ttl,
            UpperPDU::Control(inner) => inner.ttl,
        }
    }

    pub fn seq(&self) -> u32 {
        match self {
            UpperPDU::Access(inner) => inner.seq,
            UpperPDU::Control(inner) => inner.seq,
        }
    }

    pub fn set_seq(&mut self, seq: u32) {
        match self {
            UpperPDU::Access(inner) => inner.seq = seq,
            UpperPDU::Control(inner) => inner.seq = seq,
        }
    }

    pub fn set_iv_index(&mut self, iv_index: u32) {
        let ivi = (iv_index & 1) as u8;
        match self {
            UpperPDU::Access(inner) => inner.ivi = ivi,
            UpperPDU::Control(inner) => inner.ivi = ivi,
        }
    }

    pub(crate) fn set_segmented(&mut self, segmented: bool) {
        match self {
            UpperPDU::Access(inner) => inner.segmented = segmented,
            UpperPDU::Control(inner) => inner.segmented = segmented,
        }
    }
}

/// An application payload plus the key coordinates the upper layer needs to
/// decrypt it.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UpperAccess {
    pub ivi: u8,
    pub nid: u8,
    pub ttl: u8,
    pub seq: u32,
    pub src: UnicastAddress,
    pub dst: Address,
    pub akf: bool,
    pub aid: ApplicationKeyIdentifier,
    pub szmic: SzMic,
    pub segmented: bool,
    pub payload: Vec<u8, MAX_ACCESS_PAYLOAD>,
}

/// A transport control payload. `parameters` is an optional prefix inserted
/// between the header and the payload of unsegmented messages; inbound
/// messages carry everything after the opcode in `payload`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UpperControl {
    pub ivi: u8,
    pub nid: u8,
    pub ttl: u8,
    pub seq: u32,
    pub src: UnicastAddress,
    pub dst: Address,
    pub opcode: Opcode,
    pub parameters: Vec<u8, 11>,
    pub segmented: bool,
    pub payload: Vec<u8, MAX_CONTROL_PAYLOAD>,
}
