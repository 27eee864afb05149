//! Cleartext network PDU framing.
//!
//! The network layer hands this crate fully decrypted, de-obfuscated frames
//! prefixed with the proxy PDU type octet:
//!
//! `Type(8) | IVI(1) NID(7) | CTL(1) TTL(7) | SEQ(24) | SRC(16) | DST(16) | TransportPDU`
//!
//! which places the lower transport PDU at a fixed offset of 10.

use crate::address::{Address, UnicastAddress};
use crate::pdu::lower::LowerPDU;
use crate::pdu::ParseError;
use crate::InsufficientBuffer;
use heapless::Vec;

/// Proxy PDU type tag for a network PDU.
pub const NETWORK_PDU: u8 = 0x00;

/// Offset of the lower transport PDU within a decrypted network frame.
pub const TRANSPORT_PDU_OFFSET: usize = 10;

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CleartextNetworkPDU {
    pub ivi: u8, /* 1 bit */
    pub nid: u8, /* 7 bits */
    pub ttl: u8, /* 7 bits */
    pub seq: u32, /* 24 bits */
    pub src: UnicastAddress,
    pub dst: Address,
    pub transport_pdu: LowerPDU,
}

impl CleartextNetworkPDU {
    /// CTL is not stored; it is implied by the transport PDU variant.
    pub fn ctl(&self) -> bool {
        matches!(self.transport_pdu, LowerPDU::Control(_))
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() <= TRANSPORT_PDU_OFFSET {
            return Err(ParseError::InvalidLength);
        }
        if data[0] != NETWORK_PDU {
            return Err(ParseError::InvalidPDUFormat);
        }
        let ivi = (data[1] & 0b10000000) >> 7;
        let nid = data[1] & 0b01111111;
        let ctl = data[2] & 0b10000000 != 0;
        let ttl = data[2] & 0b01111111;
        let seq = u32::from_be_bytes([0, data[3], data[4], data[5]]);
        let src = UnicastAddress::parse([data[6], data[7]])?;
        let dst = Address::parse([data[8], data[9]]);
        let transport_pdu = LowerPDU::parse(ctl, &data[TRANSPORT_PDU_OFFSET..])?;
        Ok(Self {
            ivi,
            nid,
            ttl,
            seq,
            src,
            dst,
            transport_pdu,
        })
    }

    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        xmit.push(NETWORK_PDU).map_err(|_| InsufficientBuffer)?;
        xmit.push(((self.ivi & 0b00000001) << 7) | (self.nid & 0b01111111))
            .map_err(|_| InsufficientBuffer)?;
        let ctl = if self.ctl() { 0b10000000 } else { 0 };
        xmit.push(ctl | (self.ttl & 0b01111111))
            .map_err(|_| InsufficientBuffer)?;
        let seq = self.seq.to_be_bytes();
        xmit.extend_from_slice(&seq[1..]).map_err(|_| InsufficientBuffer)?;
        xmit.extend_from_slice(&self.src.as_bytes())
            .map_err(|_| InsufficientBuffer)?;
        xmit.extend_from_slice(&self.dst.as_bytes())
            .map_err(|_| InsufficientBuffer)?;
        self.transport_pdu.emit(xmit)
    }
}
