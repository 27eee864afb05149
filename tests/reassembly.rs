//! End-to-end segmentation and reassembly: messages are segmented on one
//! node, carried as raw network frames, and reassembled on another.

use core::cell::{Cell, RefCell};
use embassy_time::Instant;
use heapless::Vec;
use mesh_lower_transport::address::{Address, UnicastAddress};
use mesh_lower_transport::lower::{DeviceError, LowerContext, LowerTransport};
use mesh_lower_transport::pdu::lower::{Opcode, SzMic};
use mesh_lower_transport::pdu::network::CleartextNetworkPDU;
use mesh_lower_transport::pdu::upper::{UpperAccess, UpperControl, UpperPDU};

struct Node {
    now: Cell<Instant>,
    seq: Cell<u32>,
    sent: RefCell<Vec<std::vec::Vec<u8>, 8>>,
}

impl Node {
    fn new(seq: u32) -> Self {
        Self {
            now: Cell::new(Instant::from_millis(0)),
            seq: Cell::new(seq),
            sent: RefCell::new(Vec::new()),
        }
    }
}

impl LowerContext for Node {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn iv_index(&self) -> Option<u32> {
        Some(0x0000_0042)
    }

    fn next_sequence(&self) -> Result<u32, DeviceError> {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        Ok(seq)
    }

    fn send_segment_acknowledgement(&self, pdu: &CleartextNetworkPDU) -> Result<(), DeviceError> {
        let mut frame: heapless::Vec<u8, 64> = heapless::Vec::new();
        pdu.emit(&mut frame).map_err(DeviceError::from)?;
        self.sent
            .borrow_mut()
            .push(frame.as_slice().to_vec())
            .map_err(|_| DeviceError::InsufficientBuffer)?;
        Ok(())
    }
}

fn addr(val: u16) -> UnicastAddress {
    UnicastAddress::parse(val.to_be_bytes()).unwrap()
}

#[test]
fn access_message_survives_the_round_trip() {
    // Follow-up segments continue numbering after the message's own sequence.
    let sender = Node::new(0x012346);
    let receiver = Node::new(0x0010);
    let mut sender_lower = LowerTransport::new();
    let mut receiver_lower = LowerTransport::new();

    let payload: std::vec::Vec<u8> = (0..100u8).collect();
    let mut msg = UpperPDU::Access(UpperAccess {
        ivi: 0,
        nid: 0x68,
        ttl: 6,
        seq: 0x012345,
        src: addr(0x00AA),
        dst: Address::Unicast(addr(0x00BB)),
        akf: true,
        aid: 0x15.into(),
        szmic: SzMic::Bit32,
        segmented: false,
        payload: heapless::Vec::from_slice(&payload).unwrap(),
    });

    let segments = sender_lower.process_outbound(&sender, &mut msg).unwrap();
    assert_eq!(segments.len(), 9);
    assert!(matches!(&msg, UpperPDU::Access(inner) if inner.segmented));

    // Carry each segment as raw bytes, in order.
    let mut delivered = None;
    for segment in &segments {
        let mut frame: heapless::Vec<u8, 64> = heapless::Vec::new();
        segment.emit(&mut frame).unwrap();
        if let Some(upper) = receiver_lower.receive(&receiver, &frame) {
            assert!(delivered.is_none(), "only the last segment completes");
            delivered = Some(upper);
        }
    }

    let delivered = match delivered {
        Some(UpperPDU::Access(inner)) => inner,
        _ => panic!("expected a reassembled access message"),
    };
    assert_eq!(delivered.payload.as_slice(), payload.as_slice());
    assert!(delivered.akf);
    assert_eq!(u8::from(delivered.aid), 0x15);
    assert_eq!(delivered.seq, 0x012345);
    assert_eq!(u16::from(delivered.src), 0x00AA);
    assert!(delivered.segmented);

    // Exactly one acknowledgement, and it clears the sender's in-flight
    // segments once routed back.
    let acks = receiver.sent.borrow();
    assert_eq!(acks.len(), 1);
    assert!(sender_lower
        .process_inbound(
            &sender,
            &CleartextNetworkPDU::parse(&acks[0]).unwrap()
        )
        .unwrap()
        .is_some());
    assert!(sender_lower
        .process_retransmits(&sender)
        .unwrap()
        .is_empty());
}

#[test]
fn control_message_survives_the_round_trip() {
    let sender = Node::new(0x054322);
    let receiver = Node::new(0x0010);
    let mut sender_lower = LowerTransport::new();
    let mut receiver_lower = LowerTransport::new();

    let payload: std::vec::Vec<u8> = (0..40u8).rev().collect();
    let mut msg = UpperPDU::Control(UpperControl {
        ivi: 0,
        nid: 0x11,
        ttl: 2,
        seq: 0x054321,
        src: addr(0x0101),
        dst: Address::Unicast(addr(0x0202)),
        opcode: Opcode::FriendUpdate,
        parameters: heapless::Vec::new(),
        segmented: false,
        payload: heapless::Vec::from_slice(&payload).unwrap(),
    });

    let segments = sender_lower.process_outbound(&sender, &mut msg).unwrap();
    assert_eq!(segments.len(), 5);

    let mut delivered = None;
    for segment in &segments {
        let mut frame: heapless::Vec<u8, 64> = heapless::Vec::new();
        segment.emit(&mut frame).unwrap();
        if let Some(upper) = receiver_lower.receive(&receiver, &frame) {
            delivered = Some(upper);
        }
    }

    let delivered = match delivered {
        Some(UpperPDU::Control(inner)) => inner,
        _ => panic!("expected a reassembled control message"),
    };
    assert_eq!(delivered.opcode, Opcode::FriendUpdate);
    assert_eq!(delivered.payload.as_slice(), payload.as_slice());
    assert_eq!(delivered.seq, 0x054321);
    assert_eq!(receiver.sent.borrow().len(), 1);
}

#[test]
fn unsegmented_access_passes_straight_through() {
    let sender = Node::new(0x1000);
    let receiver = Node::new(0x0010);
    let mut sender_lower = LowerTransport::new();
    let mut receiver_lower = LowerTransport::new();

    let mut msg = UpperPDU::Access(UpperAccess {
        ivi: 1,
        nid: 0x23,
        ttl: 1,
        seq: 0x000007,
        src: addr(0x0C0C),
        dst: Address::Unicast(addr(0x0D0D)),
        akf: false,
        aid: 0.into(),
        szmic: SzMic::Bit32,
        segmented: true,
        payload: heapless::Vec::from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00]).unwrap(),
    });

    let segments = sender_lower.process_outbound(&sender, &mut msg).unwrap();
    assert_eq!(segments.len(), 1);
    assert!(matches!(&msg, UpperPDU::Access(inner) if !inner.segmented));

    let mut frame: heapless::Vec<u8, 64> = heapless::Vec::new();
    segments.iter().next().unwrap().emit(&mut frame).unwrap();
    let delivered = match receiver_lower.receive(&receiver, &frame) {
        Some(UpperPDU::Access(inner)) => inner,
        _ => panic!("expected an access message"),
    };
    assert_eq!(delivered.payload.as_slice(), &[0xDE, 0xAD, 0xBE, 0xEF, 0x00]);
    assert!(!delivered.segmented);
    assert_eq!(delivered.szmic, SzMic::Bit32);
    // No acknowledgement for unsegmented traffic.
    assert!(receiver.sent.borrow().is_empty());
}
