//! # Wire Format Pins
//!
//! Byte-exact encodings peers depend on. A change here breaks
//! compatibility with every deployed peer.

use conduit_networking::batching::push_length;
use conduit_networking::protocol::{write_varint_u16, write_varint_u32, write_varint_u64};
use conduit_networking::queue::HistoryFrame;
use conduit_networking::target::{write_proxy, ProxyHeader};
use conduit_networking::{
    CustomMessages, Direction, MessageKind, NetworkDelivery, RecordHeader, RpcBody,
    ScratchBuffer, UpdateStage, WireHeader,
};

fn encode(write: impl FnOnce(&mut ScratchBuffer)) -> Vec<u8> {
    let mut buffer = ScratchBuffer::new(64);
    write(&mut buffer);
    buffer.as_slice().to_vec()
}

#[test]
fn test_varint_u16_table() {
    let table: [(u16, &[u8]); 5] = [
        (0, &[0x01]),
        (1, &[0x05]),
        (63, &[0xFD]),
        (64, &[0x02, 0x01]),
        (16_384, &[0x03, 0x00, 0x40]),
    ];
    for (value, expected) in table {
        let bytes = encode(|b| write_varint_u16(b, value).unwrap());
        assert_eq!(bytes, expected, "u16 {value}");
    }
}

#[test]
fn test_varint_u32_table() {
    let table: [(u32, &[u8]); 5] = [
        (0, &[0x01]),
        (31, &[0xF9]),
        (32, &[0x02, 0x01]),
        (300, &[0x62, 0x09]),
        (u32::MAX, &[0x05, 0xFF, 0xFF, 0xFF, 0xFF]),
    ];
    for (value, expected) in table {
        let bytes = encode(|b| write_varint_u32(b, value).unwrap());
        assert_eq!(bytes, expected, "u32 {value}");
    }
}

#[test]
fn test_varint_u64_table() {
    let table: [(u64, &[u8]); 5] = [
        (0, &[0x01]),
        (15, &[0xF1]),
        (16, &[0x02, 0x01]),
        (1 << 60, &[0x09, 0, 0, 0, 0, 0, 0, 0, 0x10]),
        (u64::MAX, &[0x09, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
    ];
    for (value, expected) in table {
        let bytes = encode(|b| write_varint_u64(b, value).unwrap());
        assert_eq!(bytes, expected, "u64 {value}");
    }
}

#[test]
fn test_wire_header_layout() {
    let plain = encode(|b| {
        WireHeader::new(MessageKind::Rpc, UpdateStage::Update)
            .write(b)
            .unwrap();
    });
    assert_eq!(plain, [0x04, 0x00, 0x04]);

    let forwarded = encode(|b| {
        WireHeader {
            kind: MessageKind::Rpc,
            stage: UpdateStage::FixedUpdate,
            origin: Some(1),
        }
        .write(b)
        .unwrap();
    });
    assert_eq!(forwarded, [0x04, 0x80, 0x02, 1, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn test_rpc_body_layout() {
    let hash = conduit_networking::dispatch::rpc_hash("Ping");
    let bytes = encode(|b| {
        RpcBody {
            object_id: 7,
            behaviour_index: 0,
            rpc_hash: hash,
        }
        .write(b)
        .unwrap();
    });
    let mut expected = vec![0x71, 0x01];
    expected.extend_from_slice(&hash.to_le_bytes());
    assert_eq!(bytes, expected);
}

#[test]
fn test_proxy_envelope_layout() {
    let header = ProxyHeader {
        kind: MessageKind::Rpc,
        stage: UpdateStage::Update,
        delivery: NetworkDelivery::Reliable,
    };
    let bytes = encode(|b| write_proxy(b, &[0, 2], header, &[0xAA]).unwrap());
    assert_eq!(bytes, [0x09, 0x01, 0x21, 0x04, 0x00, 0x04, 0x01, 0xAA]);
}

#[test]
fn test_named_message_layout() {
    let bytes = encode(|b| CustomMessages::write_named(b, "chat", b"gg").unwrap());
    assert_eq!(&bytes[..8], &CustomMessages::name_hash("chat").to_le_bytes());
    assert_eq!(&bytes[8..], b"gg");
}

#[test]
fn test_batch_length_prefix() {
    let mut out = Vec::new();
    push_length(&mut out, 255);
    assert_eq!(out, [0xFF]);

    out.clear();
    push_length(&mut out, 256);
    assert_eq!(out, [0x00, 0x00, 0x01]);

    out.clear();
    push_length(&mut out, 300);
    assert_eq!(out, [0x00, 44, 0x01]);
}

#[test]
fn test_outbound_record_layout() {
    let mut frame = HistoryFrame::new(Direction::Outbound, UpdateStage::PostLateUpdate, 256, 64);
    let header = RecordHeader {
        kind: MessageKind::Rpc,
        stage: UpdateStage::PostLateUpdate,
        sender: 1,
        delivery: NetworkDelivery::Reliable,
        timestamp: 1.5,
        targets: &[2, 3],
    };
    let mut write = frame.begin_write(&header, false).unwrap();
    write.buffer().write_byte(0xAB).unwrap();
    write.commit().unwrap();

    let mut expected = Vec::new();
    expected.extend_from_slice(&4u16.to_le_bytes());
    expected.extend_from_slice(&1.5f32.to_le_bytes());
    expected.extend_from_slice(&1u64.to_le_bytes());
    expected.push(1);
    expected.extend_from_slice(&2u32.to_le_bytes());
    expected.extend_from_slice(&2u64.to_le_bytes());
    expected.extend_from_slice(&3u64.to_le_bytes());
    expected.extend_from_slice(&1u64.to_le_bytes());
    expected.push(0xAB);
    assert_eq!(frame.as_bytes(), expected.as_slice());
}
