// SPDX-License-Identifier: AGPL-3.0-or-later GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::BytesMut;
use hex_literal::hex;
use peerlink_rs::models::{
    opcode::{Op, Tag},
    packet::{HEADER_LEN, MAX_FRAME_LEN, PacketHeader, ProtocolError},
};

#[test]
fn test_header_wire_layout() {
    // len=3, nonce=0x11223344, op=request, tag=find_node, little-endian.
    let header = PacketHeader::new(3, 0x1122_3344, Op::Request, Tag::FindNode);
    let bytes = header.to_bytes();
    assert_eq!(bytes.len(), HEADER_LEN);
    assert_eq!(bytes, hex!("03000000 44332211 01 02"));
}

#[test]
fn test_ping_request_fixture() -> Result<()> {
    // The canonical first packet on a fresh connection: a 3-byte ping.
    let fixture = hex!("03000000 00000000 01 00");
    let parsed = PacketHeader::decode(&fixture)?;
    assert_eq!(parsed, PacketHeader::new(3, 0, Op::Request, Tag::Ping));
    Ok(())
}

#[test]
fn test_round_trip_all_ops_and_tags() -> Result<()> {
    let ops = [Op::Command, Op::Request, Op::Response];
    let tags = [
        Tag::Ping,
        Tag::Hello,
        Tag::FindNode,
        Tag::PushTransaction,
        Tag::PullTransaction,
        Tag::PullBlock,
    ];
    for op in ops {
        for tag in tags {
            let header = PacketHeader::new(MAX_FRAME_LEN, u32::MAX, op, tag);
            assert_eq!(PacketHeader::decode(&header.to_bytes())?, header);
        }
    }
    Ok(())
}

#[test]
fn test_encode_appends_exactly_ten_bytes() {
    let mut out = BytesMut::new();
    PacketHeader::new(0, 7, Op::Command, Tag::Hello).encode(&mut out);
    PacketHeader::new(0, 8, Op::Command, Tag::Hello).encode(&mut out);
    assert_eq!(out.len(), 2 * HEADER_LEN);
}

#[test]
fn test_oversize_frame_is_rejected() {
    // 1 MiB + 1 = 0x100001.
    let fixture = hex!("01001000 00000000 02 00");
    assert_eq!(
        PacketHeader::decode(&fixture),
        Err(ProtocolError::FrameTooLarge(MAX_FRAME_LEN + 1))
    );

    // Exactly 1 MiB still passes.
    let fixture = hex!("00001000 00000000 02 00");
    assert!(PacketHeader::decode(&fixture).is_ok());
}

#[test]
fn test_unknown_discriminators_are_rejected() {
    let bad_op = hex!("00000000 00000000 03 00");
    assert!(matches!(
        PacketHeader::decode(&bad_op),
        Err(ProtocolError::UnknownOp(_))
    ));

    let bad_tag = hex!("00000000 00000000 00 06");
    assert!(matches!(
        PacketHeader::decode(&bad_tag),
        Err(ProtocolError::UnknownTag(_))
    ));

    // The length guard wins over the enum checks.
    let oversize_and_bad = hex!("ffffffff 00000000 ff ff");
    assert!(matches!(
        PacketHeader::decode(&oversize_and_bad),
        Err(ProtocolError::FrameTooLarge(_))
    ));
}
