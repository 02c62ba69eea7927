// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire codec for the fixed 10-byte packet header.
//!
//! Every frame on the stream is `[header][body]` where the header
//! carries the body length, the request/response correlator and the two
//! discriminator bytes. All integers are little-endian. The codec is
//! stateless; framing against a live socket lives in the read loops.

use bytes::BytesMut;
use thiserror::Error;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32, transmute,
    transmute_ref,
};

use crate::models::opcode::{Op, Tag, UnknownOp, UnknownTag};

/// Size of the encoded header.
pub const HEADER_LEN: usize = 10;

/// Upper bound on the body of a single frame. Anything larger is a
/// protocol violation and kills the connection that produced it.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Violations of the wire contract. All of them are fatal for the
/// connection on which they are observed; the peer is retried under
/// circuit-breaker rules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame body of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u32),
    #[error(transparent)]
    UnknownOp(#[from] UnknownOp),
    #[error(transparent)]
    UnknownTag(#[from] UnknownTag),
    #[error("response nonce {0} does not match any outstanding request")]
    UnexpectedResponse(u32),
}

/// Exact wire layout of the header.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawHeader {
    pub len: U32<LittleEndian>,
    pub nonce: U32<LittleEndian>,
    pub op: u8,
    pub tag: u8,
}

/// Decoded, validated header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Body length in bytes, excluding the header itself.
    pub len: u32,
    /// Request/response correlator; zero for packets outside an exchange.
    pub nonce: u32,
    pub op: Op,
    pub tag: Tag,
}

impl PacketHeader {
    pub fn new(len: u32, nonce: u32, op: Op, tag: Tag) -> Self {
        Self {
            len,
            nonce,
            op,
            tag,
        }
    }

    /// Append the encoded header to `out`. Always writes exactly
    /// [`HEADER_LEN`] bytes.
    pub fn encode(&self, out: &mut BytesMut) {
        out.extend_from_slice(&self.to_bytes());
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let raw = RawHeader {
            len: U32::new(self.len),
            nonce: U32::new(self.nonce),
            op: u8::from(&self.op),
            tag: u8::from(&self.tag),
        };
        transmute!(raw)
    }

    /// Decode a header from exactly [`HEADER_LEN`] buffered bytes.
    ///
    /// The length guard runs before the enum checks, so an oversize
    /// frame surfaces as [`ProtocolError::FrameTooLarge`] no matter what
    /// the trailing bytes contain.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let raw: &RawHeader = transmute_ref!(buf);

        let len = raw.len.get();
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        Ok(Self {
            len,
            nonce: raw.nonce.get(),
            op: Op::try_from(raw.op)?,
            tag: Tag::try_from(raw.tag)?,
        })
    }
}
