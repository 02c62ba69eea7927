// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed views of the two discriminator bytes carried by every packet
//! header.
//!
//! ```text
//! [len: u32 LE][nonce: u32 LE][op: u8][tag: u8][body...]
//!                              ^^^^^^  ^^^^^^
//! ```
//!
//! * **op** — how the packet participates in the request/response
//!   exchange (one-way command, request awaiting a reply, or the reply
//!   itself).
//! * **tag** — which operation the body encodes. Unknown values on
//!   either byte are a decode error; peers speaking a newer revision of
//!   the protocol must negotiate it out of band.

use std::convert::TryFrom;

use thiserror::Error;

/// Exchange role of a packet.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// One-way message; the sender does not expect a reply.
    #[default]
    Command = 0x00,
    /// Carries a nonce the peer must echo in a `Response`.
    Request = 0x01,
    /// Reply correlated to an outstanding `Request` by nonce.
    Response = 0x02,
}

impl Op {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Command,
            0x01 => Self::Request,
            0x02 => Self::Response,
            _ => return None,
        })
    }
}

/// Operation selector for the packet body.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    #[default]
    Ping = 0x00,
    Hello = 0x01,
    FindNode = 0x02,
    PushTransaction = 0x03,
    PullTransaction = 0x04,
    PullBlock = 0x05,
}

impl Tag {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Ping,
            0x01 => Self::Hello,
            0x02 => Self::FindNode,
            0x03 => Self::PushTransaction,
            0x04 => Self::PullTransaction,
            0x05 => Self::PullBlock,
            _ => return None,
        })
    }
}

/// Returned when the op byte holds an undefined value.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid packet op: 0x{0:02x}")]
pub struct UnknownOp(pub u8);

/// Returned when the tag byte holds an undefined value.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid packet tag: 0x{0:02x}")]
pub struct UnknownTag(pub u8);

impl TryFrom<u8> for Op {
    type Error = UnknownOp;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Op::from_u8(byte).ok_or(UnknownOp(byte))
    }
}

impl TryFrom<u8> for Tag {
    type Error = UnknownTag;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Tag::from_u8(byte).ok_or(UnknownTag(byte))
    }
}

impl From<&Op> for u8 {
    fn from(op: &Op) -> u8 {
        *op as u8
    }
}

impl From<&Tag> for u8 {
    fn from(tag: &Tag) -> u8 {
        *tag as u8
    }
}
