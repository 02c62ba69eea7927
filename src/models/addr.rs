// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Peer addresses and the textual grammar accepted by configuration
//! files and CLI flags.
//!
//! Accepted shapes:
//!
//! * `9000` — bare port, binds/dials any-v4
//! * `10.0.0.5:9000` — IPv4
//! * `fe80::1:9000` — unbracketed IPv6 when the port suffix is
//!   unambiguous
//! * `[fe80::1%3]:9000` — bracketed IPv6 with an optional numeric scope
//!   id
//!
//! Hostnames are rejected; resolution happens in the host environment,
//! not here.

use std::{
    fmt,
    hash::{Hash, Hasher},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    str::FromStr,
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrParseError {
    #[error("missing ']' after a bracketed IPv6 address")]
    MissingEndBracket,
    #[error("missing ':port' suffix")]
    MissingPort,
    #[error("unexpected '[' inside an address")]
    UnexpectedLeftBracket,
    #[error("unexpected ']' without an opening bracket")]
    UnexpectedRightBracket,
    #[error("too many ':' separators for an unbracketed address")]
    TooManyColons,
    #[error("port is not a decimal number in 0..=65535")]
    InvalidPort,
    #[error("address is neither IPv4, IPv6 nor a bare port")]
    UnknownAddressProtocol,
}

/// A remote or local endpoint. The v6 variant carries `(ip, scope_id,
/// port)`; a scope id of zero means unscoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u32, u16),
}

impl PeerAddr {
    pub fn port(&self) -> u16 {
        match self {
            Self::V4(_, port) => *port,
            Self::V6(_, _, port) => *port,
        }
    }
}

// The hash feeds address octets, then the v6 scope id, then the port,
// all as little-endian bytes, so the value is stable across hosts.
impl Hash for PeerAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::V4(ip, port) => {
                state.write(&ip.octets());
                state.write(&port.to_le_bytes());
            },
            Self::V6(ip, scope_id, port) => {
                state.write(&ip.octets());
                state.write(&scope_id.to_le_bytes());
                state.write(&port.to_le_bytes());
            },
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(ip, port) => write!(f, "{ip}:{port}"),
            Self::V6(ip, 0, port) => write!(f, "[{ip}]:{port}"),
            Self::V6(ip, scope_id, port) => write!(f, "[{ip}%{scope_id}]:{port}"),
        }
    }
}

impl From<PeerAddr> for SocketAddr {
    fn from(addr: PeerAddr) -> SocketAddr {
        match addr {
            PeerAddr::V4(ip, port) => SocketAddr::V4(SocketAddrV4::new(ip, port)),
            PeerAddr::V6(ip, scope_id, port) => {
                SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope_id))
            },
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> PeerAddr {
        match addr {
            SocketAddr::V4(v4) => PeerAddr::V4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => PeerAddr::V6(*v6.ip(), v6.scope_id(), v6.port()),
        }
    }
}

impl FromStr for PeerAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddrParseError::UnknownAddressProtocol);
        }

        if let Some(inner) = s.strip_prefix('[') {
            return parse_bracketed(inner);
        }
        if s.contains('[') {
            return Err(AddrParseError::UnexpectedLeftBracket);
        }
        if s.contains(']') {
            return Err(AddrParseError::UnexpectedRightBracket);
        }

        match s.bytes().filter(|b| *b == b':').count() {
            // Bare port, or a host that forgot its port.
            0 => {
                if s.bytes().all(|b| b.is_ascii_digit()) {
                    let port = parse_port(s)?;
                    Ok(Self::V4(Ipv4Addr::UNSPECIFIED, port))
                } else if s.contains('.') {
                    Err(AddrParseError::MissingPort)
                } else {
                    Err(AddrParseError::UnknownAddressProtocol)
                }
            },
            1 => {
                let (host, port) = s.rsplit_once(':').expect("one ':' counted");
                let port = parse_port(port)?;
                if !host.contains('.') {
                    return Err(AddrParseError::UnknownAddressProtocol);
                }
                let ip = Ipv4Addr::from_str(host)
                    .map_err(|_| AddrParseError::UnknownAddressProtocol)?;
                Ok(Self::V4(ip, port))
            },
            // Unbracketed IPv6: the final segment must read as a port
            // and the remainder as an address, otherwise the colons are
            // ambiguous.
            _ => {
                let (host, port) = s.rsplit_once(':').expect("colons counted");
                if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(AddrParseError::TooManyColons);
                }
                let port = parse_port(port)?;
                let (ip, scope_id) =
                    parse_v6(host).map_err(|_| AddrParseError::TooManyColons)?;
                Ok(Self::V6(ip, scope_id, port))
            },
        }
    }
}

fn parse_bracketed(after_lbracket: &str) -> Result<PeerAddr, AddrParseError> {
    let (inner, rest) = after_lbracket
        .split_once(']')
        .ok_or(AddrParseError::MissingEndBracket)?;
    if inner.contains('[') {
        return Err(AddrParseError::UnexpectedLeftBracket);
    }
    if rest.contains(']') {
        return Err(AddrParseError::UnexpectedRightBracket);
    }

    let port = rest.strip_prefix(':').ok_or(AddrParseError::MissingPort)?;
    if port.is_empty() {
        return Err(AddrParseError::MissingPort);
    }
    let port = parse_port(port)?;

    let (ip, scope_id) = parse_v6(inner)?;
    Ok(PeerAddr::V6(ip, scope_id, port))
}

fn parse_v6(host: &str) -> Result<(Ipv6Addr, u32), AddrParseError> {
    let (ip_text, scope_id) = match host.split_once('%') {
        Some((ip_text, scope)) => {
            let scope_id = scope
                .parse::<u32>()
                .map_err(|_| AddrParseError::UnknownAddressProtocol)?;
            (ip_text, scope_id)
        },
        None => (host, 0),
    };
    let ip = Ipv6Addr::from_str(ip_text)
        .map_err(|_| AddrParseError::UnknownAddressProtocol)?;
    Ok((ip, scope_id))
}

fn parse_port(text: &str) -> Result<u16, AddrParseError> {
    text.parse::<u16>().map_err(|_| AddrParseError::InvalidPort)
}
