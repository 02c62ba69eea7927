// SPDX-License-Identifier: AGPL-3.0-or-later GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

use peerlink_rs::models::addr::{AddrParseError, PeerAddr};

fn parse(s: &str) -> Result<PeerAddr, AddrParseError> {
    s.parse::<PeerAddr>()
}

#[test]
fn test_bare_port_binds_any_v4() {
    assert_eq!(
        parse("9000"),
        Ok(PeerAddr::V4(Ipv4Addr::UNSPECIFIED, 9000))
    );
}

#[test]
fn test_v4_host_port() {
    assert_eq!(
        parse("10.0.0.5:9000"),
        Ok(PeerAddr::V4(Ipv4Addr::new(10, 0, 0, 5), 9000))
    );
}

#[test]
fn test_bracketed_v6() {
    assert_eq!(
        parse("[::1]:9000"),
        Ok(PeerAddr::V6(Ipv6Addr::LOCALHOST, 0, 9000))
    );
    assert_eq!(
        parse("[fe80::1%3]:9000"),
        Ok(PeerAddr::V6("fe80::1".parse().expect("v6 literal"), 3, 9000))
    );
}

#[test]
fn test_unbracketed_v6_with_unambiguous_port() {
    assert_eq!(
        parse("fe80::1:9000"),
        Ok(PeerAddr::V6("fe80::1".parse().expect("v6 literal"), 0, 9000))
    );
}

#[test]
fn test_bracket_errors() {
    assert_eq!(parse("[::1"), Err(AddrParseError::MissingEndBracket));
    assert_eq!(parse("[::1]"), Err(AddrParseError::MissingPort));
    assert_eq!(parse("[::1]9000"), Err(AddrParseError::MissingPort));
    assert_eq!(parse("[::1]:"), Err(AddrParseError::MissingPort));
    assert_eq!(parse("host[::1]:90"), Err(AddrParseError::UnexpectedLeftBracket));
    assert_eq!(parse("::1]:90"), Err(AddrParseError::UnexpectedRightBracket));
}

#[test]
fn test_colon_ambiguity() {
    assert_eq!(parse("a:b:c"), Err(AddrParseError::TooManyColons));
    assert_eq!(parse("1:2:3:4"), Err(AddrParseError::TooManyColons));
}

#[test]
fn test_protocol_and_port_errors() {
    assert_eq!(parse("example.com:80"), Err(AddrParseError::UnknownAddressProtocol));
    assert_eq!(parse("justahost"), Err(AddrParseError::UnknownAddressProtocol));
    assert_eq!(parse(""), Err(AddrParseError::UnknownAddressProtocol));
    assert_eq!(parse("10.0.0.5"), Err(AddrParseError::MissingPort));
    assert_eq!(parse("10.0.0.5:99999"), Err(AddrParseError::InvalidPort));
}

#[test]
fn test_display_round_trips() {
    for input in ["10.0.0.5:9000", "[::1]:9000", "[fe80::1%3]:9000"] {
        let addr = parse(input).expect(input);
        assert_eq!(parse(&addr.to_string()), Ok(addr));
    }
}

#[test]
fn test_socket_addr_conversion() {
    let addr = parse("[fe80::1%3]:9000").expect("parse");
    assert_eq!(addr.port(), 9000);
    let sock: SocketAddr = addr.into();
    assert_eq!(sock.port(), 9000);
    match sock {
        SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 3),
        SocketAddr::V4(_) => panic!("expected a v6 socket address"),
    }
}

#[test]
fn test_hash_is_consistent_for_equal_addresses() {
    fn hash_of(addr: &PeerAddr) -> u64 {
        let mut hasher = DefaultHasher::new();
        addr.hash(&mut hasher);
        hasher.finish()
    }

    let a = parse("10.0.0.5:9000").expect("parse");
    let b = parse("10.0.0.5:9000").expect("parse");
    assert_eq!(a, b);
    assert_eq!(hash_of(&a), hash_of(&b));
}
