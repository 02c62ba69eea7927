// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write;

use rand::RngExt;

/// Generates a random peer id (16 bytes) and returns:
/// - `[u8; 16]` for direct use in a hello body
/// - `String` containing its hexadecimal representation (no prefix)
pub fn generate_peer_id() -> ([u8; 16], String) {
    let mut id = [0u8; 16];
    rand::rng().fill(&mut id);

    let mut hex = String::with_capacity(32);
    for byte in &id {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }

    (id, hex)
}
