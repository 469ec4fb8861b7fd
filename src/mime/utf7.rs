//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of imap-bridge.
//
// imap-bridge is free software: you can  redistribute it and/or modify it
// under the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// imap-bridge is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// imap-bridge. If not, see <http://www.gnu.org/licenses/>.

//! IMAP's "modified UTF-7" mailbox name encoding, as set by RFC 3501 section
//! 5.1.3.
//!
//! Printable ASCII stands for itself, except `&`, which is written `&-`.
//! Everything else is UTF-16BE, base64-encoded with `,` in place of `/`,
//! between `&` and `-`.

use std::borrow::Cow;

/// Decode a mailbox name received from the server into UTF-8.
///
/// Decoding is permissive: a missing `-` terminator is tolerated, and a
/// shifted sequence that is not valid base64 is passed through as-is.
pub fn decode(wire: &str) -> Cow<str> {
    if !wire.contains('&') {
        return Cow::Borrowed(wire);
    }

    let mut decoded = String::with_capacity(wire.len());
    let mut rest = wire;
    while let Some(shift) = rest.find('&') {
        decoded.push_str(&rest[..shift]);

        let shifted = &rest[shift + 1..];
        let end = shifted
            .find(|c: char| !is_base64_char(c))
            .unwrap_or(shifted.len());
        let encoded = &shifted[..end];
        let terminated = shifted[end..].starts_with('-');
        rest = if terminated {
            &shifted[end + 1..]
        } else {
            &shifted[end..]
        };

        if encoded.is_empty() {
            decoded.push('&');
        } else if let Some(text) = decode_utf16_run(encoded) {
            decoded.push_str(&text);
        } else {
            decoded.push('&');
            decoded.push_str(encoded);
            if terminated {
                decoded.push('-');
            }
        }
    }
    decoded.push_str(rest);

    Cow::Owned(decoded)
}

/// Encode a UTF-8 mailbox name for the wire.
///
/// The output is minimal: no direct character is ever shifted, and each run
/// of non-direct characters becomes exactly one shifted sequence.
pub fn encode(name: &str) -> Cow<str> {
    if name.bytes().all(|b| is_direct(b) && b'&' != b) {
        return Cow::Borrowed(name);
    }

    let mut encoded = String::with_capacity(name.len() * 2);
    let mut run = Vec::<u16>::new();
    for ch in name.chars() {
        if ch.is_ascii() && is_direct(ch as u8) {
            flush_run(&mut encoded, &mut run);
            if '&' == ch {
                encoded.push_str("&-");
            } else {
                encoded.push(ch);
            }
        } else {
            let mut units = [0u16; 2];
            run.extend_from_slice(ch.encode_utf16(&mut units));
        }
    }
    flush_run(&mut encoded, &mut run);

    Cow::Owned(encoded)
}

fn flush_run(dst: &mut String, run: &mut Vec<u16>) {
    if run.is_empty() {
        return;
    }

    let bytes = run
        .iter()
        .flat_map(|unit| unit.to_be_bytes().to_vec())
        .collect::<Vec<u8>>();
    dst.push('&');
    dst.push_str(&base64::encode_config(&bytes, base64::IMAP_MUTF7));
    dst.push('-');
    run.clear();
}

fn decode_utf16_run(encoded: &str) -> Option<String> {
    let bytes = base64::decode_config(
        encoded,
        base64::IMAP_MUTF7.decode_allow_trailing_bits(true),
    )
    .ok()?;

    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect::<Vec<u16>>();
    Some(String::from_utf16_lossy(&units))
}

fn is_direct(byte: u8) -> bool {
    byte >= b' ' && byte < 0x7F
}

fn is_base64_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || '+' == ch || ',' == ch
}
