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

use encoding_rs::Encoding;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"^=\?([^?\s]+)\?([bBqQ])\?([^?\s]*)\?=$").unwrap();
    static ref TOKEN: Regex = Regex::new(r"\s+|\S+").unwrap();
}

/// Decode an unstructured header value (such as a subject taken from an
/// `ENVELOPE`) into text.
///
/// RFC 2047 encoded words are decoded, and the whitespace between two
/// adjacent encoded words is dropped as that RFC requires. Everything else,
/// including encoded words we cannot decode, is kept verbatim. Invalid UTF-8
/// outside of encoded words is replaced.
pub fn decode_header(raw: &[u8]) -> String {
    let raw = String::from_utf8_lossy(raw);
    let mut decoded = String::with_capacity(raw.len());
    let mut pending_space = "";
    let mut after_encoded_word = false;

    for token in TOKEN.find_iter(&raw) {
        let token = token.as_str();
        if token.starts_with(char::is_whitespace) {
            pending_space = token;
            continue;
        }

        match decode_word(token) {
            Some(text) => {
                if !after_encoded_word {
                    decoded.push_str(pending_space);
                }
                decoded.push_str(&text);
                after_encoded_word = true;
            },
            None => {
                decoded.push_str(pending_space);
                decoded.push_str(token);
                after_encoded_word = false;
            },
        }
        pending_space = "";
    }
    decoded.push_str(pending_space);

    decoded
}

/// Decode `word` if it is, in its entirety, an encoded word.
///
/// Returns `None` if it is not one, or if its charset or content cannot be
/// decoded.
pub fn decode_word(word: &str) -> Option<String> {
    let captures = ENCODED_WORD.captures(word)?;
    let charset = captures.get(1)?.as_str();
    let transfer_encoding = captures.get(2)?.as_str();
    let content = captures.get(3)?.as_str().as_bytes();

    // RFC 2231 allows a language suffix: =?utf-8*en?Q?...?=
    let charset = charset.split('*').next().unwrap_or(charset);

    let bytes = match transfer_encoding {
        "q" | "Q" => q_decode(content),
        _ => base64::decode(content).ok()?,
    };

    let encoding = Encoding::for_label_no_replacement(charset.as_bytes())?;
    Some(encoding.decode_with_bom_removal(&bytes).0.into_owned())
}

/// The "Q" encoding: quoted-printable, with `_` standing for a space.
/// Malformed escapes pass through unchanged.
fn q_decode(content: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::with_capacity(content.len());
    let mut ix = 0;
    while ix < content.len() {
        match content[ix] {
            b'_' => decoded.push(b' '),
            b'=' => {
                let hi = content.get(ix + 1).copied().and_then(hex_value);
                let lo = content.get(ix + 2).copied().and_then(hex_value);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        decoded.push(hi << 4 | lo);
                        ix += 2;
                    },
                    _ => decoded.push(b'='),
                }
            },
            b => decoded.push(b),
        }
        ix += 1;
    }

    decoded
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
