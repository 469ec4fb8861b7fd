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

/// The maximum length, in characters, of a name produced by `safe_name`.
pub const MAX_SAFE_NAME: usize = 64;

/// Turn arbitrary text (typically a message subject) into something usable
/// as one element of a virtual path.
///
/// Path separators, ASCII control characters, characters that are special
/// in IMAP or on common file systems, and runs of whitespace all become a
/// single `_`. Leading `.` and `#` are removed so the result can neither
/// traverse directories, become a hidden file on UNIX, nor look like an IMAP
/// namespace. The result is truncated to `MAX_SAFE_NAME` characters.
///
/// Returns `None` if nothing usable remains.
pub fn safe_name(text: &str) -> Option<String> {
    let mut name = String::with_capacity(text.len().min(MAX_SAFE_NAME * 4));
    let mut pending_underscore = false;
    let mut len = 0;

    for ch in text.chars() {
        if is_unsafe(ch) || ch.is_whitespace() {
            pending_underscore = true;
            continue;
        }

        // Nothing may start with these
        if 0 == len && (ch == '.' || ch == '#') {
            continue;
        }

        if pending_underscore && len > 0 {
            if len + 1 >= MAX_SAFE_NAME {
                break;
            }
            name.push('_');
            len += 1;
        }
        pending_underscore = false;

        if len >= MAX_SAFE_NAME {
            break;
        }
        name.push(ch);
        len += 1;
    }

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn is_unsafe(ch: char) -> bool {
    ch < ' '
        || ch == '\x7F'
        || ch.is_control()
        || ch == '/'
        || ch == '\\'
        // * and % are wildcards in LIST
        || ch == '*'
        || ch == '%'
        || ch == ':'
        || ch == '?'
        || ch == '"'
        || ch == '<'
        || ch == '>'
        || ch == '|'
}
