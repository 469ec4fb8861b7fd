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

//! Mapping between virtual paths and mailbox names.
//!
//! A virtual path is absolute, UTF-8 and `/`-separated. A mailbox name in
//! "virtual form" is the same thing without the leading `/`. A mailbox name
//! in "wire form" is what the server sees: each segment in modified UTF-7,
//! joined with the server's hierarchy delimiter.

use crate::mime::utf7;
use crate::support::error::Error;

/// Split a virtual path into its segments.
///
/// Empty segments and `.` are dropped; `..` removes the previous segment and
/// cannot climb above the root.
pub fn parse_path(path: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => (),
            ".." => {
                parts.pop();
            },
            part => parts.push(part),
        }
    }
    parts
}

/// Normalise `path` into a clean absolute path, e.g. `a//b/./c` becomes
/// `/a/b/c`. The root is `/`.
pub fn clean_abs(path: &str) -> String {
    let mut clean = String::with_capacity(path.len() + 1);
    for part in parse_path(path) {
        clean.push('/');
        clean.push_str(part);
    }

    if clean.is_empty() {
        clean.push('/');
    }
    clean
}

/// Every proper and improper ancestor of `path` below the root, shortest
/// first. `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`; the root yields nothing.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut prefix = String::new();
    parse_path(path)
        .into_iter()
        .map(|part| {
            prefix.push('/');
            prefix.push_str(part);
            prefix.clone()
        })
        .collect()
}

/// The mailbox (in virtual form) which holds the message at `path`, i.e.,
/// the message's parent directory without the leading `/`.
///
/// A message directly under the root has no mailbox and is rejected.
pub fn mailbox_of(path: &str) -> Result<String, Error> {
    let parts = parse_path(path);
    match parts.split_last() {
        Some((_, parent)) if !parent.is_empty() => Ok(parent.join("/")),
        _ => Err(Error::InvalidPath(path.to_owned())),
    }
}

/// Converts between the two forms of mailbox names for one server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MailboxNames {
    /// The server's hierarchy delimiter; `None` for a flat namespace.
    pub delimiter: Option<char>,
}

impl MailboxNames {
    pub fn new(delimiter: Option<char>) -> Self {
        MailboxNames { delimiter }
    }

    /// Convert a mailbox name in virtual form to wire form.
    ///
    /// On a server with a flat namespace the segments are joined with `/`,
    /// which then is just part of the name.
    pub fn to_wire(&self, name: &str) -> String {
        let delimiter = self.delimiter.unwrap_or('/');
        let mut wire = String::with_capacity(name.len());
        for (ix, part) in parse_path(name).into_iter().enumerate() {
            if ix > 0 {
                wire.push(delimiter);
            }
            wire.push_str(&utf7::encode(part));
        }
        wire
    }

    /// Convert a mailbox name in wire form, as listed with `delimiter`, to
    /// virtual form.
    ///
    /// A `/` occurring inside one segment (possible when the delimiter is
    /// something else) becomes `_` so that it cannot introduce hierarchy.
    pub fn to_virtual(wire: &str, delimiter: Option<char>) -> String {
        let segments: Vec<&str> = match delimiter {
            Some(delimiter) => wire.split(delimiter).collect(),
            None => vec![wire],
        };

        segments
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(|s| utf7::decode(s).replace('/', "_"))
            .filter(|s| "." != s && ".." != s)
            .collect::<Vec<_>>()
            .join("/")
    }
}
