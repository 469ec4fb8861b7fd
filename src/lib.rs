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

//! Moves mail between an IMAP server and the tree-of-records model used by
//! the backup pipeline.
//!
//! The import direction walks every mailbox on a server and produces one
//! directory record per (virtual) mailbox directory and one lazily-readable
//! file record per message. The export direction consumes such records and
//! recreates the mailboxes and messages on a server.
//!
//! Both directions sit on top of [`imap::pool::SessionPool`], which keeps a
//! fixed number of authenticated connections around and tracks which mailbox
//! each one currently has selected.

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

pub mod imap;
pub mod mime;
pub mod pipeline;
pub mod support;

#[cfg(test)]
mod test_support;

pub use crate::pipeline::{new_exporter, new_importer, Endpoint};
pub use crate::support::cancel::CancelToken;
pub use crate::support::config::{ImapConfig, TlsMode};
pub use crate::support::error::Error;
