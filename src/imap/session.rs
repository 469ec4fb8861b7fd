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

//! The boundary between the transfer engines and the protocol client.
//!
//! Everything above this module deals only in these traits, which is what
//! lets the pool and the engines be exercised against an in-memory server in
//! tests. All mailbox names crossing this boundary are in wire format
//! (modified UTF-7, server hierarchy delimiter).

use chrono::prelude::*;

use crate::support::error::Error;

/// One mailbox as reported by `LIST`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxInfo {
    /// The name in wire format.
    pub name: String,
    /// The hierarchy delimiter, or `None` if the server has a flat namespace.
    pub delimiter: Option<char>,
    /// False for `\Noselect` and `\NonExistent` mailboxes, which exist only
    /// as containers for others.
    pub selectable: bool,
}

/// The lightweight metadata of one message, as fetched in bulk by the
/// importer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMeta {
    /// 0 if the server did not report a UID.
    pub uid: u32,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub size: Option<u32>,
    /// The raw subject from the `ENVELOPE`, possibly RFC 2047 encoded.
    pub subject: Option<Vec<u8>>,
}

/// A single authenticated connection.
///
/// Protocol commands on one session are strictly sequential; the `&mut self`
/// receivers ensure nobody shares a session between threads.
pub trait Session: Send + 'static {
    fn noop(&mut self) -> Result<(), Error>;

    /// `SELECT` (or `EXAMINE` if `read_only`) the mailbox, returning the
    /// number of messages it contains.
    fn select(&mut self, mailbox: &str, read_only: bool) -> Result<u32, Error>;

    fn create(&mut self, mailbox: &str) -> Result<(), Error>;

    /// `LIST "" pattern`.
    fn list(&mut self, pattern: &str) -> Result<Vec<MailboxInfo>, Error>;

    /// The hierarchy delimiter of the personal namespace, as reported by
    /// `LIST "" ""`.
    fn delimiter(&mut self) -> Result<Option<char>, Error>;

    fn append(
        &mut self,
        mailbox: &str,
        message: &[u8],
        internal_date: DateTime<FixedOffset>,
    ) -> Result<(), Error>;

    /// Fetch UID, internal date, size and envelope subject of messages
    /// `1:count` of the selected mailbox.
    fn fetch_metadata(&mut self, count: u32)
        -> Result<Vec<MessageMeta>, Error>;

    /// `UID FETCH uid BODY.PEEK[]` in the selected mailbox.
    fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>, Error>;

    fn logout(&mut self) -> Result<(), Error>;
}

/// Something that can produce new authenticated sessions.
pub trait Connect: Send + Sync + 'static {
    type Session: Session;

    fn connect(&self) -> Result<Self::Session, Error>;

    /// The server address, for diagnostics.
    fn address(&self) -> &str;

    /// The user sessions log in as, for diagnostics.
    fn username(&self) -> &str;
}

/// Check that the server is reachable and the credentials work: connect,
/// list everything, log out.
pub fn ping<C: Connect>(connector: &C) -> Result<(), Error> {
    let mut session = connector.connect()?;
    let listed = session.list("*");
    let _ = session.logout();
    listed.map(|_| ())
}
