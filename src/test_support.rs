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

//! An in-memory IMAP server for tests, with fault injection and counters for
//! everything the engines do to it.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::prelude::*;

use crate::imap::session::{Connect, MailboxInfo, MessageMeta, Session};
use crate::support::config::{ImapConfig, TlsMode};
use crate::support::error::Error;

pub fn test_config(pool_size: usize) -> ImapConfig {
    ImapConfig {
        location: "imap://mock.example.com:993".to_owned(),
        username: "azure".to_owned(),
        password: "hunter2".to_owned(),
        tls: TlsMode::Tls,
        tls_no_verify: false,
        pool_size,
        max_message_size: None,
    }
}

#[derive(Clone, Debug)]
pub struct MockMessage {
    pub uid: u32,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub subject: Option<Vec<u8>>,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct MockMailbox {
    pub selectable: bool,
    pub messages: Vec<MockMessage>,
}

#[derive(Debug)]
pub struct ServerState {
    pub delimiter: Option<char>,
    /// Keyed by wire name.
    pub mailboxes: BTreeMap<String, MockMailbox>,
    /// Whether `APPEND` to a missing mailbox answers `[TRYCREATE]` instead
    /// of creating the mailbox implicitly.
    pub require_create: bool,
    pub next_uid: u32,

    /// Refuse every connection attempt.
    pub refuse_connects: bool,
    /// Refuse this many of the next connection attempts.
    pub fail_connects: usize,
    /// Refuse connection attempts once this many have succeeded in total.
    pub max_connects: Option<usize>,
    /// The next this many `NOOP`s drop the connection.
    pub fail_noops: usize,
    /// The next this many `APPEND`s drop the connection.
    pub fatal_appends: usize,
    /// The next this many `APPEND`s are answered with a plain `NO`.
    pub refused_appends: usize,
    /// `CREATE` of these wire names is refused.
    pub refused_creates: Vec<String>,
    /// `SELECT`/`EXAMINE` of these wire names is refused.
    pub refused_selects: Vec<String>,
    /// Sessions connected before the generation changed are dead.
    pub generation: u32,
    pub append_delay: Option<Duration>,

    /// Connection attempts, successful or not.
    pub dials: usize,
    pub connects: usize,
    pub live: usize,
    pub max_live: usize,
    pub noops: usize,
    pub selects: usize,
    pub creates: usize,
    pub appends: usize,
    pub trycreates: usize,
    pub metadata_fetches: usize,
    pub body_fetches: usize,
    pub logouts: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        ServerState {
            delimiter: Some('/'),
            mailboxes: BTreeMap::new(),
            require_create: true,
            next_uid: 1,
            refuse_connects: false,
            fail_connects: 0,
            max_connects: None,
            fail_noops: 0,
            fatal_appends: 0,
            refused_appends: 0,
            refused_creates: vec![],
            refused_selects: vec![],
            generation: 0,
            append_delay: None,
            dials: 0,
            connects: 0,
            live: 0,
            max_live: 0,
            noops: 0,
            selects: 0,
            creates: 0,
            appends: 0,
            trycreates: 0,
            metadata_fetches: 0,
            body_fetches: 0,
            logouts: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        let server = MockServer::default();
        server.add_mailbox("INBOX");
        server
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            server: self.clone(),
        }
    }

    pub fn add_mailbox(&self, wire_name: &str) {
        self.state()
            .mailboxes
            .entry(wire_name.to_owned())
            .or_default()
            .selectable = true;
    }

    pub fn add_noselect(&self, wire_name: &str) {
        self.state()
            .mailboxes
            .entry(wire_name.to_owned())
            .or_default();
    }

    pub fn add_message(
        &self,
        wire_name: &str,
        subject: Option<&str>,
        body: &[u8],
    ) -> u32 {
        let uid = {
            let mut state = self.state();
            state.next_uid += 1;
            state.next_uid - 1
        };
        self.add_message_with_uid(wire_name, uid, subject, body);
        uid
    }

    /// Add a message with a fixed UID, which may be one a real server would
    /// never assign.
    pub fn add_message_with_uid(
        &self,
        wire_name: &str,
        uid: u32,
        subject: Option<&str>,
        body: &[u8],
    ) {
        self.state()
            .mailboxes
            .get_mut(wire_name)
            .unwrap()
            .messages
            .push(MockMessage {
                uid,
                internal_date: Some(
                    FixedOffset::east(3600)
                        .ymd(2020, 7, 4)
                        .and_hms(12, 30, uid % 60),
                ),
                subject: subject.map(|s| s.as_bytes().to_vec()),
                body: body.to_vec(),
            });
    }

    pub fn messages(&self, wire_name: &str) -> Vec<MockMessage> {
        self.state()
            .mailboxes
            .get(wire_name)
            .map(|mb| mb.messages.clone())
            .unwrap_or_default()
    }

    pub fn has_mailbox(&self, wire_name: &str) -> bool {
        self.state().mailboxes.contains_key(wire_name)
    }

    /// Kill every session connected so far.
    pub fn drop_all_connections(&self) {
        self.state().generation += 1;
    }
}

#[derive(Clone, Debug)]
pub struct MockConnector {
    pub server: MockServer,
}

impl Connect for MockConnector {
    type Session = MockSession;

    fn connect(&self) -> Result<MockSession, Error> {
        let mut state = self.server.state();
        state.dials += 1;
        let exhausted =
            state.max_connects.map_or(false, |max| state.connects >= max);
        if state.refuse_connects || exhausted || state.fail_connects > 0 {
            state.fail_connects = state.fail_connects.saturating_sub(1);
            return Err(Error::Dial(Box::new(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "Connection refused",
            )))));
        }

        state.connects += 1;
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        Ok(MockSession {
            server: self.server.clone(),
            generation: state.generation,
            selected: None,
            dead: false,
        })
    }

    fn address(&self) -> &str {
        "mock.example.com:993"
    }

    fn username(&self) -> &str {
        "azure"
    }
}

#[derive(Debug)]
pub struct MockSession {
    server: MockServer,
    generation: u32,
    selected: Option<String>,
    dead: bool,
}

fn connection_lost() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::ConnectionReset,
        "Connection reset by peer",
    ))
}

impl MockSession {
    fn state(&mut self) -> Result<MutexGuard<'_, ServerState>, Error> {
        let state = self.server.state.lock().unwrap();
        if self.dead || state.generation != self.generation {
            self.dead = true;
            Err(connection_lost())
        } else {
            Ok(state)
        }
    }
}

impl Session for MockSession {
    fn noop(&mut self) -> Result<(), Error> {
        let mut state = self.state()?;
        if state.fail_noops > 0 {
            state.fail_noops -= 1;
            drop(state);
            self.dead = true;
            return Err(connection_lost());
        }

        state.noops += 1;
        Ok(())
    }

    fn select(&mut self, mailbox: &str, _read_only: bool) -> Result<u32, Error> {
        self.selected = None;
        let mut state = self.state()?;
        state.selects += 1;
        if state.refused_selects.iter().any(|m| m == mailbox) {
            return Err(Error::No("[NOPERM] Permission denied".to_owned()));
        }

        let count = match state.mailboxes.get(mailbox) {
            Some(mb) if mb.selectable => mb.messages.len() as u32,
            _ => {
                return Err(Error::No(
                    "[NONEXISTENT] No such mailbox".to_owned(),
                ))
            },
        };
        drop(state);

        self.selected = Some(mailbox.to_owned());
        Ok(count)
    }

    fn create(&mut self, mailbox: &str) -> Result<(), Error> {
        let mut state = self.state()?;
        state.creates += 1;
        if state.refused_creates.iter().any(|m| m == mailbox) {
            return Err(Error::No("[NOPERM] Permission denied".to_owned()));
        }

        match state.mailboxes.get_mut(mailbox) {
            Some(mb) if mb.selectable => {
                Err(Error::No("[ALREADYEXISTS] Mailbox exists".to_owned()))
            },
            Some(mb) => {
                mb.selectable = true;
                Ok(())
            },
            None => {
                state
                    .mailboxes
                    .insert(mailbox.to_owned(), MockMailbox {
                        selectable: true,
                        messages: vec![],
                    });
                Ok(())
            },
        }
    }

    fn list(&mut self, pattern: &str) -> Result<Vec<MailboxInfo>, Error> {
        assert_eq!("*", pattern);
        let state = self.state()?;
        Ok(state
            .mailboxes
            .iter()
            .map(|(name, mb)| MailboxInfo {
                name: name.clone(),
                delimiter: state.delimiter,
                selectable: mb.selectable,
            })
            .collect())
    }

    fn delimiter(&mut self) -> Result<Option<char>, Error> {
        Ok(self.state()?.delimiter)
    }

    fn append(
        &mut self,
        mailbox: &str,
        message: &[u8],
        internal_date: DateTime<FixedOffset>,
    ) -> Result<(), Error> {
        let delay = {
            let mut state = self.state()?;
            if state.fatal_appends > 0 {
                state.fatal_appends -= 1;
                drop(state);
                self.dead = true;
                return Err(connection_lost());
            }

            if state.refused_appends > 0 {
                state.refused_appends -= 1;
                return Err(Error::No("[OVERQUOTA] Mailbox full".to_owned()));
            }

            let exists = state
                .mailboxes
                .get(mailbox)
                .map_or(false, |mb| mb.selectable);
            if !exists {
                if state.require_create {
                    state.trycreates += 1;
                    // What the client reports for a `NO [TRYCREATE]`
                    // sent in place of the continuation
                    return Err(Error::AppendRefused);
                }
                state.mailboxes.entry(mailbox.to_owned()).or_default().selectable =
                    true;
            }

            state.appends += 1;
            let uid = state.next_uid;
            state.next_uid += 1;
            state
                .mailboxes
                .get_mut(mailbox)
                .unwrap()
                .messages
                .push(MockMessage {
                    uid,
                    internal_date: Some(internal_date),
                    subject: None,
                    body: message.to_vec(),
                });
            state.append_delay
        };

        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        Ok(())
    }

    fn fetch_metadata(
        &mut self,
        count: u32,
    ) -> Result<Vec<MessageMeta>, Error> {
        let selected = self.selected.clone().unwrap();
        let mut state = self.state()?;
        state.metadata_fetches += 1;
        Ok(state.mailboxes[&selected]
            .messages
            .iter()
            .take(count as usize)
            .map(|m| MessageMeta {
                uid: m.uid,
                internal_date: m.internal_date,
                size: Some(m.body.len() as u32),
                subject: m.subject.clone(),
            })
            .collect())
    }

    fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>, Error> {
        let selected = self.selected.clone();
        let mut state = self.state()?;
        state.body_fetches += 1;
        selected
            .and_then(|selected| state.mailboxes.get(&selected))
            .and_then(|mb| mb.messages.iter().find(|m| m.uid == uid))
            .map(|m| m.body.clone())
            .ok_or(Error::UnexpectedFetch {
                messages: 0,
                bodies: 0,
            })
    }

    fn logout(&mut self) -> Result<(), Error> {
        let mut state = self.state()?;
        state.logouts += 1;
        drop(state);
        self.dead = true;
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        if let Ok(mut state) = self.server.state.lock() {
            state.live -= 1;
        }
    }
}
