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

//! Reading every mailbox of a server as a tree of records.
//!
//! The scan itself runs on one dedicated session and only transfers
//! metadata. Message bodies are fetched when the host opens a record, on
//! sessions borrowed from a pool which outlives the scan.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;

use chrono::prelude::*;
use crossbeam::channel::{select, Sender};
use log::{debug, info, warn};

use super::record::{Body, BodyReader, FileInfo, FileMode, Record};
use super::Endpoint;
use crate::imap::mailbox_name::{ancestors, MailboxNames};
use crate::imap::pool::SessionPool;
use crate::imap::session::{self, Connect, MailboxInfo, MessageMeta, Session};
use crate::mime::encoded_word;
use crate::support::cancel::CancelToken;
use crate::support::config::ImapConfig;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::safe_name::safe_name;

pub struct Importer<C: Connect> {
    connector: Arc<C>,
    pool_size: usize,
    pool: Option<Arc<SessionPool<C>>>,
    log_prefix: LogPrefix,
}

impl<C: Connect> Importer<C> {
    pub fn new(connector: C, config: &ImapConfig) -> Self {
        let log_prefix =
            LogPrefix::new("import", connector.username(), connector.address());
        Importer {
            connector: Arc::new(connector),
            pool_size: config.pool_size,
            pool: None,
            log_prefix,
        }
    }

    /// Send a record for the root, every mailbox directory, and every
    /// message to `records`.
    ///
    /// `records` is dropped when this returns. The bodies of the message
    /// records stay readable after that until `close()` is called.
    pub fn import(
        &mut self,
        cancel: &CancelToken,
        records: Sender<Record>,
    ) -> Result<(), Error> {
        session::ping(&*self.connector)?;

        let mut session = Some(self.connector.connect()?);
        let result = self.import_with(cancel, &mut session, &records);
        if let Some(mut session) = session {
            let _ = session.logout();
        }

        match result {
            Ok(()) => info!("{} Import finished", self.log_prefix),
            Err(ref e) => warn!("{} Import stopped: {}", self.log_prefix, e),
        }
        result
    }

    fn import_with(
        &mut self,
        cancel: &CancelToken,
        session: &mut Option<C::Session>,
        records: &Sender<Record>,
    ) -> Result<(), Error> {
        if let Some(old) = self.pool.take() {
            old.close();
        }
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&self.connector),
            self.pool_size,
        )?);
        self.pool = Some(Arc::clone(&pool));

        let mailboxes = match session.as_mut() {
            Some(session) => session.list("*")?,
            None => return Err(Error::Disconnected),
        };
        info!(
            "{} Importing {} mailboxes",
            self.log_prefix,
            mailboxes.len()
        );

        let mailboxes: Vec<(MailboxInfo, String)> = mailboxes
            .into_iter()
            .map(|mb| {
                let path = format!(
                    "/{}",
                    MailboxNames::to_virtual(&mb.name, mb.delimiter)
                );
                (mb, path)
            })
            .filter(|&(_, ref path)| path.as_str() != "/")
            .collect();

        emit(cancel, records, Record::dir("/"))?;
        let mut seen = HashSet::new();
        for &(_, ref path) in &mailboxes {
            for dir in ancestors(path) {
                if seen.insert(dir.clone()) {
                    emit(cancel, records, Record::dir(dir))?;
                }
            }
        }

        let scan = Scan {
            connector: &*self.connector,
            pool: &pool,
            cancel,
            records,
            log_prefix: &self.log_prefix,
        };
        for (mailbox, path) in mailboxes {
            if mailbox.selectable {
                scan.mailbox(session, &mailbox.name, &path)?;
            } else {
                debug!("{} Skipping unselectable {}", self.log_prefix, path);
            }
        }

        Ok(())
    }

    /// Log out of the sessions used to fetch bodies. Bodies of records
    /// already produced can no longer be read afterwards.
    pub fn close(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close();
        }
    }
}

impl<C: Connect> Endpoint for Importer<C> {
    fn origin(&self) -> &str {
        self.connector.address()
    }

    fn ping(&self) -> Result<(), Error> {
        session::ping(&*self.connector)
    }
}

struct Scan<'a, C: Connect> {
    connector: &'a C,
    pool: &'a Arc<SessionPool<C>>,
    cancel: &'a CancelToken,
    records: &'a Sender<Record>,
    log_prefix: &'a LogPrefix,
}

impl<C: Connect> Scan<'_, C> {
    /// Emit the records of one mailbox.
    ///
    /// `session` is `None` after the connection was lost; it is re-dialed
    /// here, and if that fails the mailbox is reported as failed.
    fn mailbox(
        &self,
        session: &mut Option<C::Session>,
        wire: &str,
        path: &str,
    ) -> Result<(), Error> {
        self.cancel.check()?;

        if session.is_none() {
            match self.connector.connect() {
                Ok(fresh) => *session = Some(fresh),
                Err(e) => {
                    warn!("{} {}: {}", self.log_prefix, path, e);
                    return emit(
                        self.cancel,
                        self.records,
                        Record::failed(path, e),
                    );
                },
            }
        }

        let listed = match session.as_mut() {
            Some(live) => list_messages(live, wire),
            None => return Ok(()),
        };
        let messages = match listed {
            Ok(messages) => messages,
            Err(e) => {
                warn!("{} {}: {}", self.log_prefix, path, e);
                if e.is_connection_fatal() {
                    *session = None;
                }
                return emit(
                    self.cancel,
                    self.records,
                    Record::failed(path, e),
                );
            },
        };

        debug!(
            "{} {} has {} messages",
            self.log_prefix,
            path,
            messages.len()
        );
        for meta in messages {
            if 0 == meta.uid {
                continue;
            }

            emit(self.cancel, self.records, self.message(wire, path, meta))?;
        }

        Ok(())
    }

    fn message(&self, wire: &str, dir: &str, meta: MessageMeta) -> Record {
        let name = message_name(&meta);
        let info = FileInfo {
            name: name.clone(),
            mode: FileMode::file(0o600),
            size: meta.size.filter(|&size| size > 0).map_or(-1, i64::from),
            mod_time: Some(
                meta.internal_date
                    .map(|date| date.with_timezone(&Utc))
                    .unwrap_or_else(|| Utc.timestamp(0, 0)),
            ),
        };

        let pool = Arc::clone(self.pool);
        let cancel = self.cancel.clone();
        let wire = wire.to_owned();
        let uid = meta.uid;
        let opener = move || -> Result<BodyReader, Error> {
            let body = pool.with_session(&cancel, |pooled| {
                pooled.select(&wire, true)?;
                pooled.session.fetch_body(uid).map_err(|e| {
                    if e.is_connection_fatal() {
                        pooled.mark_broken();
                    }
                    e
                })
            })?;
            Ok(Box::new(Cursor::new(body)))
        };

        Record::file(format!("{}/{}", dir, name), info, Body::Lazy(Arc::new(opener)))
    }
}

fn list_messages<S: Session>(
    session: &mut S,
    wire: &str,
) -> Result<Vec<MessageMeta>, Error> {
    let count = session.select(wire, true).map_err(|e| Error::Select {
        mailbox: wire.to_owned(),
        source: Box::new(e),
    })?;
    if 0 == count {
        return Ok(Vec::new());
    }

    session.fetch_metadata(count).map_err(|e| Error::Fetch {
        mailbox: wire.to_owned(),
        source: Box::new(e),
    })
}

/// `<uid>.eml`, or `<uid>-<subject>.eml` if the subject has anything usable
/// in it.
fn message_name(meta: &MessageMeta) -> String {
    let subject = meta
        .subject
        .as_ref()
        .map(|raw| encoded_word::decode_header(raw))
        .and_then(|subject| safe_name(&subject));

    match subject {
        Some(subject) => format!("{}-{}.eml", meta.uid, subject),
        None => format!("{}.eml", meta.uid),
    }
}

fn emit(
    cancel: &CancelToken,
    records: &Sender<Record>,
    record: Record,
) -> Result<(), Error> {
    cancel.check()?;
    select! {
        send(records, record) -> sent => sent.map_err(|_| Error::Disconnected),
        recv(cancel.signal()) -> _ => Err(Error::Cancelled),
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::thread;
    use std::time::Duration;

    use crossbeam::channel;

    use super::*;
    use crate::test_support::*;

    fn importer(server: &MockServer, pool_size: usize) -> Importer<MockConnector> {
        Importer::new(server.connector(), &test_config(pool_size))
    }

    fn run(importer: &mut Importer<MockConnector>) -> Vec<Record> {
        let (tx, rx) = channel::unbounded();
        importer.import(&CancelToken::new(), tx).unwrap();
        rx.iter().collect()
    }

    fn read(record: &mut Record) -> Vec<u8> {
        let mut data = Vec::new();
        record.open().unwrap().read_to_end(&mut data).unwrap();
        data
    }

    fn dir_paths(records: &[Record]) -> Vec<&str> {
        records
            .iter()
            .filter(|r| r.info.mode.is_dir() && r.error.is_none())
            .map(|r| &r.path as &str)
            .collect()
    }

    #[test]
    fn hierarchy_is_complete_and_parents_come_first() {
        let server = MockServer::new();
        server.add_mailbox("C/D/E");
        server.add_mailbox("A/B");
        server.add_mailbox("A");
        let mut importer = importer(&server, 1);

        let records = run(&mut importer);
        let dirs = dir_paths(&records);
        assert_eq!("/", dirs[0]);

        let mut sorted = dirs.clone();
        sorted.sort();
        assert_eq!(
            vec!["/", "/A", "/A/B", "/C", "/C/D", "/C/D/E", "/INBOX"],
            sorted
        );

        for (ix, dir) in dirs.iter().enumerate() {
            for ancestor in ancestors(dir) {
                let position = dirs.iter().position(|d| *d == ancestor);
                assert!(position.unwrap() <= ix, "{} before {}", ancestor, dir);
            }
        }

        for record in records.iter().filter(|r| r.info.mode.is_dir()) {
            assert_eq!(Some(Utc.timestamp(0, 0)), record.info.mod_time);
        }

        // Only real mailboxes are selected, and only on the scan session
        assert_eq!(4, server.state().selects);
        assert_eq!(0, server.state().metadata_fetches);
    }

    #[test]
    fn message_records() {
        let server = MockServer::new();
        let plain = server.add_message("INBOX", Some("Hello world"), b"one");
        let encoded = server.add_message(
            "INBOX",
            Some("=?utf-8?Q?Gr=C3=BC=C3=9Fe?= aus / Berlin"),
            b"two",
        );
        let bare = server.add_message("INBOX", None, b"");
        let mut importer = importer(&server, 1);

        let records = run(&mut importer);
        let files: Vec<&Record> =
            records.iter().filter(|r| !r.info.mode.is_dir()).collect();
        assert_eq!(3, files.len());

        assert_eq!(
            format!("/INBOX/{}-Hello_world.eml", plain),
            files[0].path
        );
        assert_eq!(
            format!("/INBOX/{}-Grüße_aus_Berlin.eml", encoded),
            files[1].path
        );
        assert_eq!(format!("/INBOX/{}.eml", bare), files[2].path);
        assert_eq!(format!("{}.eml", bare), files[2].info.name);

        assert_eq!(0o600, files[0].info.mode.perm());
        assert_eq!(3, files[0].info.size);
        assert_eq!(-1, files[2].info.size);
        assert_eq!(
            Some(
                FixedOffset::east(3600)
                    .ymd(2020, 7, 4)
                    .and_hms(12, 30, plain % 60)
                    .with_timezone(&Utc)
            ),
            files[0].info.mod_time
        );
        assert_eq!(1, server.state().metadata_fetches);
    }

    #[test]
    fn uid_zero_is_skipped() {
        let server = MockServer::new();
        let before = server.add_message("INBOX", Some("before"), b"a");
        server.add_message_with_uid("INBOX", 0, Some("broken"), b"b");
        let after = server.add_message("INBOX", Some("after"), b"c");
        let mut importer = importer(&server, 1);

        let records = run(&mut importer);
        let files: Vec<&str> = records
            .iter()
            .filter(|r| !r.info.mode.is_dir())
            .map(|r| &r.path as &str)
            .collect();
        assert_eq!(
            vec![
                format!("/INBOX/{}-before.eml", before),
                format!("/INBOX/{}-after.eml", after),
            ],
            files
        );
        assert!(records.iter().all(|r| r.error.is_none()));
    }

    #[test]
    fn bodies_are_fetched_lazily() {
        let server = MockServer::new();
        server.add_mailbox("Trash");
        server.add_message("INBOX", None, b"first");
        server.add_message("Trash", None, b"second");
        server.add_message("Trash", None, b"third");
        let mut importer = importer(&server, 1);

        let mut records = run(&mut importer);
        assert_eq!(0, server.state().body_fetches);
        let selects_after_scan = server.state().selects;

        let mut files: Vec<&mut Record> = records
            .iter_mut()
            .filter(|r| !r.info.mode.is_dir())
            .collect();
        assert_eq!(b"first".to_vec(), read(files[0]));
        assert_eq!(b"first".to_vec(), read(files[0]));
        assert_eq!(2, server.state().body_fetches);
        assert_eq!(selects_after_scan + 1, server.state().selects);

        assert_eq!(b"second".to_vec(), read(files[1]));
        assert_eq!(b"third".to_vec(), read(files[2]));
        // One pooled session; INBOX, then Trash once
        assert_eq!(selects_after_scan + 2, server.state().selects);
        assert_eq!(4, server.state().body_fetches);
    }

    #[test]
    fn bodies_survive_until_close() {
        let server = MockServer::new();
        server.add_message("INBOX", None, b"body");
        let mut importer = importer(&server, 2);

        let mut records = run(&mut importer);
        let file = records
            .iter_mut()
            .find(|r| !r.info.mode.is_dir())
            .unwrap();

        // The scan session is gone, the pool is not
        assert_eq!(2, server.state().live);
        assert_eq!(b"body".to_vec(), read(file));

        importer.close();
        assert_eq!(0, server.state().live);
        assert_matches!(Err(Error::PoolClosed), file.open().map(|_| ()));
    }

    #[test]
    fn unselectable_mailboxes_only_produce_directories() {
        let server = MockServer::new();
        server.add_noselect("Public");
        server.add_mailbox("Public/Lists");
        server.add_message("Public/Lists", None, b"x");
        let mut importer = importer(&server, 1);

        let records = run(&mut importer);
        assert!(dir_paths(&records).contains(&"/Public"));
        assert!(records
            .iter()
            .any(|r| r.path.starts_with("/Public/Lists/")));
        // INBOX and Public/Lists
        assert_eq!(2, server.state().selects);
    }

    #[test]
    fn mailbox_failures_become_error_records() {
        let server = MockServer::new();
        server.add_mailbox("Secret");
        server.add_mailbox("Zebra");
        server.add_message("Zebra", None, b"x");
        server.state().refused_selects.push("Secret".to_owned());
        let mut importer = importer(&server, 1);

        let records = run(&mut importer);
        let failed = records.iter().find(|r| r.error.is_some()).unwrap();
        assert_eq!("/Secret", failed.path);
        assert_matches!(Some(Error::Select { .. }), &failed.error);

        // Mailboxes after the failed one are still scanned
        assert!(records.iter().any(|r| r.path.starts_with("/Zebra/")));
    }

    #[test]
    fn scan_reconnects_after_connection_loss() {
        let server = MockServer::new();
        server.add_mailbox("Secret");
        server.add_mailbox("Zebra");
        server.add_message("Zebra", None, b"x");
        let mut importer = importer(&server, 1);
        let (tx, rx) = channel::bounded::<Record>(0);

        let server2 = server.clone();
        let reader = thread::spawn(move || {
            let mut records = Vec::new();
            for record in rx {
                // The scan is blocked on the next send until we loop, so
                // this happens before any mailbox is selected
                if "/" == record.path {
                    server2.drop_all_connections();
                }
                records.push(record);
            }
            records
        });

        importer.import(&CancelToken::new(), tx).unwrap();
        let records = reader.join().unwrap();
        let failed = records.iter().find(|r| r.error.is_some()).unwrap();
        assert_eq!("/INBOX", failed.path);
        assert!(records.iter().any(|r| r.path.starts_with("/Zebra/")));
    }

    #[test]
    fn failed_reconnect_reports_remaining_mailboxes() {
        let server = MockServer::new();
        server.add_mailbox("Secret");
        server.add_mailbox("Zebra");
        server.add_message("Zebra", None, b"x");
        let mut importer = importer(&server, 1);
        let (tx, rx) = channel::bounded::<Record>(0);

        let server2 = server.clone();
        let reader = thread::spawn(move || {
            let mut records = Vec::new();
            for record in rx {
                if "/" == record.path {
                    server2.drop_all_connections();
                    server2.state().refuse_connects = true;
                }
                records.push(record);
            }
            records
        });

        importer.import(&CancelToken::new(), tx).unwrap();
        let records = reader.join().unwrap();
        let failed: Vec<&str> = records
            .iter()
            .filter(|r| r.error.is_some())
            .map(|r| &r.path as &str)
            .collect();
        assert_eq!(vec!["/INBOX", "/Secret", "/Zebra"], failed);
        let zebra = records
            .iter()
            .find(|r| "/Zebra" == r.path && r.error.is_some())
            .unwrap();
        assert_matches!(Some(Error::Dial(_)), &zebra.error);
        assert!(!records.iter().any(|r| r.path.starts_with("/Zebra/")));
    }

    #[test]
    fn names_are_decoded_and_split() {
        let server = MockServer::new();
        server.state().delimiter = Some('.');
        server.add_mailbox("Archiv.Entw&APw-rfe");
        server.add_mailbox("a/b");
        let mut importer = importer(&server, 1);

        let records = run(&mut importer);
        let dirs = dir_paths(&records);
        assert!(dirs.contains(&"/Archiv"));
        assert!(dirs.contains(&"/Archiv/Entwürfe"));
        assert!(dirs.contains(&"/a_b"));
    }

    #[test]
    fn closed_record_channel_stops_scan() {
        let server = MockServer::new();
        let mut importer = importer(&server, 1);
        let (tx, rx) = channel::unbounded();
        drop(rx);

        assert_matches!(
            Err(Error::Disconnected),
            importer.import(&CancelToken::new(), tx)
        );
        // The scan session was still logged out
        assert_eq!(2, server.state().logouts);
    }

    #[test]
    fn cancellation_stops_scan() {
        let server = MockServer::new();
        let mut importer = importer(&server, 1);
        let cancel = CancelToken::new();
        // Nobody receives, so the first send blocks until cancelled
        let (tx, _rx) = channel::bounded(0);

        let canceller = cancel.clone();
        let thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        assert_matches!(Err(Error::Cancelled), importer.import(&cancel, tx));
        thread.join().unwrap();
    }
}
