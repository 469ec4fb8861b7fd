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

//! Writing a stream of records into mailboxes.
//!
//! Directory records are turned into mailboxes right away on the thread that
//! reads the record stream, so that a directory always exists before any
//! message submitted after it is appended. Messages are handed to a fixed
//! set of worker threads, each of which borrows a session from the pool for
//! every append.

use std::io::Read;
use std::sync::Arc;

use chrono::prelude::*;
use crossbeam::channel::{self, select, Receiver, Sender};
use log::{debug, info, warn};

use super::record::{Outcome, Record};
use super::Endpoint;
use crate::imap::mailbox_name::{ancestors, clean_abs, mailbox_of, MailboxNames};
use crate::imap::pool::SessionPool;
use crate::imap::session::{self, Connect, Session};
use crate::support::cancel::CancelToken;
use crate::support::config::ImapConfig;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

pub struct Exporter<C: Connect> {
    connector: Arc<C>,
    pool_size: usize,
    max_message_size: Option<u64>,
    pool: Option<SessionPool<C>>,
    log_prefix: LogPrefix,
}

impl<C: Connect> Exporter<C> {
    pub fn new(connector: C, config: &ImapConfig) -> Self {
        let log_prefix =
            LogPrefix::new("export", connector.username(), connector.address());
        Exporter {
            connector: Arc::new(connector),
            pool_size: config.pool_size,
            max_message_size: config.max_message_size,
            pool: None,
            log_prefix,
        }
    }

    /// Consume `records` until the sender hangs up, writing one `Outcome`
    /// per record to `results`.
    ///
    /// `results` is dropped, and thus closed, when this returns, regardless
    /// of the result. If `cancel` fires, no further records are consumed,
    /// appends already under way are allowed to finish, and
    /// `Error::Cancelled` is returned.
    pub fn export(
        &mut self,
        cancel: &CancelToken,
        records: Receiver<Record>,
        results: Sender<Outcome>,
    ) -> Result<(), Error> {
        session::ping(&*self.connector)?;

        if let Some(old) = self.pool.take() {
            old.close();
        }
        let pool = SessionPool::new(Arc::clone(&self.connector), self.pool_size)?;
        let delimiter =
            pool.with_session(cancel, |pooled| pooled.session.delimiter())?;
        debug!(
            "{} Server hierarchy delimiter is {:?}",
            self.log_prefix, delimiter
        );

        let pool = self.pool.get_or_insert(pool);
        let context = Context {
            pool,
            names: MailboxNames::new(delimiter),
            cancel,
            max_message_size: self.max_message_size,
            log_prefix: &self.log_prefix,
        };

        info!("{} Starting export", self.log_prefix);
        let (consumed, result) = context.run(records, results, self.pool_size);
        match result {
            Ok(()) => info!(
                "{} Export finished after {} records",
                self.log_prefix, consumed
            ),
            Err(ref e) => warn!(
                "{} Export stopped after {} records: {}",
                self.log_prefix, consumed, e
            ),
        }
        result
    }

    /// Log out of all pooled sessions.
    pub fn close(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close();
        }
    }
}

impl<C: Connect> Endpoint for Exporter<C> {
    fn origin(&self) -> &str {
        self.connector.address()
    }

    fn ping(&self) -> Result<(), Error> {
        session::ping(&*self.connector)
    }
}

struct Context<'a, C: Connect> {
    pool: &'a SessionPool<C>,
    names: MailboxNames,
    cancel: &'a CancelToken,
    max_message_size: Option<u64>,
    log_prefix: &'a LogPrefix,
}

impl<C: Connect> Context<'_, C> {
    /// Returns the number of records consumed alongside the overall result.
    fn run(
        &self,
        records: Receiver<Record>,
        results: Sender<Outcome>,
        workers: usize,
    ) -> (usize, Result<(), Error>) {
        let (job_tx, job_rx) = channel::bounded::<Record>(0);
        let mut consumed = 0;

        let scope_result = crossbeam::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let results = results.clone();
                s.spawn(move |_| {
                    for record in job_rx {
                        let path = record.path.clone();
                        let result = self.export_file(record);
                        if let Err(ref e) = result {
                            warn!("{} {}: {}", self.log_prefix, path, e);
                        }
                        let _ = results.send(Outcome { path, result });
                    }
                });
            }
            drop(job_rx);

            let result = self.ingest(&records, &results, &job_tx, &mut consumed);
            drop(job_tx);
            result
        });

        let result = match scope_result {
            Ok(result) => result,
            Err(_) => Err(Error::WorkerPanicked),
        };
        (consumed, result)
    }

    fn ingest(
        &self,
        records: &Receiver<Record>,
        results: &Sender<Outcome>,
        jobs: &Sender<Record>,
        consumed: &mut usize,
    ) -> Result<(), Error> {
        let report = |outcome: Outcome| {
            results.send(outcome).map_err(|_| Error::Disconnected)
        };

        loop {
            self.cancel.check()?;
            let record = select! {
                recv(records) -> record => match record {
                    Ok(record) => record,
                    Err(_) => return Ok(()),
                },
                recv(self.cancel.signal()) -> _ => return Err(Error::Cancelled),
            };
            *consumed += 1;

            if let Some(ref e) = record.error {
                debug!(
                    "{} Passing through failed record {}: {}",
                    self.log_prefix, record.path, e
                );
                report(Outcome::ok(record.path))?;
            } else if record.is_xattr {
                report(Outcome::ok(record.path))?;
            } else if record.info.mode.is_dir() {
                let result = self.export_dir(&record.path);
                if let Err(ref e) = result {
                    warn!("{} {}: {}", self.log_prefix, record.path, e);
                }
                report(Outcome {
                    path: record.path,
                    result,
                })?;
            } else if record.info.mode.is_symlink() {
                report(Outcome::err(record.path, Error::Unsupported))?;
            } else {
                let path = record.path.clone();
                select! {
                    send(jobs, record) -> sent => if sent.is_err() {
                        report(Outcome::err(path, Error::WorkerPanicked))?;
                        return Err(Error::WorkerPanicked);
                    },
                    recv(self.cancel.signal()) -> _ => {
                        report(Outcome::err(path, Error::Cancelled))?;
                        return Err(Error::Cancelled);
                    },
                }
            }
        }
    }

    fn export_dir(&self, path: &str) -> Result<(), Error> {
        let path = clean_abs(path);
        if "/" == path {
            Ok(())
        } else {
            self.ensure_mailbox(&path)
        }
    }

    /// Create the mailbox at virtual path `path` and all its ancestors.
    fn ensure_mailbox(&self, path: &str) -> Result<(), Error> {
        for ancestor in ancestors(path) {
            let wire = self.names.to_wire(&ancestor);
            self.pool.with_session(self.cancel, |pooled| {
                match pooled.session.create(&wire) {
                    Ok(()) => {
                        debug!("{} Created {}", self.log_prefix, wire);
                        Ok(())
                    },
                    Err(e) if e.is_already_exists() => Ok(()),
                    Err(e) => {
                        if e.is_connection_fatal() {
                            pooled.mark_broken();
                        }
                        Err(e)
                    },
                }
            })?;
        }

        Ok(())
    }

    fn export_file(&self, mut record: Record) -> Result<(), Error> {
        let mailbox = mailbox_of(&record.path)?;
        let wire = self.names.to_wire(&mailbox);
        let body = self.read_body(&mut record)?;
        let date = record
            .info
            .mod_time
            .unwrap_or_else(Utc::now)
            .with_timezone(&FixedOffset::east(0));

        match self.append(&wire, &body, date) {
            Ok(()) => Ok(()),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) if e.is_try_create() => {
                debug!(
                    "{} {} does not exist yet, creating it",
                    self.log_prefix, wire
                );
                if let Err(create) = self.ensure_mailbox(&mailbox) {
                    return Err(Error::TryCreate {
                        mailbox: wire,
                        create: Box::new(create),
                        append: Box::new(e),
                    });
                }
                self.append(&wire, &body, date)
            },
            Err(e) => {
                debug!(
                    "{} Retrying {} after error: {}",
                    self.log_prefix, record.path, e
                );
                self.append(&wire, &body, date)
            },
        }
    }

    fn read_body(&self, record: &mut Record) -> Result<Vec<u8>, Error> {
        let mut reader = record.open()?;
        let mut body = Vec::new();
        match self.max_message_size {
            None => {
                reader.read_to_end(&mut body)?;
            },
            Some(max) => {
                reader.take(max.saturating_add(1)).read_to_end(&mut body)?;
                if body.len() as u64 > max {
                    return Err(Error::MessageTooLarge(max));
                }
            },
        }

        Ok(body)
    }

    /// Probe a pooled session with `NOOP`, then `APPEND` on it.
    fn append(
        &self,
        mailbox: &str,
        body: &[u8],
        date: DateTime<FixedOffset>,
    ) -> Result<(), Error> {
        self.pool.with_session(self.cancel, |pooled| {
            if let Err(e) = pooled.session.noop() {
                pooled.mark_broken();
                return Err(e);
            }

            pooled.session.append(mailbox, body, date).map_err(|e| {
                if e.is_connection_fatal() {
                    pooled.mark_broken();
                }
                e
            })
        })
    }
}
