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

//! A fixed-size pool of authenticated sessions.
//!
//! The idle sessions live in a bounded channel whose capacity is the pool
//! size; checking a session out is a receive and returning it is a send. A
//! session that failed in a way that leaves the connection unusable is never
//! returned; it is logged out and a replacement dialed in its place. If that
//! fails, the pool remembers the missing slot and tries again on later
//! checkouts: right away when no session is idle, otherwise at most once per
//! `REDIAL_INTERVAL`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, select, Receiver, Sender};
use log::{info, warn};

use super::session::{Connect, Session};
use crate::support::cancel::CancelToken;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// How long a checkout waits for a session before retrying replenishment.
const REPLENISH_INTERVAL: Duration = Duration::from_secs(1);
/// How long after a failed dial a checkout that finds an idle session skips
/// replenishing.
const REDIAL_INTERVAL: Duration = Duration::from_secs(30);

/// A session plus the mailbox it currently has selected.
#[derive(Debug)]
pub struct PooledSession<S> {
    pub session: S,
    selected: Option<String>,
    broken: bool,
}

impl<S: Session> PooledSession<S> {
    fn new(session: S) -> Self {
        PooledSession {
            session,
            selected: None,
            broken: false,
        }
    }

    /// The wire name of the mailbox last successfully selected on this
    /// connection.
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Flag the connection as unusable, so that the pool replaces it instead
    /// of handing it out again.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Ensure `mailbox` is the selected mailbox, issuing `SELECT` (or
    /// `EXAMINE`) only if it is not already.
    pub fn select(&mut self, mailbox: &str, read_only: bool) -> Result<(), Error> {
        if self.selected() == Some(mailbox) {
            return Ok(());
        }

        self.selected = None;
        match self.session.select(mailbox, read_only) {
            Ok(_) => {
                self.selected = Some(mailbox.to_owned());
                Ok(())
            },
            Err(e) => {
                if e.is_connection_fatal() {
                    self.broken = true;
                }
                Err(Error::Select {
                    mailbox: mailbox.to_owned(),
                    source: Box::new(e),
                })
            },
        }
    }
}

pub struct SessionPool<C: Connect> {
    connector: Arc<C>,
    idle_tx: Sender<PooledSession<C::Session>>,
    idle_rx: Receiver<PooledSession<C::Session>>,
    size: usize,
    missing: AtomicUsize,
    last_failed_dial: Mutex<Option<Instant>>,
    redial_interval: Duration,
    shutdown: CancelToken,
    log_prefix: LogPrefix,
}

/// Returns the session to the pool when the borrower is done with it, even
/// if the borrower panicked.
struct Checkout<'a, C: Connect> {
    pool: &'a SessionPool<C>,
    pooled: Option<PooledSession<C::Session>>,
}

impl<C: Connect> Drop for Checkout<'_, C> {
    fn drop(&mut self) {
        if let Some(mut pooled) = self.pooled.take() {
            if thread::panicking() {
                pooled.mark_broken();
            }
            self.pool.checkin(pooled);
        }
    }
}

impl<C: Connect> SessionPool<C> {
    /// Dial and log in `size` sessions, one after another.
    ///
    /// If any of them fails, the ones already established are logged out
    /// and no pool is returned.
    pub fn new(connector: Arc<C>, size: usize) -> Result<Self, Error> {
        if 0 == size {
            return Err(Error::InvalidConfig(
                "pool size must be at least 1".to_owned(),
            ));
        }

        let log_prefix =
            LogPrefix::new("pool", connector.username(), connector.address());
        let (idle_tx, idle_rx) = channel::bounded(size);
        let pool = SessionPool {
            connector,
            idle_tx,
            idle_rx,
            size,
            missing: AtomicUsize::new(0),
            last_failed_dial: Mutex::new(None),
            redial_interval: REDIAL_INTERVAL,
            shutdown: CancelToken::new(),
            log_prefix,
        };

        for index in 1..=size {
            match pool.connector.connect() {
                Ok(session) => pool.put_idle(PooledSession::new(session)),
                Err(e) => {
                    pool.close();
                    return Err(Error::PoolConnect {
                        index,
                        size,
                        source: Box::new(e),
                    });
                },
            }
        }

        info!("{} Opened {} sessions", pool.log_prefix, size);
        Ok(pool)
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    /// The nominal number of sessions.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The number of sessions that currently exist, idle or checked out.
    pub fn live(&self) -> usize {
        self.size - self.missing.load(Ordering::SeqCst).min(self.size)
    }

    /// The number of sessions currently waiting for a borrower.
    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run `f` with exclusive use of one session.
    ///
    /// Blocks until a session is free, `cancel` fires, or the pool is
    /// closed. Whatever `f` returns is passed through. If `f` marked the
    /// session broken, it is replaced rather than returned to the pool.
    pub fn with_session<T>(
        &self,
        cancel: &CancelToken,
        f: impl FnOnce(&mut PooledSession<C::Session>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut checkout = Checkout {
            pool: self,
            pooled: Some(self.checkout(cancel)?),
        };

        match checkout.pooled {
            Some(ref mut pooled) => f(pooled),
            None => Err(Error::PoolClosed),
        }
    }

    fn checkout(
        &self,
        cancel: &CancelToken,
    ) -> Result<PooledSession<C::Session>, Error> {
        loop {
            cancel.check()?;
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }

            if self.idle_rx.is_empty() || self.redial_due() {
                self.replenish()?;
            }

            select! {
                recv(self.idle_rx) -> pooled => {
                    if let Ok(pooled) = pooled {
                        return Ok(pooled);
                    }
                },
                recv(cancel.signal()) -> _ => return Err(Error::Cancelled),
                recv(self.shutdown.signal()) -> _ => {
                    return Err(Error::PoolClosed)
                },
                default(REPLENISH_INTERVAL) => (),
            }
        }
    }

    #[cfg(test)]
    fn with_redial_interval(mut self, interval: Duration) -> Self {
        self.redial_interval = interval;
        self
    }

    fn redial_due(&self) -> bool {
        match self.last_failed_dial.lock() {
            Ok(last) => {
                last.map_or(true, |at| at.elapsed() >= self.redial_interval)
            },
            Err(_) => true,
        }
    }

    fn record_failed_dial(&self) {
        if let Ok(mut last) = self.last_failed_dial.lock() {
            *last = Some(Instant::now());
        }
    }

    /// Try to re-dial every missing slot.
    ///
    /// Failure is only an error if there is no session left at all, since
    /// otherwise the caller can still wait for one of the others.
    fn replenish(&self) -> Result<(), Error> {
        while self.take_missing_slot() {
            match self.connector.connect() {
                Ok(session) => {
                    info!("{} Replaced a lost session", self.log_prefix);
                    self.put_idle(PooledSession::new(session));
                },
                Err(e) => {
                    self.missing.fetch_add(1, Ordering::SeqCst);
                    self.record_failed_dial();
                    if 0 == self.live() {
                        return Err(e);
                    }

                    warn!(
                        "{} Failed to replace a lost session: {}",
                        self.log_prefix, e
                    );
                    break;
                },
            }
        }

        Ok(())
    }

    fn take_missing_slot(&self) -> bool {
        let mut missing = self.missing.load(Ordering::SeqCst);
        while missing > 0 {
            match self.missing.compare_exchange(
                missing,
                missing - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => missing = actual,
            }
        }
        false
    }

    fn checkin(&self, pooled: PooledSession<C::Session>) {
        if pooled.broken {
            self.retire(pooled);
        } else {
            self.put_idle(pooled);
        }
    }

    fn retire(&self, mut pooled: PooledSession<C::Session>) {
        let _ = pooled.session.logout();
        drop(pooled);

        if self.is_closed() {
            return;
        }

        match self.connector.connect() {
            Ok(session) => self.put_idle(PooledSession::new(session)),
            Err(e) => {
                self.missing.fetch_add(1, Ordering::SeqCst);
                self.record_failed_dial();
                warn!(
                    "{} Dropped a broken session and could not replace it: {}",
                    self.log_prefix, e
                );
            },
        }
    }

    fn put_idle(&self, mut pooled: PooledSession<C::Session>) {
        if self.is_closed() {
            let _ = pooled.session.logout();
            return;
        }

        if let Err(e) = self.idle_tx.try_send(pooled) {
            let _ = e.into_inner().session.logout();
            return;
        }

        // close() may have drained the channel between the check above and
        // the send.
        if self.is_closed() {
            self.drain_idle();
        }
    }

    fn drain_idle(&self) {
        while let Ok(mut pooled) = self.idle_rx.try_recv() {
            let _ = pooled.session.logout();
        }
    }

    /// Log out all idle sessions and fail all further checkouts.
    ///
    /// Sessions that are checked out are logged out when they come back.
    pub fn close(&self) {
        if !self.is_closed() {
            info!("{} Closing", self.log_prefix);
        }
        self.shutdown.cancel();
        self.drain_idle();
    }
}

impl<C: Connect> Drop for SessionPool<C> {
    fn drop(&mut self) {
        self.close();
    }
}
