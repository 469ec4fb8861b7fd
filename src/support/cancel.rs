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

use std::fmt;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender};

use super::error::Error;

/// A one-shot cancellation signal shared between threads.
///
/// Clones of a `CancelToken` share the same underlying state. Once
/// `cancel()` is called, the token stays cancelled forever.
///
/// The signal is a channel that never carries a message: cancelling drops the
/// only sender, which makes every receive on `signal()` complete immediately.
/// This lets blocking code wait on cancellation alongside other channels with
/// `select!`.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = channel::bounded(0);
        CancelToken {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                receiver,
            }),
        }
    }

    pub fn cancel(&self) {
        if let Ok(mut sender) = self.inner.sender.lock() {
            sender.take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self.inner.sender.lock() {
            Ok(sender) => sender.is_none(),
            // Only a panic while cancelling can poison the lock
            Err(_) => true,
        }
    }

    /// Return `Err(Error::Cancelled)` if the token has been cancelled.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A receiver which becomes ready (disconnected) once cancelled.
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.receiver
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
