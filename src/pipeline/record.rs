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
use std::io::Read;
use std::mem;
use std::sync::Arc;

use bitflags::bitflags;
use chrono::prelude::*;

use crate::support::error::Error;

bitflags! {
    /// File type and permission bits of a record.
    pub struct FileMode: u32 {
        const DIR = 1 << 31;
        const SYMLINK = 1 << 27;
        const PERM = 0o777;
    }
}

impl FileMode {
    pub fn dir(perm: u32) -> Self {
        FileMode::DIR | FileMode::from_bits_truncate(perm & 0o777)
    }

    pub fn file(perm: u32) -> Self {
        FileMode::from_bits_truncate(perm & 0o777)
    }

    pub fn is_dir(self) -> bool {
        self.contains(FileMode::DIR)
    }

    pub fn is_symlink(self) -> bool {
        self.contains(FileMode::SYMLINK)
    }

    pub fn perm(self) -> u32 {
        (self & FileMode::PERM).bits()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// The last element of the path; `/` for the root.
    pub name: String,
    pub mode: FileMode,
    /// Size in bytes, or -1 if unknown.
    pub size: i64,
    pub mod_time: Option<DateTime<Utc>>,
}

pub type BodyReader = Box<dyn Read + Send>;
pub type BodyOpener = Arc<dyn Fn() -> Result<BodyReader, Error> + Send + Sync>;

/// The content of a file record.
pub enum Body {
    Empty,
    /// A stream that can be read once.
    Reader(BodyReader),
    /// A callback producing a fresh stream each time it is called.
    Lazy(BodyOpener),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Body::Empty => write!(f, "Empty"),
            Body::Reader(_) => write!(f, "Reader(..)"),
            Body::Lazy(_) => write!(f, "Lazy(..)"),
        }
    }
}

/// One element of the tree of records exchanged with the backup pipeline.
#[derive(Debug)]
pub struct Record {
    /// Absolute, `/`-separated.
    pub path: String,
    pub info: FileInfo,
    pub body: Body,
    /// Set if the producer failed to read this element.
    pub error: Option<Error>,
    /// Extended attribute records carry no mail data.
    pub is_xattr: bool,
}

impl Record {
    /// A directory record. Mailboxes have no time of their own, so it is
    /// stamped with the epoch.
    pub fn dir(path: impl Into<String>) -> Self {
        let path = path.into();
        Record {
            info: FileInfo {
                name: base_name(&path),
                mode: FileMode::dir(0o700),
                size: 0,
                mod_time: Some(Utc.timestamp(0, 0)),
            },
            path,
            body: Body::Empty,
            error: None,
            is_xattr: false,
        }
    }

    pub fn file(path: impl Into<String>, info: FileInfo, body: Body) -> Self {
        Record {
            path: path.into(),
            info,
            body,
            error: None,
            is_xattr: false,
        }
    }

    /// A record reporting that `path` could not be read.
    pub fn failed(path: impl Into<String>, error: Error) -> Self {
        let mut record = Record::dir(path);
        record.error = Some(error);
        record
    }

    /// Get a reader over the body.
    ///
    /// A `Reader` body can only be opened once; a `Lazy` body can be opened
    /// any number of times.
    pub fn open(&mut self) -> Result<BodyReader, Error> {
        match self.body {
            Body::Empty => Err(Error::MissingBody),
            Body::Lazy(ref opener) => opener(),
            Body::Reader(_) => {
                match mem::replace(&mut self.body, Body::Empty) {
                    Body::Reader(reader) => Ok(reader),
                    _ => Err(Error::MissingBody),
                }
            },
        }
    }
}

fn base_name(path: &str) -> String {
    path.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("/")
        .to_owned()
}

/// The result of exporting one record.
#[derive(Debug)]
pub struct Outcome {
    pub path: String,
    pub result: Result<(), Error>,
}

impl Outcome {
    pub fn ok(path: impl Into<String>) -> Self {
        Outcome {
            path: path.into(),
            result: Ok(()),
        }
    }

    pub fn err(path: impl Into<String>, error: Error) -> Self {
        Outcome {
            path: path.into(),
            result: Err(error),
        }
    }
}
