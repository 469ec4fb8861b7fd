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

use std::io;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref RESPONSE_CODE: Regex =
        Regex::new(r"^\s*\[([A-Za-z0-9-]+)[^\]]*\]").unwrap();
    static ref TRYCREATE_TEXT: Regex = Regex::new(r"(?i)trycreate").unwrap();
    static ref ALREADY_EXISTS_TEXT: Regex =
        Regex::new(r"(?i)already|exists").unwrap();
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing {0}")]
    MissingConfig(&'static str),
    #[error("Invalid tls mode {0:?}")]
    InvalidTlsMode(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    SslHandshake(#[from] openssl::ssl::Error),
    #[error(transparent)]
    Imap(::imap::error::Error),
    #[error("Failed to dial IMAP server: {0}")]
    Dial(#[source] Box<Error>),
    #[error("Failed to login: {0}")]
    Login(#[source] Box<Error>),
    #[error("imap pool connect {index}/{size}: {source}")]
    PoolConnect {
        index: usize,
        size: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("Session pool closed")]
    PoolClosed,

    /// A tagged `NO` response. The text includes any response code.
    #[error("NO {0}")]
    No(String),
    /// A tagged `BAD` response.
    #[error("BAD {0}")]
    Bad(String),
    /// The server answered `APPEND` with a tagged response instead of a
    /// continuation, so the message was never sent. The client library does
    /// not keep the response text.
    #[error("APPEND refused before upload")]
    AppendRefused,

    #[error("invalid imap path: {0:?}")]
    InvalidPath(String),
    #[error("Unsupported operation")]
    Unsupported,
    #[error("Message exceeds the {0} byte size limit")]
    MessageTooLarge(u64),
    #[error("Record has no body")]
    MissingBody,
    #[error("SELECT {mailbox:?} failed: {source}")]
    Select {
        mailbox: String,
        #[source]
        source: Box<Error>,
    },
    #[error("FETCH {mailbox:?} failed: {source}")]
    Fetch {
        mailbox: String,
        #[source]
        source: Box<Error>,
    },
    #[error("unexpected fetch response (msgs={messages} bodies={bodies})")]
    UnexpectedFetch { messages: usize, bodies: usize },
    #[error(
        "append TRYCREATE but ensure mailbox {mailbox:?} failed: \
         {create} (orig: {append})"
    )]
    TryCreate {
        mailbox: String,
        create: Box<Error>,
        append: Box<Error>,
    },

    #[error("Operation cancelled")]
    Cancelled,
    #[error("Record channel disconnected")]
    Disconnected,
    #[error("Export worker panicked")]
    WorkerPanicked,
}

impl From<::imap::error::Error> for Error {
    fn from(e: ::imap::error::Error) -> Self {
        match e {
            ::imap::error::Error::No(text) => Error::No(text),
            ::imap::error::Error::Bad(text) => Error::Bad(text),
            ::imap::error::Error::Io(e) => Error::Io(e),
            ::imap::error::Error::Append => Error::AppendRefused,
            e => Error::Imap(e),
        }
    }
}

impl Error {
    /// Whether this error leaves the connection that produced it in an
    /// unknown state, so that it must not be handed out again.
    ///
    /// Tagged `NO` and `BAD` responses mean the server processed the command
    /// and is still in sync with us. Arguments rejected by the client library
    /// were never sent at all.
    pub fn is_connection_fatal(&self) -> bool {
        match *self {
            Error::No(_)
            | Error::Bad(_)
            | Error::AppendRefused
            | Error::Cancelled => false,
            Error::Imap(::imap::error::Error::Validate(_)) => false,
            Error::Select { ref source, .. }
            | Error::Fetch { ref source, .. } => source.is_connection_fatal(),
            _ => true,
        }
    }

    /// The response code (e.g. `TRYCREATE`) of a tagged `NO`/`BAD`, if any.
    pub fn response_code(&self) -> Option<&str> {
        match *self {
            Error::No(ref text) | Error::Bad(ref text) => RESPONSE_CODE
                .captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str()),
            _ => None,
        }
    }

    /// Whether the server told us that the target of an `APPEND` does not
    /// exist and should be created first.
    ///
    /// Falls back to looking for the word in the response text for servers
    /// which put it somewhere other than the response code.
    ///
    /// A refusal before the upload carries no text. `TRYCREATE` is the usual
    /// cause, so it is treated as one; creating a mailbox that already exists
    /// is harmless and the append is only retried once.
    pub fn is_try_create(&self) -> bool {
        if let Error::AppendRefused = *self {
            return true;
        }

        match self.response_code() {
            Some(code) if code.eq_ignore_ascii_case("TRYCREATE") => true,
            _ => self.server_text().map_or(false, |text| {
                TRYCREATE_TEXT.is_match(text)
            }),
        }
    }

    /// Whether the server refused a `CREATE` because the mailbox exists.
    pub fn is_already_exists(&self) -> bool {
        match self.response_code() {
            Some(code) if code.eq_ignore_ascii_case("ALREADYEXISTS") => true,
            _ => self.server_text().map_or(false, |text| {
                ALREADY_EXISTS_TEXT.is_match(text)
            }),
        }
    }

    fn server_text(&self) -> Option<&str> {
        match *self {
            Error::No(ref text) | Error::Bad(ref text) => Some(text),
            _ => None,
        }
    }
}
