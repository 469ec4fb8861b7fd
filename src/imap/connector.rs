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

//! Real connections, built on the `imap` crate.
//!
//! TLS is done with OpenSSL here rather than through the client library, so
//! the client only ever sees an already-secured byte stream. `STARTTLS` is
//! therefore negotiated by hand before the client is constructed.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use ::imap::types::NameAttribute;
use chrono::prelude::*;
use log::{debug, warn};
use openssl::ssl::{
    HandshakeError, SslConnector, SslMethod, SslStream, SslVerifyMode,
};

use super::session::{Connect, MailboxInfo, MessageMeta, Session};
use crate::support::config::{ImapConfig, TlsMode};
use crate::support::error::Error;

/// How long to wait for the TCP connection itself.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Socket timeout for individual reads and writes.
///
/// Idle pooled connections are not affected since nothing reads from them.
const IO_TIMEOUT: Duration = Duration::from_secs(120);
/// Longest line we accept while negotiating `STARTTLS`.
const MAX_PREAMBLE_LINE: usize = 8192;
const STARTTLS_TAG: &str = "S0";

/// The byte stream underneath a session.
pub enum Transport {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl Read for Transport {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match *self {
            Transport::Plain(ref mut s) => s.read(dst),
            Transport::Tls(ref mut s) => s.read(dst),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        match *self {
            Transport::Plain(ref mut s) => s.write(src),
            Transport::Tls(ref mut s) => s.write(src),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Transport::Plain(ref mut s) => s.flush(),
            Transport::Tls(ref mut s) => s.flush(),
        }
    }
}

/// Produces authenticated sessions against the server named by an
/// `ImapConfig`.
#[derive(Debug)]
pub struct ImapConnector {
    config: ImapConfig,
    host: String,
    port: u16,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Result<Self, Error> {
        let (host, port) = config.host_and_port()?;
        let host = host.to_owned();
        Ok(ImapConnector { config, host, port })
    }

    pub fn config(&self) -> &ImapConfig {
        &self.config
    }

    fn dial(&self) -> Result<::imap::Client<Transport>, Error> {
        let tcp = self.connect_tcp()?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))?;

        match self.config.tls {
            TlsMode::NoTls => {
                let mut client = ::imap::Client::new(Transport::Plain(tcp));
                client.read_greeting()?;
                Ok(client)
            },

            TlsMode::Tls => {
                let ssl = self.handshake(tcp)?;
                let mut client = ::imap::Client::new(Transport::Tls(ssl));
                client.read_greeting()?;
                Ok(client)
            },

            TlsMode::StartTls => {
                let mut tcp = tcp;
                let greeting = read_preamble_line(&mut tcp)?;
                if !greeting.starts_with("* OK") {
                    return Err(Error::Bad(format!(
                        "Unexpected greeting: {}",
                        greeting
                    )));
                }

                write!(tcp, "{} STARTTLS\r\n", STARTTLS_TAG)?;
                tcp.flush()?;
                let tagged = loop {
                    let line = read_preamble_line(&mut tcp)?;
                    if line.starts_with(STARTTLS_TAG)
                        && line[STARTTLS_TAG.len()..].starts_with(' ')
                    {
                        break line;
                    }
                };

                let status = tagged[STARTTLS_TAG.len() + 1..].trim_start();
                if !status.starts_with("OK") {
                    return Err(Error::No(format!(
                        "STARTTLS refused: {}",
                        status
                    )));
                }

                // The server sends no new greeting after the upgrade
                let ssl = self.handshake(tcp)?;
                Ok(::imap::Client::new(Transport::Tls(ssl)))
            },
        }
    }

    /// Connect to the first address of the host that accepts within
    /// `CONNECT_TIMEOUT`.
    fn connect_tcp(&self) -> Result<TcpStream, Error> {
        let mut last_error = None;
        for addr in (&self.host as &str, self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => last_error = Some(e),
            }
        }

        Err(Error::Io(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} has no addresses", self.host),
            )
        })))
    }

    fn handshake(
        &self,
        tcp: TcpStream,
    ) -> Result<SslStream<TcpStream>, Error> {
        let mut connector = SslConnector::builder(SslMethod::tls())?;
        if self.config.tls_no_verify {
            connector.set_verify(SslVerifyMode::NONE);
        }

        connector
            .build()
            .connect(&self.host, tcp)
            .map_err(|e| match e {
                HandshakeError::SetupFailure(es) => Error::Ssl(es),
                HandshakeError::Failure(f) => Error::SslHandshake(f.into_error()),
                HandshakeError::WouldBlock(f) => {
                    Error::SslHandshake(f.into_error())
                },
            })
    }
}

impl Connect for ImapConnector {
    type Session = ImapSession;

    fn connect(&self) -> Result<ImapSession, Error> {
        let client = self.dial().map_err(|e| Error::Dial(Box::new(e)))?;
        let session = client
            .login(&self.config.username, &self.config.password)
            .map_err(|(e, _)| Error::Login(Box::new(e.into())))?;

        debug!(
            "Logged in to {}:{} as {}",
            self.host, self.port, self.config.username
        );
        Ok(ImapSession { session })
    }

    fn address(&self) -> &str {
        self.config.address()
    }

    fn username(&self) -> &str {
        &self.config.username
    }
}

/// Read one CRLF-terminated line directly from the socket.
///
/// This reads a byte at a time so that nothing past the line is consumed;
/// everything after the `STARTTLS` response belongs to the TLS handshake.
fn read_preamble_line(tcp: &mut TcpStream) -> Result<String, Error> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\r\n") {
        if 0 == tcp.read(&mut byte)? {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed before STARTTLS completed",
            )));
        }

        line.push(byte[0]);
        if line.len() > MAX_PREAMBLE_LINE {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "Line too long before STARTTLS",
            )));
        }
    }

    line.truncate(line.len() - 2);
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// A logged-in connection.
pub struct ImapSession {
    session: ::imap::Session<Transport>,
}

impl Session for ImapSession {
    fn noop(&mut self) -> Result<(), Error> {
        self.session.noop()?;
        Ok(())
    }

    fn select(&mut self, mailbox: &str, read_only: bool) -> Result<u32, Error> {
        let mailbox = if read_only {
            self.session.examine(mailbox)?
        } else {
            self.session.select(mailbox)?
        };
        Ok(mailbox.exists)
    }

    fn create(&mut self, mailbox: &str) -> Result<(), Error> {
        self.session.create(mailbox)?;
        Ok(())
    }

    fn list(&mut self, pattern: &str) -> Result<Vec<MailboxInfo>, Error> {
        let names = self.session.list(Some(""), Some(pattern))?;
        Ok(names
            .iter()
            .map(|name| MailboxInfo {
                name: name.name().to_owned(),
                delimiter: name.delimiter().and_then(|d| d.chars().next()),
                selectable: !name.attributes().iter().any(is_unselectable),
            })
            .collect())
    }

    fn delimiter(&mut self) -> Result<Option<char>, Error> {
        let names = self.session.list(Some(""), None)?;
        Ok(names
            .iter()
            .filter_map(|name| name.delimiter())
            .filter_map(|d| d.chars().next())
            .next())
    }

    fn append(
        &mut self,
        mailbox: &str,
        message: &[u8],
        internal_date: DateTime<FixedOffset>,
    ) -> Result<(), Error> {
        // The client puts the name between quotes as-is.
        let mailbox = quote_inner(mailbox)?;
        self.session.append_with_flags_and_date(
            &mailbox,
            message,
            &[],
            Some(internal_date),
        )?;
        Ok(())
    }

    fn fetch_metadata(
        &mut self,
        count: u32,
    ) -> Result<Vec<MessageMeta>, Error> {
        if 0 == count {
            return Ok(Vec::new());
        }

        let fetches = self.session.fetch(
            format!("1:{}", count),
            "(UID INTERNALDATE RFC822.SIZE ENVELOPE)",
        )?;
        Ok(fetches
            .iter()
            .map(|fetch| MessageMeta {
                uid: fetch.uid.unwrap_or(0),
                internal_date: fetch.internal_date(),
                size: fetch.size,
                subject: fetch
                    .envelope()
                    .and_then(|env| env.subject.as_ref())
                    .map(|subject| subject.to_vec()),
            })
            .collect())
    }

    fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>, Error> {
        let fetches = self.session.uid_fetch(uid.to_string(), "BODY.PEEK[]")?;
        // Servers may interleave unsolicited FETCH responses (e.g. flag
        // changes), so only count the ones that carry a body.
        let mut bodies = fetches.iter().filter_map(|fetch| fetch.body());
        match (bodies.next(), bodies.next()) {
            (Some(body), None) => Ok(body.to_vec()),
            (first, _) => {
                let bodies = fetches
                    .iter()
                    .filter(|fetch| fetch.body().is_some())
                    .count();
                if first.is_none() {
                    warn!("UID FETCH {} returned no body", uid);
                }
                Err(Error::UnexpectedFetch {
                    messages: fetches.len(),
                    bodies,
                })
            },
        }
    }

    fn logout(&mut self) -> Result<(), Error> {
        self.session.logout()?;
        Ok(())
    }
}

/// Escape `mailbox` for use inside a quoted string.
///
/// CR and LF cannot be quoted at all and are rejected the same way the
/// client rejects them for other commands.
fn quote_inner(mailbox: &str) -> Result<String, Error> {
    let mut quoted = String::with_capacity(mailbox.len());
    for ch in mailbox.chars() {
        match ch {
            '\r' | '\n' => {
                return Err(Error::Imap(::imap::error::Error::Validate(
                    ::imap::error::ValidateError(ch),
                )))
            },
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(ch);
            },
            ch => quoted.push(ch),
        }
    }
    Ok(quoted)
}

fn is_unselectable(attribute: &NameAttribute<'_>) -> bool {
    match *attribute {
        NameAttribute::NoSelect => true,
        NameAttribute::Custom(ref custom) => {
            custom.eq_ignore_ascii_case("\\NonExistent")
        },
        _ => false,
    }
}
