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

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::Error;

pub const DEFAULT_POOL_SIZE: usize = 5;

/// How the connection to the server is secured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum TlsMode {
    /// Plain text for the whole session.
    #[serde(rename = "no-tls")]
    NoTls,
    /// Connect in plain text, then upgrade with `STARTTLS` before logging in.
    #[serde(rename = "starttls")]
    StartTls,
    /// TLS from the first byte.
    #[serde(rename = "tls")]
    Tls,
}

impl Default for TlsMode {
    fn default() -> Self {
        TlsMode::StartTls
    }
}

impl TlsMode {
    pub fn default_port(self) -> u16 {
        match self {
            TlsMode::Tls => 993,
            TlsMode::NoTls | TlsMode::StartTls => 143,
        }
    }
}

impl FromStr for TlsMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "no-tls" => Ok(TlsMode::NoTls),
            "starttls" => Ok(TlsMode::StartTls),
            "tls" => Ok(TlsMode::Tls),
            s => Err(Error::InvalidTlsMode(s.to_owned())),
        }
    }
}

/// Everything needed to reach and authenticate against one IMAP server, plus
/// the tuning knobs of the transfer engines.
///
/// The host normally hands us a flat string map (see `from_map`); the same
/// structure can also be read from a TOML document.
#[derive(Clone, Deserialize, Serialize)]
pub struct ImapConfig {
    /// `host`, `host:port` or `imap://host:port`.
    pub location: String,
    pub username: String,
    pub password: String,

    #[serde(default)]
    pub tls: TlsMode,

    /// If true, the server certificate is not verified.
    ///
    /// Only useful for test servers with self-signed certificates.
    #[serde(default)]
    pub tls_no_verify: bool,

    /// The number of connections each engine keeps in its pool.
    ///
    /// This is also the number of messages the exporter appends in parallel.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// If set, exported messages larger than this many bytes are rejected
    /// instead of being buffered.
    #[serde(default)]
    pub max_message_size: Option<u64>,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

impl ImapConfig {
    /// Build a configuration from the host's key-value map.
    ///
    /// Recognised keys are `location`, `username`, `password`, `tls`,
    /// `tls_no_verify`, `pool_size` and `max_message_size`; anything else is
    /// ignored.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, Error> {
        let location = map.get("location").cloned().unwrap_or_default();
        let username = map
            .get("username")
            .cloned()
            .ok_or(Error::MissingConfig("username"))?;
        let password = map
            .get("password")
            .cloned()
            .ok_or(Error::MissingConfig("password"))?;
        let tls = match map.get("tls") {
            Some(mode) => mode.parse()?,
            None => TlsMode::default(),
        };
        let tls_no_verify =
            map.get("tls_no_verify").map_or(false, |v| "true" == v);
        let pool_size = match map.get("pool_size") {
            Some(n) => n.parse().map_err(|_| {
                Error::InvalidConfig(format!("bad pool_size {:?}", n))
            })?,
            None => DEFAULT_POOL_SIZE,
        };
        let max_message_size = match map.get("max_message_size") {
            Some(n) => Some(n.parse().map_err(|_| {
                Error::InvalidConfig(format!("bad max_message_size {:?}", n))
            })?),
            None => None,
        };

        let config = ImapConfig {
            location,
            username,
            password,
            tls,
            tls_no_verify,
            pool_size,
            max_message_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let config: ImapConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.location.trim().is_empty() {
            return Err(Error::MissingConfig("location"));
        }
        if 0 == self.pool_size {
            return Err(Error::InvalidConfig(
                "pool_size must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// The location with any `imap://` prefix and trailing slash removed.
    pub fn address(&self) -> &str {
        let location = self.location.trim();
        let location = if location.starts_with("imap://") {
            &location["imap://".len()..]
        } else {
            location
        };
        location.trim_end_matches('/')
    }

    /// Split `address()` into host name and port, filling in the default
    /// port for the TLS mode.
    pub fn host_and_port(&self) -> Result<(&str, u16), Error> {
        let address = self.address();
        let bad = || Error::InvalidConfig(format!("bad location {:?}", address));

        // [v6addr]:port or [v6addr]
        if address.starts_with('[') {
            let close = address.find(']').ok_or_else(bad)?;
            let host = &address[1..close];
            let rest = &address[close + 1..];
            if rest.is_empty() {
                return Ok((host, self.tls.default_port()));
            }
            if !rest.starts_with(':') {
                return Err(bad());
            }
            let port = rest[1..].parse().map_err(|_| bad())?;
            return Ok((host, port));
        }

        match address.rfind(':') {
            // A bare IPv6 address has more than one colon
            Some(ix) if address[..ix].find(':').is_none() => {
                let port = address[ix + 1..].parse().map_err(|_| bad())?;
                Ok((&address[..ix], port))
            },
            _ => Ok((address, self.tls.default_port())),
        }
    }
}

impl fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ImapConfig")
            .field("location", &self.location)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tls", &self.tls)
            .field("tls_no_verify", &self.tls_no_verify)
            .field("pool_size", &self.pool_size)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}
