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

//! The two transfer engines and the record model they share with the backup
//! pipeline.

pub mod export;
pub mod import;
pub mod record;

use crate::imap::connector::ImapConnector;
use crate::support::config::ImapConfig;
use crate::support::error::Error;

pub use self::export::Exporter;
pub use self::import::Importer;

/// What the host needs to know about either end of a transfer.
pub trait Endpoint {
    /// The path of the root directory.
    fn root(&self) -> &str {
        "/"
    }

    /// The server address.
    fn origin(&self) -> &str;

    fn type_name(&self) -> &str {
        "imap"
    }

    /// Check that the server can be reached and logged in to.
    fn ping(&self) -> Result<(), Error>;
}

/// Build an importer for the server described by `config`.
pub fn new_importer(
    config: &ImapConfig,
) -> Result<Importer<ImapConnector>, Error> {
    config.validate()?;
    Ok(Importer::new(ImapConnector::new(config.clone())?, config))
}

/// Build an exporter for the server described by `config`.
pub fn new_exporter(
    config: &ImapConfig,
) -> Result<Exporter<ImapConnector>, Error> {
    config.validate()?;
    Ok(Exporter::new(ImapConnector::new(config.clone())?, config))
}
