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
use std::sync::Arc;

/// Text included at the start of every log statement of one engine, e.g.
/// `imap-export[azure@mail.example.com]`.
///
/// Clones share the same underlying string.
#[derive(Clone)]
pub struct LogPrefix {
    text: Arc<str>,
}

impl LogPrefix {
    pub fn new(direction: &str, user: &str, origin: &str) -> Self {
        let text = format!(
            "imap-{}[{}@{}]",
            direction,
            sanitise(user),
            sanitise(origin)
        );
        LogPrefix { text: text.into() }
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LogPrefix({})", self.text)
    }
}

fn sanitise(s: &str) -> String {
    let mut s: String = s.chars().filter(|c| !c.is_control()).collect();
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}
