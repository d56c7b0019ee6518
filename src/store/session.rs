//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailcore.
//
// Mailcore is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailcore is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailcore. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::model::Username;
use crate::support::log_prefix::LogPrefix;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    /// Acting on behalf of an authenticated user.
    User,
    /// Acting on behalf of the system itself (e.g. delivery or quota
    /// recalculation).
    System,
}

/// The context every store operation runs in.
#[derive(Clone, Debug)]
pub struct MailboxSession {
    pub id: SessionId,
    pub user: Username,
    pub kind: SessionKind,
    pub log_prefix: LogPrefix,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl MailboxSession {
    pub fn user(user: Username) -> Self {
        Self::new(user, SessionKind::User)
    }

    pub fn system(user: Username) -> Self {
        Self::new(user, SessionKind::System)
    }

    fn new(user: Username, kind: SessionKind) -> Self {
        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        let log_prefix = LogPrefix::new("store".to_owned());
        log_prefix.set_user(user.0.clone());
        log_prefix.set_session(id.0);
        MailboxSession {
            id,
            user,
            kind,
            log_prefix,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sessions_get_distinct_ids_and_prefixes() {
        let a = MailboxSession::user(Username::new("alice"));
        let b = MailboxSession::system(Username::new("alice"));
        assert_ne!(a.id, b.id);
        assert_eq!(SessionKind::System, b.kind);
        assert_eq!(
            format!("store[alice {}]", a.id),
            a.log_prefix.to_string()
        );
    }
}
