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

use serde::{Deserialize, Serialize};

use super::acl::MailboxAcl;
use super::model::{MailboxId, Username};
use crate::support::error::Error;

pub const PRIVATE_NAMESPACE: &str = "#private";
pub const INBOX: &str = "INBOX";
pub const HIERARCHY_DELIMITER: char = '/';

/// The name of a mailbox, qualified by namespace and owner.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MailboxPath {
    pub namespace: String,
    pub user: Username,
    pub name: String,
}

impl MailboxPath {
    /// Build a path in the private namespace of `user`.
    ///
    /// Fails with `UnsafeName` if any `/`-separated part of `name` is not a
    /// safe name.
    pub fn for_user(user: Username, name: &str) -> Result<Self, Error> {
        if !name.split(HIERARCHY_DELIMITER).all(is_safe_name) {
            return Err(Error::UnsafeName);
        }

        Ok(MailboxPath {
            namespace: PRIVATE_NAMESPACE.to_owned(),
            user,
            name: name.to_owned(),
        })
    }

    pub fn inbox(user: Username) -> Self {
        MailboxPath {
            namespace: PRIVATE_NAMESPACE.to_owned(),
            user,
            name: INBOX.to_owned(),
        }
    }

    pub fn is_inbox(&self) -> bool {
        self.name.eq_ignore_ascii_case(INBOX)
    }

    /// Whether `self` is a strict descendant of `parent`.
    pub fn is_child_of(&self, parent: &MailboxPath) -> bool {
        self.namespace == parent.namespace
            && self.user == parent.user
            && self.name.len() > parent.name.len()
            && self.name.starts_with(&parent.name)
            && self.name[parent.name.len()..].starts_with(HIERARCHY_DELIMITER)
    }
}

impl fmt::Display for MailboxPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.user, self.name)
    }
}

/// Whether `name` may be used as one level of a mailbox name.
///
/// Empty names, names starting with `.` or `#`, control characters and the
/// IMAP wildcards `*` and `%` are all rejected, as is `\`.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.starts_with('#')
        && !name.contains('\\')
        && !name.contains(|c| c < ' ' || c == '\x7F')
        && !name.contains(|c| c == '*' || c == '%')
}

/// A mailbox container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mailbox {
    pub id: MailboxId,
    pub path: MailboxPath,
    /// Changes whenever a mailbox with this path is recreated.
    pub uid_validity: u32,
    pub acl: MailboxAcl,
}
