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

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::mailbox::Mailbox;
use super::model::{Flag, Flags, Username};
use crate::support::error::Error;

bitflags! {
    /// RFC 4314 access rights.
    #[derive(Serialize, Deserialize)]
    pub struct Rights: u16 {
        /// `l`: the mailbox is visible.
        const LOOKUP = 1 << 0;
        /// `r`: messages can be read.
        const READ = 1 << 1;
        /// `s`: `\Seen` can be kept across sessions.
        const WRITE_SEEN = 1 << 2;
        /// `w`: flags other than `\Seen` and `\Deleted` can be changed.
        const WRITE = 1 << 3;
        /// `i`: messages can be inserted.
        const INSERT = 1 << 4;
        /// `p`: messages can be posted to the mailbox.
        const POST = 1 << 5;
        /// `k`: child mailboxes can be created.
        const CREATE_MAILBOX = 1 << 6;
        /// `x`: the mailbox can be deleted or renamed.
        const DELETE_MAILBOX = 1 << 7;
        /// `t`: `\Deleted` can be changed and placements removed.
        const DELETE_MESSAGES = 1 << 8;
        /// `e`: the mailbox can be expunged.
        const EXPUNGE = 1 << 9;
        /// `a`: the ACL can be administered.
        const ADMINISTER = 1 << 10;

        const ALL = Self::LOOKUP.bits | Self::READ.bits
            | Self::WRITE_SEEN.bits | Self::WRITE.bits
            | Self::INSERT.bits | Self::POST.bits
            | Self::CREATE_MAILBOX.bits | Self::DELETE_MAILBOX.bits
            | Self::DELETE_MESSAGES.bits | Self::EXPUNGE.bits
            | Self::ADMINISTER.bits;
    }
}

const RIGHT_CHARS: &[(char, Rights)] = &[
    ('l', Rights::LOOKUP),
    ('r', Rights::READ),
    ('s', Rights::WRITE_SEEN),
    ('w', Rights::WRITE),
    ('i', Rights::INSERT),
    ('p', Rights::POST),
    ('k', Rights::CREATE_MAILBOX),
    ('x', Rights::DELETE_MAILBOX),
    ('t', Rights::DELETE_MESSAGES),
    ('e', Rights::EXPUNGE),
    ('a', Rights::ADMINISTER),
];

impl fmt::Display for Rights {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &(ch, right) in RIGHT_CHARS {
            if self.contains(right) {
                write!(f, "{}", ch)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Rights {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut rights = Rights::empty();
        for ch in s.chars() {
            let &(_, right) = RIGHT_CHARS
                .iter()
                .find(|&&(c, _)| c == ch)
                .ok_or(Error::UnsafeName)?;
            rights |= right;
        }
        Ok(rights)
    }
}

impl Rights {
    /// Drop from `flags` everything these rights do not allow to be set.
    ///
    /// `\Seen` needs `s`, `\Deleted` needs `t`, and every other flag needs
    /// `w`.
    pub fn sanitize_flags(self, flags: &Flags) -> Flags {
        flags
            .iter()
            .filter(|flag| self.contains(required_to_set(flag)))
            .cloned()
            .collect()
    }
}

fn required_to_set(flag: &Flag) -> Rights {
    match *flag {
        Flag::Seen => Rights::WRITE_SEEN,
        Flag::Deleted => Rights::DELETE_MESSAGES,
        _ => Rights::WRITE,
    }
}

/// The delegated rights of a mailbox. The owner is implicit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxAcl {
    entries: BTreeMap<Username, Rights>,
}

impl MailboxAcl {
    pub fn get(&self, user: &Username) -> Rights {
        self.entries.get(user).copied().unwrap_or_else(Rights::empty)
    }

    /// Set the rights of `user`. Empty rights remove the entry.
    pub fn set(&mut self, user: Username, rights: Rights) {
        if rights.is_empty() {
            self.entries.remove(&user);
        } else {
            self.entries.insert(user, rights);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Username, Rights)> + '_ {
        self.entries.iter().map(|(u, &r)| (u, r))
    }
}

/// Determines the effective rights of a user on a mailbox.
pub trait RightsResolver: Send + Sync {
    fn rights(&self, mailbox: &Mailbox, user: &Username) -> Rights;
}

/// The owner of a mailbox has every right; everybody else has exactly what
/// the ACL grants them.
#[derive(Clone, Copy, Debug, Default)]
pub struct OwnerAclRightsResolver;

impl RightsResolver for OwnerAclRightsResolver {
    fn rights(&self, mailbox: &Mailbox, user: &Username) -> Rights {
        if mailbox.path.user == *user {
            Rights::ALL
        } else {
            mailbox.acl.get(user)
        }
    }
}
