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

//! The persistence abstraction.
//!
//! A backend implements these traits; the managers never touch storage any
//! other way. The backend need not serialise anything itself beyond keeping
//! each call atomic: the managers only allocate UIDs and MOD-SEQs and only
//! mutate placements of a mailbox while holding that mailbox's write lock.

use std::collections::BTreeSet;

use super::acl::MailboxAcl;
use super::mailbox::{Mailbox, MailboxPath};
use super::model::*;
use crate::support::error::Error;

pub trait MailboxMapper: Send + Sync {
    /// Create a new, empty mailbox.
    ///
    /// Fails with `MailboxExists` if `path` is taken.
    fn create(&self, path: MailboxPath) -> Result<Mailbox, Error>;
    fn find_by_id(&self, id: MailboxId) -> Result<Option<Mailbox>, Error>;
    fn find_by_path(
        &self,
        path: &MailboxPath,
    ) -> Result<Option<Mailbox>, Error>;
    /// Fails with `MailboxExists` if `new_path` is taken, or `NxMailbox` if
    /// `id` does not exist.
    fn rename(&self, id: MailboxId, new_path: MailboxPath)
        -> Result<(), Error>;
    fn set_acl(&self, id: MailboxId, acl: MailboxAcl) -> Result<(), Error>;
    /// Remove the mailbox itself. Its placements must already be gone.
    fn delete(&self, id: MailboxId) -> Result<(), Error>;
    /// All mailboxes owned by `user`, ordered by path.
    fn list(&self, user: &Username) -> Result<Vec<Mailbox>, Error>;
}

pub trait MessageMapper: Send + Sync {
    fn generate_message_id(&self) -> MessageId;

    /// Every placement of every message in `ids`, ordered by message then
    /// mailbox.
    fn find(&self, ids: &[MessageId]) -> Result<Vec<MailboxMessage>, Error>;
    /// The placements in `mailbox` whose UIDs fall in `range`, by UID.
    fn find_in_mailbox(
        &self,
        mailbox: MailboxId,
        range: MessageRange,
    ) -> Result<Vec<MailboxMessage>, Error>;
    /// Every placement of messages of `thread_id`.
    fn find_by_thread(
        &self,
        thread_id: ThreadId,
    ) -> Result<Vec<MailboxMessage>, Error>;
    fn list_uids(&self, mailbox: MailboxId) -> Result<Vec<Uid>, Error>;
    /// Placement count and total size of `mailbox`.
    fn usage(&self, mailbox: MailboxId) -> Result<(u64, u64), Error>;

    /// Allocate the next UID of `mailbox`.
    ///
    /// Successive calls for one mailbox return strictly increasing values,
    /// whether or not the previous values were used.
    fn next_uid(&self, mailbox: MailboxId) -> Result<Uid, Error>;
    /// Allocate the next MOD-SEQ of `mailbox`, with the same guarantees as
    /// `next_uid()`.
    fn next_modseq(&self, mailbox: MailboxId) -> Result<Modseq, Error>;

    /// Store a new placement.
    fn save(&self, message: MailboxMessage) -> Result<(), Error>;
    /// Replace the flags and MOD-SEQ of an existing placement.
    fn update_flags(
        &self,
        mailbox: MailboxId,
        id: MessageId,
        flags: Flags,
        modseq: Modseq,
    ) -> Result<(), Error>;
    /// Remove the placements of `id` in `mailboxes`. Missing placements are
    /// ignored.
    fn delete(
        &self,
        id: MessageId,
        mailboxes: &BTreeSet<MailboxId>,
    ) -> Result<(), Error>;

    fn applicable_flags(&self, mailbox: MailboxId) -> Result<Flags, Error>;
    /// Merge the user flags of `flags` into the applicable flags of
    /// `mailbox`.
    fn add_applicable_flags(
        &self,
        mailbox: MailboxId,
        flags: &Flags,
    ) -> Result<(), Error>;
}

/// The correlation data the thread resolver keeps about one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadEntry {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub mime_message_ids: BTreeSet<MimeMessageId>,
    pub base_subject: Option<String>,
}

pub trait ThreadMapper: Send + Sync {
    fn save_thread_data(
        &self,
        user: &Username,
        entry: ThreadEntry,
    ) -> Result<(), Error>;

    /// The entries of `user` sharing at least one id with `mime_message_ids`,
    /// oldest first.
    fn find_related(
        &self,
        user: &Username,
        mime_message_ids: &BTreeSet<MimeMessageId>,
    ) -> Result<Vec<ThreadEntry>, Error>;

    /// Forget the correlation data of `message_id`.
    fn delete_thread_data(
        &self,
        user: &Username,
        message_id: MessageId,
    ) -> Result<(), Error>;
}
