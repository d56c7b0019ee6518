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
use std::sync::Arc;

use super::acl::{Rights, RightsResolver};
use super::batcher::BatchSizes;
use super::events::{Event, EventBus, RegistrationKey};
use super::hooks::PreDeletionHooks;
use super::locker::MailboxLocker;
use super::mailbox::{Mailbox, MailboxPath};
use super::mapper::{MailboxMapper, MessageMapper};
use super::model::MailboxId;
use super::quota::{QuotaManager, QuotaRoot, QuotaRootResolver};
use super::session::{MailboxSession, SessionKind};
use super::thread::ThreadIdGuesser;
use crate::support::error::Error;

/// What the managers lock.
///
/// Multi-key operations acquire in the derived order, so every path is
/// locked before every quota root, which is locked before every mailbox.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Path(MailboxPath),
    QuotaRoot(QuotaRoot),
    Mailbox(MailboxId),
}

/// The collaborators shared by the managers.
#[derive(Clone)]
pub struct StoreContext {
    pub mailboxes: Arc<dyn MailboxMapper>,
    pub messages: Arc<dyn MessageMapper>,
    pub rights: Arc<dyn RightsResolver>,
    pub quota: Arc<QuotaManager>,
    pub quota_roots: Arc<dyn QuotaRootResolver>,
    pub events: Arc<EventBus>,
    pub hooks: Arc<PreDeletionHooks>,
    pub threads: Arc<dyn ThreadIdGuesser>,
    pub locker: Arc<MailboxLocker<LockKey>>,
    pub batch_sizes: BatchSizes,
}

impl StoreContext {
    pub fn rights(&self, mailbox: &Mailbox, session: &MailboxSession) -> Rights {
        match session.kind {
            SessionKind::System => Rights::ALL,
            SessionKind::User => self.rights.rights(mailbox, &session.user),
        }
    }

    pub fn can(
        &self,
        mailbox: &Mailbox,
        session: &MailboxSession,
        needed: Rights,
    ) -> bool {
        self.rights(mailbox, session).contains(needed)
    }

    /// Fail with `PermissionDenied` unless `session` has all of `needed` on
    /// `mailbox`.
    pub fn require(
        &self,
        mailbox: &Mailbox,
        session: &MailboxSession,
        needed: Rights,
    ) -> Result<(), Error> {
        let missing = needed - self.rights(mailbox, session);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::PermissionDenied(mailbox.id, missing))
        }
    }

    /// Look up every mailbox in `ids` that exists. Missing ones are silently
    /// dropped.
    pub fn existing_mailboxes(
        &self,
        ids: impl IntoIterator<Item = MailboxId>,
    ) -> Result<BTreeMap<MailboxId, Mailbox>, Error> {
        let mut result = BTreeMap::new();
        for id in ids {
            if result.contains_key(&id) {
                continue;
            }
            if let Some(mailbox) = self.mailboxes.find_by_id(id)? {
                result.insert(id, mailbox);
            }
        }
        Ok(result)
    }

    pub fn quota_root(&self, mailbox: &Mailbox) -> QuotaRoot {
        self.quota_roots.quota_root(&mailbox.path)
    }

    /// The write-lock set of a mutation touching `mailboxes`: every mailbox,
    /// plus the quota root of each.
    pub fn mutation_lock_keys<'a>(
        &self,
        mailboxes: impl IntoIterator<Item = &'a Mailbox>,
    ) -> Vec<LockKey> {
        let mut keys = Vec::new();
        for mailbox in mailboxes {
            keys.push(LockKey::Mailbox(mailbox.id));
            keys.push(LockKey::QuotaRoot(self.quota_root(mailbox)));
        }
        keys
    }

    /// Dispatch an event about `mailbox` to its listeners and those of its
    /// owner.
    pub fn dispatch(&self, event: Event, mailbox: &Mailbox) -> Result<(), Error> {
        self.events.dispatch(
            &event,
            &[
                RegistrationKey::Mailbox(mailbox.id),
                RegistrationKey::User(mailbox.path.user.clone()),
            ],
        )
    }
}
