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

//! Operations on messages by identity, across mailboxes.
//!
//! A message lives in zero or more mailboxes at once; each such presence is
//! a placement with its own UID, MOD-SEQ and flags. The operations here
//! change which mailboxes hold a message, or change the flags of its
//! placements, without the caller knowing (or caring about) UIDs.
//!
//! Every mutation follows the same shape. The mailboxes involved are looked
//! up and the session's rights on them checked; the write locks of all the
//! mailboxes and of their quota roots are acquired together, in key order;
//! the placements are re-read under the locks; quota is checked; hooks run
//! if anything is to be removed; the change is applied through the mappers;
//! and finally the events are dispatched, still under the locks.
//! Once a change is applied, every one of its events is dispatched even if a
//! listener fails; the first failure is returned afterwards.
//!
//! A message id that has no placement the session can see is treated as
//! absent. Mutations on absent messages or nonexistent mailboxes do nothing;
//! they are never errors.

use std::collections::{BTreeMap, BTreeSet};

use log::info;

use super::acl::Rights;
use super::context::{LockKey, StoreContext};
use super::events::*;
use super::flags::{FlagsUpdateCalculator, UpdatedFlags};
use super::hooks::{DeleteOperation, MessageDeletionMetadata};
use super::locker::LockType;
use super::mailbox::Mailbox;
use super::model::*;
use super::quota::QuotaRoot;
use super::session::MailboxSession;
use crate::support::error::Error;

pub struct MessageIdManager {
    ctx: StoreContext,
}

/// The placements of one message, paired with their mailboxes.
type Placements = BTreeMap<MailboxId, (Mailbox, MailboxMessage)>;

impl MessageIdManager {
    pub fn new(ctx: StoreContext) -> Self {
        MessageIdManager { ctx }
    }

    /// Fetch every placement of `ids` the session may read.
    ///
    /// Ids with no such placement are silently omitted.
    pub fn get_messages(
        &self,
        ids: &[MessageId],
        fetch_group: FetchGroup,
        session: &MailboxSession,
    ) -> Result<Vec<MessageResult>, Error> {
        Ok(self
            .readable_placements(ids, session)?
            .iter()
            .map(|&(_, ref message)| MessageResult::of(message, fetch_group))
            .collect())
    }

    /// The subset of `ids` with at least one placement the session may read.
    pub fn accessible_messages(
        &self,
        ids: &[MessageId],
        session: &MailboxSession,
    ) -> Result<BTreeSet<MessageId>, Error> {
        Ok(self
            .readable_placements(ids, session)?
            .iter()
            .map(|&(_, ref message)| message.message_id)
            .collect())
    }

    /// Apply a flag update to the placements of `id` in `mailbox_ids`.
    ///
    /// Mailboxes which do not exist or do not hold the message are skipped.
    /// Placements whose flags end up unchanged keep their MOD-SEQ and
    /// produce no event. Returns the changed placements.
    pub fn set_flags(
        &self,
        flags: Flags,
        mode: FlagsUpdateMode,
        id: MessageId,
        mailbox_ids: &[MailboxId],
        session: &MailboxSession,
    ) -> Result<BTreeMap<MailboxId, UpdatedFlags>, Error> {
        let mailboxes =
            self.ctx.existing_mailboxes(mailbox_ids.iter().copied())?;
        for mailbox in mailboxes.values() {
            self.ctx.require(mailbox, session, Rights::WRITE)?;
        }

        let _guards = self.ctx.locker.lock_all(
            mailboxes.keys().map(|&id| LockKey::Mailbox(id)),
            LockType::Write,
        )?;

        let calculator = FlagsUpdateCalculator::new(flags, mode);
        let mut updates = BTreeMap::new();
        for message in self.ctx.messages.find(&[id])? {
            let mailbox = match mailboxes.get(&message.mailbox_id) {
                Some(mailbox) => mailbox,
                None => continue,
            };

            let new_flags = calculator.build_new_flags(&message.flags);
            if new_flags == message.flags {
                continue;
            }

            let modseq = self.ctx.messages.next_modseq(mailbox.id)?;
            self.ctx.messages.update_flags(
                mailbox.id,
                id,
                new_flags.clone(),
                modseq,
            )?;
            self.ctx
                .messages
                .add_applicable_flags(mailbox.id, &new_flags)?;

            updates.insert(
                mailbox.id,
                UpdatedFlags {
                    message_id: id,
                    uid: message.uid,
                    modseq,
                    old_flags: message.flags,
                    new_flags,
                },
            );
        }

        let mut delivery = Delivery::new();
        for (mailbox_id, updated) in &updates {
            if let Some(mailbox) = mailboxes.get(mailbox_id) {
                delivery.record(self.ctx.dispatch(
                    Event::FlagsUpdated(FlagsUpdated {
                        session_id: session.id,
                        user: session.user.clone(),
                        mailbox_id: mailbox.id,
                        path: mailbox.path.clone(),
                        updated: vec![updated.clone()],
                    }),
                    mailbox,
                ));
            }
        }
        delivery.finish()?;

        Ok(updates)
    }

    /// Make `id` present in exactly the existing mailboxes among
    /// `target_ids`.
    ///
    /// Placements already in a target mailbox are left untouched. New
    /// placements get a fresh UID and MOD-SEQ from their mailbox and the
    /// flags of the visible placement in the lowest-numbered mailbox.
    /// Placements the session can see outside the targets are removed.
    /// Quota is checked on the net change of each quota root first; if it
    /// fails, nothing changes.
    pub fn set_in_mailboxes(
        &self,
        id: MessageId,
        target_ids: &[MailboxId],
        session: &MailboxSession,
    ) -> Result<(), Error> {
        let targets = self.ctx.existing_mailboxes(target_ids.iter().copied())?;

        let (_guards, placements, targets) = loop {
            let snapshot = self.placements(id)?;
            if snapshot.is_empty() {
                return Ok(());
            }

            let keys = self.ctx.mutation_lock_keys(
                snapshot
                    .values()
                    .map(|&(ref mailbox, _)| mailbox)
                    .chain(targets.values()),
            );
            let guards = self.ctx.locker.lock_all(keys, LockType::Write)?;

            // Targets deleted before we got their locks are no longer
            // targets. The message may have gained placements between the
            // snapshot and locking; those mailboxes are not locked yet.
            let locked_targets =
                self.ctx.existing_mailboxes(targets.keys().copied())?;
            let placements = self.placements(id)?;
            if placements.keys().all(|k| snapshot.contains_key(k)) {
                break (guards, placements, locked_targets);
            }
        };

        let visible: Placements = placements
            .iter()
            .filter(|&(_, &(ref mailbox, _))| {
                self.ctx.can(mailbox, session, Rights::READ)
            })
            .map(|(&k, v)| (k, v.clone()))
            .collect();
        let source = match visible.values().next() {
            Some(&(_, ref message)) => message.clone(),
            None => return Ok(()),
        };

        let to_add: Vec<&Mailbox> = targets
            .values()
            .filter(|mailbox| !placements.contains_key(&mailbox.id))
            .collect();
        let to_remove: Vec<&(Mailbox, MailboxMessage)> = visible
            .values()
            .filter(|&&(ref mailbox, _)| !targets.contains_key(&mailbox.id))
            .collect();
        if to_add.is_empty() && to_remove.is_empty() {
            return Ok(());
        }

        for mailbox in &to_add {
            self.ctx.require(mailbox, session, Rights::INSERT)?;
        }
        for &&(ref mailbox, _) in &to_remove {
            self.ctx.require(mailbox, session, Rights::DELETE_MESSAGES)?;
        }

        let mut net_change = BTreeMap::<QuotaRoot, i64>::new();
        for mailbox in &to_add {
            *net_change.entry(self.ctx.quota_root(mailbox)).or_insert(0) += 1;
        }
        for &&(ref mailbox, _) in &to_remove {
            *net_change.entry(self.ctx.quota_root(mailbox)).or_insert(0) -= 1;
        }
        for (root, &count) in &net_change {
            let size = i64::try_from(source.size)
                .unwrap_or(i64::MAX)
                .saturating_mul(count);
            self.ctx.quota.check_can_add(root, count, size)?;
        }

        self.ctx.hooks.run_hooks(&DeleteOperation {
            session_id: session.id,
            user: session.user.clone(),
            deletions: to_remove
                .iter()
                .map(|&&(ref mailbox, ref message)| MessageDeletionMetadata {
                    mailbox_id: mailbox.id,
                    metadata: message.metadata(),
                })
                .collect(),
        })?;

        let mut added = Vec::with_capacity(to_add.len());
        for mailbox in &to_add {
            let flags = self
                .ctx
                .rights(mailbox, session)
                .sanitize_flags(&source.flags);
            let copy = source.copy_to(
                mailbox.id,
                self.ctx.messages.next_uid(mailbox.id)?,
                self.ctx.messages.next_modseq(mailbox.id)?,
                flags,
            );
            self.ctx.messages.save(copy.clone())?;
            self.ctx
                .messages
                .add_applicable_flags(mailbox.id, &copy.flags)?;
            added.push((*mailbox, copy));
        }

        let removed_ids: BTreeSet<MailboxId> = to_remove
            .iter()
            .map(|&&(ref mailbox, _)| mailbox.id)
            .collect();
        if !removed_ids.is_empty() {
            self.ctx.messages.delete(id, &removed_ids)?;
        }

        info!(
            "{} Message {} added to {:?}, removed from {:?}",
            session.log_prefix,
            id,
            added.iter().map(|&(m, _)| m.id).collect::<Vec<_>>(),
            removed_ids
        );

        let mut delivery = Delivery::new();
        for &(mailbox, ref copy) in &added {
            delivery.record(self.ctx.dispatch(
                Event::Added(Added {
                    session_id: session.id,
                    user: session.user.clone(),
                    mailbox_id: mailbox.id,
                    path: mailbox.path.clone(),
                    added: single(copy),
                    is_append: false,
                }),
                mailbox,
            ));
        }
        for &&(ref mailbox, ref message) in &to_remove {
            delivery.record(self.ctx.dispatch(
                expunged(session, mailbox, single(message)),
                mailbox,
            ));
        }

        let previous_mailboxes: BTreeSet<MailboxId> =
            placements.keys().copied().collect();
        let target_mailboxes: BTreeSet<MailboxId> = previous_mailboxes
            .iter()
            .copied()
            .filter(|id| !removed_ids.contains(id))
            .chain(added.iter().map(|&(m, _)| m.id))
            .collect();
        let mut keys: Vec<RegistrationKey> = previous_mailboxes
            .union(&target_mailboxes)
            .map(|&id| RegistrationKey::Mailbox(id))
            .collect();
        keys.push(RegistrationKey::User(session.user.clone()));
        delivery.record(self.ctx.events.dispatch(
            &Event::MessageMoved(MessageMoved {
                session_id: session.id,
                user: session.user.clone(),
                message_id: id,
                previous_mailboxes,
                target_mailboxes,
            }),
            &keys,
        ));
        delivery.finish()
    }

    /// Remove the placements of `id` in `mailbox_ids`.
    ///
    /// Missing mailboxes and placements are ignored.
    pub fn delete(
        &self,
        id: MessageId,
        mailbox_ids: &[MailboxId],
        session: &MailboxSession,
    ) -> Result<(), Error> {
        let mailboxes =
            self.ctx.existing_mailboxes(mailbox_ids.iter().copied())?;
        self.delete_in(&[id], &mailboxes, session).map(|_| ())
    }

    /// Remove every placement the session can see of every message in
    /// `ids`.
    pub fn delete_messages(
        &self,
        ids: &[MessageId],
        session: &MailboxSession,
    ) -> Result<DeleteResult, Error> {
        let mailboxes = self.ctx.existing_mailboxes(
            self.ctx
                .messages
                .find(ids)?
                .into_iter()
                .map(|m| m.mailbox_id),
        )?;
        let destroyed = self.delete_in(ids, &mailboxes, session)?;

        let not_found = ids
            .iter()
            .copied()
            .filter(|id| !destroyed.contains(id))
            .collect();
        Ok(DeleteResult {
            destroyed,
            not_found,
        })
    }

    /// Delete the placements of `ids` within `mailboxes`, returning the ids
    /// that lost at least one placement.
    fn delete_in(
        &self,
        ids: &[MessageId],
        mailboxes: &BTreeMap<MailboxId, Mailbox>,
        session: &MailboxSession,
    ) -> Result<BTreeSet<MessageId>, Error> {
        let _guards = self.ctx.locker.lock_all(
            self.ctx.mutation_lock_keys(mailboxes.values()),
            LockType::Write,
        )?;

        let doomed: Vec<(&Mailbox, MailboxMessage)> = self
            .ctx
            .messages
            .find(ids)?
            .into_iter()
            .filter_map(|m| mailboxes.get(&m.mailbox_id).map(|mb| (mb, m)))
            .filter(|&(mailbox, _)| self.ctx.can(mailbox, session, Rights::READ))
            .collect();
        if doomed.is_empty() {
            return Ok(BTreeSet::new());
        }

        for &(mailbox, _) in &doomed {
            self.ctx.require(mailbox, session, Rights::DELETE_MESSAGES)?;
        }

        self.ctx.hooks.run_hooks(&DeleteOperation {
            session_id: session.id,
            user: session.user.clone(),
            deletions: doomed
                .iter()
                .map(|&(mailbox, ref message)| MessageDeletionMetadata {
                    mailbox_id: mailbox.id,
                    metadata: message.metadata(),
                })
                .collect(),
        })?;

        let mut by_message = BTreeMap::<MessageId, BTreeSet<MailboxId>>::new();
        let mut by_mailbox =
            BTreeMap::<MailboxId, BTreeMap<Uid, MessageMetadata>>::new();
        for &(mailbox, ref message) in &doomed {
            by_message
                .entry(message.message_id)
                .or_default()
                .insert(mailbox.id);
            by_mailbox
                .entry(mailbox.id)
                .or_default()
                .insert(message.uid, message.metadata());
        }
        for (&id, mailbox_ids) in &by_message {
            self.ctx.messages.delete(id, mailbox_ids)?;
        }

        info!(
            "{} Deleted {} placements of {} messages",
            session.log_prefix,
            doomed.len(),
            by_message.len()
        );

        let mut delivery = Delivery::new();
        for (mailbox_id, metadata) in by_mailbox {
            if let Some(mailbox) = mailboxes.get(&mailbox_id) {
                delivery.record(
                    self.ctx
                        .dispatch(expunged(session, mailbox, metadata), mailbox),
                );
            }
        }
        delivery.finish()?;

        Ok(by_message.into_iter().map(|(id, _)| id).collect())
    }

    /// The messages of `thread_id` the session may read, oldest first.
    ///
    /// Fails with `NxThread` if the thread has no messages at all.
    pub fn message_ids_in_thread(
        &self,
        thread_id: ThreadId,
        session: &MailboxSession,
    ) -> Result<Vec<MessageId>, Error> {
        let ids = self.ctx.threads.message_ids_in_thread(thread_id, session)?;
        let accessible = self.accessible_messages(&ids, session)?;
        Ok(ids.into_iter().filter(|id| accessible.contains(id)).collect())
    }

    /// All current placements of `id`, by mailbox. Placements whose mailbox
    /// vanished concurrently are omitted.
    fn placements(&self, id: MessageId) -> Result<Placements, Error> {
        let messages = self.ctx.messages.find(&[id])?;
        let mailboxes = self
            .ctx
            .existing_mailboxes(messages.iter().map(|m| m.mailbox_id))?;
        Ok(messages
            .into_iter()
            .filter_map(|m| {
                mailboxes
                    .get(&m.mailbox_id)
                    .map(|mb| (m.mailbox_id, (mb.clone(), m)))
            })
            .collect())
    }

    fn readable_placements(
        &self,
        ids: &[MessageId],
        session: &MailboxSession,
    ) -> Result<Vec<(Mailbox, MailboxMessage)>, Error> {
        let messages = self.ctx.messages.find(ids)?;
        let mailboxes = self
            .ctx
            .existing_mailboxes(messages.iter().map(|m| m.mailbox_id))?;
        Ok(messages
            .into_iter()
            .filter_map(|m| {
                mailboxes.get(&m.mailbox_id).map(|mb| (mb.clone(), m))
            })
            .filter(|&(ref mailbox, _)| {
                self.ctx.can(mailbox, session, Rights::READ)
            })
            .collect())
    }
}

fn single(message: &MailboxMessage) -> BTreeMap<Uid, MessageMetadata> {
    let mut map = BTreeMap::new();
    map.insert(message.uid, message.metadata());
    map
}

fn expunged(
    session: &MailboxSession,
    mailbox: &Mailbox,
    expunged: BTreeMap<Uid, MessageMetadata>,
) -> Event {
    Event::Expunged(Expunged {
        session_id: session.id,
        user: session.user.clone(),
        mailbox_id: mailbox.id,
        path: mailbox.path.clone(),
        expunged,
    })
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use rayon::prelude::*;

    use super::*;
    use crate::store::test_prelude::*;

    fn flags(f: &[Flag]) -> Flags {
        f.iter().cloned().collect()
    }

    fn placements_of(
        setup: &TestSetup,
        id: MessageId,
    ) -> BTreeMap<MailboxId, MessageMetadata> {
        setup
            .system
            .message_id_manager
            .get_messages(&[id], FetchGroup::Minimal, &setup.alice)
            .unwrap()
            .into_iter()
            .map(|r| (r.mailbox_id, r.metadata))
            .collect()
    }

    fn record_events(setup: &TestSetup) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        setup.system.events.register(
            RegistrationKey::User(setup.alice.user.clone()),
            Listener::new(
                "recorder",
                EventKinds::all() - EventKinds::QUOTA_USAGE_UPDATED,
                move |e| {
                    seen2.lock().unwrap().push(e.clone());
                    Ok(())
                },
            ),
        );
        seen
    }

    #[test]
    fn get_messages_omits_missing_and_inaccessible() {
        let setup = set_up();
        let id = setup.append(setup.alice_inbox, "Hello");
        let results = setup
            .system
            .message_id_manager
            .get_messages(
                &[id, MessageId(999)],
                FetchGroup::Full,
                &setup.alice,
            )
            .unwrap();
        assert_eq!(1, results.len());
        assert_eq!(id, results[0].message_id());
        assert!(results[0].content.is_some());

        assert!(setup
            .system
            .message_id_manager
            .get_messages(&[id], FetchGroup::Minimal, &setup.bob)
            .unwrap()
            .is_empty());
        assert!(setup
            .system
            .message_id_manager
            .accessible_messages(&[id], &setup.bob)
            .unwrap()
            .is_empty());
        assert_eq!(
            vec![id],
            setup
                .system
                .message_id_manager
                .accessible_messages(&[id, MessageId(999)], &setup.alice)
                .unwrap()
                .into_iter()
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn set_in_mailboxes_adds_and_removes() {
        let setup = set_up();
        let manager = &setup.system.message_id_manager;
        let id = setup.append(setup.alice_inbox, "Hello");
        manager
            .set_flags(
                flags(&[Flag::Seen, Flag::kw("work")]),
                FlagsUpdateMode::Add,
                id,
                &[setup.alice_inbox],
                &setup.alice,
            )
            .unwrap();
        let events = record_events(&setup);

        manager
            .set_in_mailboxes(
                id,
                &[setup.alice_archive, setup.alice_sent],
                &setup.alice,
            )
            .unwrap();

        let placements = placements_of(&setup, id);
        assert_eq!(
            vec![setup.alice_archive, setup.alice_sent],
            placements.keys().copied().collect::<Vec<_>>()
        );
        for metadata in placements.values() {
            assert_eq!(flags(&[Flag::Seen, Flag::kw("work")]), metadata.flags);
        }

        let events = events.lock().unwrap();
        let kinds: Vec<EventKinds> = events.iter().map(Event::kind).collect();
        assert_eq!(
            vec![
                EventKinds::ADDED,
                EventKinds::ADDED,
                EventKinds::EXPUNGED,
                EventKinds::MESSAGE_MOVED,
            ],
            kinds
        );
        assert_matches!(
            Event::MessageMoved(MessageMoved { .. }),
            events[3].clone()
        );
        if let Event::MessageMoved(ref moved) = events[3] {
            assert_eq!(
                vec![setup.alice_inbox],
                moved.removed_mailboxes().into_iter().collect::<Vec<_>>()
            );
            assert_eq!(2, moved.added_mailboxes().len());
        }
        assert!(setup
            .system
            .mailbox_manager
            .applicable_flags(setup.alice_archive, &setup.alice)
            .unwrap()
            .contains(&Flag::kw("work")));
    }

    #[test]
    fn set_in_mailboxes_is_idempotent() {
        let setup = set_up();
        let manager = &setup.system.message_id_manager;
        let id = setup.append(setup.alice_inbox, "Hello");

        manager
            .set_in_mailboxes(id, &[setup.alice_archive], &setup.alice)
            .unwrap();
        let before = placements_of(&setup, id);

        let events = record_events(&setup);
        manager
            .set_in_mailboxes(id, &[setup.alice_archive], &setup.alice)
            .unwrap();
        assert_eq!(before, placements_of(&setup, id));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn set_in_mailboxes_on_absent_message_is_noop() {
        let setup = set_up();
        let events = record_events(&setup);
        setup
            .system
            .message_id_manager
            .set_in_mailboxes(
                MessageId(12345),
                &[setup.alice_inbox],
                &setup.alice,
            )
            .unwrap();
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn set_in_mailboxes_keeps_existing_placement() {
        let setup = set_up();
        let manager = &setup.system.message_id_manager;
        let id = setup.append(setup.alice_inbox, "Hello");
        let before = placements_of(&setup, id)[&setup.alice_inbox].clone();

        manager
            .set_in_mailboxes(
                id,
                &[setup.alice_inbox, setup.alice_archive, MailboxId(9999)],
                &setup.alice,
            )
            .unwrap();
        let after = placements_of(&setup, id);
        assert_eq!(before, after[&setup.alice_inbox]);
        assert_eq!(2, after.len());
    }

    #[test]
    fn over_quota_leaves_membership_unchanged() {
        let setup = set_up();
        let manager = &setup.system.message_id_manager;
        let first = setup.append(setup.alice_inbox, "one");
        let second = setup.append(setup.alice_archive, "two");
        manager
            .set_in_mailboxes(second, &[setup.alice_archive], &setup.alice)
            .unwrap();
        setup.max_quota.set_global_max_message_count(Some(2));

        assert_matches!(
            Err(Error::OverQuota { .. }),
            manager.set_in_mailboxes(
                second,
                &[setup.alice_archive, setup.alice_inbox],
                &setup.alice
            )
        );
        assert_eq!(
            vec![setup.alice_archive],
            placements_of(&setup, second).keys().copied().collect::<Vec<_>>()
        );
        assert_eq!(1, placements_of(&setup, first).len());

        // A move is net zero and therefore allowed
        manager
            .set_in_mailboxes(second, &[setup.alice_sent], &setup.alice)
            .unwrap();
    }

    #[test]
    fn permissions_are_checked_before_mutating() {
        let setup = set_up();
        let manager = &setup.system.message_id_manager;
        let id = setup.append(setup.alice_inbox, "Hello");

        // bob cannot see the message at all: no-op
        manager
            .set_in_mailboxes(id, &[setup.bob_inbox], &setup.bob)
            .unwrap();
        assert_eq!(1, placements_of(&setup, id).len());

        // bob can read but not insert into alice's archive
        setup
            .system
            .mailbox_manager
            .set_rights(
                setup.alice_inbox,
                setup.bob.user.clone(),
                Rights::LOOKUP | Rights::READ,
                &setup.alice,
            )
            .unwrap();
        assert_matches!(
            Err(Error::PermissionDenied(_, _)),
            manager.set_in_mailboxes(
                id,
                &[setup.alice_inbox, setup.alice_archive],
                &setup.bob
            )
        );
        // nor remove it from the inbox
        assert_matches!(
            Err(Error::PermissionDenied(_, Rights::DELETE_MESSAGES)),
            manager.set_in_mailboxes(id, &[], &setup.bob)
        );
        assert_matches!(
            Err(Error::PermissionDenied(_, Rights::WRITE)),
            manager.set_flags(
                flags(&[Flag::Seen]),
                FlagsUpdateMode::Add,
                id,
                &[setup.alice_inbox],
                &setup.bob
            )
        );
        assert_eq!(1, placements_of(&setup, id).len());
    }

    #[test]
    fn copy_into_mailbox_without_write_sanitises_flags() {
        let setup = set_up();
        let manager = &setup.system.message_id_manager;
        let id = setup.append(setup.bob_inbox, "Hello");
        manager
            .set_flags(
                flags(&[Flag::Seen, Flag::Flagged]),
                FlagsUpdateMode::Replace,
                id,
                &[setup.bob_inbox],
                &setup.bob,
            )
            .unwrap();

        setup
            .system
            .mailbox_manager
            .set_rights(
                setup.alice_archive,
                setup.bob.user.clone(),
                Rights::LOOKUP
                    | Rights::READ
                    | Rights::INSERT
                    | Rights::WRITE_SEEN,
                &setup.alice,
            )
            .unwrap();

        manager
            .set_in_mailboxes(
                id,
                &[setup.bob_inbox, setup.alice_archive],
                &setup.bob,
            )
            .unwrap();
        let copied = setup
            .system
            .message_id_manager
            .get_messages(&[id], FetchGroup::Minimal, &setup.alice)
            .unwrap();
        assert_eq!(1, copied.len());
        assert_eq!(flags(&[Flag::Seen]), copied[0].metadata.flags);
    }

    #[test]
    fn set_flags_on_several_mailboxes() {
        let setup = set_up();
        let manager = &setup.system.message_id_manager;
        let id = setup.append(setup.alice_inbox, "Hello");
        manager
            .set_in_mailboxes(
                id,
                &[setup.alice_inbox, setup.alice_archive],
                &setup.alice,
            )
            .unwrap();
        let before = placements_of(&setup, id);

        let updates = manager
            .set_flags(
                flags(&[Flag::Answered]),
                FlagsUpdateMode::Add,
                id,
                &[setup.alice_inbox, setup.alice_archive, setup.alice_sent],
                &setup.alice,
            )
            .unwrap();
        assert_eq!(2, updates.len());

        let after = placements_of(&setup, id);
        assert_eq!(
            after[&setup.alice_inbox].flags,
            after[&setup.alice_archive].flags
        );
        for (mailbox, metadata) in &after {
            assert!(metadata.modseq > before[mailbox].modseq);
            assert_eq!(metadata.uid, before[mailbox].uid);
        }

        // Re-applying changes nothing
        let events = record_events(&setup);
        assert!(manager
            .set_flags(
                flags(&[Flag::Answered]),
                FlagsUpdateMode::Add,
                id,
                &[setup.alice_inbox, setup.alice_archive],
                &setup.alice,
            )
            .unwrap()
            .is_empty());
        assert_eq!(after, placements_of(&setup, id));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn flags_updated_reports_delta() {
        let setup = set_up();
        let id = setup.append(setup.alice_inbox, "Hello");
        let events = record_events(&setup);
        setup
            .system
            .message_id_manager
            .set_flags(
                flags(&[Flag::Seen, Flag::Deleted, Flag::Answered]),
                FlagsUpdateMode::Add,
                id,
                &[setup.alice_inbox],
                &setup.alice,
            )
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(1, events.len());
        match events[0] {
            Event::FlagsUpdated(ref e) => {
                assert_eq!(1, e.updated.len());
                assert_eq!(
                    vec![Flag::Answered, Flag::Deleted, Flag::Seen],
                    e.updated[0].modified_system_flags()
                );
            },
            ref e => panic!("Unexpected event: {:?}", e),
        }
    }

    #[test]
    fn delete_runs_and_reports() {
        let setup = set_up();
        let manager = &setup.system.message_id_manager;
        let a = setup.append(setup.alice_inbox, "a");
        let b = setup.append(setup.alice_inbox, "b");
        manager
            .set_in_mailboxes(
                a,
                &[setup.alice_inbox, setup.alice_archive],
                &setup.alice,
            )
            .unwrap();

        manager
            .delete(a, &[setup.alice_archive, MailboxId(9999)], &setup.alice)
            .unwrap();
        assert_eq!(
            vec![setup.alice_inbox],
            placements_of(&setup, a).keys().copied().collect::<Vec<_>>()
        );

        let result = manager
            .delete_messages(&[a, b, MessageId(9999)], &setup.alice)
            .unwrap();
        assert_eq!(
            vec![a, b],
            result.destroyed.into_iter().collect::<Vec<_>>()
        );
        assert_eq!(
            vec![MessageId(9999)],
            result.not_found.into_iter().collect::<Vec<_>>()
        );
        assert!(placements_of(&setup, a).is_empty());

        let result = manager.delete_messages(&[a], &setup.alice).unwrap();
        assert!(result.destroyed.is_empty());
    }

    #[test]
    fn hook_failure_aborts_delete() {
        let setup = set_up_with_failing_hook();
        let manager = &setup.system.message_id_manager;
        let id = setup.append(setup.alice_inbox, "a");
        let events = record_events(&setup);

        assert_matches!(
            Err(Error::HookFailed { .. }),
            manager.delete_messages(&[id], &setup.alice)
        );
        assert_matches!(
            Err(Error::HookFailed { .. }),
            manager.set_in_mailboxes(id, &[setup.alice_archive], &setup.alice)
        );
        assert_eq!(
            vec![setup.alice_inbox],
            placements_of(&setup, id).keys().copied().collect::<Vec<_>>()
        );
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_set_in_mailboxes_assigns_unique_uids() {
        let setup = set_up();
        let ids: Vec<MessageId> = (0..50)
            .map(|i| setup.append(setup.alice_inbox, &format!("m{}", i)))
            .collect();

        ids.par_iter().for_each(|&id| {
            setup
                .system
                .message_id_manager
                .set_in_mailboxes(
                    id,
                    &[setup.alice_inbox, setup.alice_archive],
                    &setup.alice,
                )
                .unwrap();
        });

        let mut uids: Vec<Uid> = ids
            .iter()
            .map(|&id| placements_of(&setup, id)[&setup.alice_archive].uid)
            .collect();
        uids.sort();
        uids.dedup();
        assert_eq!(50, uids.len());
        assert_eq!(
            uids,
            setup
                .system
                .mailbox_manager
                .list_uids(setup.alice_archive, &setup.alice)
                .unwrap()
        );
    }

    #[test]
    fn concurrent_additions_respect_quota() {
        let setup = set_up();
        let ids: Vec<MessageId> = (0..20)
            .map(|i| setup.append(setup.alice_inbox, &format!("m{}", i)))
            .collect();
        setup.max_quota.set_global_max_message_count(Some(25));

        let successes = ids
            .par_iter()
            .filter(|&&id| {
                setup
                    .system
                    .message_id_manager
                    .set_in_mailboxes(
                        id,
                        &[setup.alice_inbox, setup.alice_archive],
                        &setup.alice,
                    )
                    .is_ok()
            })
            .count();
        assert_eq!(5, successes);
    }

    fn fail_on(setup: &TestSetup, mailbox: MailboxId, kinds: EventKinds) {
        setup.system.events.register(
            RegistrationKey::Mailbox(mailbox),
            Listener::new("broken", kinds, |_| {
                Err(Error::Backend("indexer down".to_owned()))
            }),
        );
    }

    fn messages_used(setup: &TestSetup) -> u64 {
        setup
            .system
            .quota
            .message_quota(&QuotaRoot::for_user(&setup.alice.user))
            .unwrap()
            .used
    }

    #[test]
    fn failing_listener_does_not_cut_off_move_events() {
        let setup = set_up();
        let id = setup.append(setup.alice_inbox, "x");
        fail_on(&setup, setup.alice_archive, EventKinds::ADDED);
        let events = record_events(&setup);

        assert_matches!(
            Err(Error::ListenerFailed { .. }),
            setup.system.message_id_manager.set_in_mailboxes(
                id,
                &[setup.alice_archive],
                &setup.alice
            )
        );

        assert_eq!(
            vec![setup.alice_archive],
            placements_of(&setup, id).keys().copied().collect::<Vec<_>>()
        );
        assert_eq!(1, messages_used(&setup));
        let kinds: Vec<EventKinds> =
            events.lock().unwrap().iter().map(Event::kind).collect();
        assert_eq!(
            vec![
                EventKinds::ADDED,
                EventKinds::EXPUNGED,
                EventKinds::MESSAGE_MOVED
            ],
            kinds
        );
    }

    #[test]
    fn failing_listener_does_not_cut_off_flag_updates() {
        let setup = set_up();
        let manager = &setup.system.message_id_manager;
        let id = setup.append(setup.alice_inbox, "x");
        manager
            .set_in_mailboxes(
                id,
                &[setup.alice_inbox, setup.alice_archive, setup.alice_sent],
                &setup.alice,
            )
            .unwrap();
        fail_on(&setup, setup.alice_inbox, EventKinds::FLAGS_UPDATED);
        let events = record_events(&setup);

        assert_matches!(
            Err(Error::ListenerFailed { .. }),
            manager.set_flags(
                flags(&[Flag::Flagged]),
                FlagsUpdateMode::Add,
                id,
                &[setup.alice_inbox, setup.alice_archive, setup.alice_sent],
                &setup.alice,
            )
        );

        for metadata in placements_of(&setup, id).values() {
            assert_eq!(flags(&[Flag::Flagged]), metadata.flags);
        }
        assert_eq!(3, events.lock().unwrap().len());
    }

    #[test]
    fn failing_listener_does_not_cut_off_expunge_events() {
        let setup = set_up();
        let manager = &setup.system.message_id_manager;
        let id = setup.append(setup.alice_inbox, "x");
        manager
            .set_in_mailboxes(
                id,
                &[setup.alice_inbox, setup.alice_archive],
                &setup.alice,
            )
            .unwrap();
        fail_on(&setup, setup.alice_inbox, EventKinds::EXPUNGED);

        assert_matches!(
            Err(Error::ListenerFailed { .. }),
            manager.delete_messages(&[id], &setup.alice)
        );
        assert!(placements_of(&setup, id).is_empty());
        assert_eq!(0, messages_used(&setup));
    }

    #[test]
    fn target_deleted_while_waiting_for_locks_is_skipped() {
        let setup = set_up();
        let manager = &setup.system.message_id_manager;
        let id = setup.append(setup.alice_inbox, "x");

        let result = crossbeam::scope(|s| {
            let guard = manager
                .ctx
                .locker
                .lock(&LockKey::Mailbox(setup.alice_sent), LockType::Write)
                .unwrap();
            let mover = s.spawn(|_| {
                manager.set_in_mailboxes(
                    id,
                    &[setup.alice_archive, setup.alice_sent],
                    &setup.alice,
                )
            });

            // The mover has looked its targets up and now waits on the lock
            thread::sleep(Duration::from_millis(50));
            manager.ctx.mailboxes.delete(setup.alice_sent).unwrap();
            drop(guard);
            mover.join().unwrap()
        })
        .unwrap();
        result.unwrap();

        assert_eq!(
            vec![setup.alice_archive],
            placements_of(&setup, id).keys().copied().collect::<Vec<_>>()
        );
        assert_eq!(1, messages_used(&setup));
    }
}
