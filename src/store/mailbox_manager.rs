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

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::prelude::*;
use log::info;

use super::acl::Rights;
use super::batcher::MessageBatcher;
use super::context::{LockKey, StoreContext};
use super::events::*;
use super::flags::{FlagsUpdateCalculator, UpdatedFlags};
use super::hooks::{DeleteOperation, MessageDeletionMetadata};
use super::locker::LockType;
use super::mailbox::{Mailbox, MailboxPath, HIERARCHY_DELIMITER};
use super::model::*;
use super::session::{MailboxSession, SessionKind};
use super::thread::CorrelationHeaders;
use crate::support::error::Error;

/// A new message to be stored.
#[derive(Clone, Debug, Default)]
pub struct AppendCommand {
    pub content: Vec<u8>,
    pub flags: Flags,
    /// Defaults to the time of the append.
    pub internal_date: Option<DateTime<Utc>>,
    pub headers: CorrelationHeaders,
}

impl AppendCommand {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        AppendCommand {
            content: content.into(),
            ..AppendCommand::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendResult {
    pub message_id: MessageId,
    pub uid: Uid,
    pub modseq: Modseq,
    pub thread_id: ThreadId,
}

/// Operations on mailboxes and on the placements of one mailbox at a time.
///
/// Unlike the message-id operations, these address mailboxes explicitly, so
/// a missing or invisible mailbox is an `NxMailbox` error.
pub struct MailboxManager {
    ctx: StoreContext,
}

impl MailboxManager {
    pub fn new(ctx: StoreContext) -> Self {
        MailboxManager { ctx }
    }

    /// Create the mailbox at `path`.
    ///
    /// Users may create mailboxes of their own, or children of a mailbox of
    /// another user on which they hold `k`.
    pub fn create_mailbox(
        &self,
        path: &MailboxPath,
        session: &MailboxSession,
    ) -> Result<MailboxId, Error> {
        if !self.owns(path, session) {
            let parent = parent_path(path)
                .map(|p| self.ctx.mailboxes.find_by_path(&p))
                .transpose()?
                .flatten()
                .ok_or(Error::NxMailbox)?;
            self.ctx
                .require(&parent, session, Rights::CREATE_MAILBOX)?;
        }

        let _guard = self
            .ctx
            .locker
            .lock(&LockKey::Path(path.clone()), LockType::Write)?;
        let mailbox = self.ctx.mailboxes.create(path.clone())?;
        info!(
            "{} Created mailbox {} as {}",
            session.log_prefix, path, mailbox.id
        );

        self.ctx.dispatch(
            Event::MailboxAdded(MailboxAdded {
                session_id: session.id,
                user: session.user.clone(),
                mailbox_id: mailbox.id,
                path: mailbox.path.clone(),
            }),
            &mailbox,
        )?;
        Ok(mailbox.id)
    }

    pub fn get_mailbox(
        &self,
        path: &MailboxPath,
        session: &MailboxSession,
    ) -> Result<Mailbox, Error> {
        let mailbox = self.ctx.mailboxes.find_by_path(path)?;
        self.visible(mailbox, session)
    }

    pub fn get_mailbox_by_id(
        &self,
        id: MailboxId,
        session: &MailboxSession,
    ) -> Result<Mailbox, Error> {
        let mailbox = self.ctx.mailboxes.find_by_id(id)?;
        self.visible(mailbox, session)
    }

    /// The mailboxes of the session's user.
    pub fn list_mailboxes(
        &self,
        session: &MailboxSession,
    ) -> Result<Vec<Mailbox>, Error> {
        self.ctx.mailboxes.list(&session.user)
    }

    /// Rename `from` to `to`, along with all its children.
    ///
    /// Renaming the INBOX is not supported; a mailbox can only be moved
    /// within the namespace of its owner.
    pub fn rename_mailbox(
        &self,
        from: &MailboxPath,
        to: &MailboxPath,
        session: &MailboxSession,
    ) -> Result<(), Error> {
        let mailbox = self.get_mailbox(from, session)?;
        self.ctx.require(&mailbox, session, Rights::DELETE_MAILBOX)?;
        if from.is_inbox()
            || from.user != to.user
            || from.namespace != to.namespace
            || to == from
            || to.is_child_of(from)
        {
            return Err(Error::UnsafeName);
        }

        let mut renames = vec![(mailbox, to.clone())];
        for child in self.ctx.mailboxes.list(&from.user)? {
            if child.path.is_child_of(from) {
                let mut new_path = to.clone();
                new_path.name.push_str(&child.path.name[from.name.len()..]);
                renames.push((child, new_path));
            }
        }

        let keys = renames.iter().flat_map(|&(ref mailbox, ref new_path)| {
            vec![
                LockKey::Path(mailbox.path.clone()),
                LockKey::Path(new_path.clone()),
                LockKey::Mailbox(mailbox.id),
            ]
        });
        let _guards = self.ctx.locker.lock_all(keys, LockType::Write)?;
        let mut current = Vec::with_capacity(renames.len());
        for (mailbox, new_path) in renames {
            if self.ctx.mailboxes.find_by_path(&new_path)?.is_some() {
                return Err(Error::MailboxExists);
            }
            // A concurrent rename or delete may have got there first
            match self.ctx.mailboxes.find_by_id(mailbox.id)? {
                Some(found) if found.path == mailbox.path => {
                    current.push((found, new_path))
                },
                _ => return Err(Error::NxMailbox),
            }
        }

        let mut delivery = Delivery::new();
        for (current, new_path) in current {
            self.ctx.mailboxes.rename(current.id, new_path.clone())?;
            info!(
                "{} Renamed mailbox {} from {} to {}",
                session.log_prefix, current.id, current.path, new_path
            );

            let old_path = current.path.clone();
            let renamed = Mailbox {
                path: new_path.clone(),
                ..current
            };
            delivery.record(self.ctx.dispatch(
                Event::MailboxRenamed(MailboxRenamed {
                    session_id: session.id,
                    user: session.user.clone(),
                    mailbox_id: renamed.id,
                    old_path,
                    new_path,
                }),
                &renamed,
            ));
        }

        delivery.finish()
    }

    /// Delete the mailbox at `path` and every placement in it.
    pub fn delete_mailbox(
        &self,
        path: &MailboxPath,
        session: &MailboxSession,
    ) -> Result<(), Error> {
        let mailbox = self.get_mailbox(path, session)?;
        self.ctx.require(&mailbox, session, Rights::DELETE_MAILBOX)?;

        let quota_root = self.ctx.quota_root(&mailbox);
        let _guards = self.ctx.locker.lock_all(
            vec![
                LockKey::Path(mailbox.path.clone()),
                LockKey::QuotaRoot(quota_root.clone()),
                LockKey::Mailbox(mailbox.id),
            ],
            LockType::Write,
        )?;
        if self.ctx.mailboxes.find_by_id(mailbox.id)?.is_none() {
            return Err(Error::NxMailbox);
        }

        let placements = self
            .ctx
            .messages
            .find_in_mailbox(mailbox.id, MessageRange::all())?;
        self.ctx.hooks.run_hooks(&DeleteOperation {
            session_id: session.id,
            user: session.user.clone(),
            deletions: placements
                .iter()
                .map(|message| MessageDeletionMetadata {
                    mailbox_id: mailbox.id,
                    metadata: message.metadata(),
                })
                .collect(),
        })?;

        let total_size = placements
            .iter()
            .fold(0u64, |sum, m| sum.saturating_add(m.size));
        self.ctx.mailboxes.delete(mailbox.id)?;
        info!(
            "{} Deleted mailbox {} ({}) with {} messages",
            session.log_prefix,
            mailbox.path,
            mailbox.id,
            placements.len()
        );

        self.ctx.dispatch(
            Event::MailboxDeletion(MailboxDeletion {
                session_id: session.id,
                user: session.user.clone(),
                mailbox_id: mailbox.id,
                path: mailbox.path.clone(),
                quota_root,
                deleted_messages: placements.len() as u64,
                total_size,
            }),
            &mailbox,
        )
    }

    /// Set the rights of `user` on `mailbox_id`. Requires `a`.
    pub fn set_rights(
        &self,
        mailbox_id: MailboxId,
        user: Username,
        rights: Rights,
        session: &MailboxSession,
    ) -> Result<(), Error> {
        let mailbox = self.get_mailbox_by_id(mailbox_id, session)?;
        self.ctx.require(&mailbox, session, Rights::ADMINISTER)?;

        let _guard = self
            .ctx
            .locker
            .lock(&LockKey::Mailbox(mailbox_id), LockType::Write)?;
        let mut acl = self
            .ctx
            .mailboxes
            .find_by_id(mailbox_id)?
            .ok_or(Error::NxMailbox)?
            .acl;
        info!(
            "{} Rights of {} on {} set to {}",
            session.log_prefix, user, mailbox.path, rights
        );
        acl.set(user, rights);
        self.ctx.mailboxes.set_acl(mailbox_id, acl)
    }

    /// Store a new message as the first placement of a new message id.
    pub fn append_message(
        &self,
        mailbox_id: MailboxId,
        command: AppendCommand,
        session: &MailboxSession,
    ) -> Result<AppendResult, Error> {
        let mailbox = self.get_mailbox_by_id(mailbox_id, session)?;
        self.ctx.require(&mailbox, session, Rights::INSERT)?;

        let _guards = self.ctx.locker.lock_all(
            self.ctx.mutation_lock_keys(Some(&mailbox)),
            LockType::Write,
        )?;
        let size = command.content.len() as u64;
        self.ctx.quota.check_can_add(
            &self.ctx.quota_root(&mailbox),
            1,
            i64::try_from(size).unwrap_or(i64::MAX),
        )?;

        let message_id = self.ctx.messages.generate_message_id();
        let thread_id = self.ctx.threads.guess_thread_id(
            message_id,
            &command.headers,
            session,
        )?;
        let message = MailboxMessage {
            message_id,
            mailbox_id,
            uid: self.ctx.messages.next_uid(mailbox_id)?,
            modseq: self.ctx.messages.next_modseq(mailbox_id)?,
            flags: self
                .ctx
                .rights(&mailbox, session)
                .sanitize_flags(&command.flags),
            internal_date: command.internal_date.unwrap_or_else(Utc::now),
            size,
            thread_id,
            content: Arc::from(command.content),
        };
        let result = AppendResult {
            message_id,
            uid: message.uid,
            modseq: message.modseq,
            thread_id,
        };

        self.ctx.messages.save(message.clone())?;
        self.ctx
            .messages
            .add_applicable_flags(mailbox_id, &message.flags)?;
        self.ctx
            .threads
            .record(message_id, thread_id, &command.headers, session)?;
        info!(
            "{} Appended {} to {} as {}",
            session.log_prefix, message_id, mailbox.path, message.uid
        );

        let mut added = BTreeMap::new();
        added.insert(message.uid, message.metadata());
        self.ctx.dispatch(
            Event::Added(Added {
                session_id: session.id,
                user: session.user.clone(),
                mailbox_id,
                path: mailbox.path.clone(),
                added,
                is_append: true,
            }),
            &mailbox,
        )?;

        Ok(result)
    }

    /// Fetch the placements of `mailbox_id` within `range`, in UID order.
    pub fn fetch(
        &self,
        mailbox_id: MailboxId,
        range: MessageRange,
        fetch_group: FetchGroup,
        session: &MailboxSession,
    ) -> Result<Vec<MessageResult>, Error> {
        let mailbox = self.get_mailbox_by_id(mailbox_id, session)?;
        self.ctx.require(&mailbox, session, Rights::READ)?;

        let _guard = self
            .ctx
            .locker
            .lock(&LockKey::Mailbox(mailbox_id), LockType::Read)?;
        MessageBatcher::with_size(self.ctx.batch_sizes.fetch).batch(
            range,
            |batch| {
                Ok(self
                    .ctx
                    .messages
                    .find_in_mailbox(mailbox_id, batch)?
                    .iter()
                    .map(|m| MessageResult::of(m, fetch_group))
                    .collect())
            },
        )
    }

    /// Apply a flag update to every placement of `mailbox_id` in `range`.
    ///
    /// One `FlagsUpdated` event is dispatched per batch that changed
    /// anything. A failing listener does not stop later batches; its error
    /// is returned once all are done. Returns the changed placements.
    pub fn set_flags(
        &self,
        mailbox_id: MailboxId,
        flags: Flags,
        mode: FlagsUpdateMode,
        range: MessageRange,
        session: &MailboxSession,
    ) -> Result<Vec<UpdatedFlags>, Error> {
        let mailbox = self.get_mailbox_by_id(mailbox_id, session)?;
        self.ctx.require(&mailbox, session, Rights::WRITE)?;

        let _guard = self
            .ctx
            .locker
            .lock(&LockKey::Mailbox(mailbox_id), LockType::Write)?;
        let calculator = FlagsUpdateCalculator::new(flags, mode);
        let mut delivery = Delivery::new();
        let batcher = MessageBatcher::with_size(self.ctx.batch_sizes.flags);
        let updated = batcher.batch(
            range,
            |batch| {
                let mut updated = Vec::new();
                for message in
                    self.ctx.messages.find_in_mailbox(mailbox_id, batch)?
                {
                    let new_flags = calculator.build_new_flags(&message.flags);
                    if new_flags == message.flags {
                        continue;
                    }

                    let modseq = self.ctx.messages.next_modseq(mailbox_id)?;
                    self.ctx.messages.update_flags(
                        mailbox_id,
                        message.message_id,
                        new_flags.clone(),
                        modseq,
                    )?;
                    self.ctx
                        .messages
                        .add_applicable_flags(mailbox_id, &new_flags)?;
                    updated.push(UpdatedFlags {
                        message_id: message.message_id,
                        uid: message.uid,
                        modseq,
                        old_flags: message.flags,
                        new_flags,
                    });
                }

                delivery.record(self.ctx.dispatch(
                    Event::FlagsUpdated(FlagsUpdated {
                        session_id: session.id,
                        user: session.user.clone(),
                        mailbox_id,
                        path: mailbox.path.clone(),
                        updated: updated.clone(),
                    }),
                    &mailbox,
                ));
                Ok(updated)
            },
        )?;

        delivery.finish()?;
        Ok(updated)
    }

    /// Remove the placements of `mailbox_id` in `range` that carry
    /// `\Deleted`, returning their UIDs.
    pub fn expunge(
        &self,
        mailbox_id: MailboxId,
        range: MessageRange,
        session: &MailboxSession,
    ) -> Result<Vec<Uid>, Error> {
        let mailbox = self.get_mailbox_by_id(mailbox_id, session)?;
        self.ctx.require(&mailbox, session, Rights::EXPUNGE)?;

        let _guards = self.ctx.locker.lock_all(
            self.ctx.mutation_lock_keys(Some(&mailbox)),
            LockType::Write,
        )?;
        let doomed: Vec<MailboxMessage> =
            MessageBatcher::with_size(self.ctx.batch_sizes.expunge).batch(
                range,
                |batch| {
                Ok(self
                    .ctx
                    .messages
                    .find_in_mailbox(mailbox_id, batch)?
                    .into_iter()
                    .filter(|m| m.flags.contains(&Flag::Deleted))
                    .collect())
                },
            )?;
        if doomed.is_empty() {
            return Ok(Vec::new());
        }

        self.ctx.hooks.run_hooks(&DeleteOperation {
            session_id: session.id,
            user: session.user.clone(),
            deletions: doomed
                .iter()
                .map(|message| MessageDeletionMetadata {
                    mailbox_id,
                    metadata: message.metadata(),
                })
                .collect(),
        })?;

        let only_here: BTreeSet<MailboxId> =
            Some(mailbox_id).into_iter().collect();
        let mut expunged = BTreeMap::new();
        for message in doomed {
            self.ctx.messages.delete(message.message_id, &only_here)?;
            expunged.insert(message.uid, message.metadata());
        }
        info!(
            "{} Expunged {} messages from {}",
            session.log_prefix,
            expunged.len(),
            mailbox.path
        );

        let uids = expunged.keys().copied().collect();
        self.ctx.dispatch(
            Event::Expunged(Expunged {
                session_id: session.id,
                user: session.user.clone(),
                mailbox_id,
                path: mailbox.path.clone(),
                expunged,
            }),
            &mailbox,
        )?;
        Ok(uids)
    }

    /// The applicable flags of `mailbox_id`: every keyword ever stored
    /// there.
    pub fn applicable_flags(
        &self,
        mailbox_id: MailboxId,
        session: &MailboxSession,
    ) -> Result<Flags, Error> {
        let mailbox = self.get_mailbox_by_id(mailbox_id, session)?;
        self.ctx.require(&mailbox, session, Rights::READ)?;
        self.ctx.messages.applicable_flags(mailbox_id)
    }

    pub fn list_uids(
        &self,
        mailbox_id: MailboxId,
        session: &MailboxSession,
    ) -> Result<Vec<Uid>, Error> {
        let mailbox = self.get_mailbox_by_id(mailbox_id, session)?;
        self.ctx.require(&mailbox, session, Rights::READ)?;
        self.ctx.messages.list_uids(mailbox_id)
    }

    /// Placement count and total size of `mailbox_id`.
    pub fn usage(
        &self,
        mailbox_id: MailboxId,
        session: &MailboxSession,
    ) -> Result<(u64, u64), Error> {
        let mailbox = self.get_mailbox_by_id(mailbox_id, session)?;
        self.ctx.require(&mailbox, session, Rights::READ)?;
        self.ctx.messages.usage(mailbox_id)
    }

    fn owns(&self, path: &MailboxPath, session: &MailboxSession) -> bool {
        SessionKind::System == session.kind || path.user == session.user
    }

    fn visible(
        &self,
        mailbox: Option<Mailbox>,
        session: &MailboxSession,
    ) -> Result<Mailbox, Error> {
        match mailbox {
            Some(mailbox) if self.ctx.can(&mailbox, session, Rights::LOOKUP) => {
                Ok(mailbox)
            },
            _ => Err(Error::NxMailbox),
        }
    }
}

fn parent_path(path: &MailboxPath) -> Option<MailboxPath> {
    path.name
        .rfind(HIERARCHY_DELIMITER)
        .map(|ix| MailboxPath {
            name: path.name[..ix].to_owned(),
            ..path.clone()
        })
}
