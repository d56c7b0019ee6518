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

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::prelude::*;

use super::acl::MailboxAcl;
use super::flags::merge_applicable_flags;
use super::mailbox::{Mailbox, MailboxPath};
use super::mapper::*;
use super::model::*;
use crate::support::error::Error;

/// A persistence backend that keeps everything in process memory.
///
/// Every call takes one table-wide lock, so each call is atomic on its own.
pub struct InMemoryMapper {
    inner: Mutex<Inner>,
}

struct Inner {
    next_mailbox_id: u64,
    next_message_id: u64,
    next_uid_validity: u32,
    mailboxes: BTreeMap<MailboxId, Mailbox>,
    paths: BTreeMap<MailboxPath, MailboxId>,
    counters: HashMap<MailboxId, Counters>,
    placements: BTreeMap<(MessageId, MailboxId), MailboxMessage>,
    uids: BTreeMap<(MailboxId, Uid), MessageId>,
    applicable: HashMap<MailboxId, Flags>,
    threads: HashMap<Username, Vec<ThreadEntry>>,
}

#[derive(Default)]
struct Counters {
    last_uid: u32,
    last_modseq: u64,
}

impl Default for InMemoryMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMapper {
    pub fn new() -> Self {
        InMemoryMapper {
            inner: Mutex::new(Inner {
                next_mailbox_id: 1,
                next_message_id: 1,
                // Seeded from the clock so that a mailbox recreated in a
                // later process does not reuse a UIDVALIDITY
                next_uid_validity: uid_validity_seed(Utc::now()),
                mailboxes: BTreeMap::new(),
                paths: BTreeMap::new(),
                counters: HashMap::new(),
                placements: BTreeMap::new(),
                uids: BTreeMap::new(),
                applicable: HashMap::new(),
                threads: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn counters(&mut self, mailbox: MailboxId) -> Result<&mut Counters, Error> {
        self.counters.get_mut(&mailbox).ok_or(Error::NxMailbox)
    }
}

impl MailboxMapper for InMemoryMapper {
    fn create(&self, path: MailboxPath) -> Result<Mailbox, Error> {
        let mut inner = self.lock();
        if inner.paths.contains_key(&path) {
            return Err(Error::MailboxExists);
        }

        let id = MailboxId(inner.next_mailbox_id);
        inner.next_mailbox_id += 1;
        let uid_validity = inner.next_uid_validity;
        inner.next_uid_validity = uid_validity.wrapping_add(1).max(1);

        let mailbox = Mailbox {
            id,
            path: path.clone(),
            uid_validity,
            acl: MailboxAcl::default(),
        };
        inner.paths.insert(path, id);
        inner.mailboxes.insert(id, mailbox.clone());
        inner.counters.insert(id, Counters::default());
        Ok(mailbox)
    }

    fn find_by_id(&self, id: MailboxId) -> Result<Option<Mailbox>, Error> {
        Ok(self.lock().mailboxes.get(&id).cloned())
    }

    fn find_by_path(
        &self,
        path: &MailboxPath,
    ) -> Result<Option<Mailbox>, Error> {
        let inner = self.lock();
        Ok(inner
            .paths
            .get(path)
            .and_then(|id| inner.mailboxes.get(id))
            .cloned())
    }

    fn rename(
        &self,
        id: MailboxId,
        new_path: MailboxPath,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.paths.contains_key(&new_path) {
            return Err(Error::MailboxExists);
        }

        let mailbox = inner.mailboxes.get_mut(&id).ok_or(Error::NxMailbox)?;
        let old_path =
            std::mem::replace(&mut mailbox.path, new_path.clone());
        inner.paths.remove(&old_path);
        inner.paths.insert(new_path, id);
        Ok(())
    }

    fn set_acl(&self, id: MailboxId, acl: MailboxAcl) -> Result<(), Error> {
        self.lock()
            .mailboxes
            .get_mut(&id)
            .ok_or(Error::NxMailbox)?
            .acl = acl;
        Ok(())
    }

    fn delete(&self, id: MailboxId) -> Result<(), Error> {
        let mut inner = self.lock();
        let mailbox = inner.mailboxes.remove(&id).ok_or(Error::NxMailbox)?;
        inner.paths.remove(&mailbox.path);
        inner.counters.remove(&id);
        inner.applicable.remove(&id);

        let orphans = inner
            .uids
            .range((id, Uid::MIN)..=(id, Uid::MAX))
            .map(|(&(_, uid), &message_id)| (uid, message_id))
            .collect::<Vec<_>>();
        for (uid, message_id) in orphans {
            inner.uids.remove(&(id, uid));
            inner.placements.remove(&(message_id, id));
        }
        Ok(())
    }

    fn list(&self, user: &Username) -> Result<Vec<Mailbox>, Error> {
        let inner = self.lock();
        Ok(inner
            .paths
            .iter()
            .filter(|&(path, _)| path.user == *user)
            .filter_map(|(_, id)| inner.mailboxes.get(id))
            .cloned()
            .collect())
    }
}

impl MessageMapper for InMemoryMapper {
    fn generate_message_id(&self) -> MessageId {
        let mut inner = self.lock();
        let id = MessageId(inner.next_message_id);
        inner.next_message_id += 1;
        id
    }

    fn find(&self, ids: &[MessageId]) -> Result<Vec<MailboxMessage>, Error> {
        let inner = self.lock();
        let ids: BTreeSet<MessageId> = ids.iter().copied().collect();
        let mut result = Vec::new();
        for &id in &ids {
            result.extend(
                inner
                    .placements
                    .range((id, MailboxId(0))..=(id, MailboxId(u64::MAX)))
                    .map(|(_, m)| m.clone()),
            );
        }
        Ok(result)
    }

    fn find_in_mailbox(
        &self,
        mailbox: MailboxId,
        range: MessageRange,
    ) -> Result<Vec<MailboxMessage>, Error> {
        let inner = self.lock();
        if !inner.mailboxes.contains_key(&mailbox) {
            return Err(Error::NxMailbox);
        }

        Ok(inner
            .uids
            .range((mailbox, range.from)..=(mailbox, range.to))
            .filter_map(|(_, &id)| inner.placements.get(&(id, mailbox)))
            .cloned()
            .collect())
    }

    fn find_by_thread(
        &self,
        thread_id: ThreadId,
    ) -> Result<Vec<MailboxMessage>, Error> {
        Ok(self
            .lock()
            .placements
            .values()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect())
    }

    fn list_uids(&self, mailbox: MailboxId) -> Result<Vec<Uid>, Error> {
        let inner = self.lock();
        if !inner.mailboxes.contains_key(&mailbox) {
            return Err(Error::NxMailbox);
        }

        Ok(inner
            .uids
            .range((mailbox, Uid::MIN)..=(mailbox, Uid::MAX))
            .map(|(&(_, uid), _)| uid)
            .collect())
    }

    fn usage(&self, mailbox: MailboxId) -> Result<(u64, u64), Error> {
        let inner = self.lock();
        let mut count = 0u64;
        let mut size = 0u64;
        for (_, &id) in inner.uids.range((mailbox, Uid::MIN)..=(mailbox, Uid::MAX))
        {
            if let Some(message) = inner.placements.get(&(id, mailbox)) {
                count += 1;
                size = size.saturating_add(message.size);
            }
        }
        Ok((count, size))
    }

    fn next_uid(&self, mailbox: MailboxId) -> Result<Uid, Error> {
        let mut inner = self.lock();
        let counters = inner.counters(mailbox)?;
        let next = counters.last_uid.checked_add(1).ok_or(Error::MailboxFull)?;
        counters.last_uid = next;
        Uid::of(next).ok_or(Error::MailboxFull)
    }

    fn next_modseq(&self, mailbox: MailboxId) -> Result<Modseq, Error> {
        let mut inner = self.lock();
        let counters = inner.counters(mailbox)?;
        let next = counters
            .last_modseq
            .checked_add(1)
            .ok_or(Error::MailboxFull)?;
        counters.last_modseq = next;
        Modseq::of(next).ok_or(Error::MailboxFull)
    }

    fn save(&self, message: MailboxMessage) -> Result<(), Error> {
        let mut inner = self.lock();
        if !inner.mailboxes.contains_key(&message.mailbox_id) {
            return Err(Error::NxMailbox);
        }

        let key = (message.message_id, message.mailbox_id);
        let uid_key = (message.mailbox_id, message.uid);
        if inner.placements.contains_key(&key)
            || inner.uids.contains_key(&uid_key)
        {
            return Err(Error::Backend(format!(
                "placement of {} in {} already exists",
                message.message_id, message.mailbox_id
            )));
        }

        inner.uids.insert(uid_key, message.message_id);
        inner.placements.insert(key, message);
        Ok(())
    }

    fn update_flags(
        &self,
        mailbox: MailboxId,
        id: MessageId,
        flags: Flags,
        modseq: Modseq,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let message =
            inner.placements.get_mut(&(id, mailbox)).ok_or_else(|| {
                Error::Backend(format!("no placement of {} in {}", id, mailbox))
            })?;
        message.flags = flags;
        message.modseq = modseq;
        Ok(())
    }

    fn delete(
        &self,
        id: MessageId,
        mailboxes: &BTreeSet<MailboxId>,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        for &mailbox in mailboxes {
            if let Some(message) = inner.placements.remove(&(id, mailbox)) {
                inner.uids.remove(&(mailbox, message.uid));
            }
        }
        Ok(())
    }

    fn applicable_flags(&self, mailbox: MailboxId) -> Result<Flags, Error> {
        let inner = self.lock();
        if !inner.mailboxes.contains_key(&mailbox) {
            return Err(Error::NxMailbox);
        }
        Ok(inner.applicable.get(&mailbox).cloned().unwrap_or_default())
    }

    fn add_applicable_flags(
        &self,
        mailbox: MailboxId,
        flags: &Flags,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        if !inner.mailboxes.contains_key(&mailbox) {
            return Err(Error::NxMailbox);
        }
        merge_applicable_flags(
            inner.applicable.entry(mailbox).or_default(),
            flags,
        );
        Ok(())
    }
}

impl ThreadMapper for InMemoryMapper {
    fn save_thread_data(
        &self,
        user: &Username,
        entry: ThreadEntry,
    ) -> Result<(), Error> {
        self.lock()
            .threads
            .entry(user.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    fn find_related(
        &self,
        user: &Username,
        mime_message_ids: &BTreeSet<MimeMessageId>,
    ) -> Result<Vec<ThreadEntry>, Error> {
        Ok(self
            .lock()
            .threads
            .get(user)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| {
                        !e.mime_message_ids.is_disjoint(mime_message_ids)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_thread_data(
        &self,
        user: &Username,
        message_id: MessageId,
    ) -> Result<(), Error> {
        if let Some(entries) = self.lock().threads.get_mut(user) {
            entries.retain(|e| e.message_id != message_id);
        }
        Ok(())
    }
}

/// The clock in seconds, wrapped to 32 bits; never 0.
fn uid_validity_seed(now: DateTime<Utc>) -> u32 {
    u32::try_from(now.timestamp() & i64::from(u32::MAX))
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rayon::prelude::*;

    use super::*;

    fn placement(
        mapper: &InMemoryMapper,
        id: MessageId,
        mailbox: MailboxId,
    ) -> MailboxMessage {
        MailboxMessage {
            message_id: id,
            mailbox_id: mailbox,
            uid: mapper.next_uid(mailbox).unwrap(),
            modseq: mapper.next_modseq(mailbox).unwrap(),
            flags: Flags::new(),
            internal_date: Utc::now(),
            size: 10,
            thread_id: ThreadId::from_base_message_id(id),
            content: Arc::from(&b"0123456789"[..]),
        }
    }

    fn mailbox(mapper: &InMemoryMapper, name: &str) -> MailboxId {
        mapper
            .create(
                MailboxPath::for_user(Username::new("alice"), name).unwrap(),
            )
            .unwrap()
            .id
    }

    #[test]
    fn mailbox_lifecycle() {
        let mapper = InMemoryMapper::new();
        let inbox = mailbox(&mapper, "INBOX");
        let archive = mailbox(&mapper, "Archive");
        let path = MailboxPath::for_user(Username::new("alice"), "INBOX")
            .unwrap();
        assert_matches!(Err(Error::MailboxExists), mapper.create(path.clone()));

        let new_path =
            MailboxPath::for_user(Username::new("alice"), "Old").unwrap();
        mapper.rename(archive, new_path.clone()).unwrap();
        assert_eq!(
            Some(archive),
            mapper.find_by_path(&new_path).unwrap().map(|m| m.id)
        );
        assert_matches!(Err(Error::MailboxExists), mapper.rename(archive, path));

        assert_eq!(
            vec![inbox, archive],
            mapper
                .list(&Username::new("alice"))
                .unwrap()
                .into_iter()
                .map(|m| m.id)
                .collect::<Vec<_>>()
        );
        assert!(mapper.list(&Username::new("bob")).unwrap().is_empty());

        MailboxMapper::delete(&mapper, archive).unwrap();
        assert!(mapper.find_by_id(archive).unwrap().is_none());
        assert_matches!(Err(Error::NxMailbox), mapper.next_uid(archive));
    }

    #[test]
    fn uids_never_reused() {
        let mapper = InMemoryMapper::new();
        let inbox = mailbox(&mapper, "INBOX");
        let id = mapper.generate_message_id();
        let first = placement(&mapper, id, inbox);
        let first_uid = first.uid;
        mapper.save(first).unwrap();
        MessageMapper::delete(&mapper, id, &vec![inbox].into_iter().collect())
            .unwrap();
        assert!(mapper.list_uids(inbox).unwrap().is_empty());

        let second = placement(&mapper, mapper.generate_message_id(), inbox);
        assert!(second.uid > first_uid);
    }

    #[test]
    fn placements_by_message_and_range() {
        let mapper = InMemoryMapper::new();
        let inbox = mailbox(&mapper, "INBOX");
        let archive = mailbox(&mapper, "Archive");

        let a = mapper.generate_message_id();
        let b = mapper.generate_message_id();
        mapper.save(placement(&mapper, a, archive)).unwrap();
        mapper.save(placement(&mapper, a, inbox)).unwrap();
        mapper.save(placement(&mapper, b, inbox)).unwrap();

        let found = mapper.find(&[b, a, a]).unwrap();
        assert_eq!(
            vec![(a, inbox), (a, archive), (b, inbox)],
            found
                .iter()
                .map(|m| (m.message_id, m.mailbox_id))
                .collect::<Vec<_>>()
        );

        let in_inbox = mapper
            .find_in_mailbox(inbox, MessageRange::one(Uid::u(2)))
            .unwrap();
        assert_eq!(1, in_inbox.len());
        assert_eq!(b, in_inbox[0].message_id);
        assert_eq!((2, 20), mapper.usage(inbox).unwrap());

        let dup = placement(&mapper, a, inbox);
        assert_matches!(Err(Error::Backend(_)), mapper.save(dup));
    }

    #[test]
    fn applicable_flags_accumulate() {
        let mapper = InMemoryMapper::new();
        let inbox = mailbox(&mapper, "INBOX");
        let flags: Flags =
            vec![Flag::Seen, Flag::kw("a")].into_iter().collect();
        mapper.add_applicable_flags(inbox, &flags).unwrap();
        mapper.add_applicable_flags(inbox, &Flags::new()).unwrap();
        assert_eq!(
            vec![Flag::kw("a")],
            mapper
                .applicable_flags(inbox)
                .unwrap()
                .iter()
                .cloned()
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn thread_entries_are_per_user() {
        let mapper = InMemoryMapper::new();
        let alice = Username::new("alice");
        let ids: BTreeSet<MimeMessageId> =
            vec![MimeMessageId::new("a@x")].into_iter().collect();
        mapper
            .save_thread_data(
                &alice,
                ThreadEntry {
                    message_id: MessageId(1),
                    thread_id: ThreadId::from_base_message_id(MessageId(1)),
                    mime_message_ids: ids.clone(),
                    base_subject: Some("test".to_owned()),
                },
            )
            .unwrap();

        assert_eq!(1, mapper.find_related(&alice, &ids).unwrap().len());
        assert!(mapper
            .find_related(&Username::new("bob"), &ids)
            .unwrap()
            .is_empty());
        mapper.delete_thread_data(&alice, MessageId(1)).unwrap();
        assert!(mapper.find_related(&alice, &ids).unwrap().is_empty());
    }

    #[test]
    fn concurrent_uid_allocation_is_unique() {
        let mapper = InMemoryMapper::new();
        let inbox = mailbox(&mapper, "INBOX");
        let mut uids = (0..1000)
            .into_par_iter()
            .map(|_| mapper.next_uid(inbox).unwrap())
            .collect::<Vec<_>>();
        uids.sort();
        uids.dedup();
        assert_eq!(1000, uids.len());
        assert_eq!(Uid::u(1000), uids[999]);
    }

    #[test]
    fn uid_validity_seed_wraps_and_skips_zero() {
        let at = |secs: i64| Utc.timestamp_opt(secs, 0).unwrap();
        assert_eq!(1, uid_validity_seed(at(0)));
        assert_eq!(1_600_000_000, uid_validity_seed(at(1_600_000_000)));
        assert_eq!(5, uid_validity_seed(at((1i64 << 32) + 5)));
        assert_eq!(1, uid_validity_seed(at(1i64 << 32)));
    }
}
