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

//! Mutation events and their delivery.
//!
//! Every mutation the managers commit is described by one `Event` per
//! affected mailbox. An event carries everything a listener needs to know
//! about the change (UIDs, MOD-SEQs, old and new flags, message metadata) so
//! that no listener ever has to go back to the store.
//!
//! Listeners are registered either under a `RegistrationKey` (a mailbox, or
//! all mailboxes of a user), in which case they see the events dispatched
//! with that key, or under a group name, in which case they see every event.
//! Registration never replays past events.
//!
//! Delivery is synchronous. `EventBus::dispatch()` invokes every matching
//! listener in turn on the calling thread and only returns once all have run.
//! The managers dispatch while still holding the write lock of the affected
//! mailbox, so two mutations of one mailbox are always observed in commit
//! order.
//!
//! An event a group listener fails on is kept as a dead letter of that group
//! until it is redelivered.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use bitflags::bitflags;
use chrono::prelude::*;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::flags::UpdatedFlags;
use super::mailbox::MailboxPath;
use super::model::*;
use super::quota::{Quota, QuotaRoot};
use super::session::SessionId;
use crate::support::error::Error;

/// Placements that appeared in one mailbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Added {
    pub session_id: SessionId,
    pub user: Username,
    pub mailbox_id: MailboxId,
    pub path: MailboxPath,
    pub added: BTreeMap<Uid, MessageMetadata>,
    /// Whether the placements are new messages, as opposed to existing
    /// messages put into another mailbox.
    pub is_append: bool,
}

/// Placements that were removed from one mailbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expunged {
    pub session_id: SessionId,
    pub user: Username,
    pub mailbox_id: MailboxId,
    pub path: MailboxPath,
    pub expunged: BTreeMap<Uid, MessageMetadata>,
}

/// Placements of one mailbox whose flags changed.
///
/// Only entries whose flags actually differ are ever included.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagsUpdated {
    pub session_id: SessionId,
    pub user: Username,
    pub mailbox_id: MailboxId,
    pub path: MailboxPath,
    pub updated: Vec<UpdatedFlags>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxAdded {
    pub session_id: SessionId,
    pub user: Username,
    pub mailbox_id: MailboxId,
    pub path: MailboxPath,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxRenamed {
    pub session_id: SessionId,
    pub user: Username,
    pub mailbox_id: MailboxId,
    pub old_path: MailboxPath,
    pub new_path: MailboxPath,
}

/// A mailbox and all its placements were deleted.
///
/// No `Expunged` event is dispatched for the placements that went with it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxDeletion {
    pub session_id: SessionId,
    pub user: Username,
    pub mailbox_id: MailboxId,
    pub path: MailboxPath,
    pub quota_root: QuotaRoot,
    pub deleted_messages: u64,
    pub total_size: u64,
}

/// The set of mailboxes holding a message changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMoved {
    pub session_id: SessionId,
    pub user: Username,
    pub message_id: MessageId,
    pub previous_mailboxes: BTreeSet<MailboxId>,
    pub target_mailboxes: BTreeSet<MailboxId>,
}

impl MessageMoved {
    pub fn added_mailboxes(&self) -> BTreeSet<MailboxId> {
        self.target_mailboxes
            .difference(&self.previous_mailboxes)
            .copied()
            .collect()
    }

    pub fn removed_mailboxes(&self) -> BTreeSet<MailboxId> {
        self.previous_mailboxes
            .difference(&self.target_mailboxes)
            .copied()
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsageUpdated {
    pub session_id: SessionId,
    pub user: Username,
    pub quota_root: QuotaRoot,
    pub count: Quota,
    pub size: Quota,
    pub instant: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Added(Added),
    Expunged(Expunged),
    FlagsUpdated(FlagsUpdated),
    MailboxAdded(MailboxAdded),
    MailboxRenamed(MailboxRenamed),
    MailboxDeletion(MailboxDeletion),
    MessageMoved(MessageMoved),
    QuotaUsageUpdated(QuotaUsageUpdated),
}

bitflags! {
    /// A set of `Event` variants, used by listeners to select what they
    /// receive.
    pub struct EventKinds: u16 {
        const ADDED = 1 << 0;
        const EXPUNGED = 1 << 1;
        const FLAGS_UPDATED = 1 << 2;
        const MAILBOX_ADDED = 1 << 3;
        const MAILBOX_RENAMED = 1 << 4;
        const MAILBOX_DELETION = 1 << 5;
        const MESSAGE_MOVED = 1 << 6;
        const QUOTA_USAGE_UPDATED = 1 << 7;
    }
}

impl Event {
    pub fn kind(&self) -> EventKinds {
        match *self {
            Event::Added(..) => EventKinds::ADDED,
            Event::Expunged(..) => EventKinds::EXPUNGED,
            Event::FlagsUpdated(..) => EventKinds::FLAGS_UPDATED,
            Event::MailboxAdded(..) => EventKinds::MAILBOX_ADDED,
            Event::MailboxRenamed(..) => EventKinds::MAILBOX_RENAMED,
            Event::MailboxDeletion(..) => EventKinds::MAILBOX_DELETION,
            Event::MessageMoved(..) => EventKinds::MESSAGE_MOVED,
            Event::QuotaUsageUpdated(..) => EventKinds::QUOTA_USAGE_UPDATED,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match *self {
            Event::Added(ref e) => e.session_id,
            Event::Expunged(ref e) => e.session_id,
            Event::FlagsUpdated(ref e) => e.session_id,
            Event::MailboxAdded(ref e) => e.session_id,
            Event::MailboxRenamed(ref e) => e.session_id,
            Event::MailboxDeletion(ref e) => e.session_id,
            Event::MessageMoved(ref e) => e.session_id,
            Event::QuotaUsageUpdated(ref e) => e.session_id,
        }
    }

    pub fn user(&self) -> &Username {
        match *self {
            Event::Added(ref e) => &e.user,
            Event::Expunged(ref e) => &e.user,
            Event::FlagsUpdated(ref e) => &e.user,
            Event::MailboxAdded(ref e) => &e.user,
            Event::MailboxRenamed(ref e) => &e.user,
            Event::MailboxDeletion(ref e) => &e.user,
            Event::MessageMoved(ref e) => &e.user,
            Event::QuotaUsageUpdated(ref e) => &e.user,
        }
    }

    /// Whether the event describes no change at all.
    ///
    /// No-op events are never delivered.
    pub fn is_noop(&self) -> bool {
        match *self {
            Event::Added(ref e) => e.added.is_empty(),
            Event::Expunged(ref e) => e.expunged.is_empty(),
            Event::FlagsUpdated(ref e) => {
                !e.updated.iter().any(UpdatedFlags::flags_changed)
            },
            Event::MessageMoved(ref e) => {
                e.previous_mailboxes == e.target_mailboxes
            },
            Event::MailboxAdded(..)
            | Event::MailboxRenamed(..)
            | Event::MailboxDeletion(..)
            | Event::QuotaUsageUpdated(..) => false,
        }
    }
}

/// What a listener is registered under.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RegistrationKey {
    Mailbox(MailboxId),
    /// Every mailbox of the user.
    User(Username),
}

type Handler = dyn Fn(&Event) -> Result<(), Error> + Send + Sync;

/// A named event handler.
pub struct Listener {
    name: String,
    kinds: EventKinds,
    handler: Box<Handler>,
}

impl Listener {
    pub fn new(
        name: &str,
        kinds: EventKinds,
        handler: impl Fn(&Event) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Listener {
            name: name.to_owned(),
            kinds,
            handler: Box::new(handler),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accepts(&self, event: &Event) -> bool {
        self.kinds.contains(event.kind())
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Listener({})", self.name)
    }
}

/// The handle returned by `EventBus::register()`.
#[derive(Clone, Debug)]
pub struct Registration {
    key: RegistrationKey,
    listener: Arc<Listener>,
}

impl Registration {
    pub fn key(&self) -> &RegistrationKey {
        &self.key
    }
}

#[derive(Default)]
struct Registry {
    keyed: HashMap<RegistrationKey, Vec<Arc<Listener>>>,
    groups: BTreeMap<String, Arc<Listener>>,
}

/// The outcome of every dispatch belonging to one mutation.
///
/// Each dispatch is attempted no matter what earlier ones returned; only the
/// first failure is kept.
#[derive(Debug, Default)]
pub struct Delivery {
    first_failure: Option<Error>,
}

impl Delivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: Result<(), Error>) {
        if let Err(e) = result {
            if self.first_failure.is_none() {
                self.first_failure = Some(e);
            }
        }
    }

    pub fn finish(self) -> Result<(), Error> {
        match self.first_failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Identifies one dead letter within its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InsertionId(pub u64);

/// Events a group listener failed to process, kept until redelivered.
#[derive(Default)]
pub struct EventDeadLetters {
    inner: Mutex<DeadLettersInner>,
}

#[derive(Default)]
struct DeadLettersInner {
    next_id: u64,
    groups: BTreeMap<String, BTreeMap<InsertionId, Event>>,
}

impl EventDeadLetters {
    pub fn store(&self, group: &str, event: Event) -> InsertionId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = InsertionId(inner.next_id);
        inner
            .groups
            .entry(group.to_owned())
            .or_default()
            .insert(id, event);
        id
    }

    pub fn remove(&self, group: &str, id: InsertionId) {
        let mut inner = self.lock();
        let now_empty = if let Some(events) = inner.groups.get_mut(group) {
            events.remove(&id);
            events.is_empty()
        } else {
            false
        };
        if now_empty {
            inner.groups.remove(group);
        }
    }

    pub fn failed_event(&self, group: &str, id: InsertionId) -> Option<Event> {
        self.lock()
            .groups
            .get(group)
            .and_then(|events| events.get(&id))
            .cloned()
    }

    /// The insertion ids of `group`, oldest first.
    pub fn failed_ids(&self, group: &str) -> Vec<InsertionId> {
        self.lock()
            .groups
            .get(group)
            .map(|events| events.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn groups_with_failed_events(&self) -> Vec<String> {
        self.lock().groups.keys().cloned().collect()
    }

    pub fn contains_events(&self) -> bool {
        !self.lock().groups.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, DeadLettersInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
pub struct EventBus {
    registry: RwLock<Registry>,
    dead_letters: EventDeadLetters,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events dispatched with `key`.
    ///
    /// Registering the same listener under the same key more than once is
    /// allowed; it is still invoked once per event.
    pub fn register(
        &self,
        key: RegistrationKey,
        listener: Arc<Listener>,
    ) -> Registration {
        debug!("Registering {:?} on {:?}", listener, key);
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .keyed
            .entry(key.clone())
            .or_default()
            .push(Arc::clone(&listener));
        Registration { key, listener }
    }

    /// Remove a registration. Removing one that is already gone does
    /// nothing.
    pub fn unregister(&self, registration: &Registration) {
        let mut registry =
            self.registry.write().unwrap_or_else(|e| e.into_inner());
        let now_empty =
            if let Some(listeners) = registry.keyed.get_mut(&registration.key)
            {
                listeners.retain(|l| !Arc::ptr_eq(l, &registration.listener));
                listeners.is_empty()
            } else {
                false
            };
        if now_empty {
            registry.keyed.remove(&registration.key);
        }
    }

    /// Register `listener` as the one member of `group`, receiving every
    /// dispatched event.
    pub fn register_group(
        &self,
        group: &str,
        listener: Arc<Listener>,
    ) -> Result<(), Error> {
        let mut registry =
            self.registry.write().unwrap_or_else(|e| e.into_inner());
        if registry.groups.contains_key(group) {
            return Err(Error::GroupAlreadyRegistered(group.to_owned()));
        }

        debug!("Registering {:?} as group {}", listener, group);
        registry.groups.insert(group.to_owned(), listener);
        Ok(())
    }

    pub fn unregister_group(&self, group: &str) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .groups
            .remove(group);
    }

    /// The events group listeners failed on.
    pub fn dead_letters(&self) -> &EventDeadLetters {
        &self.dead_letters
    }

    /// Deliver `event` to every group listener and every listener registered
    /// under any of `keys`.
    ///
    /// Each listener is invoked at most once, even if it is registered under
    /// several of the keys. Listeners run one after another on this thread;
    /// a failing listener does not prevent the rest from running, but the
    /// first failure is returned once all have run. Events a group listener
    /// fails on are kept in the dead letters of that group.
    pub fn dispatch(
        &self,
        event: &Event,
        keys: &[RegistrationKey],
    ) -> Result<(), Error> {
        if event.is_noop() {
            return Ok(());
        }

        // Listeners run outside the registry lock so they can dispatch or
        // register themselves.
        let listeners = {
            let registry =
                self.registry.read().unwrap_or_else(|e| e.into_inner());
            let mut listeners: Vec<(Option<String>, Arc<Listener>)> = registry
                .groups
                .iter()
                .map(|(group, l)| (Some(group.clone()), Arc::clone(l)))
                .collect();
            for key in keys {
                for listener in registry.keyed.get(key).into_iter().flatten() {
                    if !listeners.iter().any(|(_, l)| Arc::ptr_eq(l, listener))
                    {
                        listeners.push((None, Arc::clone(listener)));
                    }
                }
            }
            listeners
        };

        let mut delivery = Delivery::new();
        for (group, listener) in listeners {
            let result = self.deliver(&listener, event);
            if let (Some(group), true) = (group, result.is_err()) {
                self.dead_letters.store(&group, event.clone());
            }
            delivery.record(result);
        }

        delivery.finish()
    }

    /// Deliver `event` to the listener of `group` alone.
    ///
    /// Fails with `NxGroup` if no such group is registered. A failure is
    /// kept in the dead letters again.
    pub fn redeliver(&self, group: &str, event: &Event) -> Result<(), Error> {
        let listener = self.group_listener(group)?;
        if event.is_noop() {
            return Ok(());
        }

        let result = self.deliver(&listener, event);
        if result.is_err() {
            self.dead_letters.store(group, event.clone());
        }
        result
    }

    /// Redeliver every dead letter of `group`, oldest first.
    ///
    /// Letters are removed as they are redelivered; those that fail again
    /// are stored under new ids and the first failure is returned after all
    /// have been attempted.
    pub fn redeliver_dead_letters(&self, group: &str) -> Result<(), Error> {
        self.group_listener(group)?;

        let mut delivery = Delivery::new();
        for id in self.dead_letters.failed_ids(group) {
            if let Some(event) = self.dead_letters.failed_event(group, id) {
                self.dead_letters.remove(group, id);
                delivery.record(self.redeliver(group, &event));
            }
        }
        delivery.finish()
    }

    fn group_listener(&self, group: &str) -> Result<Arc<Listener>, Error> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .groups
            .get(group)
            .cloned()
            .ok_or_else(|| Error::NxGroup(group.to_owned()))
    }

    fn deliver(&self, listener: &Listener, event: &Event) -> Result<(), Error> {
        if !listener.accepts(event) {
            return Ok(());
        }

        (listener.handler)(event).map_err(|e| {
            warn!(
                "Listener {} failed on {:?} event: {}",
                listener.name,
                event.kind(),
                e
            );
            Error::ListenerFailed {
                listener: listener.name.clone(),
                source: Box::new(e),
            }
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    fn mailbox_added(mailbox: u64) -> Event {
        let user = Username::new("alice");
        Event::MailboxAdded(MailboxAdded {
            session_id: SessionId(1),
            user: user.clone(),
            mailbox_id: MailboxId(mailbox),
            path: MailboxPath::inbox(user),
        })
    }

    fn recorder(
        name: &str,
        kinds: EventKinds,
    ) -> (Arc<Listener>, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let listener = Listener::new(name, kinds, move |e| {
            seen2.lock().unwrap().push(e.clone());
            Ok(())
        });
        (listener, seen)
    }

    #[test]
    fn keyed_delivery() {
        let bus = EventBus::new();
        let (listener, seen) = recorder("l", EventKinds::all());
        let registration =
            bus.register(RegistrationKey::Mailbox(MailboxId(1)), listener);

        bus.dispatch(
            &mailbox_added(1),
            &[RegistrationKey::Mailbox(MailboxId(1))],
        )
        .unwrap();
        bus.dispatch(
            &mailbox_added(2),
            &[RegistrationKey::Mailbox(MailboxId(2))],
        )
        .unwrap();
        assert_eq!(vec![mailbox_added(1)], *seen.lock().unwrap());

        bus.unregister(&registration);
        bus.unregister(&registration);
        bus.dispatch(
            &mailbox_added(1),
            &[RegistrationKey::Mailbox(MailboxId(1))],
        )
        .unwrap();
        assert_eq!(1, seen.lock().unwrap().len());
    }

    #[test]
    fn listener_invoked_once_across_keys() {
        let bus = EventBus::new();
        let (listener, seen) = recorder("l", EventKinds::all());
        let alice = Username::new("alice");
        bus.register(
            RegistrationKey::Mailbox(MailboxId(1)),
            Arc::clone(&listener),
        );
        bus.register(
            RegistrationKey::Mailbox(MailboxId(1)),
            Arc::clone(&listener),
        );
        bus.register(RegistrationKey::User(alice.clone()), listener);

        bus.dispatch(
            &mailbox_added(1),
            &[
                RegistrationKey::Mailbox(MailboxId(1)),
                RegistrationKey::User(alice),
            ],
        )
        .unwrap();
        assert_eq!(1, seen.lock().unwrap().len());
    }

    #[test]
    fn groups_see_everything_once() {
        let bus = EventBus::new();
        let (listener, seen) = recorder("g", EventKinds::all());
        bus.register_group("g", Arc::clone(&listener)).unwrap();
        assert_matches!(
            Err(Error::GroupAlreadyRegistered(_)),
            bus.register_group("g", listener)
        );

        bus.dispatch(&mailbox_added(7), &[]).unwrap();
        assert_eq!(1, seen.lock().unwrap().len());

        bus.unregister_group("g");
        bus.dispatch(&mailbox_added(7), &[]).unwrap();
        assert_eq!(1, seen.lock().unwrap().len());
    }

    #[test]
    fn kinds_and_noops_are_filtered() {
        let bus = EventBus::new();
        let (listener, seen) = recorder("l", EventKinds::ADDED);
        bus.register_group("g", listener).unwrap();

        bus.dispatch(&mailbox_added(1), &[]).unwrap();
        let user = Username::new("alice");
        let empty = Event::Added(Added {
            session_id: SessionId(1),
            user: user.clone(),
            mailbox_id: MailboxId(1),
            path: MailboxPath::inbox(user),
            added: BTreeMap::new(),
            is_append: true,
        });
        assert!(empty.is_noop());
        bus.dispatch(&empty, &[]).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn failures_surface_after_all_listeners_ran() {
        let bus = EventBus::new();
        let key = RegistrationKey::Mailbox(MailboxId(1));
        bus.register(
            key.clone(),
            Listener::new("bad", EventKinds::all(), |_| {
                Err(Error::Backend("nope".to_owned()))
            }),
        );
        let (good, seen) = recorder("good", EventKinds::all());
        bus.register(key.clone(), good);

        match bus.dispatch(&mailbox_added(1), &[key]) {
            Err(Error::ListenerFailed { listener, source }) => {
                assert_eq!("bad", listener);
                assert_matches!(Error::Backend(_), *source);
            },
            r => panic!("Unexpected result: {:?}", r),
        }
        assert_eq!(1, seen.lock().unwrap().len());
    }

    #[test]
    fn listeners_may_dispatch_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let (inner, seen) = recorder("inner", EventKinds::all());
        bus.register(RegistrationKey::Mailbox(MailboxId(2)), inner);

        let weak = Arc::downgrade(&bus);
        bus.register(
            RegistrationKey::Mailbox(MailboxId(1)),
            Listener::new("outer", EventKinds::all(), move |_| {
                weak.upgrade().unwrap().dispatch(
                    &mailbox_added(2),
                    &[RegistrationKey::Mailbox(MailboxId(2))],
                )
            }),
        );

        bus.dispatch(
            &mailbox_added(1),
            &[RegistrationKey::Mailbox(MailboxId(1))],
        )
        .unwrap();
        assert_eq!(vec![mailbox_added(2)], *seen.lock().unwrap());
    }

    fn flaky_group(
        bus: &EventBus,
        group: &str,
    ) -> (Arc<AtomicBool>, Arc<Mutex<Vec<Event>>>) {
        let failing = Arc::new(AtomicBool::new(true));
        let failing2 = Arc::clone(&failing);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        bus.register_group(
            group,
            Listener::new(group, EventKinds::all(), move |e| {
                if failing2.load(Ordering::SeqCst) {
                    Err(Error::Backend("down".to_owned()))
                } else {
                    seen2.lock().unwrap().push(e.clone());
                    Ok(())
                }
            }),
        )
        .unwrap();
        (failing, seen)
    }

    #[test]
    fn failed_group_deliveries_become_dead_letters() {
        let bus = EventBus::new();
        let (failing, seen) = flaky_group(&bus, "g");
        bus.register(
            RegistrationKey::Mailbox(MailboxId(1)),
            Listener::new("keyed", EventKinds::all(), |_| {
                Err(Error::Backend("also down".to_owned()))
            }),
        );

        assert_matches!(
            Err(Error::ListenerFailed { .. }),
            bus.dispatch(
                &mailbox_added(1),
                &[RegistrationKey::Mailbox(MailboxId(1))]
            )
        );
        assert_eq!(
            vec!["g".to_owned()],
            bus.dead_letters().groups_with_failed_events()
        );
        let ids = bus.dead_letters().failed_ids("g");
        assert_eq!(1, ids.len());
        assert_eq!(
            Some(mailbox_added(1)),
            bus.dead_letters().failed_event("g", ids[0])
        );

        // Still failing: the letter is kept
        assert_matches!(
            Err(Error::ListenerFailed { .. }),
            bus.redeliver_dead_letters("g")
        );
        assert_eq!(1, bus.dead_letters().failed_ids("g").len());

        failing.store(false, Ordering::SeqCst);
        bus.redeliver_dead_letters("g").unwrap();
        assert!(!bus.dead_letters().contains_events());
        assert_eq!(vec![mailbox_added(1)], *seen.lock().unwrap());
    }

    #[test]
    fn redeliver_targets_one_group() {
        let bus = EventBus::new();
        let (failing, seen) = flaky_group(&bus, "g");
        failing.store(false, Ordering::SeqCst);
        let (other, other_seen) = recorder("h", EventKinds::all());
        bus.register_group("h", other).unwrap();

        bus.redeliver("g", &mailbox_added(3)).unwrap();
        assert_eq!(vec![mailbox_added(3)], *seen.lock().unwrap());
        assert!(other_seen.lock().unwrap().is_empty());

        assert_matches!(
            Err(Error::NxGroup(_)),
            bus.redeliver("nx", &mailbox_added(3))
        );
        assert_matches!(
            Err(Error::NxGroup(_)),
            bus.redeliver_dead_letters("nx")
        );
    }

    #[test]
    fn redeliver_skips_noops() {
        let bus = EventBus::new();
        let (_failing, _) = flaky_group(&bus, "g");
        let user = Username::new("alice");
        let empty = Event::Expunged(Expunged {
            session_id: SessionId(1),
            user: user.clone(),
            mailbox_id: MailboxId(1),
            path: MailboxPath::inbox(user),
            expunged: BTreeMap::new(),
        });
        assert!(empty.is_noop());
        bus.redeliver("g", &empty).unwrap();
        assert!(!bus.dead_letters().contains_events());
    }

    #[test]
    fn delivery_keeps_first_failure() {
        let mut delivery = Delivery::new();
        delivery.record(Ok(()));
        delivery.record(Err(Error::NxThread));
        delivery.record(Err(Error::NxMailbox));
        assert_matches!(Err(Error::NxThread), delivery.finish());
        Delivery::new().finish().unwrap();
    }
}
