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

//! Storage quotas.
//!
//! Usage is accounted per quota root. Each root has two independent
//! dimensions, the message count and the total storage in bytes, each with
//! its own limit which may be `Unlimited`.
//!
//! The current usage is not computed by scanning mailboxes. It is kept up to
//! date by `CurrentQuotaUpdater`, a group listener on the event bus which
//! applies every `Added`, `Expunged` and `MailboxDeletion` event to the
//! counters. Since the managers dispatch those events while still holding
//! the lock of the quota root, the next quota check on the same root always
//! sees the effect of the previous mutation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::prelude::*;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::events::*;
use super::mailbox::MailboxPath;
use super::model::Username;
use crate::support::error::Error;
use crate::support::system_config::{QuotaConfig, QuotaLimits};

/// The limit of one quota dimension.
///
/// `Unlimited` is its own value, never a large number, so sums against it
/// cannot overflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaLimit {
    Limited(u64),
    Unlimited,
}

impl From<Option<u64>> for QuotaLimit {
    fn from(limit: Option<u64>) -> Self {
        limit.map_or(QuotaLimit::Unlimited, QuotaLimit::Limited)
    }
}

impl fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            QuotaLimit::Limited(n) => write!(f, "{}", n),
            QuotaLimit::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// The scope usage is accounted against.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct QuotaRoot {
    pub name: String,
    /// The user whose limits apply to this root.
    pub user: Username,
}

impl QuotaRoot {
    pub fn for_user(user: &Username) -> Self {
        QuotaRoot {
            name: format!("#private&{}", user),
            user: user.clone(),
        }
    }
}

impl fmt::Display for QuotaRoot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaResource {
    MessageCount,
    Storage,
}

impl fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            QuotaResource::MessageCount => write!(f, "MESSAGE"),
            QuotaResource::Storage => write!(f, "STORAGE"),
        }
    }
}

/// Usage and limit of one dimension of one root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub used: u64,
    pub limit: QuotaLimit,
}

impl Quota {
    pub fn is_over_quota(&self) -> bool {
        self.is_over_quota_with_addition(0)
    }

    pub fn is_over_quota_with_addition(&self, addition: u64) -> bool {
        match self.limit {
            QuotaLimit::Unlimited => false,
            QuotaLimit::Limited(limit) => self
                .used
                .checked_add(addition)
                .map_or(true, |total| total > limit),
        }
    }
}

/// Current usage of one root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuotaUsage {
    pub count: u64,
    pub size: u64,
}

/// Maps mailboxes to the quota roots they are accounted against.
pub trait QuotaRootResolver: Send + Sync {
    fn quota_root(&self, path: &MailboxPath) -> QuotaRoot;
}

/// Every mailbox of a user is accounted against that user's root.
#[derive(Clone, Copy, Debug, Default)]
pub struct UserQuotaRootResolver;

impl QuotaRootResolver for UserQuotaRootResolver {
    fn quota_root(&self, path: &MailboxPath) -> QuotaRoot {
        QuotaRoot::for_user(&path.user)
    }
}

/// Provides the configured limits of quota roots.
pub trait MaxQuotaManager: Send + Sync {
    fn max_message_count(&self, root: &QuotaRoot) -> QuotaLimit;
    fn max_storage(&self, root: &QuotaRoot) -> QuotaLimit;
}

/// Limits resolved from user, then domain, then global settings.
///
/// Each dimension is resolved separately, so a user may have their own
/// message-count limit while inheriting the storage limit of their domain.
#[derive(Debug, Default)]
pub struct InMemoryMaxQuotaManager {
    limits: Mutex<LimitTable>,
}

#[derive(Debug, Default)]
struct LimitTable {
    global: QuotaLimits,
    domains: BTreeMap<String, QuotaLimits>,
    users: BTreeMap<String, QuotaLimits>,
}

impl InMemoryMaxQuotaManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &QuotaConfig) -> Self {
        InMemoryMaxQuotaManager {
            limits: Mutex::new(LimitTable {
                global: QuotaLimits {
                    max_messages: config.max_messages,
                    max_storage: config.max_storage,
                },
                domains: config.domains.clone(),
                users: config.users.clone(),
            }),
        }
    }

    pub fn set_global_max_message_count(&self, limit: Option<u64>) {
        self.lock().global.max_messages = limit;
    }

    pub fn set_global_max_storage(&self, limit: Option<u64>) {
        self.lock().global.max_storage = limit;
    }

    pub fn set_domain_limits(&self, domain: &str, limits: QuotaLimits) {
        self.lock().domains.insert(domain.to_owned(), limits);
    }

    pub fn set_user_limits(&self, user: &Username, limits: QuotaLimits) {
        self.lock().users.insert(user.0.clone(), limits);
    }

    fn lock(&self) -> MutexGuard<'_, LimitTable> {
        self.limits.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(
        &self,
        root: &QuotaRoot,
        dimension: impl Fn(&QuotaLimits) -> Option<u64>,
    ) -> QuotaLimit {
        let limits = self.lock();
        let user = limits.users.get(root.user.as_str()).and_then(&dimension);
        let domain = root
            .user
            .domain()
            .and_then(|d| limits.domains.get(d))
            .and_then(&dimension);
        user.or(domain).or_else(|| dimension(&limits.global)).into()
    }
}

impl MaxQuotaManager for InMemoryMaxQuotaManager {
    fn max_message_count(&self, root: &QuotaRoot) -> QuotaLimit {
        self.resolve(root, |l| l.max_messages)
    }

    fn max_storage(&self, root: &QuotaRoot) -> QuotaLimit {
        self.resolve(root, |l| l.max_storage)
    }
}

/// Holds the current usage of quota roots.
pub trait CurrentQuotaManager: Send + Sync {
    fn usage(&self, root: &QuotaRoot) -> Result<QuotaUsage, Error>;
    fn increase(
        &self,
        root: &QuotaRoot,
        count: u64,
        size: u64,
    ) -> Result<(), Error>;
    /// Usage never goes below zero.
    fn decrease(
        &self,
        root: &QuotaRoot,
        count: u64,
        size: u64,
    ) -> Result<(), Error>;
}

#[derive(Debug, Default)]
pub struct InMemoryCurrentQuotaManager {
    usage: Mutex<HashMap<QuotaRoot, QuotaUsage>>,
}

impl InMemoryCurrentQuotaManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QuotaRoot, QuotaUsage>> {
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CurrentQuotaManager for InMemoryCurrentQuotaManager {
    fn usage(&self, root: &QuotaRoot) -> Result<QuotaUsage, Error> {
        Ok(self.lock().get(root).copied().unwrap_or_default())
    }

    fn increase(
        &self,
        root: &QuotaRoot,
        count: u64,
        size: u64,
    ) -> Result<(), Error> {
        let mut usage = self.lock();
        let entry = usage.entry(root.clone()).or_default();
        entry.count = entry.count.saturating_add(count);
        entry.size = entry.size.saturating_add(size);
        Ok(())
    }

    fn decrease(
        &self,
        root: &QuotaRoot,
        count: u64,
        size: u64,
    ) -> Result<(), Error> {
        let mut usage = self.lock();
        let entry = usage.entry(root.clone()).or_default();
        entry.count = entry.count.saturating_sub(count);
        entry.size = entry.size.saturating_sub(size);
        Ok(())
    }
}

/// Combines limits and usage, and guards mutations against them.
pub struct QuotaManager {
    max: Arc<dyn MaxQuotaManager>,
    current: Arc<dyn CurrentQuotaManager>,
}

impl QuotaManager {
    pub fn new(
        max: Arc<dyn MaxQuotaManager>,
        current: Arc<dyn CurrentQuotaManager>,
    ) -> Self {
        QuotaManager { max, current }
    }

    pub fn current(&self) -> &dyn CurrentQuotaManager {
        &*self.current
    }

    pub fn message_quota(&self, root: &QuotaRoot) -> Result<Quota, Error> {
        Ok(Quota {
            used: self.current.usage(root)?.count,
            limit: self.max.max_message_count(root),
        })
    }

    pub fn storage_quota(&self, root: &QuotaRoot) -> Result<Quota, Error> {
        Ok(Quota {
            used: self.current.usage(root)?.size,
            limit: self.max.max_storage(root),
        })
    }

    /// Check that adding `messages` messages totalling `bytes` bytes to
    /// `root` keeps it within both limits.
    ///
    /// Negative values (a net removal) always pass. The caller must hold the
    /// lock of `root` from this check until the mutation is committed.
    pub fn check_can_add(
        &self,
        root: &QuotaRoot,
        messages: i64,
        bytes: i64,
    ) -> Result<(), Error> {
        let checks = [
            (QuotaResource::MessageCount, messages),
            (QuotaResource::Storage, bytes),
        ];
        for &(resource, addition) in &checks {
            if addition <= 0 {
                continue;
            }

            let quota = match resource {
                QuotaResource::MessageCount => self.message_quota(root)?,
                QuotaResource::Storage => self.storage_quota(root)?,
            };
            if quota.is_over_quota_with_addition(addition as u64) {
                return Err(Error::OverQuota {
                    root: root.clone(),
                    resource,
                    used: quota.used,
                    limit: quota.limit,
                });
            }
        }

        Ok(())
    }
}

/// The group name `CurrentQuotaUpdater` registers under.
pub const CURRENT_QUOTA_UPDATER_GROUP: &str = "current-quota-updater";

/// Keeps current usage in step with the events of the bus.
pub struct CurrentQuotaUpdater {
    quota: Arc<QuotaManager>,
    roots: Arc<dyn QuotaRootResolver>,
    bus: Weak<EventBus>,
}

impl CurrentQuotaUpdater {
    pub fn new(
        quota: Arc<QuotaManager>,
        roots: Arc<dyn QuotaRootResolver>,
        bus: &Arc<EventBus>,
    ) -> Self {
        CurrentQuotaUpdater {
            quota,
            roots,
            bus: Arc::downgrade(bus),
        }
    }

    /// Register a new updater as a group listener on `bus`.
    pub fn register(
        quota: Arc<QuotaManager>,
        roots: Arc<dyn QuotaRootResolver>,
        bus: &Arc<EventBus>,
    ) -> Result<(), Error> {
        let updater = Self::new(quota, roots, bus);
        bus.register_group(
            CURRENT_QUOTA_UPDATER_GROUP,
            Listener::new(
                CURRENT_QUOTA_UPDATER_GROUP,
                EventKinds::ADDED
                    | EventKinds::EXPUNGED
                    | EventKinds::MAILBOX_DELETION,
                move |event| updater.handle(event),
            ),
        )
    }

    fn handle(&self, event: &Event) -> Result<(), Error> {
        let (session_id, root) = match *event {
            Event::Added(ref e) => {
                let root = self.roots.quota_root(&e.path);
                let (count, size) = totals(e.added.values());
                self.quota.current().increase(&root, count, size)?;
                (e.session_id, root)
            },
            Event::Expunged(ref e) => {
                let root = self.roots.quota_root(&e.path);
                let (count, size) = totals(e.expunged.values());
                self.quota.current().decrease(&root, count, size)?;
                (e.session_id, root)
            },
            Event::MailboxDeletion(ref e) => {
                self.quota.current().decrease(
                    &e.quota_root,
                    e.deleted_messages,
                    e.total_size,
                )?;
                (e.session_id, e.quota_root.clone())
            },
            _ => return Ok(()),
        };

        let bus = match self.bus.upgrade() {
            Some(bus) => bus,
            None => {
                warn!("Quota of {} updated after event bus shut down", root);
                return Ok(());
            },
        };

        let usage = Event::QuotaUsageUpdated(QuotaUsageUpdated {
            session_id,
            user: root.user.clone(),
            count: self.quota.message_quota(&root)?,
            size: self.quota.storage_quota(&root)?,
            quota_root: root.clone(),
            instant: Utc::now(),
        });
        debug!("Quota usage of {} changed", root);
        bus.dispatch(&usage, &[RegistrationKey::User(root.user.clone())])
    }
}

fn totals<'a>(
    metadata: impl Iterator<Item = &'a crate::store::model::MessageMetadata>,
) -> (u64, u64) {
    metadata.fold((0, 0), |(count, size), m| {
        (count + 1, size.saturating_add(m.size))
    })
}
