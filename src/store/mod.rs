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

//! The mail store core.
//!
//! `StoreSystem` wires the managers to a backend and their shared
//! collaborators. Everything protocol-facing goes through `MailboxManager`
//! (mailboxes, and placements addressed by UID) or `MessageIdManager`
//! (messages addressed by id, across mailboxes).

use std::sync::Arc;

use log::info;

pub mod acl;
pub mod batcher;
pub mod context;
pub mod event_codec;
pub mod events;
pub mod flags;
pub mod hooks;
pub mod locker;
pub mod mailbox;
pub mod mailbox_manager;
pub mod mapper;
pub mod memory;
pub mod message_id_manager;
pub mod model;
pub mod quota;
pub mod session;
pub mod thread;

use self::acl::OwnerAclRightsResolver;
use self::context::StoreContext;
use self::events::EventBus;
use self::hooks::PreDeletionHooks;
use self::locker::MailboxLocker;
use self::mailbox_manager::MailboxManager;
use self::memory::InMemoryMapper;
use self::message_id_manager::MessageIdManager;
use self::quota::*;
use self::thread::SubjectThreadIdGuesser;
use crate::support::error::Error;
use crate::support::metrics::LogMetrics;
use crate::support::system_config::SystemConfig;

/// A complete store over the in-memory backend.
pub struct StoreSystem {
    pub mailbox_manager: MailboxManager,
    pub message_id_manager: MessageIdManager,
    pub events: Arc<EventBus>,
    pub quota: Arc<QuotaManager>,
    pub max_quota: Arc<InMemoryMaxQuotaManager>,
}

impl StoreSystem {
    pub fn in_memory(config: &SystemConfig) -> Result<Self, Error> {
        Self::in_memory_with_hooks(
            config,
            PreDeletionHooks::new(Arc::new(LogMetrics)),
        )
    }

    pub fn in_memory_with_hooks(
        config: &SystemConfig,
        hooks: PreDeletionHooks,
    ) -> Result<Self, Error> {
        let batch_sizes = config.batch.batch_sizes()?;
        let mapper = Arc::new(InMemoryMapper::new());
        let max_quota =
            Arc::new(InMemoryMaxQuotaManager::from_config(&config.quota));
        let quota = Arc::new(QuotaManager::new(
            Arc::clone(&max_quota) as Arc<dyn MaxQuotaManager>,
            Arc::new(InMemoryCurrentQuotaManager::new()),
        ));
        let quota_roots: Arc<dyn QuotaRootResolver> =
            Arc::new(UserQuotaRootResolver);
        let events = Arc::new(EventBus::new());
        CurrentQuotaUpdater::register(
            Arc::clone(&quota),
            Arc::clone(&quota_roots),
            &events,
        )?;

        let ctx = StoreContext {
            mailboxes: mapper.clone(),
            messages: mapper.clone(),
            rights: Arc::new(OwnerAclRightsResolver),
            quota: Arc::clone(&quota),
            quota_roots,
            events: Arc::clone(&events),
            hooks: Arc::new(hooks),
            threads: Arc::new(SubjectThreadIdGuesser::new(
                mapper.clone(),
                mapper,
            )),
            locker: Arc::new(MailboxLocker::new(config.locking.timeout())),
            batch_sizes,
        };
        info!(
            "Store started with {} pre-deletion hooks, batch sizes {:?}",
            ctx.hooks.len(),
            batch_sizes
        );

        Ok(StoreSystem {
            mailbox_manager: MailboxManager::new(ctx.clone()),
            message_id_manager: MessageIdManager::new(ctx),
            events,
            quota,
            max_quota,
        })
    }
}
