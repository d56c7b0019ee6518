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

use std::io;

use thiserror::Error;

use crate::store::acl::Rights;
use crate::store::model::MailboxId;
use crate::store::quota::{QuotaLimit, QuotaResource, QuotaRoot};

#[derive(Error, Debug)]
pub enum Error {
    #[error("No such mailbox")]
    NxMailbox,
    #[error("No such thread")]
    NxThread,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("Missing rights {1} on mailbox {0}")]
    PermissionDenied(MailboxId, Rights),
    #[error("Over quota on {root} for {resource}: {used} used, limit {limit}")]
    OverQuota {
        root: QuotaRoot,
        resource: QuotaResource,
        used: u64,
        limit: QuotaLimit,
    },
    #[error("Pre-deletion hook {hook} failed: {source}")]
    HookFailed {
        hook: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Listener {listener} failed: {source}")]
    ListenerFailed {
        listener: String,
        #[source]
        source: Box<Error>,
    },
    #[error("No such listener group {0}")]
    NxGroup(String),
    #[error("Listener group {0} is already registered")]
    GroupAlreadyRegistered(String),
    #[error("Batch size must not be negative (got {0})")]
    NegativeBatchSize(i64),
    #[error("Timed out waiting for mailbox lock")]
    LockTimeout,
    #[error("Cannot upgrade a held read lock to a write lock")]
    LockUpgrade,
    #[error("Mailbox full")]
    MailboxFull,
    #[error("Non-existent system flag")]
    NxFlag,
    #[error("Unsafe flag or mailbox name")]
    UnsafeName,
    #[error("Storage backend failure: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
}
