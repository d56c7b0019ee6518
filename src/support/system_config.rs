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
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::batcher::{BatchSize, BatchSizes};
use crate::support::error::Error;

/// The system-wide configuration for the mail store core.
///
/// This is stored in a file named `mailcore.toml`. Every section is optional;
/// an empty file yields a working (if unconstrained) configuration.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Sizes of the sub-ranges bulk operations are split into.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Storage quota limits.
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Behaviour of the per-mailbox lock layer.
    #[serde(default)]
    pub locking: LockingConfig,
}

impl SystemConfig {
    /// Parse a configuration from TOML text.
    pub fn parse(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    /// Load and parse the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }
}

/// Batch sizes, as UID counts.
///
/// 0 means that the operation is done in one single batch regardless of the
/// size of the range. Negative values are rejected when the configuration is
/// turned into `BatchSizes`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub fetch: i64,
    pub flags: i64,
    pub expunge: i64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            fetch: BatchSizes::DEFAULT_SIZE,
            flags: BatchSizes::DEFAULT_SIZE,
            expunge: BatchSizes::DEFAULT_SIZE,
        }
    }
}

impl BatchConfig {
    pub fn batch_sizes(&self) -> Result<BatchSizes, Error> {
        Ok(BatchSizes {
            fetch: BatchSize::of(self.fetch)?,
            flags: BatchSize::of(self.flags)?,
            expunge: BatchSize::of(self.expunge)?,
        })
    }
}

/// Quota limits at each level of resolution.
///
/// A user-level limit takes precedence over a domain-level limit, which takes
/// precedence over the global limit. A dimension which is unset at every
/// level is unlimited.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub max_messages: Option<u64>,
    pub max_storage: Option<u64>,
    pub domains: BTreeMap<String, QuotaLimits>,
    pub users: BTreeMap<String, QuotaLimits>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuotaLimits {
    pub max_messages: Option<u64>,
    pub max_storage: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LockingConfig {
    /// If set, give up acquiring a mailbox lock after this many milliseconds.
    ///
    /// If unset, acquisition blocks until the lock is available.
    pub timeout_ms: Option<u64>,
}

impl LockingConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
