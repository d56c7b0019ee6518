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

use std::num::NonZeroU32;

use log::debug;

use super::model::{MessageRange, Uid};
use crate::support::error::Error;

/// The maximum number of UIDs one batch covers.
///
/// `UNBOUNDED` means the whole range is processed as a single batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSize(Option<NonZeroU32>);

impl BatchSize {
    pub const UNBOUNDED: Self = BatchSize(None);

    /// Interpret a configured batch size. 0 means unbounded.
    pub fn of(size: i64) -> Result<Self, Error> {
        if size < 0 {
            return Err(Error::NegativeBatchSize(size));
        }

        // Anything beyond the UID space is the same as one batch.
        Ok(BatchSize(
            u32::try_from(size).ok().and_then(NonZeroU32::new),
        ))
    }
}

/// The batch sizes used by the bulk mailbox operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSizes {
    pub fetch: BatchSize,
    pub flags: BatchSize,
    pub expunge: BatchSize,
}

impl BatchSizes {
    pub const DEFAULT_SIZE: i64 = 200;

    pub fn uniform(size: BatchSize) -> Self {
        BatchSizes {
            fetch: size,
            flags: size,
            expunge: size,
        }
    }
}

impl Default for BatchSizes {
    fn default() -> Self {
        BatchSizes::uniform(BatchSize(NonZeroU32::new(
            Self::DEFAULT_SIZE as u32,
        )))
    }
}

/// Splits UID ranges into consecutive sub-ranges of bounded size.
#[derive(Clone, Copy, Debug)]
pub struct MessageBatcher {
    size: BatchSize,
}

impl MessageBatcher {
    pub fn new(size: i64) -> Result<Self, Error> {
        Ok(MessageBatcher {
            size: BatchSize::of(size)?,
        })
    }

    pub fn with_size(size: BatchSize) -> Self {
        MessageBatcher { size }
    }

    /// The sub-ranges `range` is split into, in order.
    pub fn split(&self, range: MessageRange) -> Vec<MessageRange> {
        let size = match self.size.0 {
            None => return vec![range],
            Some(size) => size.get(),
        };

        let mut batches = Vec::new();
        let mut from = range.from;
        loop {
            let end = from.get().saturating_add(size - 1).min(range.to.get());
            // end >= from >= 1
            let to = Uid::of(end).unwrap_or(range.to);
            batches.push(MessageRange { from, to });

            match to.next() {
                Some(next) if to < range.to => from = next,
                _ => break,
            }
        }
        batches
    }

    /// Run `operation` once per sub-range of `range`, in order, and
    /// concatenate the results.
    ///
    /// The first failure aborts the remaining sub-ranges.
    pub fn batch<T>(
        &self,
        range: MessageRange,
        mut operation: impl FnMut(MessageRange) -> Result<Vec<T>, Error>,
    ) -> Result<Vec<T>, Error> {
        let mut results = Vec::new();
        for sub_range in self.split(range) {
            debug!("Processing batch {}", sub_range);
            results.extend(operation(sub_range)?);
        }
        Ok(results)
    }
}
