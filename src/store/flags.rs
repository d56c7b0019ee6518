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

//! Flag arithmetic.
//!
//! Everything here is pure. The managers decide which placements to apply it
//! to and what to do with the result.

use serde::{Deserialize, Serialize};

use super::model::*;

/// Computes the new flags of a placement from its current flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagsUpdateCalculator {
    flags: Flags,
    mode: FlagsUpdateMode,
}

impl FlagsUpdateCalculator {
    pub fn new(flags: Flags, mode: FlagsUpdateMode) -> Self {
        FlagsUpdateCalculator { flags, mode }
    }

    pub fn build_new_flags(&self, old_flags: &Flags) -> Flags {
        match self.mode {
            FlagsUpdateMode::Replace => self.flags.clone(),
            FlagsUpdateMode::Add => old_flags.union(&self.flags),
            FlagsUpdateMode::Remove => old_flags.difference(&self.flags),
        }
    }
}

/// Fold per-message flag sets into the set of user flags they mention.
///
/// System flags never appear in the result.
pub fn applicable_flags<'a>(
    message_flags: impl IntoIterator<Item = &'a Flags>,
) -> Flags {
    let mut result = Flags::new();
    for flags in message_flags {
        merge_applicable_flags(&mut result, flags);
    }
    result
}

/// Add the user flags of `flags` to the growing set `applicable`.
///
/// Returns whether `applicable` gained anything.
pub fn merge_applicable_flags(applicable: &mut Flags, flags: &Flags) -> bool {
    let mut changed = false;
    for flag in flags.user_flags() {
        changed |= applicable.insert(flag.clone());
    }
    changed
}

/// The change of flags of one placement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedFlags {
    pub message_id: MessageId,
    pub uid: Uid,
    pub modseq: Modseq,
    pub old_flags: Flags,
    pub new_flags: Flags,
}

impl UpdatedFlags {
    pub fn flags_changed(&self) -> bool {
        self.old_flags != self.new_flags
    }

    /// System flags that were set or cleared, in stable flag order.
    pub fn modified_system_flags(&self) -> Vec<Flag> {
        self.old_flags
            .symmetric_difference(&self.new_flags)
            .system_flags()
            .cloned()
            .collect()
    }

    pub fn is_modified_to_set(&self, flag: &Flag) -> bool {
        !self.old_flags.contains(flag) && self.new_flags.contains(flag)
    }

    pub fn is_modified_to_unset(&self, flag: &Flag) -> bool {
        self.old_flags.contains(flag) && !self.new_flags.contains(flag)
    }

    pub fn added_user_flags(&self) -> Vec<Flag> {
        self.new_flags
            .difference(&self.old_flags)
            .user_flags()
            .cloned()
            .collect()
    }

    pub fn removed_user_flags(&self) -> Vec<Flag> {
        self.old_flags
            .difference(&self.new_flags)
            .user_flags()
            .cloned()
            .collect()
    }
}
