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

//! Binary form of events, for listeners living outside the process.

use super::events::Event;
use crate::support::error::Error;

pub fn to_cbor(event: &Event) -> Result<Vec<u8>, Error> {
    Ok(serde_cbor::to_vec(event)?)
}

pub fn from_cbor(data: &[u8]) -> Result<Event, Error> {
    Ok(serde_cbor::from_slice(data)?)
}

#[cfg(test)]
mod test {
    use std::collections::{BTreeMap, BTreeSet};

    use chrono::prelude::*;

    use super::*;
    use crate::store::events::*;
    use crate::store::flags::UpdatedFlags;
    use crate::store::mailbox::MailboxPath;
    use crate::store::model::*;
    use crate::store::quota::*;
    use crate::store::session::SessionId;

    fn alice() -> Username {
        Username::new("alice@example.com")
    }

    #[test]
    fn flag_updates_survive_encoding() {
        let flags: Flags = vec![Flag::Seen, Flag::kw("$Work")]
            .into_iter()
            .collect();
        let event = Event::FlagsUpdated(FlagsUpdated {
            session_id: SessionId(4),
            user: alice(),
            mailbox_id: MailboxId(2),
            path: MailboxPath::inbox(alice()),
            updated: vec![UpdatedFlags {
                message_id: MessageId(9),
                uid: Uid::u(3),
                modseq: Modseq::of(12).unwrap(),
                old_flags: Flags::new(),
                new_flags: flags,
            }],
        });

        assert_eq!(event, from_cbor(&to_cbor(&event).unwrap()).unwrap());
    }

    #[test]
    fn added_with_metadata_survives_encoding() {
        let mut added = BTreeMap::new();
        added.insert(
            Uid::u(5),
            MessageMetadata {
                message_id: MessageId(1),
                uid: Uid::u(5),
                modseq: Modseq::MIN,
                flags: Flags::new(),
                size: 1234,
                internal_date: Utc.timestamp(1_600_000_000, 0),
                thread_id: ThreadId::from_base_message_id(MessageId(1)),
            },
        );
        let event = Event::Added(Added {
            session_id: SessionId(1),
            user: alice(),
            mailbox_id: MailboxId(1),
            path: MailboxPath::inbox(alice()),
            added,
            is_append: false,
        });

        assert_eq!(event, from_cbor(&to_cbor(&event).unwrap()).unwrap());
    }

    #[test]
    fn quota_and_move_events_survive_encoding() {
        let quota = Event::QuotaUsageUpdated(QuotaUsageUpdated {
            session_id: SessionId(1),
            user: alice(),
            quota_root: QuotaRoot::for_user(&alice()),
            count: Quota {
                used: 3,
                limit: QuotaLimit::Unlimited,
            },
            size: Quota {
                used: 300,
                limit: QuotaLimit::Limited(1000),
            },
            instant: Utc.timestamp(1_600_000_000, 0),
        });
        assert_eq!(quota, from_cbor(&to_cbor(&quota).unwrap()).unwrap());

        let moved = Event::MessageMoved(MessageMoved {
            session_id: SessionId(1),
            user: alice(),
            message_id: MessageId(1),
            previous_mailboxes: vec![MailboxId(1)].into_iter().collect(),
            target_mailboxes: BTreeSet::new(),
        });
        assert_eq!(moved, from_cbor(&to_cbor(&moved).unwrap()).unwrap());
    }

    #[test]
    fn garbage_is_rejected() {
        assert_matches!(Err(Error::Cbor(_)), from_cbor(b"\xff\x00garbage"));
    }
}
