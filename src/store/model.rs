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

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FromIterator;
use std::num::{NonZeroU32, NonZeroU64};
use std::str::FromStr;
use std::sync::Arc;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// The backend-wide identity of one logical message.
///
/// A `MessageId` is independent of the mailboxes the message lives in. The
/// message exists as long as it has at least one placement.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identity of one mailbox. Never reused, never changed by a rename.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct MailboxId(pub u64);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Uniquely identifies a placement within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as placements are added to the
/// mailbox. UIDs are never reused, even after the placement holding one is
/// expunged.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self = unsafe { Uid(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn next(self) -> Option<Self> {
        self.0.get().checked_add(1).and_then(Uid::of)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

/// The per-mailbox modification sequence number (RFC 7162 MODSEQ).
///
/// Each mailbox has its own sequence. Creating a placement or changing its
/// flags assigns the placement the next value of the sequence of its
/// mailbox, so no two mutations in one mailbox ever share a `Modseq`.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Modseq(NonZeroU64);

impl Modseq {
    pub const MIN: Self = unsafe { Modseq(NonZeroU64::new_unchecked(1)) };

    pub fn of(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Modseq)
    }

    pub fn next(self) -> Option<Self> {
        self.0.get().checked_add(1).and_then(Modseq::of)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for Modseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Modseq({})", self.0.get())
    }
}

impl fmt::Display for Modseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// An inclusive, non-empty range of UIDs.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MessageRange {
    pub from: Uid,
    pub to: Uid,
}

impl MessageRange {
    /// Create the range `[a, b]`, swapping the ends if they are reversed.
    pub fn new(a: Uid, b: Uid) -> Self {
        MessageRange {
            from: a.min(b),
            to: a.max(b),
        }
    }

    pub fn one(uid: Uid) -> Self {
        MessageRange { from: uid, to: uid }
    }

    pub fn all() -> Self {
        MessageRange {
            from: Uid::MIN,
            to: Uid::MAX,
        }
    }

    pub fn contains(&self, uid: Uid) -> bool {
        uid >= self.from && uid <= self.to
    }

    /// The number of UIDs in the range, not the number of placements.
    pub fn len(&self) -> u64 {
        u64::from(self.to.get()) - u64::from(self.from.get()) + 1
    }
}

impl fmt::Display for MessageRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}:{}", self.from, self.to)
        }
    }
}

impl fmt::Debug for MessageRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[Uid {}]", self)
    }
}

/// A message flag.
///
/// System flags are represented as top-level enum values. User-defined flags
/// are in the `Keyword` case.
///
/// The `Display` format of this type is the exact string value that would be
/// sent over the wire. `FromStr` does the reverse conversion, and also
/// understands non-standard casing of the system flags.
///
/// Flags are ordered by their declaration order here, keywords last and
/// among themselves by ASCII-case-insensitive name. Every set of flags in
/// this crate iterates in that order, which is what makes flag deltas
/// reproducible.
#[derive(Clone, Serialize, Deserialize)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Recent,
    Seen,
    Keyword(String),
}

impl Flag {
    pub fn is_system(&self) -> bool {
        !matches!(*self, Flag::Keyword(..))
    }

    fn rank(&self) -> u8 {
        match *self {
            Flag::Answered => 0,
            Flag::Deleted => 1,
            Flag::Draft => 2,
            Flag::Flagged => 3,
            Flag::Recent => 4,
            Flag::Seen => 5,
            Flag::Keyword(..) => 6,
        }
    }

    #[cfg(test)]
    pub fn kw(name: &str) -> Self {
        Flag::Keyword(name.to_owned())
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Flag::Answered => write!(f, "\\Answered"),
            &Flag::Deleted => write!(f, "\\Deleted"),
            &Flag::Draft => write!(f, "\\Draft"),
            &Flag::Flagged => write!(f, "\\Flagged"),
            &Flag::Recent => write!(f, "\\Recent"),
            &Flag::Seen => write!(f, "\\Seen"),
            &Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\recent") {
            Ok(Flag::Recent)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::NxFlag)
        } else if !s.is_empty() && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

fn cmp_keyword(a: &str, b: &str) -> Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

// Keywords are compared ASCII-case-insensitively. Eq, Ord and Hash all agree
// on that.
impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        Ordering::Equal == self.cmp(other)
    }
}

impl Eq for Flag {}

impl PartialOrd for Flag {
    fn partial_cmp(&self, other: &Flag) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Flag {
    fn cmp(&self, other: &Flag) -> Ordering {
        match (self, other) {
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => cmp_keyword(a, b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Flag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        if let Flag::Keyword(ref kw) = *self {
            for b in kw.bytes() {
                state.write_u8(b.to_ascii_lowercase());
            }
        }
    }
}

/// A set of flags, iterated in the stable `Flag` order.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(BTreeSet<Flag>);

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, flag: &Flag) -> bool {
        self.0.contains(flag)
    }

    pub fn insert(&mut self, flag: Flag) -> bool {
        self.0.insert(flag)
    }

    pub fn remove(&mut self, flag: &Flag) -> bool {
        self.0.remove(flag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> + '_ {
        self.0.iter()
    }

    pub fn system_flags(&self) -> impl Iterator<Item = &Flag> + '_ {
        self.0.iter().filter(|f| f.is_system())
    }

    pub fn user_flags(&self) -> impl Iterator<Item = &Flag> + '_ {
        self.0.iter().filter(|f| !f.is_system())
    }

    pub fn union(&self, other: &Flags) -> Flags {
        self.0.union(&other.0).cloned().collect()
    }

    pub fn difference(&self, other: &Flags) -> Flags {
        self.0.difference(&other.0).cloned().collect()
    }

    /// Flags in exactly one of `self` and `other`, in stable order.
    pub fn symmetric_difference(&self, other: &Flags) -> Flags {
        self.0.symmetric_difference(&other.0).cloned().collect()
    }

    pub fn extend<I: IntoIterator<Item = Flag>>(&mut self, flags: I) {
        self.0.extend(flags);
    }
}

impl FromIterator<Flag> for Flags {
    fn from_iter<I: IntoIterator<Item = Flag>>(it: I) -> Self {
        Flags(it.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Flags {
    type Item = &'a Flag;
    type IntoIter = std::collections::btree_set::Iter<'a, Flag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (ix, flag) in self.0.iter().enumerate() {
            if ix > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", flag)?;
        }
        write!(f, ")")
    }
}

/// How a flag update combines the requested flags with the current ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagsUpdateMode {
    Replace,
    Add,
    Remove,
}

/// The identity of a conversation.
///
/// A thread is named after the `MessageId` of its first message, its "base
/// message id".
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct ThreadId(MessageId);

impl ThreadId {
    pub fn from_base_message_id(id: MessageId) -> Self {
        ThreadId(id)
    }

    pub fn base_message_id(self) -> MessageId {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// The value of a `Message-ID`-style header, without angle brackets.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MimeMessageId(pub String);

impl MimeMessageId {
    pub fn new(raw: &str) -> Self {
        MimeMessageId(
            raw.trim().trim_start_matches('<').trim_end_matches('>').to_owned(),
        )
    }
}

/// An authenticated account name.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Username(pub String);

impl Username {
    pub fn new(name: &str) -> Self {
        Username(name.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the last `@`, if any.
    pub fn domain(&self) -> Option<&str> {
        self.0.rsplit_once('@').map(|(_, domain)| domain)
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a listener needs to know about one placement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub message_id: MessageId,
    pub uid: Uid,
    pub modseq: Modseq,
    pub flags: Flags,
    pub size: u64,
    pub internal_date: DateTime<Utc>,
    pub thread_id: ThreadId,
}

/// A message's presence in one mailbox.
///
/// The content is shared between all placements of one message.
#[derive(Clone, Debug)]
pub struct MailboxMessage {
    pub message_id: MessageId,
    pub mailbox_id: MailboxId,
    pub uid: Uid,
    pub modseq: Modseq,
    pub flags: Flags,
    pub internal_date: DateTime<Utc>,
    pub size: u64,
    pub thread_id: ThreadId,
    pub content: Arc<[u8]>,
}

impl MailboxMessage {
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            message_id: self.message_id,
            uid: self.uid,
            modseq: self.modseq,
            flags: self.flags.clone(),
            size: self.size,
            internal_date: self.internal_date,
            thread_id: self.thread_id,
        }
    }

    /// Produce a new placement of the same message in `mailbox_id`.
    ///
    /// The content is shared, not copied.
    pub fn copy_to(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
        modseq: Modseq,
        flags: Flags,
    ) -> Self {
        MailboxMessage {
            message_id: self.message_id,
            mailbox_id,
            uid,
            modseq,
            flags,
            internal_date: self.internal_date,
            size: self.size,
            thread_id: self.thread_id,
            content: Arc::clone(&self.content),
        }
    }
}

/// How much of a message a fetch returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchGroup {
    /// Only the metadata.
    Minimal,
    /// Metadata and the full content.
    Full,
}

/// One fetched placement.
#[derive(Clone, Debug)]
pub struct MessageResult {
    pub mailbox_id: MailboxId,
    pub metadata: MessageMetadata,
    pub content: Option<Arc<[u8]>>,
}

impl MessageResult {
    pub fn of(message: &MailboxMessage, fetch_group: FetchGroup) -> Self {
        MessageResult {
            mailbox_id: message.mailbox_id,
            metadata: message.metadata(),
            content: match fetch_group {
                FetchGroup::Minimal => None,
                FetchGroup::Full => Some(Arc::clone(&message.content)),
            },
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.metadata.message_id
    }
}

/// The outcome of deleting a set of messages everywhere.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteResult {
    /// Messages that had at least one placement removed.
    pub destroyed: BTreeSet<MessageId>,
    /// Messages with no placement visible to the session.
    pub not_found: BTreeSet<MessageId>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flag_parsing() {
        assert_eq!(Flag::Seen, "\\SEEN".parse::<Flag>().unwrap());
        assert_eq!(Flag::Recent, "\\recent".parse::<Flag>().unwrap());
        assert_eq!(Flag::kw("$Junk"), "$junk".parse::<Flag>().unwrap());
        assert_matches!(Err(Error::NxFlag), "\\Bogus".parse::<Flag>());
        assert_matches!(Err(Error::UnsafeName), "a b".parse::<Flag>());
        assert_matches!(Err(Error::UnsafeName), "".parse::<Flag>());
        assert_eq!("\\Seen", Flag::Seen.to_string());
    }

    #[test]
    fn flags_iterate_in_declaration_order() {
        let flags: Flags = vec![
            Flag::kw("zeta"),
            Flag::Seen,
            Flag::kw("Alpha"),
            Flag::Answered,
            Flag::Recent,
        ]
        .into_iter()
        .collect();

        assert_eq!(
            "(\\Answered \\Recent \\Seen Alpha zeta)",
            flags.to_string()
        );
        assert_eq!(
            vec![Flag::Answered, Flag::Recent, Flag::Seen],
            flags.system_flags().cloned().collect::<Vec<_>>()
        );
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let mut flags = Flags::new();
        assert!(flags.insert(Flag::kw("Work")));
        assert!(!flags.insert(Flag::kw("WORK")));
        assert!(flags.contains(&Flag::kw("work")));
        assert_eq!(1, flags.len());
    }

    #[test]
    fn uid_and_modseq_bounds() {
        assert_eq!(Some(Uid::u(2)), Uid::MIN.next());
        assert_eq!(None, Uid::MAX.next());
        assert_eq!(None, Uid::of(0));
        assert_eq!(Some(2), Modseq::MIN.next().map(Modseq::raw));
        assert_eq!(None, Modseq::of(u64::MAX).unwrap().next());
    }

    #[test]
    fn range_basics() {
        let range = MessageRange::new(Uid::u(10), Uid::u(1));
        assert_eq!(Uid::u(1), range.from);
        assert_eq!(10, range.len());
        assert!(range.contains(Uid::u(10)));
        assert!(!range.contains(Uid::u(11)));
        assert_eq!("1:10", range.to_string());
        assert_eq!("4", MessageRange::one(Uid::u(4)).to_string());
        assert_eq!(u64::from(u32::MAX), MessageRange::all().len());
    }

    #[test]
    fn user_domain() {
        assert_eq!(
            Some("example.com"),
            Username::new("alice@example.com").domain()
        );
        assert_eq!(None, Username::new("root").domain());
        assert_eq!("abc@d", MimeMessageId::new(" <abc@d> ").0);
    }
}
