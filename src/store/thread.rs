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

//! Deciding which conversation a new message belongs to.
//!
//! A message joins an existing thread only if it has the same base subject
//! as some earlier message of the same user _and_ shares at least one
//! correlation id (`Message-ID`, `In-Reply-To` or `References` entry) with
//! it. Either one alone is not enough: plenty of unrelated mail is titled
//! "Hello", and mailing list software is known to mangle `References`.
//!
//! The binding is made once, when the message is appended, and never
//! revisited.

use std::collections::BTreeSet;
use std::sync::Arc;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use super::mapper::{MessageMapper, ThreadEntry, ThreadMapper};
use super::model::*;
use super::session::MailboxSession;
use crate::support::error::Error;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref SUBJ_LEADER: Regex =
        Regex::new(r"(?i)^(\[[^\[\]]*\]\s*)*(re|fwd?)\s*(\[[^\[\]]*\])?\s*:\s*")
            .unwrap();
    static ref SUBJ_BLOB: Regex = Regex::new(r"^\[[^\[\]]*\]\s*").unwrap();
}

/// Extract the RFC 5256 base subject of `subject`.
///
/// Case is preserved; callers compare base subjects case-insensitively.
pub fn base_subject(subject: &str) -> String {
    let mut s = WHITESPACE.replace_all(subject.trim(), " ").into_owned();

    loop {
        // Trailing "(fwd)"s
        loop {
            let trimmed_len = s.trim_end().len();
            s.truncate(trimmed_len);
            if s.to_ascii_lowercase().ends_with("(fwd)") {
                s.truncate(s.len() - "(fwd)".len());
            } else {
                break;
            }
        }

        // Leading "Re:", "Fwd:", "[blob]"...
        loop {
            let before = s.len();
            if let Some(m) = SUBJ_LEADER.find(&s) {
                s = s[m.end()..].to_owned();
            }
            if let Some(m) = SUBJ_BLOB.find(&s) {
                // A blob is only removed if something remains after it
                if !s[m.end()..].trim().is_empty() {
                    s = s[m.end()..].to_owned();
                }
            }
            if s.len() == before {
                break;
            }
        }

        // "[fwd: ...]" wrappers
        if s.len() >= "[fwd:]".len()
            && s.get(..5).map_or(false, |p| p.eq_ignore_ascii_case("[fwd:"))
            && s.ends_with(']')
        {
            s = s[5..s.len() - 1].trim().to_owned();
            continue;
        }

        break;
    }

    s
}

/// The headers of a new message the thread resolver looks at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CorrelationHeaders {
    pub mime_message_id: Option<MimeMessageId>,
    pub in_reply_to: Option<MimeMessageId>,
    pub references: Vec<MimeMessageId>,
    pub subject: Option<String>,
}

impl CorrelationHeaders {
    /// `{Message-ID, In-Reply-To} ∪ References`, absent values omitted.
    pub fn correlation_ids(&self) -> BTreeSet<MimeMessageId> {
        self.mime_message_id
            .iter()
            .chain(self.in_reply_to.iter())
            .chain(self.references.iter())
            .filter(|id| !id.0.is_empty())
            .cloned()
            .collect()
    }

    /// The lower-cased base subject, if there is a non-empty one.
    pub fn normalised_subject(&self) -> Option<String> {
        self.subject
            .as_deref()
            .map(|s| base_subject(s).to_lowercase())
            .filter(|s| !s.is_empty())
    }
}

pub trait ThreadIdGuesser: Send + Sync {
    /// Choose the thread of the new message `new_id`.
    fn guess_thread_id(
        &self,
        new_id: MessageId,
        headers: &CorrelationHeaders,
        session: &MailboxSession,
    ) -> Result<ThreadId, Error>;

    /// Remember the correlation data of a message that was just appended so
    /// later messages can join its thread.
    fn record(
        &self,
        message_id: MessageId,
        thread_id: ThreadId,
        headers: &CorrelationHeaders,
        session: &MailboxSession,
    ) -> Result<(), Error>;

    /// All messages of `thread_id`, oldest first.
    ///
    /// Fails with `NxThread` if the thread has no messages.
    fn message_ids_in_thread(
        &self,
        thread_id: ThreadId,
        session: &MailboxSession,
    ) -> Result<Vec<MessageId>, Error>;
}

/// Threads by base subject plus correlation ids.
pub struct SubjectThreadIdGuesser {
    threads: Arc<dyn ThreadMapper>,
    messages: Arc<dyn MessageMapper>,
}

impl SubjectThreadIdGuesser {
    pub fn new(
        threads: Arc<dyn ThreadMapper>,
        messages: Arc<dyn MessageMapper>,
    ) -> Self {
        SubjectThreadIdGuesser { threads, messages }
    }
}

impl ThreadIdGuesser for SubjectThreadIdGuesser {
    fn guess_thread_id(
        &self,
        new_id: MessageId,
        headers: &CorrelationHeaders,
        session: &MailboxSession,
    ) -> Result<ThreadId, Error> {
        let new_thread = ThreadId::from_base_message_id(new_id);
        let ids = headers.correlation_ids();
        let subject = match headers.normalised_subject() {
            Some(subject) if !ids.is_empty() => subject,
            _ => return Ok(new_thread),
        };

        let found = self
            .threads
            .find_related(&session.user, &ids)?
            .into_iter()
            .find(|entry| entry.base_subject.as_ref() == Some(&subject))
            .map(|entry| entry.thread_id);

        match found {
            Some(thread_id) => {
                debug!(
                    "{} Message {} joins thread {}",
                    session.log_prefix, new_id, thread_id
                );
                Ok(thread_id)
            },
            None => Ok(new_thread),
        }
    }

    fn record(
        &self,
        message_id: MessageId,
        thread_id: ThreadId,
        headers: &CorrelationHeaders,
        session: &MailboxSession,
    ) -> Result<(), Error> {
        let mime_message_ids = headers.correlation_ids();
        if mime_message_ids.is_empty() {
            return Ok(());
        }

        self.threads.save_thread_data(
            &session.user,
            ThreadEntry {
                message_id,
                thread_id,
                mime_message_ids,
                base_subject: headers.normalised_subject(),
            },
        )
    }

    fn message_ids_in_thread(
        &self,
        thread_id: ThreadId,
        _session: &MailboxSession,
    ) -> Result<Vec<MessageId>, Error> {
        messages_in_thread(&*self.messages, thread_id)
    }
}

/// Puts every message in a thread of its own.
pub struct NaiveThreadIdGuesser {
    messages: Arc<dyn MessageMapper>,
}

impl NaiveThreadIdGuesser {
    pub fn new(messages: Arc<dyn MessageMapper>) -> Self {
        NaiveThreadIdGuesser { messages }
    }
}

impl ThreadIdGuesser for NaiveThreadIdGuesser {
    fn guess_thread_id(
        &self,
        new_id: MessageId,
        _headers: &CorrelationHeaders,
        _session: &MailboxSession,
    ) -> Result<ThreadId, Error> {
        Ok(ThreadId::from_base_message_id(new_id))
    }

    fn record(
        &self,
        _message_id: MessageId,
        _thread_id: ThreadId,
        _headers: &CorrelationHeaders,
        _session: &MailboxSession,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn message_ids_in_thread(
        &self,
        thread_id: ThreadId,
        _session: &MailboxSession,
    ) -> Result<Vec<MessageId>, Error> {
        messages_in_thread(&*self.messages, thread_id)
    }
}

fn messages_in_thread(
    messages: &dyn MessageMapper,
    thread_id: ThreadId,
) -> Result<Vec<MessageId>, Error> {
    let mut placements = messages
        .find_by_thread(thread_id)?
        .into_iter()
        .map(|m| (m.internal_date, m.message_id))
        .collect::<Vec<_>>();
    placements.sort();

    let mut seen = BTreeSet::new();
    let ids = placements
        .into_iter()
        .map(|(_, id)| id)
        .filter(|&id| seen.insert(id))
        .collect::<Vec<_>>();

    if ids.is_empty() {
        Err(Error::NxThread)
    } else {
        Ok(ids)
    }
}
