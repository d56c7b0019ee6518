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

use log::info;

use mailcore::store::mailbox::MailboxPath;
use mailcore::store::mailbox_manager::AppendCommand;
use mailcore::store::model::*;
use mailcore::store::quota::QuotaRoot;
use mailcore::store::session::MailboxSession;
use mailcore::store::StoreSystem;
use mailcore::support::error::Error;
use mailcore::support::sysexits::*;
use mailcore::support::system_config::SystemConfig;

pub(super) fn check(config: &SystemConfig) -> Sysexit {
    match run(config) {
        Ok(()) => {
            println!("OK");
            EX_OK
        },
        Err(e) => {
            eprintln!("Check failed: {}", e);
            Sysexit::from(&e)
        },
    }
}

fn run(config: &SystemConfig) -> Result<(), Error> {
    let system = StoreSystem::in_memory(config)?;
    let session =
        MailboxSession::user(Username::new("postmaster@localhost"));
    let user = session.user.clone();
    let mailboxes = &system.mailbox_manager;
    let messages = &system.message_id_manager;

    let inbox = mailboxes
        .create_mailbox(&MailboxPath::inbox(user.clone()), &session)?;
    let archive = mailboxes.create_mailbox(
        &MailboxPath::for_user(user.clone(), "Archive")?,
        &session,
    )?;
    info!(
        "{} Created INBOX {} and Archive {}",
        session.log_prefix, inbox, archive
    );

    let mut first = AppendCommand::new("Subject: Check\r\n\r\nfirst\r\n");
    first.headers.mime_message_id =
        Some(MimeMessageId::new("<check-1@localhost>"));
    first.headers.subject = Some("Check".to_owned());
    let first = mailboxes.append_message(inbox, first, &session)?;

    let mut reply = AppendCommand::new("Subject: Re: Check\r\n\r\nreply\r\n");
    reply.headers.mime_message_id =
        Some(MimeMessageId::new("<check-2@localhost>"));
    reply.headers.in_reply_to =
        Some(MimeMessageId::new("<check-1@localhost>"));
    reply.headers.subject = Some("Re: Check".to_owned());
    let reply = mailboxes.append_message(inbox, reply, &session)?;
    expect(
        first.thread_id == reply.thread_id,
        "reply did not join the thread of its parent",
    )?;

    messages.set_in_mailboxes(first.message_id, &[inbox, archive], &session)?;
    let seen: Flags = Some(Flag::Seen).into_iter().collect();
    let updated = messages.set_flags(
        seen,
        FlagsUpdateMode::Add,
        first.message_id,
        &[inbox, archive],
        &session,
    )?;
    expect(2 == updated.len(), "flags were not set in both mailboxes")?;

    messages.set_in_mailboxes(reply.message_id, &[archive], &session)?;
    let archived = mailboxes.fetch(
        archive,
        MessageRange::all(),
        FetchGroup::Minimal,
        &session,
    )?;
    expect(2 == archived.len(), "Archive does not hold both messages")?;

    let root = QuotaRoot::for_user(&user);
    expect(
        3 == system.quota.message_quota(&root)?.used,
        "quota usage does not match the placements",
    )?;

    let deleted = messages
        .delete_messages(&[first.message_id, reply.message_id], &session)?;
    expect(2 == deleted.destroyed.len(), "not every message was deleted")?;
    expect(
        0 == system.quota.message_quota(&root)?.used,
        "quota usage not released by delete",
    )?;

    info!("{} Store check passed", session.log_prefix);
    Ok(())
}

fn expect(condition: bool, what: &str) -> Result<(), Error> {
    if condition {
        Ok(())
    } else {
        Err(Error::Backend(what.to_owned()))
    }
}
