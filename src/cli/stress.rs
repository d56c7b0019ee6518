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

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{error, info};

use mailcore::store::context::LockKey;
use mailcore::store::locker::{LockType, MailboxLocker};
use mailcore::store::mailbox::MailboxPath;
use mailcore::store::model::Username;
use mailcore::support::error::Error;
use mailcore::support::sysexits::*;

use super::main::StressSubcommand;

pub(super) fn stress_locks(cmd: &StressSubcommand) -> Sysexit {
    info!(
        "Stressing one lock with {} threads x {} cycles on {} CPUs",
        cmd.threads,
        cmd.cycles,
        num_cpus::get()
    );

    for repetition in 0..cmd.repetitions {
        let start = Instant::now();
        if let Err(e) = repeat(cmd.threads, cmd.cycles) {
            error!("Repetition {} failed: {}", repetition, e);
            eprintln!("Repetition {} failed: {}", repetition, e);
            return EX_SOFTWARE;
        }
        println!(
            "Repetition {}: {}ms",
            repetition,
            start.elapsed().as_millis()
        );
    }

    EX_OK
}

fn repeat(threads: usize, cycles: usize) -> Result<(), Error> {
    let locker = Arc::new(MailboxLocker::new(None));
    let key = LockKey::Path(MailboxPath::inbox(Username::new("stress")));
    // > 0: that many readers; -1: one writer
    let holders = Arc::new(AtomicIsize::new(0));

    let handles = (0..threads)
        .map(|_| {
            let locker = Arc::clone(&locker);
            let key = key.clone();
            let holders = Arc::clone(&holders);
            thread::spawn(move || -> Result<(), Error> {
                for _ in 0..cycles {
                    let lock_type = if rand::random::<bool>() {
                        LockType::Write
                    } else {
                        LockType::Read
                    };
                    locker.execute_with_lock(&key, lock_type, || {
                        hold(&holders, lock_type)
                    })?;
                }
                Ok(())
            })
        })
        .collect::<Vec<_>>();

    let mut result = Ok(());
    for handle in handles {
        let outcome = handle.join().unwrap_or_else(|_| {
            Err(Error::Backend("stress thread panicked".to_owned()))
        });
        if result.is_ok() {
            result = outcome;
        }
    }
    result
}

fn hold(holders: &AtomicIsize, lock_type: LockType) -> Result<(), Error> {
    let corrupt = |what: &str| Err(Error::Backend(what.to_owned()));
    match lock_type {
        LockType::Write => {
            if holders
                .compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return corrupt("writer admitted alongside other holders");
            }
            thread::yield_now();
            holders.store(0, Ordering::SeqCst);
        },
        LockType::Read => {
            if holders.fetch_add(1, Ordering::SeqCst) < 0 {
                return corrupt("reader admitted alongside a writer");
            }
            thread::yield_now();
            holders.fetch_sub(1, Ordering::SeqCst);
        },
    }
    Ok(())
}
