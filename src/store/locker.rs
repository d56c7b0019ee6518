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

//! Per-mailbox read/write locks.
//!
//! Each key (a mailbox id, a mailbox path, a quota root...) gets its own
//! read/write lock, created on first use and discarded once nobody holds or
//! waits for it. Different keys never contend with each other.
//!
//! The locks are reentrant per thread: a thread holding the write lock of a
//! key may take the read or write lock of the same key again. A thread that
//! only holds the read lock of a key may _not_ take the write lock; that
//! would deadlock against any other reader doing the same, so it fails with
//! `Error::LockUpgrade` instead.
//!
//! Operations that need several keys take them through `lock_all()` or
//! `execute_with_locks()`, which acquire in ascending key order. As long as
//! nobody acquires several keys any other way, no two threads can wait on
//! each other in a cycle.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::debug;

use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
}

#[derive(Default)]
struct KeyLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Default)]
struct LockState {
    readers: HashMap<ThreadId, usize>,
    writer: Option<(ThreadId, usize)>,
}

impl LockState {
    /// Returns `Ok(true)` if the lock was taken, `Ok(false)` if the caller
    /// must wait.
    fn try_acquire(
        &mut self,
        me: ThreadId,
        lock_type: LockType,
    ) -> Result<bool, Error> {
        let writer = self.writer.map(|(owner, _)| owner);
        match (lock_type, writer) {
            (LockType::Write, Some(owner)) if owner == me => {
                if let Some((_, ref mut depth)) = self.writer {
                    *depth += 1;
                }
                Ok(true)
            },
            (LockType::Read, Some(owner)) if owner == me => {
                *self.readers.entry(me).or_insert(0) += 1;
                Ok(true)
            },
            (_, Some(_)) => Ok(false),
            (LockType::Read, None) => {
                *self.readers.entry(me).or_insert(0) += 1;
                Ok(true)
            },
            (LockType::Write, None) => {
                if self.readers.contains_key(&me) {
                    Err(Error::LockUpgrade)
                } else if self.readers.is_empty() {
                    self.writer = Some((me, 1));
                    Ok(true)
                } else {
                    Ok(false)
                }
            },
        }
    }

    fn release(&mut self, me: ThreadId, lock_type: LockType) {
        match lock_type {
            LockType::Read => {
                if let Some(count) = self.readers.get_mut(&me) {
                    *count -= 1;
                    if 0 == *count {
                        self.readers.remove(&me);
                    }
                }
            },
            LockType::Write => {
                if let Some((owner, ref mut depth)) = self.writer {
                    if owner == me {
                        *depth -= 1;
                        if 0 == *depth {
                            self.writer = None;
                        }
                    }
                }
            },
        }
    }
}

fn lock_mutex<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The protected state is always left consistent between statements, so
    // a panic elsewhere while holding the mutex does not invalidate it.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A table of read/write locks indexed by `K`.
pub struct MailboxLocker<K> {
    locks: Mutex<HashMap<K, Arc<KeyLock>>>,
    timeout: Option<Duration>,
}

impl<K: Clone + Eq + Hash + Ord> MailboxLocker<K> {
    /// Create a locker whose acquisitions block until the lock is free, or
    /// until `timeout` elapses if set.
    pub fn new(timeout: Option<Duration>) -> Self {
        MailboxLocker {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Acquire the lock of `key`.
    ///
    /// The lock is released when the returned guard is dropped.
    pub fn lock(
        &self,
        key: &K,
        lock_type: LockType,
    ) -> Result<LockGuard<'_, K>, Error> {
        let entry = Arc::clone(
            lock_mutex(&self.locks)
                .entry(key.clone())
                .or_insert_with(Default::default),
        );

        let me = thread::current().id();
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let result = {
            let mut state = lock_mutex(&entry.state);
            loop {
                match state.try_acquire(me, lock_type) {
                    Ok(true) => break Ok(()),
                    Err(e) => break Err(e),
                    Ok(false) => (),
                }

                debug!("Waiting for {:?} lock", lock_type);
                state = match deadline {
                    None => entry
                        .cond
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner()),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break Err(Error::LockTimeout);
                        }
                        entry
                            .cond
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(|e| e.into_inner())
                            .0
                    },
                };
            }
        };

        match result {
            Ok(()) => Ok(LockGuard {
                locker: self,
                key: key.clone(),
                entry: Some(entry),
                lock_type,
                owner: me,
            }),
            Err(e) => {
                self.forget(key, entry);
                Err(e)
            },
        }
    }

    /// Acquire the locks of all `keys`, in ascending order.
    ///
    /// Duplicate keys are locked once. If any acquisition fails, the locks
    /// already taken are released.
    pub fn lock_all(
        &self,
        keys: impl IntoIterator<Item = K>,
        lock_type: LockType,
    ) -> Result<Vec<LockGuard<'_, K>>, Error> {
        let keys: BTreeSet<K> = keys.into_iter().collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock(key, lock_type)?);
        }
        Ok(guards)
    }

    pub fn execute_with_lock<T>(
        &self,
        key: &K,
        lock_type: LockType,
        operation: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let _guard = self.lock(key, lock_type)?;
        operation()
    }

    pub fn execute_with_locks<T>(
        &self,
        keys: impl IntoIterator<Item = K>,
        lock_type: LockType,
        operation: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let _guards = self.lock_all(keys, lock_type)?;
        operation()
    }

    /// Drop our reference to `entry`, removing it from the table if nobody
    /// else has one.
    fn forget(&self, key: &K, entry: Arc<KeyLock>) {
        let mut locks = lock_mutex(&self.locks);
        // New references are only created under the table lock, so the
        // count cannot grow while we hold it.
        if 2 == Arc::strong_count(&entry) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn live_entries(&self) -> usize {
        lock_mutex(&self.locks).len()
    }
}

/// A held lock of one key.
pub struct LockGuard<'a, K: Clone + Eq + Hash + Ord> {
    locker: &'a MailboxLocker<K>,
    key: K,
    entry: Option<Arc<KeyLock>>,
    lock_type: LockType,
    owner: ThreadId,
}

impl<K: Clone + Eq + Hash + Ord> LockGuard<'_, K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }
}

impl<K: Clone + Eq + Hash + Ord + fmt::Debug> fmt::Debug for LockGuard<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LockGuard({:?}, {:?})", self.key, self.lock_type)
    }
}

impl<K: Clone + Eq + Hash + Ord> Drop for LockGuard<'_, K> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            lock_mutex(&entry.state).release(self.owner, self.lock_type);
            entry.cond.notify_all();
            self.locker.forget(&self.key, entry);
        }
    }
}
