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

//! Hooks run before placements are physically removed.
//!
//! A hook may do its work asynchronously by returning
//! `HookCompletion::Pending`. The runner nonetheless waits for every hook to
//! complete before starting the next one, since hooks may have side effects
//! (such as reference counts on shared blobs) that must not interleave.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver};
use log::{debug, warn};

use super::model::{MailboxId, MessageMetadata, Username};
use super::session::SessionId;
use crate::support::error::Error;
use crate::support::metrics::{MetricRecorder, TimeMetric};

/// One placement about to be removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageDeletionMetadata {
    pub mailbox_id: MailboxId,
    pub metadata: MessageMetadata,
}

/// Everything one delete is about to remove.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteOperation {
    pub session_id: SessionId,
    pub user: Username,
    pub deletions: Vec<MessageDeletionMetadata>,
}

/// The result of invoking a hook.
pub enum HookCompletion {
    Done(Result<(), Error>),
    /// The hook is still working and will send its result on the channel.
    Pending(Receiver<Result<(), Error>>),
}

impl HookCompletion {
    /// Run `work` on a new thread.
    pub fn spawn(
        work: impl FnOnce() -> Result<(), Error> + Send + 'static,
    ) -> Self {
        let (sender, receiver) = channel::bounded(1);
        thread::spawn(move || {
            // The runner only goes away if it already gave up on us
            let _ = sender.send(work());
        });
        HookCompletion::Pending(receiver)
    }

    fn wait(self) -> Result<(), Error> {
        match self {
            HookCompletion::Done(result) => result,
            HookCompletion::Pending(receiver) => {
                receiver.recv().unwrap_or_else(|_| {
                    Err(Error::Backend(
                        "hook dropped without completing".to_owned(),
                    ))
                })
            },
        }
    }
}

pub trait PreDeletionHook: Send + Sync {
    fn name(&self) -> &str;
    fn notify_delete(&self, operation: &DeleteOperation) -> HookCompletion;
}

/// The ordered set of registered hooks.
pub struct PreDeletionHooks {
    hooks: Vec<Arc<dyn PreDeletionHook>>,
    metrics: Arc<dyn MetricRecorder>,
}

impl PreDeletionHooks {
    pub fn new(metrics: Arc<dyn MetricRecorder>) -> Self {
        PreDeletionHooks {
            hooks: Vec::new(),
            metrics,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PreDeletionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook over `operation`, one at a time, in registration
    /// order.
    ///
    /// The first failure stops the run and is returned as `HookFailed`.
    /// Hooks that already completed are not compensated.
    pub fn run_hooks(&self, operation: &DeleteOperation) -> Result<(), Error> {
        if operation.deletions.is_empty() {
            return Ok(());
        }

        for hook in &self.hooks {
            let timer = TimeMetric::start(
                &*self.metrics,
                format!("pre_deletion_hook.{}", hook.name()),
            );
            let result = hook.notify_delete(operation).wait();
            let elapsed = timer.stop();
            debug!(
                "Pre-deletion hook {} took {}ms over {} placements",
                hook.name(),
                elapsed.as_millis(),
                operation.deletions.len()
            );

            if let Err(e) = result {
                warn!("Pre-deletion hook {} failed: {}", hook.name(), e);
                return Err(Error::HookFailed {
                    hook: hook.name().to_owned(),
                    source: Box::new(e),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::prelude::*;

    use super::*;
    use crate::store::model::*;
    use crate::support::metrics::RecordedMetrics;

    fn operation() -> DeleteOperation {
        DeleteOperation {
            session_id: SessionId(1),
            user: Username::new("alice"),
            deletions: vec![MessageDeletionMetadata {
                mailbox_id: MailboxId(1),
                metadata: MessageMetadata {
                    message_id: MessageId(1),
                    uid: Uid::MIN,
                    modseq: Modseq::MIN,
                    flags: Flags::new(),
                    size: 1,
                    internal_date: Utc::now(),
                    thread_id: ThreadId::from_base_message_id(MessageId(1)),
                },
            }],
        }
    }

    struct SlowHook {
        running: Arc<AtomicBool>,
        fail: bool,
    }

    impl PreDeletionHook for SlowHook {
        fn name(&self) -> &str {
            "slow"
        }

        fn notify_delete(&self, _: &DeleteOperation) -> HookCompletion {
            let running = Arc::clone(&self.running);
            let fail = self.fail;
            running.store(true, Ordering::SeqCst);
            HookCompletion::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                running.store(false, Ordering::SeqCst);
                if fail {
                    Err(Error::Backend("slow hook failed".to_owned()))
                } else {
                    Ok(())
                }
            })
        }
    }

    struct CheckingHook {
        other_running: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
        overlaps: Arc<AtomicUsize>,
    }

    impl PreDeletionHook for CheckingHook {
        fn name(&self) -> &str {
            "checking"
        }

        fn notify_delete(&self, _: &DeleteOperation) -> HookCompletion {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.other_running.load(Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            HookCompletion::Done(Ok(()))
        }
    }

    fn hooks(
        fail: bool,
        metrics: Arc<RecordedMetrics>,
    ) -> (PreDeletionHooks, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let running = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let hooks = PreDeletionHooks::new(metrics)
            .with_hook(Arc::new(SlowHook {
                running: Arc::clone(&running),
                fail,
            }))
            .with_hook(Arc::new(CheckingHook {
                other_running: running,
                calls: Arc::clone(&calls),
                overlaps: Arc::clone(&overlaps),
            }));
        (hooks, calls, overlaps)
    }

    #[test]
    fn hooks_never_overlap() {
        let metrics = RecordedMetrics::new();
        let (hooks, calls, overlaps) = hooks(false, Arc::clone(&metrics));
        for _ in 0..20 {
            hooks.run_hooks(&operation()).unwrap();
        }

        assert_eq!(20, calls.load(Ordering::SeqCst));
        assert_eq!(0, overlaps.load(Ordering::SeqCst));
        assert_eq!(20, metrics.samples("pre_deletion_hook.slow").len());
        assert_eq!(20, metrics.samples("pre_deletion_hook.checking").len());
    }

    #[test]
    fn failure_stops_later_hooks() {
        let metrics = RecordedMetrics::new();
        let (hooks, calls, _) = hooks(true, Arc::clone(&metrics));

        match hooks.run_hooks(&operation()) {
            Err(Error::HookFailed { hook, source }) => {
                assert_eq!("slow", hook);
                assert_matches!(Error::Backend(_), *source);
            },
            r => panic!("Unexpected result: {:?}", r),
        }
        assert_eq!(0, calls.load(Ordering::SeqCst));
        // Failed invocations are still timed
        assert_eq!(1, metrics.samples("pre_deletion_hook.slow").len());
    }

    #[test]
    fn abandoned_hook_is_a_failure() {
        struct Abandoning;
        impl PreDeletionHook for Abandoning {
            fn name(&self) -> &str {
                "abandoning"
            }

            fn notify_delete(&self, _: &DeleteOperation) -> HookCompletion {
                let (_, receiver) = channel::bounded(1);
                HookCompletion::Pending(receiver)
            }
        }

        let hooks = PreDeletionHooks::new(RecordedMetrics::new())
            .with_hook(Arc::new(Abandoning));
        assert_matches!(
            Err(Error::HookFailed { .. }),
            hooks.run_hooks(&operation())
        );
    }

    #[test]
    fn empty_operation_runs_nothing() {
        let metrics = RecordedMetrics::new();
        let (hooks, calls, _) = hooks(true, Arc::clone(&metrics));
        let mut op = operation();
        op.deletions.clear();
        hooks.run_hooks(&op).unwrap();
        assert_eq!(0, calls.load(Ordering::SeqCst));
        assert!(metrics.samples("pre_deletion_hook.slow").is_empty());
    }
}
