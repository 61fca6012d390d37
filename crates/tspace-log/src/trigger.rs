//! Checkpoint trigger policies.
//!
//! A policy decides when the background loop should request a checkpoint.
//! Policies only ever see the narrow [`CheckpointSync`] capability, never the
//! transaction manager itself, so checkpoint internals stay private to the
//! log component.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use tspace_error::Result;

/// The one capability a trigger may invoke: request a checkpoint now.
pub trait CheckpointSync: Send + Sync {
    fn sync(&self) -> Result<()>;
}

/// When to request a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// Fully transient configuration: never checkpoint.
    Never,
    /// Checkpoint once `threshold` operations have been logged.
    Ops { threshold: u64 },
    /// Checkpoint at `threshold` operations OR after `idle` without reaching
    /// it, whichever fires first.
    Periodic { threshold: u64, idle: Duration },
}

#[derive(Debug)]
struct TriggerShared {
    ops: Mutex<u64>,
    wake: Condvar,
    shutdown: AtomicBool,
}

/// Background loop driving a [`CheckpointPolicy`].
///
/// Owns its thread: dropping the trigger requests shutdown and joins, so the
/// loop's lifetime is scoped to its owner rather than left to chance.
#[derive(Debug)]
pub struct CheckpointTrigger {
    shared: Arc<TriggerShared>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointTrigger {
    /// Start the trigger loop. With [`CheckpointPolicy::Never`] no thread is
    /// spawned and [`Self::record_op`] is a no-op.
    #[must_use]
    pub fn start(policy: CheckpointPolicy, target: Arc<dyn CheckpointSync>) -> Self {
        let shared = Arc::new(TriggerShared {
            ops: Mutex::new(0),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let handle = match policy {
            CheckpointPolicy::Never => None,
            CheckpointPolicy::Ops { threshold } => {
                let shared = Arc::clone(&shared);
                Some(std::thread::spawn(move || {
                    run_loop(&shared, &*target, threshold, None);
                }))
            }
            CheckpointPolicy::Periodic { threshold, idle } => {
                let shared = Arc::clone(&shared);
                Some(std::thread::spawn(move || {
                    run_loop(&shared, &*target, threshold, Some(idle));
                }))
            }
        };

        Self {
            shared,
            handle,
        }
    }

    /// Count one logged operation toward the threshold.
    pub fn record_op(&self) {
        if self.handle.is_none() {
            return;
        }
        let mut ops = self.shared.ops.lock();
        *ops += 1;
        self.shared.wake.notify_one();
    }
}

impl Drop for CheckpointTrigger {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(
    shared: &TriggerShared,
    target: &dyn CheckpointSync,
    threshold: u64,
    idle: Option<Duration>,
) {
    loop {
        let fire = {
            let mut ops = shared.ops.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if *ops >= threshold {
                    break true;
                }
                match idle {
                    Some(idle) => {
                        let timed_out = shared.wake.wait_for(&mut ops, idle).timed_out();
                        if shared.shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        // Idle timeout fires only if something was logged
                        // since the last checkpoint.
                        if timed_out && *ops > 0 {
                            break true;
                        }
                    }
                    None => shared.wake.wait(&mut ops),
                }
            }
        };

        if fire {
            debug!("checkpoint trigger fired");
            // The counter resets either way: a failed checkpoint is retried
            // at the next threshold, not in a tight loop.
            if let Err(err) = target.sync() {
                warn!(error = %err, "asynchronous checkpoint failed, will retry");
            }
            *shared.ops.lock() = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    use tspace_error::TspaceError;

    use super::*;

    struct RecordingSync {
        calls: AtomicU64,
        fail_first: AtomicBool,
    }

    impl RecordingSync {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                fail_first: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::Acquire)
        }

        fn wait_for_calls(&self, n: u64, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if self.calls() >= n {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            false
        }
    }

    impl CheckpointSync for RecordingSync {
        fn sync(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::AcqRel);
            if self.fail_first.swap(false, Ordering::AcqRel) {
                return Err(TspaceError::internal("injected checkpoint failure"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_ops_threshold_fires() {
        let sync = RecordingSync::new();
        let trigger = CheckpointTrigger::start(
            CheckpointPolicy::Ops { threshold: 3 },
            Arc::clone(&sync) as Arc<dyn CheckpointSync>,
        );
        trigger.record_op();
        trigger.record_op();
        assert!(!sync.wait_for_calls(1, Duration::from_millis(100)));
        trigger.record_op();
        assert!(sync.wait_for_calls(1, Duration::from_secs(5)));
    }

    #[test]
    fn test_never_policy_spawns_nothing() {
        let sync = RecordingSync::new();
        let trigger = CheckpointTrigger::start(
            CheckpointPolicy::Never,
            Arc::clone(&sync) as Arc<dyn CheckpointSync>,
        );
        for _ in 0..100 {
            trigger.record_op();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sync.calls(), 0);
    }

    #[test]
    fn test_idle_timeout_fires_with_pending_ops() {
        let sync = RecordingSync::new();
        let trigger = CheckpointTrigger::start(
            CheckpointPolicy::Periodic {
                threshold: 1_000_000,
                idle: Duration::from_millis(20),
            },
            Arc::clone(&sync) as Arc<dyn CheckpointSync>,
        );
        trigger.record_op();
        assert!(sync.wait_for_calls(1, Duration::from_secs(5)));
    }

    #[test]
    fn test_idle_timeout_skips_when_nothing_logged() {
        let sync = RecordingSync::new();
        let _trigger = CheckpointTrigger::start(
            CheckpointPolicy::Periodic {
                threshold: 1_000_000,
                idle: Duration::from_millis(10),
            },
            Arc::clone(&sync) as Arc<dyn CheckpointSync>,
        );
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(sync.calls(), 0);
    }

    #[test]
    fn test_failed_checkpoint_is_retried() {
        let sync = RecordingSync::new();
        sync.fail_first.store(true, Ordering::Release);
        let trigger = CheckpointTrigger::start(
            CheckpointPolicy::Ops { threshold: 2 },
            Arc::clone(&sync) as Arc<dyn CheckpointSync>,
        );
        trigger.record_op();
        trigger.record_op();
        assert!(sync.wait_for_calls(1, Duration::from_secs(5)));
        // Next batch triggers again despite the earlier failure.
        trigger.record_op();
        trigger.record_op();
        assert!(sync.wait_for_calls(2, Duration::from_secs(5)));
    }

    #[test]
    fn test_drop_joins_thread() {
        let sync = RecordingSync::new();
        let trigger = CheckpointTrigger::start(
            CheckpointPolicy::Ops { threshold: 10 },
            Arc::clone(&sync) as Arc<dyn CheckpointSync>,
        );
        drop(trigger);
        // Nothing to assert beyond "drop returns": the join guarantees the
        // loop exited.
    }
}
