//! The transaction manager: control and concurrency layer over the
//! command-sourced log.
//!
//! Committing a mutation means append-then-apply: the command is serialized
//! to the current log segment under the shared side of the checkpoint lock,
//! then applied to [`TxnManagerState`]. A checkpoint takes the exclusive
//! side only for the instant of log rotation; the retired segment's sync and
//! the snapshot save run unlocked while live traffic proceeds against the
//! new segment.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use tspace_error::{Result, TspaceError};
use tspace_log::{CheckpointPolicy, CheckpointSync, CheckpointTrigger, LogConfig, LogStore};
use tspace_types::{TxnId, TxnStatus};

use crate::command::Command;
use crate::manager_state::{ApplyMode, EndedTxn, SnapshotState, TxnManagerState};
use crate::op::{EntryBackend, Op};
use crate::state::TxnState;

/// Durable single-op logging for non-transactional callers: the op runs
/// inside an implicit, locally-managed transaction.
pub trait OpLog: Send + Sync {
    /// Durably record one action. Blocks for log access.
    fn log(&self, op: Op) -> Result<()>;

    /// Like [`Self::log`] but bounds the wait for log access and returns
    /// `false` instead of blocking indefinitely. "Not logged" is a valid,
    /// expected outcome under contention.
    fn try_log(&self, op: Op, timeout: Duration) -> Result<bool>;
}

/// End-of-transaction notification, fired during live operation only.
pub type TxnEndedHook = Box<dyn Fn(&TxnId, TxnStatus) + Send + Sync>;

/// Durability barrier run by a checkpoint before it discards covered log
/// segments. The entry layer installs one that drains its write-back buffer:
/// once a segment is gone, the buffer holds the only other copy of the
/// commits it recorded.
pub type CheckpointBarrier = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Construction parameters for a [`TxnManager`].
#[derive(Debug, Clone)]
pub struct TxnManagerConfig {
    pub log: LogConfig,
    pub checkpoint: CheckpointPolicy,
}

impl Default for TxnManagerConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            checkpoint: CheckpointPolicy::Ops { threshold: 1024 },
        }
    }
}

/// Command-sourced transaction manager.
///
/// One constructed instance is passed to every consumer (entry storage,
/// lease tracker, remote gateway); there is no global accessor.
pub struct TxnManager<B: EntryBackend + 'static> {
    backend: Arc<B>,
    state: TxnManagerState,
    log: LogStore,
    /// Shared side: every logging operation. Exclusive side: log rotation,
    /// and nothing else. Always acquired before rotation so a checkpoint can
    /// never deadlock against readers waiting on the same primitive.
    ckpt_lock: RwLock<()>,
    trigger: Mutex<Option<CheckpointTrigger>>,
    hook: RwLock<Option<TxnEndedHook>>,
    barrier: RwLock<Option<CheckpointBarrier>>,
    user_data: Mutex<BTreeMap<String, serde_json::Value>>,
    next_local_seq: AtomicU64,
    closed: AtomicBool,
}

/// Weak handle used by the checkpoint trigger, breaking the ownership cycle
/// between the manager and the loop it owns.
struct WeakSync<B: EntryBackend + 'static>(Weak<TxnManager<B>>);

impl<B: EntryBackend + 'static> CheckpointSync for WeakSync<B> {
    fn sync(&self) -> Result<()> {
        match self.0.upgrade() {
            Some(manager) => manager.checkpoint(),
            None => Ok(()),
        }
    }
}

impl<B: EntryBackend + 'static> TxnManager<B> {
    /// Open the log directory, recover state, and start the checkpoint
    /// trigger.
    ///
    /// Recovery deserializes PREPARED transactions from the latest snapshot
    /// (ACTIVE ones are absent by construction), then replays surviving log
    /// segments' commands against a fresh manager state. Failures here are
    /// fatal: a command that cannot be decoded or applied means committed
    /// state would be silently lost.
    pub fn recover(
        dir: impl AsRef<Path>,
        config: TxnManagerConfig,
        backend: Arc<B>,
    ) -> Result<Arc<Self>> {
        // Read before open: opening rewrites boot.json for the next restart.
        let boot = LogStore::read_boot(dir.as_ref())?;
        let log = LogStore::open(dir.as_ref(), config.log)?;
        let state = TxnManagerState::new();
        let mut user_data = BTreeMap::new();
        let mut max_local_seq = 0u64;

        let snapshot = log.load_snapshot::<SnapshotState>()?;
        let replay_from = snapshot.as_ref().map_or(0, |loaded| loaded.replay_from);
        if let Some(loaded) = snapshot {
            for record in &loaded.state.prepared {
                if record.id.is_local() {
                    max_local_seq = max_local_seq.max(record.id.seq);
                }
            }
            user_data = loaded.state.user.clone();
            state.restore_from(&loaded.state, backend.as_ref())?;
        }

        let records = log.read_records_from(replay_from)?;
        let replayed = records.len();
        // The persisted bound is advisory: the valid-prefix scan already
        // decided what survives. Exceeding it means the previous run logged
        // far past its checkpoint threshold without checkpointing.
        if let Some(boot) = boot {
            if replayed as u64 > boot.max_unsynced_ops {
                warn!(
                    replayed,
                    bound = boot.max_unsynced_ops,
                    "replayed more commands than the persisted boot bound"
                );
            }
        }
        for bytes in &records {
            let cmd = Command::decode(bytes).map_err(|err| TspaceError::RecoveryFailed {
                detail: format!("undecodable command in log: {err}"),
            })?;
            if let Some(id) = command_txn_id(&cmd) {
                if id.is_local() {
                    max_local_seq = max_local_seq.max(id.seq);
                }
            }
            state
                .apply(&cmd, backend.as_ref(), ApplyMode::Replay)
                .map_err(|err| TspaceError::RecoveryFailed {
                    detail: format!("replay of {} command failed: {err}", cmd.kind()),
                })?;
        }

        info!(
            replay_from,
            replayed,
            live = state.live_count(),
            "transaction manager recovered"
        );

        let manager = Arc::new(Self {
            backend,
            state,
            log,
            ckpt_lock: RwLock::new(()),
            trigger: Mutex::new(None),
            hook: RwLock::new(None),
            barrier: RwLock::new(None),
            user_data: Mutex::new(user_data),
            next_local_seq: AtomicU64::new(max_local_seq + 1),
            closed: AtomicBool::new(false),
        });

        let trigger = CheckpointTrigger::start(
            config.checkpoint,
            Arc::new(WeakSync(Arc::downgrade(&manager))),
        );
        *manager.trigger.lock() = Some(trigger);
        Ok(manager)
    }

    /// Install the end-of-transaction notification used by downstream
    /// waiters. Fired on commit/abort during live operation, never during
    /// recovery replay.
    pub fn set_txn_ended_hook(&self, hook: TxnEndedHook) {
        *self.hook.write() = Some(hook);
    }

    /// Install the durability barrier. A checkpoint runs it after the retired
    /// segment's sync and before the snapshot is saved or covered segments
    /// removed; an error aborts the checkpoint with the log intact.
    pub fn set_checkpoint_barrier(&self, barrier: CheckpointBarrier) {
        *self.barrier.write() = Some(barrier);
    }

    /// Contribute an opaque value to every future snapshot.
    pub fn set_checkpoint_annotation(&self, key: impl Into<String>, value: serde_json::Value) {
        self.user_data.lock().insert(key.into(), value);
    }

    /// Read back a checkpoint contribution (restored across restarts).
    #[must_use]
    pub fn checkpoint_annotation(&self, key: &str) -> Option<serde_json::Value> {
        self.user_data.lock().get(key).cloned()
    }

    // -----------------------------------------------------------------------
    // Transaction lifecycle
    // -----------------------------------------------------------------------

    /// Start a locally-originated transaction.
    pub fn begin(&self) -> TxnId {
        let id = TxnId::local(self.next_local_seq.fetch_add(1, Ordering::AcqRel));
        self.state.resolve(TxnState::new(id.clone()));
        debug!(txn = %id, "transaction started");
        id
    }

    /// Start a locally-originated identity transaction (guaranteed
    /// non-mutating, exempt from logging).
    pub fn begin_identity(&self) -> TxnId {
        let id = TxnId::local(self.next_local_seq.fetch_add(1, Ordering::AcqRel));
        self.state.resolve(TxnState::identity(id.clone()));
        id
    }

    /// Resolve a remotely-coordinated transaction id, creating its state on
    /// first resolution.
    pub fn join(&self, id: &TxnId) {
        self.state.resolve(TxnState::new(id.clone()));
    }

    /// Record an op under a transaction. Only legal while it is ACTIVE.
    pub fn add_op(&self, id: &TxnId, op: Op) -> Result<()> {
        let entry = self.lookup(id)?;
        let mut state = entry.lock();
        state.add_op(op)
    }

    /// Vote and durably prepare. Identity and zero-op transactions bypass
    /// the log entirely: only memory changes, since there is nothing to
    /// recover.
    pub fn prepare(&self, id: &TxnId) -> Result<TxnStatus> {
        let entry = self.lookup(id)?;
        let record = {
            let mut state = entry.lock();
            let status = state.vote()?;
            if status == TxnStatus::Prepared {
                return Ok(TxnStatus::Prepared);
            }
            if !state.mutates_durable_state() {
                state.advance(TxnStatus::Prepared)?;
                debug!(txn = %id, "prepare skipped logging (identity or no ops)");
                return Ok(TxnStatus::Prepared);
            }
            state.record()
        };
        self.log_command(&Command::Prepare { txn: record })?;
        Ok(TxnStatus::Prepared)
    }

    /// Commit a prepared transaction.
    pub fn commit(&self, id: &TxnId) -> Result<()> {
        let entry = self.lookup(id)?;
        let requires_log = {
            let state = entry.lock();
            if state.mutates_durable_state() && state.status() != TxnStatus::Prepared {
                return Err(TspaceError::InvalidTransition {
                    from: state.status().to_string(),
                    to: TxnStatus::Committed.to_string(),
                });
            }
            state.requires_logging()
        };
        let cmd = Command::Commit { id: id.clone() };
        let ended = if requires_log {
            self.log_command(&cmd)?
        } else {
            debug!(txn = %id, "commit skipped logging");
            self.state
                .apply(&cmd, self.backend.as_ref(), ApplyMode::Live)?
        };
        self.notify(&ended);
        Ok(())
    }

    /// Abort a transaction.
    ///
    /// An abort of an unknown id is tolerated and logged: a transaction that
    /// died while ACTIVE left nothing on disk to undo.
    pub fn abort(&self, id: &TxnId) -> Result<()> {
        let Some(entry) = self.state.get(id) else {
            debug!(txn = %id, "abort of unknown transaction tolerated");
            return Ok(());
        };
        let requires_log = entry.lock().requires_logging();
        let cmd = Command::Abort { id: id.clone() };
        let ended = if requires_log {
            self.log_command(&cmd)?
        } else {
            debug!(txn = %id, "abort skipped logging (never prepared or no durable ops)");
            self.state
                .apply(&cmd, self.backend.as_ref(), ApplyMode::Live)?
        };
        self.notify(&ended);
        Ok(())
    }

    /// Fold prepare and commit into a single log record.
    pub fn prepare_and_commit(&self, id: &TxnId) -> Result<TxnStatus> {
        let entry = self.lookup(id)?;
        let (mutates, record) = {
            let mut state = entry.lock();
            state.vote()?;
            (state.mutates_durable_state(), state.record())
        };
        let cmd = Command::PrepareAndCommit { txn: record };
        let ended = if mutates {
            self.log_command(&cmd)?
        } else {
            debug!(txn = %id, "prepare-and-commit skipped logging");
            self.state
                .apply(&cmd, self.backend.as_ref(), ApplyMode::Live)?
        };
        self.notify(&ended);
        Ok(TxnStatus::Committed)
    }

    /// Force-abort every live transaction. The abort-all itself is logged.
    pub fn abort_all(&self) -> Result<usize> {
        let ended = self.log_command(&Command::AbortAll)?;
        let count = ended.len();
        self.notify(&ended);
        info!(aborted = count, "all live transactions aborted");
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Checkpointing
    // -----------------------------------------------------------------------

    /// Run a full checkpoint synchronously. Errors propagate to the caller;
    /// this is the path behind an explicit snapshot request.
    pub fn checkpoint(&self) -> Result<()> {
        // Exclusive strictly around rotation. Everything after runs against
        // the retired segment while new commands land in the fresh one.
        let finished = {
            let _exclusive = self.ckpt_lock.write();
            self.log.rotate()?
        };
        let replay_from = finished.first_uncovered();
        finished.sync()?;

        // Commits already applied to the entry layer may still sit in its
        // write buffer, and the covered segments hold their only durable
        // copy. Once a snapshot at `replay_from` exists recovery stops
        // replaying them, so the barrier must drain the buffer first.
        {
            let barrier = self.barrier.read();
            if let Some(barrier) = barrier.as_ref() {
                barrier()?;
            }
        }

        let snap = self.state.snapshot(self.user_data.lock().clone());
        self.log.save_snapshot(replay_from, &snap)?;
        self.log.discard_covered(replay_from)?;
        info!(
            replay_from,
            prepared = snap.prepared.len(),
            clock = snap.clock,
            "checkpoint complete"
        );
        Ok(())
    }

    /// Synchronous checkpoint request; failures propagate.
    pub fn request_snapshot(&self) -> Result<()> {
        self.checkpoint()
    }

    /// Fire-and-forget checkpoint request; failures are logged and the next
    /// trigger retries.
    pub fn request_checkpoint_async(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        std::thread::spawn(move || {
            if let Some(manager) = weak.upgrade() {
                if let Err(err) = manager.checkpoint() {
                    warn!(error = %err, "asynchronous checkpoint failed");
                }
            }
        });
    }

    /// Orderly shutdown: stop the checkpoint trigger and refuse further
    /// logging. In-memory lookups stay available for draining callers.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.trigger.lock().take();
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn status_of(&self, id: &TxnId) -> Option<TxnStatus> {
        self.state.status_of(id)
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.live_count()
    }

    #[must_use]
    pub fn remote_transaction_ids(&self) -> Vec<TxnId> {
        self.state.remote_transaction_ids()
    }

    /// Commands appended to the current log segment. Test and diagnostics
    /// aid.
    #[must_use]
    pub fn logged_records(&self) -> u64 {
        self.log.current_segment_records()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lookup(&self, id: &TxnId) -> Result<Arc<Mutex<TxnState>>> {
        self.state.get(id).ok_or_else(|| TspaceError::UnknownTransaction {
            txn: id.to_string(),
        })
    }

    /// Append-then-apply under the shared side of the checkpoint lock.
    ///
    /// The apply runs under the same guard as the append: a checkpoint that
    /// rotated between them would snapshot state missing a command whose
    /// segment it is about to discard.
    fn log_command(&self, cmd: &Command) -> Result<Vec<EndedTxn>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TspaceError::ManagerShutdown);
        }
        let bytes = cmd.encode()?;
        let ended = {
            let _shared = self.ckpt_lock.read();
            self.log.append(&bytes)?;
            self.state
                .apply(cmd, self.backend.as_ref(), ApplyMode::Live)?
        };
        if let Some(trigger) = self.trigger.lock().as_ref() {
            trigger.record_op();
        }
        Ok(ended)
    }

    fn notify(&self, ended: &[EndedTxn]) {
        if ended.is_empty() {
            return;
        }
        let hook = self.hook.read();
        if let Some(hook) = hook.as_ref() {
            for txn in ended {
                hook(&txn.id, txn.status);
            }
        }
    }

    #[cfg(test)]
    fn exclusive_for_test(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.ckpt_lock.write()
    }
}

impl<B: EntryBackend + 'static> OpLog for TxnManager<B> {
    fn log(&self, op: Op) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TspaceError::ManagerShutdown);
        }
        let (record, cmd, bytes) = self.implicit_txn(op)?;
        let ended = {
            let _shared = self.ckpt_lock.read();
            // Append before resolving: a failed append must leave no trace
            // of the implicit transaction in the live map.
            self.log.append(&bytes)?;
            self.state
                .resolve(TxnState::from_record(record, TxnStatus::Voting));
            self.state
                .apply(&cmd, self.backend.as_ref(), ApplyMode::Live)?
        };
        if let Some(trigger) = self.trigger.lock().as_ref() {
            trigger.record_op();
        }
        self.notify(&ended);
        Ok(())
    }

    fn try_log(&self, op: Op, timeout: Duration) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TspaceError::ManagerShutdown);
        }
        let (record, cmd, bytes) = self.implicit_txn(op)?;
        let ended = {
            let Some(_shared) = self.ckpt_lock.try_read_for(timeout) else {
                // Lossy under contention.
                debug!("try_log timed out waiting for log access");
                return Ok(false);
            };
            self.log.append(&bytes)?;
            self.state
                .resolve(TxnState::from_record(record, TxnStatus::Voting));
            self.state
                .apply(&cmd, self.backend.as_ref(), ApplyMode::Live)?
        };
        if let Some(trigger) = self.trigger.lock().as_ref() {
            trigger.record_op();
        }
        self.notify(&ended);
        Ok(true)
    }
}

impl<B: EntryBackend + 'static> TxnManager<B> {
    /// Build the implicit transaction wrapped around a single logged op.
    fn implicit_txn(&self, op: Op) -> Result<(crate::state::TxnRecord, Command, Vec<u8>)> {
        let id = TxnId::local(self.next_local_seq.fetch_add(1, Ordering::AcqRel));
        let mut state = TxnState::new(id);
        state.add_op(op)?;
        state.vote()?;
        let record = state.record();
        let cmd = Command::PrepareAndCommit {
            txn: record.clone(),
        };
        let bytes = cmd.encode()?;
        Ok((record, cmd, bytes))
    }
}

fn command_txn_id(cmd: &Command) -> Option<&TxnId> {
    match cmd {
        Command::Prepare { txn } | Command::PrepareAndCommit { txn } => Some(&txn.id),
        Command::Commit { id } | Command::Abort { id } => Some(id),
        Command::AbortAll => None,
    }
}
