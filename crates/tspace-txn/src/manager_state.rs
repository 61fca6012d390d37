//! The in-memory "prevalent system": all live transactions, snapshot
//! serialization, and deterministic command application.
//!
//! [`TxnManagerState`] is the single mutator of transaction state. Both live
//! operation (after appending a command to the log) and recovery replay go
//! through [`TxnManagerState::apply`], which is what makes replay
//! idempotence a structural property rather than a convention.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tspace_error::{Result, TspaceError};
use tspace_types::{TxnId, TxnStatus};

use crate::command::Command;
use crate::op::EntryBackend;
use crate::state::{TxnRecord, TxnState};

/// Whether a command is being applied during live operation or during
/// recovery replay. Downstream notifications fire only when live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Live,
    Replay,
}

/// A transaction that reached its end during command application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndedTxn {
    pub id: TxnId,
    pub status: TxnStatus,
}

/// Serialized image of the manager state: the logical clock, every PREPARED
/// transaction, and opaque contributions from upper layers. ACTIVE
/// transactions are absent by construction (nothing to recover).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotState {
    pub clock: u64,
    pub prepared: Vec<TxnRecord>,
    pub user: BTreeMap<String, serde_json::Value>,
}

/// All live transactions plus the logical clock.
///
/// The live map is a concurrent map keyed by [`TxnId`]; lookups and inserts
/// never take the manager's checkpoint lock.
#[derive(Debug, Default)]
pub struct TxnManagerState {
    live: DashMap<TxnId, Arc<Mutex<TxnState>>>,
    clock: AtomicU64,
}

impl TxnManagerState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    pub fn bump_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Look up a live transaction.
    #[must_use]
    pub fn get(&self, id: &TxnId) -> Option<Arc<Mutex<TxnState>>> {
        self.live.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert a fresh transaction. At most one `TxnState` per `TxnId` may be
    /// live; a second insert for the same id returns the existing state
    /// (first resolution wins).
    pub fn resolve(&self, state: TxnState) -> Arc<Mutex<TxnState>> {
        let id = state.id().clone();
        Arc::clone(
            self.live
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(state)))
                .value(),
        )
    }

    /// Ids of live transactions owned by remote coordinators.
    #[must_use]
    pub fn remote_transaction_ids(&self) -> Vec<TxnId> {
        self.live
            .iter()
            .filter(|entry| !entry.key().is_local())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Status of a live transaction, if any.
    #[must_use]
    pub fn status_of(&self, id: &TxnId) -> Option<TxnStatus> {
        self.get(id).map(|entry| entry.lock().status())
    }

    // -----------------------------------------------------------------------
    // Command application
    // -----------------------------------------------------------------------

    /// Apply one command. Returns the transactions this command ended, so the
    /// caller can fire end-of-transaction notifications (live mode only).
    pub fn apply(
        &self,
        cmd: &Command,
        backend: &dyn EntryBackend,
        mode: ApplyMode,
    ) -> Result<Vec<EndedTxn>> {
        self.bump_clock();
        match cmd {
            Command::Prepare { txn } => {
                self.apply_prepare(txn, backend, mode)?;
                Ok(Vec::new())
            }
            Command::Commit { id } => Ok(self.apply_end(id, TxnStatus::Committed, backend, mode)?),
            Command::Abort { id } => Ok(self.apply_end(id, TxnStatus::Aborted, backend, mode)?),
            Command::PrepareAndCommit { txn } => {
                self.apply_prepare(txn, backend, mode)?;
                Ok(self.apply_end(&txn.id, TxnStatus::Committed, backend, mode)?)
            }
            Command::AbortAll => self.apply_abort_all(backend),
        }
    }

    fn apply_prepare(
        &self,
        record: &TxnRecord,
        backend: &dyn EntryBackend,
        mode: ApplyMode,
    ) -> Result<()> {
        let entry = match self.get(&record.id) {
            Some(entry) => entry,
            None => {
                // Replay: the transaction only exists in the log. Rebuild its
                // transient structures before anything replays on top.
                if mode == ApplyMode::Live {
                    return Err(TspaceError::UnknownTransaction {
                        txn: record.id.to_string(),
                    });
                }
                for op in &record.ops {
                    op.restore(backend)?;
                }
                self.resolve(TxnState::from_record(record.clone(), TxnStatus::Voting))
            }
        };

        // Forced ops take effect at prepare time, in op order.
        for op in &record.ops {
            op.prepare(backend)?;
        }

        let mut state = entry.lock();
        if state.status() != TxnStatus::Prepared {
            state.advance(TxnStatus::Prepared)?;
        }
        debug!(txn = %record.id, ops = record.ops.len(), "transaction prepared");
        Ok(())
    }

    fn apply_end(
        &self,
        id: &TxnId,
        terminal: TxnStatus,
        backend: &dyn EntryBackend,
        mode: ApplyMode,
    ) -> Result<Vec<EndedTxn>> {
        let Some((_, entry)) = self.live.remove(id) else {
            // Replaying a command whose effect is already inside the snapshot
            // baseline; skipping it is what makes replay idempotent.
            if mode == ApplyMode::Replay {
                debug!(txn = %id, ?terminal, "replayed end for absent transaction, skipping");
                return Ok(Vec::new());
            }
            return Err(TspaceError::UnknownTransaction {
                txn: id.to_string(),
            });
        };

        let mut state = entry.lock();
        self.end_locked(&mut state, terminal, backend)?;
        Ok(vec![EndedTxn {
            id: id.clone(),
            status: terminal,
        }])
    }

    fn apply_abort_all(&self, backend: &dyn EntryBackend) -> Result<Vec<EndedTxn>> {
        let ids: Vec<TxnId> = self.live.iter().map(|e| e.key().clone()).collect();
        let mut ended = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, entry)) = self.live.remove(&id) {
                let mut state = entry.lock();
                self.end_locked(&mut state, TxnStatus::Aborted, backend)?;
                ended.push(EndedTxn {
                    id,
                    status: TxnStatus::Aborted,
                });
            }
        }
        debug!(aborted = ended.len(), "abort-all applied");
        Ok(ended)
    }

    /// Apply a transaction's ops in reverse insertion order and move it to
    /// its terminal status.
    fn end_locked(
        &self,
        state: &mut TxnState,
        terminal: TxnStatus,
        backend: &dyn EntryBackend,
    ) -> Result<()> {
        for op in state.ops_newest_first() {
            match terminal {
                TxnStatus::Committed => op.commit(backend)?,
                TxnStatus::Aborted => op.abort(backend)?,
                other => {
                    return Err(TspaceError::internal(format!(
                        "end_locked called with non-terminal status {other}"
                    )));
                }
            }
        }
        // The state machine allows Committed only from Prepared; walk through
        // the intermediate statuses for transactions ended early.
        while state.status() != terminal {
            let next = match (state.status(), terminal) {
                (TxnStatus::Active, _) => TxnStatus::Voting,
                (TxnStatus::Voting, TxnStatus::Committed) => TxnStatus::Prepared,
                (TxnStatus::Voting | TxnStatus::Prepared, _) => terminal,
                _ => terminal,
            };
            state.advance(next)?;
        }
        debug!(txn = %state.id(), status = %terminal, "transaction ended");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Snapshot / restore
    // -----------------------------------------------------------------------

    /// Serialize the recoverable part of manager state. Only PREPARED
    /// transactions are included.
    #[must_use]
    pub fn snapshot(&self, user: BTreeMap<String, serde_json::Value>) -> SnapshotState {
        let mut prepared = Vec::new();
        for entry in &self.live {
            let state = entry.value().lock();
            if state.status() == TxnStatus::Prepared && state.mutates_durable_state() {
                prepared.push(state.record());
            }
        }
        // Deterministic snapshot ordering regardless of map iteration order.
        prepared.sort_by_key(|record| (record.id.seq, record.id.coordinator.to_string()));
        SnapshotState {
            clock: self.clock(),
            prepared,
            user,
        }
    }

    /// Rebuild state from a snapshot: restore each prepared transaction's
    /// ops, then re-insert it as PREPARED.
    pub fn restore_from(&self, snapshot: &SnapshotState, backend: &dyn EntryBackend) -> Result<()> {
        self.clock.store(snapshot.clock, Ordering::Release);
        for record in &snapshot.prepared {
            for op in &record.ops {
                op.restore(backend)?;
            }
            self.resolve(TxnState::from_record(record.clone(), TxnStatus::Prepared));
        }
        debug!(
            prepared = snapshot.prepared.len(),
            clock = snapshot.clock,
            "manager state restored from snapshot"
        );
        Ok(())
    }
}
