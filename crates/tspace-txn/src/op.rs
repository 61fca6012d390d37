//! Ops: serializable, replayable mutations of entry storage, each owned by
//! one transaction.
//!
//! An Op describes a single durable effect. It is applied through the
//! [`EntryBackend`] seam in three ways:
//!
//! - `commit`: make the effect final,
//! - `abort`: undo the provisional effect,
//! - `restore`: rebuild transient structures during recovery, before the
//!   governing commit/abort replays.
//!
//! The entry layer implements [`EntryBackend`]; this crate never touches
//! physical storage directly.

use serde::{Deserialize, Serialize};
use tracing::debug;
use tspace_error::Result;
use tspace_types::{EntryRecord, Oid};

// ---------------------------------------------------------------------------
// EntryBackend — the seam between transactions and entry storage
// ---------------------------------------------------------------------------

/// Entry-storage operations a transaction can drive.
///
/// Provisional state (an entry written or taken under a still-open
/// transaction) lives behind this trait; the transaction layer only decides
/// *when* each effect becomes final or is rolled back.
pub trait EntryBackend: Send + Sync {
    /// A committed write: the entry becomes visible and is scheduled for
    /// physical insert.
    fn commit_write(&self, record: &EntryRecord) -> Result<()>;

    /// An aborted write: the provisional entry is discarded; it was never
    /// observable and never reaches disk.
    fn abort_write(&self, oid: Oid) -> Result<()>;

    /// A committed take: the entry is gone for good and its physical record
    /// is scheduled for deletion.
    fn commit_take(&self, oid: Oid) -> Result<()>;

    /// An aborted take: the entry reappears exactly once.
    fn abort_take(&self, oid: Oid) -> Result<()>;

    /// A committed lease renewal.
    fn set_expiry(&self, oid: Oid, expiry_ms: u64) -> Result<()>;

    /// Recovery pre-pass for a write belonging to a PREPARED transaction.
    fn restore_write(&self, record: &EntryRecord) -> Result<()>;

    /// Recovery pre-pass for a take belonging to a PREPARED transaction.
    fn restore_take(&self, oid: Oid) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Op
// ---------------------------------------------------------------------------

/// One durable state change owned by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Write an entry.
    Write { record: EntryRecord },
    /// Take (destructively read) an entry.
    Take { oid: Oid },
    /// A take whose effect is forced final at prepare time (the first
    /// destructive op of the transaction). Irreversible once prepared:
    /// commit and abort are both no-ops for it afterwards.
    ForcedTake { oid: Oid },
    /// Renew an entry's lease.
    Renew { oid: Oid, expiry_ms: u64 },
    /// Informational instance count for a class. Carried in the log for
    /// observability; no recoverable effect.
    InstanceCount { class_id: u32, count: u64 },
}

impl Op {
    /// Apply the committed effect.
    pub fn commit(&self, backend: &dyn EntryBackend) -> Result<()> {
        match self {
            Self::Write { record } => backend.commit_write(record),
            Self::Take { oid } => backend.commit_take(*oid),
            // Already applied when the owning transaction prepared.
            Self::ForcedTake { .. } => Ok(()),
            Self::Renew { oid, expiry_ms } => backend.set_expiry(*oid, *expiry_ms),
            Self::InstanceCount { class_id, count } => {
                debug!(class_id, count, "instance count record");
                Ok(())
            }
        }
    }

    /// Undo the provisional effect.
    pub fn abort(&self, backend: &dyn EntryBackend) -> Result<()> {
        match self {
            Self::Write { record } => backend.abort_write(record.oid),
            Self::Take { oid } => backend.abort_take(*oid),
            // Forced at prepare; nothing left to undo.
            Self::ForcedTake { .. } => Ok(()),
            Self::Renew { .. } | Self::InstanceCount { .. } => Ok(()),
        }
    }

    /// Rebuild transient structures during recovery.
    pub fn restore(&self, backend: &dyn EntryBackend) -> Result<()> {
        match self {
            Self::Write { record } => backend.restore_write(record),
            Self::Take { oid } | Self::ForcedTake { oid } => backend.restore_take(*oid),
            Self::Renew { .. } | Self::InstanceCount { .. } => Ok(()),
        }
    }

    /// Apply the prepare-time effect. Only forced takes have one.
    pub fn prepare(&self, backend: &dyn EntryBackend) -> Result<()> {
        match self {
            Self::ForcedTake { oid } => backend.commit_take(*oid),
            _ => Ok(()),
        }
    }

    /// Whether this op mutates recoverable state at all.
    #[must_use]
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::InstanceCount { .. })
    }
}
