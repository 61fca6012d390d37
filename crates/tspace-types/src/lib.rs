//! Core identifiers and data types shared by the tspace engine.
//!
//! Everything here is plain data: no I/O, no locking. The transaction layer
//! (`tspace-txn`), the durable log (`tspace-log`), and the storage layer
//! (`tspace-store`) all build on these types.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Oid — storage address of an entry
// ---------------------------------------------------------------------------

/// Internal identifier addressing an entry's storage location.
///
/// `bucket` selects the allocator bucket, `slot` is the offset key within it.
/// The lease tracker groups its expiry index by `bucket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid {
    pub bucket: u32,
    pub slot: u64,
}

impl Oid {
    #[must_use]
    pub const fn new(bucket: u32, slot: u64) -> Self {
        Self { bucket, slot }
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bucket, self.slot)
    }
}

// ---------------------------------------------------------------------------
// Coordinator / TxnId
// ---------------------------------------------------------------------------

/// The coordinator half of a transaction identity.
///
/// `Null` stands for locally-originated transactions (including the implicit
/// transaction wrapped around single logged operations). Remote coordinators
/// are addressed by endpoint; resolving and talking to them is the remote
/// layer's job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coordinator {
    Null,
    Remote { endpoint: String },
}

impl Coordinator {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "local"),
            Self::Remote { endpoint } => write!(f, "{endpoint}"),
        }
    }
}

/// Identity of a transaction: (coordinator, numeric id).
///
/// At most one live `TxnState` exists per `TxnId` at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId {
    pub coordinator: Coordinator,
    pub seq: u64,
}

impl TxnId {
    /// A locally-originated transaction id.
    #[must_use]
    pub const fn local(seq: u64) -> Self {
        Self {
            coordinator: Coordinator::Null,
            seq,
        }
    }

    /// A transaction managed by a remote coordinator.
    #[must_use]
    pub fn remote(endpoint: impl Into<String>, seq: u64) -> Self {
        Self {
            coordinator: Coordinator::Remote {
                endpoint: endpoint.into(),
            },
            seq,
        }
    }

    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.coordinator.is_null()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.coordinator, self.seq)
    }
}

// ---------------------------------------------------------------------------
// TxnStatus
// ---------------------------------------------------------------------------

/// Status state machine of a transaction.
///
/// ```text
/// Active → Voting → Prepared → { Committed, Aborted }
/// ```
///
/// Abort is additionally legal from `Active` and `Voting` (a transaction that
/// dies before it ever prepared).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    Active,
    Voting,
    Prepared,
    Committed,
    Aborted,
}

impl TxnStatus {
    /// Whether advancing `self → next` is a legal transition.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Voting)
                | (Self::Voting, Self::Prepared)
                | (Self::Prepared, Self::Committed | Self::Aborted)
                | (Self::Active | Self::Voting, Self::Aborted)
        )
    }

    /// Terminal statuses admit no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Voting => "VOTING",
            Self::Prepared => "PREPARED",
            Self::Committed => "COMMITTED",
            Self::Aborted => "ABORTED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// EntryRecord — persisted form of an entry
// ---------------------------------------------------------------------------

/// The persisted fields of a stored entry.
///
/// The payload is opaque: field-level encoding belongs to the entry
/// serialization layer, which sits outside this engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub oid: Oid,
    /// Numeric handle for the entry's class (type) name.
    pub class_id: u32,
    pub payload: Vec<u8>,
    /// Lease expiry, milliseconds since the unix epoch.
    pub expiry_ms: u64,
}

impl EntryRecord {
    #[must_use]
    pub fn new(oid: Oid, class_id: u32, payload: Vec<u8>, expiry_ms: u64) -> Self {
        Self {
            oid,
            class_id,
            payload,
            expiry_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Sleeve — in-memory caching wrapper around an entry
// ---------------------------------------------------------------------------

/// Caching state of a sleeve (the in-memory representation of an entry).
///
/// Replaces the independent NotOnDisk/Pinned/Deleted flags with one enum so
/// that illegal flag combinations cannot be represented. `DirtyNewDeleted`
/// is the terminal "never existed on disk, now deleted" state whose physical
/// write is elided entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SleeveState {
    /// Matches disk; nothing to do on eviction.
    Clean,
    /// Matches disk but a holder may still mutate it.
    PinnedClean,
    /// Dirty and pinned: eviction defers to the pinned side table.
    PinnedDirty,
    /// Created in memory, never written to disk.
    DirtyNew,
    /// Exists on disk, in-memory copy is newer.
    DirtyUpdated,
    /// Exists on disk, deleted in memory.
    DirtyDeleted,
    /// Never existed on disk and already deleted: elide the write.
    DirtyNewDeleted,
}

impl SleeveState {
    /// Whether `self → next` is a legal sleeve transition.
    #[must_use]
    pub fn can_become(self, next: Self) -> bool {
        use SleeveState::{
            Clean, DirtyDeleted, DirtyNew, DirtyNewDeleted, DirtyUpdated, PinnedClean, PinnedDirty,
        };
        match self {
            Clean => matches!(next, PinnedClean | DirtyUpdated | DirtyDeleted),
            PinnedClean => matches!(next, Clean | PinnedDirty),
            PinnedDirty => matches!(next, DirtyNew | DirtyUpdated | DirtyDeleted | DirtyNewDeleted),
            DirtyNew => matches!(next, PinnedDirty | DirtyNewDeleted | Clean),
            DirtyUpdated => matches!(next, PinnedDirty | DirtyDeleted | Clean),
            DirtyDeleted | DirtyNewDeleted => false,
        }
    }

    #[must_use]
    pub const fn is_pinned(self) -> bool {
        matches!(self, Self::PinnedClean | Self::PinnedDirty)
    }

    #[must_use]
    pub const fn is_dirty(self) -> bool {
        !matches!(self, Self::Clean | Self::PinnedClean)
    }
}

/// In-memory representation of a stored entry: the persisted record plus the
/// transient caching state the write-back scheduler keys off of.
#[derive(Debug, Clone)]
pub struct Sleeve {
    pub record: EntryRecord,
    pub state: SleeveState,
}

impl Sleeve {
    #[must_use]
    pub fn new(record: EntryRecord, state: SleeveState) -> Self {
        Self { record, state }
    }

    #[must_use]
    pub fn oid(&self) -> Oid {
        self.record.oid
    }
}
