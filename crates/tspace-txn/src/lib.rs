//! Transaction management for the tuple-space store.
//!
//! The design is command-sourced: every durable state change is expressed as
//! a [`Command`], appended to the log, then applied to in-memory state
//! through one code path. Recovery is snapshot restore plus command replay
//! over that same path.
//!
//! Layering:
//!
//! - [`op`]: individual durable effects and the [`EntryBackend`] seam to
//!   entry storage,
//! - [`state`]: per-transaction status machine and op list,
//! - [`command`]: the serialized log record vocabulary,
//! - [`manager_state`]: all live transactions, apply, snapshot, restore,
//! - [`manager`]: logging, checkpointing, and the public lifecycle API,
//! - [`liveness`]: probing of remote coordinators.

pub mod command;
pub mod liveness;
pub mod manager;
pub mod manager_state;
pub mod op;
pub mod state;

pub use command::{Command, COMMAND_FORMAT_VERSION};
pub use liveness::{CoordinatorGateway, LivenessChecker, TxnHost};
pub use manager::{CheckpointBarrier, OpLog, TxnEndedHook, TxnManager, TxnManagerConfig};
pub use manager_state::{ApplyMode, EndedTxn, SnapshotState, TxnManagerState};
pub use op::{EntryBackend, Op};
pub use state::{TxnRecord, TxnState};
