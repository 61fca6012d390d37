//! Durable substrate of the tspace transaction log.
//!
//! Three pieces:
//! - [`segment`]: checksummed append-only record files with torn-tail
//!   tolerant scanning.
//! - [`snapshot`]: atomic JSON snapshots of manager state.
//! - [`store`]: the log directory tying both together (rotation, replay,
//!   discard, boot parameters).
//! - [`trigger`]: policies deciding when to request a checkpoint.
//!
//! The transaction semantics live one crate up in `tspace-txn`; this crate
//! only moves bytes and never interprets commands.

pub mod segment;
pub mod snapshot;
pub mod store;
pub mod trigger;

pub use segment::{SegmentContents, SegmentWriter, read_segment};
pub use snapshot::{LoadedSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{BootParams, FinishedSegment, LogConfig, LogStore};
pub use trigger::{CheckpointPolicy, CheckpointSync, CheckpointTrigger};
