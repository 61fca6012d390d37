//! Entry storage for the tspace engine.
//!
//! - [`writeback`]: the asynchronous coalescing write-back buffer over a
//!   [`PhysicalStore`],
//! - [`backend`]: sleeves, visibility, and transactional staging; implements
//!   the transaction layer's `EntryBackend`,
//! - [`lease`]: the expiry index and sweep loop.

pub mod backend;
pub mod lease;
pub mod writeback;

pub use backend::StoreBackend;
pub use lease::{ExpiryFilter, LeaseSweeper, LeaseTracker};
pub use writeback::{
    Buffered, FlushAction, PhysicalStore, WriteBuffer, WriteBufferConfig, WriteRequest, WriteState,
};
