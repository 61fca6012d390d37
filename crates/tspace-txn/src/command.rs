//! Commands: replayable mutations of the transaction manager's state.
//!
//! Committing means append-then-apply; replaying the surviving log from the
//! last snapshot deterministically reconstructs manager state. Commands are
//! encoded as JSON inside a small versioned frame; the segment layer adds
//! length and checksum framing around these bytes.

use serde::{Deserialize, Serialize};
use tspace_error::{Result, TspaceError};
use tspace_types::TxnId;

use crate::state::TxnRecord;

/// Current command encoding version.
pub const COMMAND_FORMAT_VERSION: u32 = 1;

/// One durable mutation of manager state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// A transaction voted and is now PREPARED. Carries the full record so
    /// replay can reconstruct the transaction without a snapshot.
    Prepare { txn: TxnRecord },
    /// A prepared transaction committed.
    Commit { id: TxnId },
    /// A prepared transaction aborted.
    Abort { id: TxnId },
    /// Prepare and commit folded into one record (single-participant fast
    /// path, and the implicit transaction wrapped around `log(op)`).
    PrepareAndCommit { txn: TxnRecord },
    /// Force-abort of every live transaction.
    AbortAll,
}

#[derive(Serialize, Deserialize)]
struct CommandFrame {
    v: u32,
    cmd: Command,
}

impl Command {
    /// Encode for the log.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&CommandFrame {
            v: COMMAND_FORMAT_VERSION,
            cmd: self.clone(),
        })
        .map_err(TspaceError::codec)
    }

    /// Decode a log record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let frame: CommandFrame = serde_json::from_slice(bytes).map_err(TspaceError::codec)?;
        if frame.v != COMMAND_FORMAT_VERSION {
            return Err(TspaceError::Codec {
                detail: format!("unsupported command format version {}", frame.v),
            });
        }
        Ok(frame.cmd)
    }

    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Prepare { .. } => "prepare",
            Self::Commit { .. } => "commit",
            Self::Abort { .. } => "abort",
            Self::PrepareAndCommit { .. } => "prepare_and_commit",
            Self::AbortAll => "abort_all",
        }
    }
}
