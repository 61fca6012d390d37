//! Per-transaction state: the ordered op list and the status state machine.

use serde::{Deserialize, Serialize};
use tspace_error::{Result, TspaceError};
use tspace_types::{TxnId, TxnStatus};

use crate::op::Op;

/// The serializable core of a transaction, as persisted in Prepare commands
/// and snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRecord {
    pub id: TxnId,
    pub identity: bool,
    pub ops: Vec<Op>,
}

/// Live state of one transaction.
///
/// Mutable while ACTIVE; sealed once it starts VOTING. Ops are applied in
/// reverse insertion order on both commit and abort, so deletions become
/// visible before the writes that preceded them.
#[derive(Debug)]
pub struct TxnState {
    id: TxnId,
    ops: Vec<Op>,
    status: TxnStatus,
    /// Guaranteed non-mutating; exempt from logging.
    identity: bool,
}

impl TxnState {
    #[must_use]
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            ops: Vec::new(),
            status: TxnStatus::Active,
            identity: false,
        }
    }

    /// An identity transaction: guaranteed not to mutate durable state.
    #[must_use]
    pub fn identity(id: TxnId) -> Self {
        Self {
            identity: true,
            ..Self::new(id)
        }
    }

    /// Rebuild a transaction from its persisted record with the given status.
    #[must_use]
    pub fn from_record(record: TxnRecord, status: TxnStatus) -> Self {
        Self {
            id: record.id,
            ops: record.ops,
            status,
            identity: record.identity,
        }
    }

    #[must_use]
    pub fn id(&self) -> &TxnId {
        &self.id
    }

    #[must_use]
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.identity
    }

    #[must_use]
    pub fn has_no_ops(&self) -> bool {
        self.ops.is_empty()
    }

    /// Ops in insertion order. Callers applying effects must iterate in
    /// reverse (see [`Self::ops_newest_first`]).
    #[must_use]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Ops in application order: newest first.
    pub fn ops_newest_first(&self) -> impl Iterator<Item = &Op> {
        self.ops.iter().rev()
    }

    /// Append an op. Only legal while ACTIVE.
    pub fn add_op(&mut self, op: Op) -> Result<()> {
        if self.status != TxnStatus::Active {
            return Err(TspaceError::TransactionSealed {
                txn: self.id.to_string(),
                status: self.status.to_string(),
            });
        }
        self.ops.push(op);
        Ok(())
    }

    /// Vote: ACTIVE → VOTING. Idempotent for a transaction already voting or
    /// prepared; an error once terminal.
    pub fn vote(&mut self) -> Result<TxnStatus> {
        match self.status {
            TxnStatus::Active => {
                self.status = TxnStatus::Voting;
                Ok(TxnStatus::Voting)
            }
            TxnStatus::Voting | TxnStatus::Prepared => Ok(self.status),
            TxnStatus::Committed | TxnStatus::Aborted => Err(TspaceError::InvalidTransition {
                from: self.status.to_string(),
                to: TxnStatus::Voting.to_string(),
            }),
        }
    }

    /// Advance the status, enforcing the state machine.
    pub fn advance(&mut self, next: TxnStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(TspaceError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// The one authoritative "does this transaction touch durable state"
    /// predicate. Identity transactions and transactions with zero
    /// accumulated ops cannot affect anything recoverable.
    #[must_use]
    pub fn mutates_durable_state(&self) -> bool {
        !self.identity && !self.ops.is_empty()
    }

    /// Whether a commit/abort of this transaction must append to the log:
    /// only transactions that mutated durable state and reached PREPARED.
    /// Everything else is memory-only.
    #[must_use]
    pub fn requires_logging(&self) -> bool {
        self.mutates_durable_state() && self.status == TxnStatus::Prepared
    }

    #[must_use]
    pub fn record(&self) -> TxnRecord {
        TxnRecord {
            id: self.id.clone(),
            identity: self.identity,
            ops: self.ops.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tspace_types::{EntryRecord, Oid};

    use super::*;

    fn write_op(slot: u64) -> Op {
        Op::Write {
            record: EntryRecord::new(Oid::new(0, slot), 1, vec![], 0),
        }
    }

    #[test]
    fn test_add_op_only_while_active() {
        let mut txn = TxnState::new(TxnId::local(1));
        txn.add_op(write_op(1)).expect("add while active");
        txn.vote().expect("vote");
        let err = txn.add_op(write_op(2)).expect_err("sealed");
        assert!(matches!(err, TspaceError::TransactionSealed { .. }));
        assert_eq!(txn.ops().len(), 1);
    }

    #[test]
    fn test_vote_is_idempotent_until_terminal() {
        let mut txn = TxnState::new(TxnId::local(2));
        assert_eq!(txn.vote().expect("vote"), TxnStatus::Voting);
        assert_eq!(txn.vote().expect("re-vote"), TxnStatus::Voting);
        txn.advance(TxnStatus::Prepared).expect("prepare");
        assert_eq!(txn.vote().expect("vote prepared"), TxnStatus::Prepared);
        txn.advance(TxnStatus::Committed).expect("commit");
        assert!(txn.vote().is_err());
    }

    #[test]
    fn test_advance_rejects_illegal_transition() {
        let mut txn = TxnState::new(TxnId::local(3));
        let err = txn.advance(TxnStatus::Committed).expect_err("must fail");
        assert!(matches!(err, TspaceError::InvalidTransition { .. }));
    }

    #[test]
    fn test_skip_logging_predicate() {
        // Zero ops: never logs.
        let mut empty = TxnState::new(TxnId::local(4));
        assert!(!empty.mutates_durable_state());
        empty.vote().expect("vote");
        empty.advance(TxnStatus::Prepared).expect("prepare");
        assert!(!empty.requires_logging());

        // Identity: never logs even with ops recorded against it.
        let identity = TxnState::identity(TxnId::local(5));
        assert!(!identity.mutates_durable_state());

        // Mutating and prepared: logs.
        let mut real = TxnState::new(TxnId::local(6));
        real.add_op(write_op(1)).expect("add");
        assert!(real.mutates_durable_state());
        assert!(!real.requires_logging()); // not yet prepared
        real.vote().expect("vote");
        real.advance(TxnStatus::Prepared).expect("prepare");
        assert!(real.requires_logging());
    }

    #[test]
    fn test_ops_newest_first() {
        let mut txn = TxnState::new(TxnId::local(7));
        txn.add_op(write_op(1)).expect("add");
        txn.add_op(write_op(2)).expect("add");
        txn.add_op(Op::Take { oid: Oid::new(0, 3) }).expect("add");
        let slots: Vec<String> = txn
            .ops_newest_first()
            .map(|op| format!("{op:?}"))
            .collect();
        assert!(slots[0].contains("Take"));
        assert!(slots[2].contains("Write"));
    }

    #[test]
    fn test_record_roundtrip() {
        let mut txn = TxnState::new(TxnId::remote("jini://h:1", 9));
        txn.add_op(write_op(1)).expect("add");
        let rec = txn.record();
        let rebuilt = TxnState::from_record(rec.clone(), TxnStatus::Prepared);
        assert_eq!(rebuilt.id(), &rec.id);
        assert_eq!(rebuilt.status(), TxnStatus::Prepared);
        assert_eq!(rebuilt.ops(), rec.ops.as_slice());
    }
}
