//! Participant-side two-phase commit state (§4.1, §4.5).
//!
//! A storage node never initiates a transaction — `grid-master` coordinates
//! cross-shard writes and drives each participant through prepare then
//! commit/abort. This module only tracks in-doubt transactions: a `Prepare`
//! WAL record with no matching `Commit`/`Abort` means the node must ask the
//! coordinator for the outcome on startup (§4.5 "in-doubt recovery").
use crate::types::{AssociationType, ConceptId, TenantId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Prepared,
    Committed,
    Aborted,
}

/// The mutation a prepared transaction will apply once committed.
#[derive(Debug, Clone)]
pub enum PendingOp {
    Association {
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
        tenant: Option<TenantId>,
    },
}

#[derive(Debug, Clone)]
struct PendingTxn {
    op: PendingOp,
    prepared_at: Instant,
}

/// Tracks transactions this shard has prepared but not yet resolved. The
/// coordinator's per-peer prepare call has a 10s timeout (§4.5); an
/// un-acknowledged prepare here simply expires and is swept away, which the
/// coordinator treats as an implicit "no" vote.
pub struct TransactionParticipant {
    pending: RwLock<HashMap<u64, PendingTxn>>,
    prepare_timeout: Duration,
}

impl TransactionParticipant {
    pub fn new() -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            prepare_timeout: Duration::from_secs(10),
        }
    }

    pub fn prepare(&self, txn_id: u64, op: PendingOp) {
        self.pending.write().insert(
            txn_id,
            PendingTxn {
                op,
                prepared_at: Instant::now(),
            },
        );
    }

    /// Consume the prepared transaction, returning the operation to apply.
    pub fn commit(&self, txn_id: u64) -> Option<PendingOp> {
        self.pending.write().remove(&txn_id).map(|t| t.op)
    }

    pub fn abort(&self, txn_id: u64) {
        self.pending.write().remove(&txn_id);
    }

    pub fn is_prepared(&self, txn_id: u64) -> bool {
        self.pending.read().contains_key(&txn_id)
    }

    /// Drop prepared transactions the coordinator never followed up on.
    /// Returns the ids that expired.
    pub fn sweep_expired(&self) -> Vec<u64> {
        let mut pending = self.pending.write();
        let now = Instant::now();
        let expired: Vec<u64> = pending
            .iter()
            .filter(|(_, t)| now.duration_since(t.prepared_at) > self.prepare_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            pending.remove(id);
        }
        expired
    }

    /// Transactions prepared but unresolved — queried by the coordinator on
    /// node restart to learn their fate.
    pub fn in_doubt(&self) -> Vec<u64> {
        self.pending.read().keys().copied().collect()
    }
}

impl Default for TransactionParticipant {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> ConceptId {
        ConceptId([seed; 16])
    }

    fn op() -> PendingOp {
        PendingOp::Association {
            source: id(1),
            target: id(2),
            assoc_type: AssociationType::Semantic,
            confidence: 0.9,
            tenant: None,
        }
    }

    #[test]
    fn prepare_then_commit_yields_op() {
        let p = TransactionParticipant::new();
        p.prepare(1, op());
        assert!(p.is_prepared(1));
        assert!(p.commit(1).is_some());
        assert!(!p.is_prepared(1));
    }

    #[test]
    fn abort_drops_without_applying() {
        let p = TransactionParticipant::new();
        p.prepare(1, op());
        p.abort(1);
        assert!(p.commit(1).is_none());
    }

    #[test]
    fn in_doubt_lists_unresolved_transactions() {
        let p = TransactionParticipant::new();
        p.prepare(1, op());
        p.prepare(2, op());
        p.commit(1);
        assert_eq!(p.in_doubt(), vec![2]);
    }
}
