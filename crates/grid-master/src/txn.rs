//! Coordinator-side two-phase commit for associations whose endpoints land
//! on different shards (§4.3, §4.4 `TxnPrepare`/`TxnCommit`/`TxnAbort`).
//! Each shard's `TransactionParticipant` holds the durable vote; this module
//! only sequences the prepare/commit/abort round trips.

use anyhow::{bail, Result};
use noema_protocol::{decode, encode, Client, Opcode, StorageRequest, StorageResponse};
use std::time::Duration;

/// A 2PC prepare has its own per-peer timeout (§4.4); expiry counts as "no".
const PREPARE_TIMEOUT: Duration = Duration::from_secs(10);

/// One shard's endpoint and the half of the association it owns.
pub struct Participant<'a> {
    pub client: &'a Client,
    pub source: [u8; 16],
    pub target: [u8; 16],
}

/// Coordinate an association write across two shard participants: prepare
/// both, commit if both voted yes, abort (best-effort) otherwise.
pub async fn commit_association(
    txn_id: u64,
    a: Participant<'_>,
    b: Participant<'_>,
    assoc_type: u8,
    confidence: f32,
    tenant: Option<[u8; 16]>,
) -> Result<()> {
    let prepare_a = prepare(a.client, txn_id, a.source, a.target, assoc_type, confidence, tenant);
    let prepare_b = prepare(b.client, txn_id, b.source, b.target, assoc_type, confidence, tenant);
    let (vote_a, vote_b) = tokio::join!(
        tokio::time::timeout(PREPARE_TIMEOUT, prepare_a),
        tokio::time::timeout(PREPARE_TIMEOUT, prepare_b),
    );

    let yes_a = matches!(vote_a, Ok(Ok(true)));
    let yes_b = matches!(vote_b, Ok(Ok(true)));

    if yes_a && yes_b {
        let (commit_a, commit_b) = tokio::join!(commit(a.client, txn_id), commit(b.client, txn_id));
        commit_a?;
        commit_b?;
        Ok(())
    } else {
        let _ = tokio::join!(abort(a.client, txn_id), abort(b.client, txn_id));
        bail!("prepare vote failed: source={yes_a} target={yes_b}")
    }
}

async fn prepare(
    client: &Client,
    txn_id: u64,
    source: [u8; 16],
    target: [u8; 16],
    assoc_type: u8,
    confidence: f32,
    tenant: Option<[u8; 16]>,
) -> Result<bool> {
    let request = StorageRequest::TxnPrepare {
        txn_id,
        source,
        target,
        assoc_type,
        confidence,
        tenant,
    };
    let payload = encode(&request)?;
    match client.call(Opcode::TxnPrepare as u8, payload).await {
        Ok(frame) => {
            let response: StorageResponse = decode(&frame.payload)?;
            Ok(matches!(response, StorageResponse::TxnAck))
        }
        Err(_) => Ok(false),
    }
}

async fn commit(client: &Client, txn_id: u64) -> Result<()> {
    let payload = encode(&StorageRequest::TxnCommit { txn_id })?;
    client.call(Opcode::TxnCommit as u8, payload).await?;
    Ok(())
}

async fn abort(client: &Client, txn_id: u64) -> Result<()> {
    let payload = encode(&StorageRequest::TxnAbort { txn_id })?;
    client.call(Opcode::TxnAbort as u8, payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepare_against_unreachable_peer_votes_no() {
        let client = Client::connect("127.0.0.1:1").await;
        assert!(client.is_err());
    }
}
