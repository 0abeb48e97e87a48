//! Storage-local metrics events, forwarded to `grid-events` over the wire
//! protocol when this node is part of a cluster. Standalone nodes keep
//! emitting locally (tracing only) since there's nowhere else for them to go.
use crate::types::ConceptId;
use noema_protocol::{encode, Client, Opcode};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct StorageEventEmitter {
    node_id: String,
    sender: Option<mpsc::UnboundedSender<StorageEvent>>,
    worker_handle: Option<Arc<JoinHandle<()>>>,
}

#[derive(Debug, Clone)]
pub enum StorageEvent {
    ConceptLearned {
        concept_id: String,
    },
    Metrics {
        concept_count: usize,
        association_count: usize,
        wal_sequence: u64,
    },
    QueryPerformance {
        query_type: String,
        query_depth: u32,
        result_count: usize,
        latency_ms: u64,
    },
    HnswIndexBuilt {
        vector_count: usize,
        build_time_ms: u64,
        dimension: usize,
    },
    HnswIndexLoaded {
        vector_count: usize,
        load_time_ms: u64,
        persisted: bool,
    },
    PathfindingMetrics {
        source_id: String,
        target_id: String,
        path_length: u32,
        latency_ms: u64,
    },
    ReconciliationComplete {
        entries_processed: u64,
        reconciliation_time_ms: u64,
    },
}

impl StorageEventEmitter {
    /// Emitter with nowhere to forward to — events are only traced.
    pub fn new() -> Self {
        Self {
            node_id: "unknown".to_string(),
            sender: None,
            worker_handle: None,
        }
    }

    /// Emitter that forwards to `grid-events` at `event_storage_addr`.
    pub fn with_endpoint(node_id: String, event_storage_addr: Option<String>) -> Self {
        let Some(addr) = event_storage_addr else {
            return Self {
                node_id,
                sender: None,
                worker_handle: None,
            };
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::worker_loop(node_id.clone(), addr, rx));
        Self {
            node_id,
            sender: Some(tx),
            worker_handle: Some(Arc::new(handle)),
        }
    }

    fn emit(&self, event: StorageEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                warn!(node_id = %self.node_id, "event emitter worker gone, dropping event");
            }
        } else {
            debug!(node_id = %self.node_id, ?event, "storage event (no forwarding configured)");
        }
    }

    pub fn concept_learned(&self, concept_id: ConceptId) {
        self.emit(StorageEvent::ConceptLearned {
            concept_id: concept_id.to_hex(),
        });
    }

    pub fn metrics(&self, concept_count: usize, association_count: usize, wal_sequence: u64) {
        self.emit(StorageEvent::Metrics {
            concept_count,
            association_count,
            wal_sequence,
        });
    }

    pub fn query_performance(&self, query_type: impl Into<String>, query_depth: u32, result_count: usize, latency_ms: u64) {
        self.emit(StorageEvent::QueryPerformance {
            query_type: query_type.into(),
            query_depth,
            result_count,
            latency_ms,
        });
    }

    pub fn hnsw_built(&self, vector_count: usize, build_time_ms: u64, dimension: usize) {
        self.emit(StorageEvent::HnswIndexBuilt {
            vector_count,
            build_time_ms,
            dimension,
        });
    }

    pub fn hnsw_loaded(&self, vector_count: usize, load_time_ms: u64, persisted: bool) {
        self.emit(StorageEvent::HnswIndexLoaded {
            vector_count,
            load_time_ms,
            persisted,
        });
    }

    pub fn pathfinding(&self, source_id: ConceptId, target_id: ConceptId, path_length: u32, latency_ms: u64) {
        self.emit(StorageEvent::PathfindingMetrics {
            source_id: source_id.to_hex(),
            target_id: target_id.to_hex(),
            path_length,
            latency_ms,
        });
    }

    pub fn reconciliation_complete(&self, entries_processed: u64, reconciliation_time_ms: u64) {
        self.emit(StorageEvent::ReconciliationComplete {
            entries_processed,
            reconciliation_time_ms,
        });
    }

    /// Drains the channel and forwards each event to `grid-events` as an
    /// `Opcode::Event` request. Reconnects lazily on the next event if the
    /// connection drops; in between, events are dropped rather than queued
    /// unboundedly.
    async fn worker_loop(node_id: String, event_storage_addr: String, mut receiver: mpsc::UnboundedReceiver<StorageEvent>) {
        debug!(node_id, event_storage_addr, "event emitter worker started");
        let mut client: Option<Client> = None;

        while let Some(event) = receiver.recv().await {
            if client.is_none() {
                client = Client::connect(&event_storage_addr).await.ok();
                if client.is_none() {
                    warn!(event_storage_addr, "grid-events unreachable, dropping event");
                    continue;
                }
            }

            let payload = match encode(&EventEnvelope {
                node_id: node_id.clone(),
                event: event.into(),
            }) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "failed to encode storage event");
                    continue;
                }
            };

            if let Some(c) = &client {
                if c.call(Opcode::Event as u8, payload).await.is_err() {
                    warn!(event_storage_addr, "send to grid-events failed, will reconnect");
                    client = None;
                }
            }
        }

        debug!(node_id, "event emitter worker stopped");
    }
}

/// Wire shape for a forwarded storage event. `grid-events` decodes this and
/// persists it as a concept linked to the originating node.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct EventEnvelope {
    node_id: String,
    event: SerializableEvent,
}

/// `StorageEvent` isn't `Serialize` directly (it borrows nothing but keeping
/// wire shape separate from the in-process enum avoids coupling the two).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind")]
enum SerializableEvent {
    ConceptLearned { concept_id: String },
    Metrics { concept_count: usize, association_count: usize, wal_sequence: u64 },
    QueryPerformance { query_type: String, query_depth: u32, result_count: usize, latency_ms: u64 },
    HnswIndexBuilt { vector_count: usize, build_time_ms: u64, dimension: usize },
    HnswIndexLoaded { vector_count: usize, load_time_ms: u64, persisted: bool },
    PathfindingMetrics { source_id: String, target_id: String, path_length: u32, latency_ms: u64 },
    ReconciliationComplete { entries_processed: u64, reconciliation_time_ms: u64 },
}

impl From<StorageEvent> for SerializableEvent {
    fn from(event: StorageEvent) -> Self {
        match event {
            StorageEvent::ConceptLearned { concept_id } => Self::ConceptLearned { concept_id },
            StorageEvent::Metrics { concept_count, association_count, wal_sequence } => {
                Self::Metrics { concept_count, association_count, wal_sequence }
            }
            StorageEvent::QueryPerformance { query_type, query_depth, result_count, latency_ms } => {
                Self::QueryPerformance { query_type, query_depth, result_count, latency_ms }
            }
            StorageEvent::HnswIndexBuilt { vector_count, build_time_ms, dimension } => {
                Self::HnswIndexBuilt { vector_count, build_time_ms, dimension }
            }
            StorageEvent::HnswIndexLoaded { vector_count, load_time_ms, persisted } => {
                Self::HnswIndexLoaded { vector_count, load_time_ms, persisted }
            }
            StorageEvent::PathfindingMetrics { source_id, target_id, path_length, latency_ms } => {
                Self::PathfindingMetrics { source_id, target_id, path_length, latency_ms }
            }
            StorageEvent::ReconciliationComplete { entries_processed, reconciliation_time_ms } => {
                Self::ReconciliationComplete { entries_processed, reconciliation_time_ms }
            }
        }
    }
}

impl Default for StorageEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_endpoint_does_not_panic() {
        let emitter = StorageEventEmitter::new();
        emitter.metrics(10, 20, 5);
        emitter.concept_learned(ConceptId::from_bytes([1; 16]));
    }
}
