//! Core storage engine for a single shard of the knowledge graph: concepts,
//! associations, the on-disk segment format, the write-ahead log, the HNSW
//! vector index, bidirectional pathfinding, and participant-side two-phase
//! commit. `tcp_server` exposes this over the wire protocol; `grid-master`
//! and `grid-agent` compose shards into a cluster.
pub mod config;
pub mod error;
pub mod event_emitter;
pub mod hnsw_container;
pub mod index;
pub mod pathfinding;
pub mod segment;
pub mod store;
pub mod tcp_server;
pub mod tls;
pub mod transaction;
pub mod types;
pub mod wal;

pub use error::{Result, StoreError};
pub use hnsw_container::{HnswConfig, HnswContainer, HnswContainerStats, Metric};
pub use index::{GraphIndex, NeighborEntry, PruneReport};
pub use pathfinding::find_path;
pub use segment::{Segment, SegmentStats, ASSOCIATION_SLOT_SIZE, CONCEPT_SLOT_SIZE, FORMAT_VERSION, MAGIC};
pub use store::{
    Store, StoreConfig, DEFAULT_WAL_CHECKPOINT_BYTES, MAX_BATCH, MAX_CONTENT_BYTES, MAX_METADATA_BYTES,
    MAX_SEARCH_K, MAX_TRAVERSAL_DEPTH,
};
pub use transaction::{PendingOp, TransactionParticipant, TxnState};
pub use types::{
    clamp_confidence, clamp_strength, clamp_weight, now_unix_micros, now_unix_secs, Association, AssociationType,
    Concept, ConceptId, GraphPath, Metadata, TenantId,
};
pub use wal::{AssociationRecord, ConceptRecord, LogRecord, Operation, WriteAheadLog};

pub const STORAGE_VERSION: u32 = 2;
