//! Top-level storage engine (C1, §4.1–§4.3, §6).
//!
//! `Store` owns one shard: the segment on disk, the write-ahead log, the
//! in-memory `GraphIndex`, and the HNSW vector index. All public operations
//! go through it.
use crate::error::{Result, StoreError};
use crate::hnsw_container::{HnswConfig, HnswContainer};
use crate::index::{GraphIndex, NeighborEntry, PruneReport};
use crate::pathfinding;
use crate::segment::Segment;
use crate::types::{
    clamp_confidence, now_unix_secs, Association, AssociationType, Concept, ConceptId, GraphPath, Metadata, TenantId,
};
use crate::wal::{ConceptRecord, Operation, WriteAheadLog};
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Admission-control limits (§6). `MAX_CONTENT_BYTES` is the §3 data-model
/// cap on a single concept's content; it is unrelated to the wire protocol's
/// message-size cap (`noema_protocol::MAX_MESSAGE_SIZE`), which bounds an
/// entire framed request/response and is an order of magnitude larger.
pub const MAX_CONTENT_BYTES: usize = 10 * 1024;
pub const MAX_METADATA_BYTES: usize = 1024;
pub const MAX_BATCH: usize = 1000;
pub const MAX_TRAVERSAL_DEPTH: u32 = 20;
pub const MAX_SEARCH_K: usize = 1000;
pub const DEFAULT_WAL_CHECKPOINT_BYTES: u64 = 256 * 1024 * 1024;

pub struct StoreConfig {
    pub dir: PathBuf,
    pub dimension: u32,
    pub tenant_mode: bool,
    pub fsync_wal: bool,
    pub hnsw: HnswConfig,
    pub wal_checkpoint_bytes: u64,
}

impl StoreConfig {
    pub fn new<P: AsRef<Path>>(dir: P, dimension: u32) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            dimension,
            tenant_mode: false,
            fsync_wal: true,
            hnsw: HnswConfig {
                dimension: dimension as usize,
                ..HnswConfig::default()
            },
            wal_checkpoint_bytes: DEFAULT_WAL_CHECKPOINT_BYTES,
        }
    }
}

pub struct Store {
    config: StoreConfig,
    index: GraphIndex,
    hnsw: HnswContainer,
    wal: Mutex<WriteAheadLog>,
    wal_bytes_since_checkpoint: AtomicU64,
}

impl Store {
    fn segment_path(dir: &Path) -> PathBuf {
        dir.join("segment.dat")
    }

    fn wal_path(dir: &Path) -> PathBuf {
        dir.join("wal.log")
    }

    fn hnsw_path(dir: &Path) -> PathBuf {
        dir.join("vectors")
    }

    /// Open (or initialize) a shard at `config.dir`: load the latest segment,
    /// replay the WAL on top of it, and rebuild/load the HNSW index (§4.1
    /// "Recovery").
    pub fn open(config: StoreConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.dir).context("failed to create storage directory")?;
        let segment_path = Self::segment_path(&config.dir);
        let wal_path = Self::wal_path(&config.dir);

        let segment = if segment_path.exists() {
            Segment::open(&segment_path, config.dimension)?
        } else {
            Segment::create_empty(&segment_path, config.dimension, config.tenant_mode)?
        };

        let mut concepts: HashMap<ConceptId, Concept> =
            segment.iter_concepts().map(|c| (c.id, c)).collect();
        let mut associations: HashMap<(ConceptId, ConceptId, AssociationType), Association> =
            segment.iter_associations().map(|a| (a.key(), a)).collect();

        let records = WriteAheadLog::recover(&wal_path)?;
        for record in &records {
            apply_operation(&record.operation, &mut concepts, &mut associations);
        }

        let index = GraphIndex::load(concepts.into_values().collect(), associations.into_values().collect());

        let vectors: HashMap<ConceptId, Vec<f32>> = index
            .all_concepts()
            .into_iter()
            .map(|c| (c.id, c.embedding))
            .collect();
        let hnsw = HnswContainer::new(Self::hnsw_path(&config.dir), config.hnsw.clone());
        hnsw.load_or_build(&vectors)?;

        let wal = WriteAheadLog::open(&wal_path, config.fsync_wal)?;

        Ok(Self {
            config,
            index,
            hnsw,
            wal: Mutex::new(wal),
            wal_bytes_since_checkpoint: AtomicU64::new(0),
        })
    }

    fn validate_content(content: &str) -> Result<()> {
        if content.as_bytes().len() > MAX_CONTENT_BYTES {
            return Err(StoreError::ContentTooLarge(content.as_bytes().len(), MAX_CONTENT_BYTES));
        }
        Ok(())
    }

    fn validate_embedding(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.config.dimension as usize {
            return Err(StoreError::DimensionMismatch {
                expected: self.config.dimension as usize,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    fn validate_metadata(metadata: &Metadata) -> Result<()> {
        let size: usize = metadata.iter().map(|(k, v)| k.len() + v.len()).sum();
        if size > MAX_METADATA_BYTES {
            return Err(StoreError::ContentTooLarge(size, MAX_METADATA_BYTES));
        }
        Ok(())
    }

    /// §4.2 `learn_concept`.
    pub fn learn_concept(
        &self,
        content: String,
        embedding: Vec<f32>,
        tenant: Option<TenantId>,
        metadata: Metadata,
    ) -> Result<Concept> {
        Self::validate_content(&content)?;
        self.validate_embedding(&embedding)?;
        Self::validate_metadata(&metadata)?;

        let now = now_unix_secs();
        let id = ConceptId::derive(tenant, &content);
        let is_new = !self.index.contains_concept(id);
        let incoming = Concept::new(id, content, embedding.clone(), tenant, metadata, now);

        let record: ConceptRecord = (&incoming).into();
        {
            let mut wal = self.wal.lock();
            if is_new {
                wal.append(Operation::AddConcept(record)).map_err(to_durability)?;
            } else {
                let updated = self.index.get_concept(id).unwrap();
                wal.append(Operation::UpdateConcept {
                    id,
                    strength: updated.strength,
                    confidence: updated.confidence,
                    access_count: updated.access_count + 1,
                    last_accessed: now,
                })
                .map_err(to_durability)?;
            }
        }
        self.wal_bytes_since_checkpoint.fetch_add(1, Ordering::Relaxed);

        let stored = self.index.upsert_concept(incoming, now);
        if is_new {
            self.hnsw.insert(id, embedding).map_err(to_durability)?;
        }
        Ok(stored)
    }

    /// §4.2 `learn_association`. Both endpoints must already exist in this
    /// shard (cross-shard associations are coordinated by `grid-master`).
    pub fn learn_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
        tenant: Option<TenantId>,
    ) -> Result<Association> {
        if !self.index.contains_concept(source) {
            return Err(StoreError::ConceptNotFound(source));
        }
        if !self.index.contains_concept(target) {
            return Err(StoreError::ConceptNotFound(target));
        }

        let now = now_unix_secs();
        let confidence = clamp_confidence(confidence);
        let existing = self.index.get_association(source, target, assoc_type);

        {
            let mut wal = self.wal.lock();
            if let Some(existing) = &existing {
                wal.append(Operation::StrengthenAssociation {
                    source,
                    target,
                    assoc_type,
                    weight: (existing.weight + 1.0).min(10.0),
                    confidence: existing.confidence.max(confidence),
                    last_used: now,
                })
                .map_err(to_durability)?;
            } else {
                wal.append(Operation::AddAssociation(crate::wal::AssociationRecord {
                    source,
                    target,
                    assoc_type,
                    confidence,
                    tenant,
                    created: now,
                }))
                .map_err(to_durability)?;
            }
        }
        self.wal_bytes_since_checkpoint.fetch_add(1, Ordering::Relaxed);

        Ok(self.index.upsert_association(source, target, assoc_type, confidence, tenant, now))
    }

    pub fn get_concept(&self, id: ConceptId) -> Result<Concept> {
        self.index.get_concept(id).ok_or(StoreError::ConceptNotFound(id))
    }

    pub fn get_neighbors(&self, id: ConceptId) -> Vec<NeighborEntry> {
        self.index.get_neighbors(id)
    }

    pub fn get_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
    ) -> Option<Association> {
        self.index.get_association(source, target, assoc_type)
    }

    /// §4.2 `vector_search`: approximate k-NN over concept embeddings.
    pub fn vector_search(&self, query: &[f32], k: usize, ef_search: usize) -> Result<Vec<(Concept, f32)>> {
        if k > MAX_SEARCH_K {
            return Err(StoreError::KTooLarge(k, MAX_SEARCH_K));
        }
        self.validate_embedding(query)?;
        Ok(self
            .hnsw
            .search(query, k, ef_search)
            .into_iter()
            .filter_map(|(id, score)| self.index.get_concept(id).map(|c| (c, score)))
            .collect())
    }

    /// §4.3 `find_path`: bidirectional best-first search between two concepts.
    pub fn find_path(&self, source: ConceptId, target: ConceptId, max_depth: u32) -> Result<Option<GraphPath>> {
        if max_depth > MAX_TRAVERSAL_DEPTH {
            return Err(StoreError::DepthExceeded(max_depth, MAX_TRAVERSAL_DEPTH));
        }
        if !self.index.contains_concept(source) {
            return Err(StoreError::ConceptNotFound(source));
        }
        if !self.index.contains_concept(target) {
            return Err(StoreError::ConceptNotFound(target));
        }
        Ok(pathfinding::find_path(&self.index, source, target, max_depth))
    }

    /// §4.2 `decay_and_prune`.
    pub fn decay_and_prune(&self, half_life_seconds: u64, min_score: f32) -> Result<PruneReport> {
        let now = now_unix_secs();
        let report = self.index.decay_and_prune(now, half_life_seconds, min_score);
        if !report.pruned.is_empty() {
            let mut wal = self.wal.lock();
            wal.append(Operation::PruneAssociations { keys: report.pruned.clone() }).map_err(to_durability)?;
        }
        Ok(report)
    }

    pub fn concept_count(&self) -> usize {
        self.index.concept_count()
    }

    pub fn association_count(&self) -> usize {
        self.index.association_count()
    }

    pub fn wal_sequence(&self) -> u64 {
        self.wal.lock().sequence()
    }

    /// Whether accumulated WAL growth warrants a checkpoint (§4.1, default
    /// 256 MiB via `WAL_CHECKPOINT_MB`).
    pub fn should_checkpoint(&self) -> bool {
        match std::fs::metadata(Self::wal_path(&self.config.dir)) {
            Ok(meta) => meta.len() >= self.config.wal_checkpoint_bytes,
            Err(_) => false,
        }
    }

    /// §4.1 checkpoint: serialize the in-memory state to a new segment,
    /// fsync it, atomically install it, save the HNSW index, then truncate
    /// the WAL. Readers are never blocked; writers briefly stall behind the
    /// WAL lock while the segment swap completes.
    pub fn checkpoint(&self) -> anyhow::Result<()> {
        let concepts = self.index.all_concepts();
        let associations = self.index.all_associations();

        let segment_path = Self::segment_path(&self.config.dir);
        Segment::write_new(&segment_path, self.config.dimension, self.config.tenant_mode, &concepts, &associations)?;

        self.hnsw.save()?;

        let mut wal = self.wal.lock();
        wal.truncate()?;
        self.wal_bytes_since_checkpoint.store(0, Ordering::Relaxed);
        Ok(())
    }
}

fn to_durability(err: anyhow::Error) -> StoreError {
    StoreError::Durability(err.to_string())
}

fn apply_operation(
    op: &Operation,
    concepts: &mut HashMap<ConceptId, Concept>,
    associations: &mut HashMap<(ConceptId, ConceptId, AssociationType), Association>,
) {
    match op {
        Operation::AddConcept(record) => {
            concepts.insert(
                record.id,
                Concept::new(
                    record.id,
                    record.content.clone(),
                    record.embedding.clone(),
                    record.tenant,
                    record.metadata.clone(),
                    record.created,
                ),
            );
        }
        Operation::UpdateConcept {
            id,
            strength,
            confidence,
            access_count,
            last_accessed,
        } => {
            if let Some(c) = concepts.get_mut(id) {
                c.strength = *strength;
                c.confidence = *confidence;
                c.access_count = *access_count;
                c.last_accessed = *last_accessed;
            }
        }
        Operation::AddAssociation(record) => {
            let assoc = Association::new(record.source, record.target, record.assoc_type, record.confidence, record.tenant, record.created);
            associations.insert(assoc.key(), assoc);
        }
        Operation::StrengthenAssociation {
            source,
            target,
            assoc_type,
            weight,
            confidence,
            last_used,
        } => {
            if let Some(a) = associations.get_mut(&(*source, *target, *assoc_type)) {
                a.weight = *weight;
                a.confidence = *confidence;
                a.last_used = *last_used;
            }
        }
        Operation::Prune { concept_ids } => {
            for id in concept_ids {
                if let Some(c) = concepts.get_mut(id) {
                    c.tombstoned = true;
                }
            }
        }
        Operation::PruneAssociations { keys } => {
            for key in keys {
                associations.remove(key);
            }
        }
        // Transaction bookkeeping records carry no direct state mutation here;
        // `TransactionParticipant` handles in-doubt recovery separately.
        Operation::BeginTransaction { .. }
        | Operation::Prepare { .. }
        | Operation::Commit { .. }
        | Operation::Abort { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &Path) -> StoreConfig {
        StoreConfig::new(dir, 4)
    }

    #[test]
    fn learn_and_retrieve_concept() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(dir.path())).unwrap();
        let concept = store
            .learn_concept("cats are mammals".into(), vec![1.0, 2.0, 3.0, 4.0], None, Metadata::new())
            .unwrap();

        let fetched = store.get_concept(concept.id).unwrap();
        assert_eq!(fetched.content, "cats are mammals");
    }

    #[test]
    fn relearning_same_content_touches_not_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(dir.path())).unwrap();
        store
            .learn_concept("same".into(), vec![1.0, 2.0, 3.0, 4.0], None, Metadata::new())
            .unwrap();
        store
            .learn_concept("same".into(), vec![1.0, 2.0, 3.0, 4.0], None, Metadata::new())
            .unwrap();
        assert_eq!(store.concept_count(), 1);
    }

    #[test]
    fn association_requires_existing_endpoints() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(dir.path())).unwrap();
        let err = store
            .learn_association(ConceptId([1; 16]), ConceptId([2; 16]), AssociationType::Semantic, 0.9, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::ConceptNotFound(_)));
    }

    #[test]
    fn checkpoint_then_reopen_preserves_state() {
        let dir = TempDir::new().unwrap();
        let a_id;
        {
            let store = Store::open(config(dir.path())).unwrap();
            let a = store
                .learn_concept("alpha".into(), vec![1.0, 0.0, 0.0, 0.0], None, Metadata::new())
                .unwrap();
            let b = store
                .learn_concept("beta".into(), vec![0.0, 1.0, 0.0, 0.0], None, Metadata::new())
                .unwrap();
            store
                .learn_association(a.id, b.id, AssociationType::Semantic, 0.8, None)
                .unwrap();
            store.checkpoint().unwrap();
            a_id = a.id;
        }

        let store = Store::open(config(dir.path())).unwrap();
        assert_eq!(store.concept_count(), 2);
        assert_eq!(store.association_count(), 1);
        assert!(store.get_concept(a_id).is_ok());
    }

    #[test]
    fn content_over_limit_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(dir.path())).unwrap();
        let huge = "x".repeat(MAX_CONTENT_BYTES + 1);
        let err = store.learn_concept(huge, vec![1.0, 2.0, 3.0, 4.0], None, Metadata::new()).unwrap_err();
        assert!(matches!(err, StoreError::ContentTooLarge(..)));
    }
}
