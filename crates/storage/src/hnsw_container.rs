//! HNSW vector index, backed by `usearch` (§4.2).
//!
//! Wraps a `usearch::Index` with mmap-based persistence: the index file
//! loads in milliseconds rather than being rebuilt from scratch, and is
//! written alongside the segment it indexes. Default metric is cosine;
//! Euclidean is selectable per `HnswConfig` for callers whose embeddings
//! are not pre-normalized.
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};
use usearch::Index;

use crate::types::ConceptId;

/// Distance metric for a shard's vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cosine,
    Euclidean,
}

impl Default for Metric {
    fn default() -> Self {
        Metric::Cosine
    }
}

impl From<Metric> for MetricKind {
    fn from(m: Metric) -> Self {
        match m {
            Metric::Cosine => MetricKind::Cos,
            Metric::Euclidean => MetricKind::L2sq,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HnswConfig {
    pub dimension: usize,
    /// Max neighbors per node (M), default 16 (§4.2).
    pub max_neighbors: usize,
    /// Construction-time candidate list size, default 200 (§4.2).
    pub ef_construction: usize,
    pub metric: Metric,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            dimension: 768,
            max_neighbors: 16,
            ef_construction: 200,
            metric: Metric::Cosine,
        }
    }
}

/// Persistent, incrementally-updatable HNSW index for one shard.
pub struct HnswContainer {
    base_path: PathBuf,
    index: Arc<RwLock<Option<Index>>>,
    id_mapping: Arc<RwLock<HashMap<usize, ConceptId>>>,
    reverse_mapping: Arc<RwLock<HashMap<ConceptId, usize>>>,
    next_id: Arc<RwLock<usize>>,
    config: HnswConfig,
    dirty: Arc<RwLock<bool>>,
}

impl HnswContainer {
    pub fn new<P: AsRef<Path>>(base_path: P, config: HnswConfig) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            index: Arc::new(RwLock::new(None)),
            id_mapping: Arc::new(RwLock::new(HashMap::new())),
            reverse_mapping: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(RwLock::new(0)),
            config,
            dirty: Arc::new(RwLock::new(false)),
        }
    }

    fn index_options(&self) -> IndexOptions {
        IndexOptions {
            dimensions: self.config.dimension,
            metric: self.config.metric.into(),
            quantization: ScalarKind::F32,
            connectivity: self.config.max_neighbors,
            expansion_add: self.config.ef_construction,
            expansion_search: 40,
            multi: false,
        }
    }

    /// Load a persisted index from disk if present and version-compatible,
    /// otherwise rebuild from `vectors` (§4.2: "rebuilt if absent or
    /// version-mismatched").
    pub fn load_or_build(&self, vectors: &HashMap<ConceptId, Vec<f32>>) -> Result<()> {
        let index_path = self.base_path.with_extension("usearch");
        let metadata_path = self.base_path.with_extension("hnsw.meta");
        let start = Instant::now();

        if index_path.exists() && metadata_path.exists() {
            if let Err(err) = self.try_load(&index_path, &metadata_path, vectors) {
                tracing::warn!(error = %err, "failed to load persisted HNSW index, rebuilding");
                return self.build_from_vectors(vectors);
            }
            tracing::info!(elapsed_ms = start.elapsed().as_secs_f64() * 1000.0, "loaded HNSW index");
            return Ok(());
        }

        tracing::info!(count = vectors.len(), "no persisted HNSW index found, building");
        self.build_from_vectors(vectors)
    }

    fn try_load(
        &self,
        index_path: &Path,
        metadata_path: &Path,
        vectors: &HashMap<ConceptId, Vec<f32>>,
    ) -> Result<()> {
        self.load_mappings(metadata_path)?;

        let index = Index::new(&self.index_options()).context("failed to create usearch index")?;
        index
            .load(index_path.to_str().context("non-utf8 index path")?)
            .context("failed to load usearch index from disk")?;

        let num_loaded = index.size();
        if num_loaded < vectors.len() {
            let missing: Vec<(ConceptId, Vec<f32>)> = {
                let reverse_mapping = self.reverse_mapping.read();
                vectors
                    .iter()
                    .filter(|(id, _)| !reverse_mapping.contains_key(id))
                    .map(|(id, v)| (*id, v.clone()))
                    .collect()
            };
            if !missing.is_empty() {
                index.reserve(missing.len()).context("failed to reserve capacity")?;
                for (concept_id, vector) in missing {
                    self.insert_into_index(&index, concept_id, &vector)?;
                }
                *self.dirty.write() = true;
            }
        }

        *self.index.write() = Some(index);
        Ok(())
    }

    fn insert_into_index(&self, index: &Index, concept_id: ConceptId, vector: &[f32]) -> Result<()> {
        let hnsw_id = {
            let mut next_id = self.next_id.write();
            let id = *next_id;
            *next_id += 1;
            id
        };
        index.add(hnsw_id as u64, vector).context("failed to add vector to index")?;
        self.id_mapping.write().insert(hnsw_id, concept_id);
        self.reverse_mapping.write().insert(concept_id, hnsw_id);
        Ok(())
    }

    fn build_from_vectors(&self, vectors: &HashMap<ConceptId, Vec<f32>>) -> Result<()> {
        let start = Instant::now();
        let index = Index::new(&self.index_options()).context("failed to create usearch index")?;

        if vectors.is_empty() {
            *self.index.write() = Some(index);
            return Ok(());
        }

        index.reserve(vectors.len()).context("failed to reserve index capacity")?;
        {
            let mut id_mapping = self.id_mapping.write();
            let mut reverse_mapping = self.reverse_mapping.write();
            let mut next_id = self.next_id.write();
            for (concept_id, vector) in vectors.iter() {
                let hnsw_id = *next_id;
                index.add(hnsw_id as u64, vector).context("failed to add vector to index")?;
                id_mapping.insert(hnsw_id, *concept_id);
                reverse_mapping.insert(*concept_id, hnsw_id);
                *next_id += 1;
            }
        }

        tracing::info!(
            count = vectors.len(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "built HNSW index"
        );
        *self.index.write() = Some(index);
        *self.dirty.write() = true;
        Ok(())
    }

    /// Insert a single vector incrementally.
    pub fn insert(&self, concept_id: ConceptId, vector: Vec<f32>) -> Result<()> {
        if self.reverse_mapping.read().contains_key(&concept_id) {
            return Ok(());
        }
        let index_lock = self.index.read();
        let index = index_lock.as_ref().context("HNSW index not initialized")?;
        index.reserve(1).context("failed to reserve capacity for insert")?;
        self.insert_into_index(index, concept_id, &vector)?;
        *self.dirty.write() = true;
        Ok(())
    }

    /// Approximate k-nearest-neighbor search. `ef_search` tunes the
    /// recall/latency tradeoff per query (§4.2).
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<(ConceptId, f32)> {
        let index_lock = self.index.read();
        let index = match index_lock.as_ref() {
            Some(idx) => idx,
            None => return Vec::new(),
        };
        if ef_search > 0 {
            let _ = index.change_expansion_search(ef_search);
        }

        let matches = match index.search(query, k) {
            Ok(m) => m,
            Err(err) => {
                tracing::error!(error = %err, "HNSW search failed");
                return Vec::new();
            }
        };

        let id_mapping = self.id_mapping.read();
        matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(hnsw_id, distance)| {
                id_mapping.get(&(*hnsw_id as usize)).map(|concept_id| {
                    let similarity = match self.config.metric {
                        Metric::Cosine => 1.0 - distance.min(1.0),
                        Metric::Euclidean => -*distance,
                    };
                    (*concept_id, similarity)
                })
            })
            .collect()
    }

    /// Persist the index next to the segment it indexes.
    pub fn save(&self) -> Result<()> {
        if !*self.dirty.read() {
            return Ok(());
        }
        let index_path = self.base_path.with_extension("usearch");
        let metadata_path = self.base_path.with_extension("hnsw.meta");

        let index_lock = self.index.read();
        let index = index_lock.as_ref().context("HNSW index not initialized")?;

        if let Some(parent) = index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        index
            .save(index_path.to_str().context("non-utf8 index path")?)
            .context("failed to save usearch index")?;
        drop(index_lock);

        self.save_mappings(&metadata_path)?;
        *self.dirty.write() = false;
        Ok(())
    }

    fn save_mappings(&self, path: &Path) -> Result<()> {
        let metadata = HnswMetadata {
            id_mapping: self.id_mapping.read().clone(),
            next_id: *self.next_id.read(),
            version: 1,
        };
        let encoded = rmp_serde::to_vec(&metadata).context("failed to encode HNSW metadata")?;
        std::fs::write(path, encoded).context("failed to write HNSW metadata")?;
        Ok(())
    }

    fn load_mappings(&self, path: &Path) -> Result<()> {
        let data = std::fs::read(path).context("failed to read HNSW metadata")?;
        let metadata: HnswMetadata = rmp_serde::from_slice(&data).context("failed to decode HNSW metadata")?;

        *self.id_mapping.write() = metadata.id_mapping.clone();
        let mut reverse_mapping = self.reverse_mapping.write();
        reverse_mapping.clear();
        for (hnsw_id, concept_id) in metadata.id_mapping.iter() {
            reverse_mapping.insert(*concept_id, *hnsw_id);
        }
        drop(reverse_mapping);
        *self.next_id.write() = metadata.next_id;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        *self.dirty.read()
    }

    pub fn stats(&self) -> HnswContainerStats {
        let index_lock = self.index.read();
        HnswContainerStats {
            num_vectors: index_lock.as_ref().map(|idx| idx.size()).unwrap_or(0),
            dimension: self.config.dimension,
            max_neighbors: self.config.max_neighbors,
            dirty: *self.dirty.read(),
            initialized: index_lock.is_some(),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct HnswMetadata {
    id_mapping: HashMap<usize, ConceptId>,
    next_id: usize,
    version: u32,
}

#[derive(Debug, Clone)]
pub struct HnswContainerStats {
    pub num_vectors: usize,
    pub dimension: usize,
    pub max_neighbors: usize,
    pub dirty: bool,
    pub initialized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vectors(n: u64, dim: usize) -> HashMap<ConceptId, Vec<f32>> {
        (0..n)
            .map(|i| {
                let mut id_bytes = [0u8; 16];
                id_bytes[0..8].copy_from_slice(&i.to_le_bytes());
                let vector: Vec<f32> = (0..dim).map(|j| ((i as usize + j) % 100) as f32 / 100.0).collect();
                (ConceptId(id_bytes), vector)
            })
            .collect()
    }

    #[test]
    fn build_and_search() {
        let dir = TempDir::new().unwrap();
        let config = HnswConfig {
            dimension: 32,
            ..HnswConfig::default()
        };
        let container = HnswContainer::new(dir.path().join("storage"), config);

        let vecs = vectors(100, 32);
        container.load_or_build(&vecs).unwrap();

        let query: Vec<f32> = (0..32).map(|j| (j % 100) as f32 / 100.0).collect();
        let results = container.search(&query, 10, 50);
        assert!(!results.is_empty());
        assert!(results.len() <= 10);
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let base_path = dir.path().join("storage");
        let config = HnswConfig {
            dimension: 32,
            ..HnswConfig::default()
        };

        {
            let container = HnswContainer::new(&base_path, config.clone());
            container.load_or_build(&vectors(100, 32)).unwrap();
            container.save().unwrap();
        }

        {
            let container = HnswContainer::new(&base_path, config);
            container.load_or_build(&HashMap::new()).unwrap();
            let stats = container.stats();
            assert_eq!(stats.num_vectors, 100);
            assert!(!stats.dirty);
        }
    }

    #[test]
    fn incremental_insert_grows_index() {
        let dir = TempDir::new().unwrap();
        let config = HnswConfig {
            dimension: 32,
            ..HnswConfig::default()
        };
        let container = HnswContainer::new(dir.path().join("storage"), config);
        container.load_or_build(&vectors(10, 32)).unwrap();

        for (id, vec) in vectors(20, 32).into_iter().skip(10) {
            container.insert(id, vec).unwrap();
        }

        assert_eq!(container.stats().num_vectors, 20);
        assert!(container.stats().dirty);
    }
}
