//! In-memory graph index (§4.2, §5).
//!
//! Holds the live, mutable state of a single shard: the concept map, the
//! association map, and a symmetric neighbor index kept in sync with both.
//! Structural maps share one lock each — per §5 this crate does not attempt
//! lock-free concurrency, a single `RwLock` per map is sufficient at the
//! target scale. Vector search lives in `hnsw_container`; `Store` composes
//! the two.
use crate::types::{Association, AssociationType, Concept, ConceptId, TenantId};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;

/// One entry in a concept's neighbor list, kept sorted by descending weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborEntry {
    pub neighbor: ConceptId,
    pub assoc_type: AssociationType,
    pub weight: f32,
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub associations_pruned: usize,
    pub pruned: Vec<(ConceptId, ConceptId, AssociationType)>,
}

pub struct GraphIndex {
    concepts: RwLock<HashMap<ConceptId, Concept>>,
    associations: RwLock<HashMap<(ConceptId, ConceptId, AssociationType), Association>>,
    neighbors: RwLock<HashMap<ConceptId, Vec<NeighborEntry>>>,
}

impl GraphIndex {
    pub fn new() -> Self {
        Self {
            concepts: RwLock::new(HashMap::new()),
            associations: RwLock::new(HashMap::new()),
            neighbors: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild from a recovered segment plus replayed WAL state.
    pub fn load(concepts: Vec<Concept>, associations: Vec<Association>) -> Self {
        let index = Self::new();
        {
            let mut map = index.concepts.write();
            for c in concepts {
                map.insert(c.id, c);
            }
        }
        for a in associations {
            index.insert_association_raw(a);
        }
        index
    }

    /// §4.2 `upsert_concept`: insert a brand new concept, or touch and merge
    /// onto the existing one if the id (derived from tenant+content) already
    /// exists.
    pub fn upsert_concept(&self, incoming: Concept, now: u64) -> Concept {
        let mut concepts = self.concepts.write();
        match concepts.get_mut(&incoming.id) {
            Some(existing) => {
                existing.touch(now);
                if !incoming.embedding.is_empty() {
                    existing.embedding = incoming.embedding;
                }
                for (k, v) in incoming.metadata {
                    existing.metadata.insert(k, v);
                }
                existing.clone()
            }
            None => {
                concepts.insert(incoming.id, incoming.clone());
                incoming
            }
        }
    }

    pub fn get_concept(&self, id: ConceptId) -> Option<Concept> {
        self.concepts.read().get(&id).cloned()
    }

    pub fn contains_concept(&self, id: ConceptId) -> bool {
        self.concepts.read().contains_key(&id)
    }

    pub fn all_concepts(&self) -> Vec<Concept> {
        self.concepts.read().values().cloned().collect()
    }

    pub fn concept_count(&self) -> usize {
        self.concepts.read().len()
    }

    pub fn tombstone_concept(&self, id: ConceptId) -> bool {
        if let Some(c) = self.concepts.write().get_mut(&id) {
            c.tombstoned = true;
            true
        } else {
            false
        }
    }

    /// §4.2 `upsert_association`: strengthen an existing edge in place, or
    /// insert a new one, keeping the symmetric neighbor index current.
    pub fn upsert_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
        tenant: Option<TenantId>,
        now: u64,
    ) -> Association {
        let key = (source, target, assoc_type);
        {
            let mut associations = self.associations.write();
            if let Some(existing) = associations.get_mut(&key) {
                existing.strengthen(1.0, confidence, now);
                let updated = existing.clone();
                drop(associations);
                self.reindex_neighbor(source, target, assoc_type, updated.weight);
                self.reindex_neighbor(target, source, assoc_type, updated.weight);
                return updated;
            }
        }
        let assoc = Association::new(source, target, assoc_type, confidence, tenant, now);
        self.associations.write().insert(key, assoc.clone());
        self.insert_neighbor(source, target, assoc_type, assoc.weight);
        self.insert_neighbor(target, source, assoc_type, assoc.weight);
        assoc
    }

    fn insert_association_raw(&self, assoc: Association) {
        let key = assoc.key();
        self.insert_neighbor(assoc.source, assoc.target, assoc.assoc_type, assoc.weight);
        self.insert_neighbor(assoc.target, assoc.source, assoc.assoc_type, assoc.weight);
        self.associations.write().insert(key, assoc);
    }

    fn insert_neighbor(&self, from: ConceptId, to: ConceptId, assoc_type: AssociationType, weight: f32) {
        let mut neighbors = self.neighbors.write();
        let entries = neighbors.entry(from).or_default();
        entries.push(NeighborEntry {
            neighbor: to,
            assoc_type,
            weight,
        });
        entries.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(Ordering::Equal));
    }

    fn reindex_neighbor(&self, from: ConceptId, to: ConceptId, assoc_type: AssociationType, weight: f32) {
        let mut neighbors = self.neighbors.write();
        if let Some(entries) = neighbors.get_mut(&from) {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| e.neighbor == to && e.assoc_type == assoc_type)
            {
                entry.weight = weight;
            }
            entries.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(Ordering::Equal));
        }
    }

    fn remove_neighbor(&self, from: ConceptId, to: ConceptId, assoc_type: AssociationType) {
        if let Some(entries) = self.neighbors.write().get_mut(&from) {
            entries.retain(|e| !(e.neighbor == to && e.assoc_type == assoc_type));
        }
    }

    pub fn get_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
    ) -> Option<Association> {
        self.associations.read().get(&(source, target, assoc_type)).cloned()
    }

    /// Look up an association regardless of which endpoint was recorded as
    /// `source` — used by traversal, which walks the symmetric neighbor
    /// index and doesn't know the original insertion direction.
    pub fn get_association_either(
        &self,
        a: ConceptId,
        b: ConceptId,
        assoc_type: AssociationType,
    ) -> Option<Association> {
        let associations = self.associations.read();
        associations
            .get(&(a, b, assoc_type))
            .or_else(|| associations.get(&(b, a, assoc_type)))
            .cloned()
    }

    /// Record that a traversal crossed this edge (§4.3 `find_path`).
    pub fn touch_association_either(&self, a: ConceptId, b: ConceptId, assoc_type: AssociationType, now: u64) {
        let mut associations = self.associations.write();
        if let Some(assoc) = associations.get_mut(&(a, b, assoc_type)) {
            assoc.last_used = now;
        } else if let Some(assoc) = associations.get_mut(&(b, a, assoc_type)) {
            assoc.last_used = now;
        }
    }

    pub fn get_neighbors(&self, id: ConceptId) -> Vec<NeighborEntry> {
        self.neighbors.read().get(&id).cloned().unwrap_or_default()
    }

    pub fn all_associations(&self) -> Vec<Association> {
        self.associations.read().values().cloned().collect()
    }

    pub fn association_count(&self) -> usize {
        self.associations.read().len()
    }

    /// §4.2 `decay_and_prune`: apply exponential half-life decay to every
    /// association's `score()` and drop anything that falls below
    /// `min_score`. Associations, not concepts, are the unit of decay —
    /// concepts are only removed via explicit tombstoning.
    pub fn decay_and_prune(&self, now: u64, half_life_seconds: u64, min_score: f32) -> PruneReport {
        let decay_rate = std::f32::consts::LN_2 / half_life_seconds.max(1) as f32;
        let mut dropped = Vec::new();
        {
            let mut associations = self.associations.write();
            associations.retain(|key, a| {
                let elapsed = now.saturating_sub(a.last_used) as f32;
                let decayed = a.score() * (-decay_rate * elapsed).exp();
                let keep = decayed >= min_score;
                if !keep {
                    dropped.push(*key);
                }
                keep
            });
        }
        for (source, target, assoc_type) in &dropped {
            self.remove_neighbor(*source, *target, *assoc_type);
            self.remove_neighbor(*target, *source, *assoc_type);
        }
        PruneReport {
            associations_pruned: dropped.len(),
            pruned: dropped,
        }
    }
}

impl Default for GraphIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn id(seed: u8) -> ConceptId {
        ConceptId::from_bytes([seed; 16])
    }

    fn concept(seed: u8) -> Concept {
        Concept::new(id(seed), format!("c{seed}"), vec![1.0, 2.0], None, Metadata::new(), 100)
    }

    #[test]
    fn upsert_concept_inserts_then_touches() {
        let index = GraphIndex::new();
        let first = index.upsert_concept(concept(1), 100);
        assert_eq!(first.access_count, 1);

        let second = index.upsert_concept(concept(1), 200);
        assert_eq!(second.access_count, 2);
        assert_eq!(index.concept_count(), 1);
    }

    #[test]
    fn upsert_association_builds_symmetric_neighbors() {
        let index = GraphIndex::new();
        index.upsert_association(id(1), id(2), AssociationType::Semantic, 0.8, None, 100);

        let forward = index.get_neighbors(id(1));
        let backward = index.get_neighbors(id(2));
        assert_eq!(forward.len(), 1);
        assert_eq!(backward.len(), 1);
        assert_eq!(forward[0].neighbor, id(2));
        assert_eq!(backward[0].neighbor, id(1));
    }

    #[test]
    fn upsert_association_strengthens_existing() {
        let index = GraphIndex::new();
        index.upsert_association(id(1), id(2), AssociationType::Semantic, 0.5, None, 100);
        let updated = index.upsert_association(id(1), id(2), AssociationType::Semantic, 0.9, None, 200);
        assert_eq!(updated.weight, 2.0);
        assert_eq!(updated.confidence, 0.9);
        assert_eq!(index.association_count(), 1);
    }

    #[test]
    fn decay_and_prune_drops_stale_associations() {
        let index = GraphIndex::new();
        index.upsert_association(id(1), id(2), AssociationType::Semantic, 1.0, None, 0);
        let report = index.decay_and_prune(1_000_000, 60, 0.5);
        assert_eq!(report.associations_pruned, 1);
        assert!(index.get_association(id(1), id(2), AssociationType::Semantic).is_none());
        assert!(index.get_neighbors(id(1)).is_empty());
    }
}
