//! Core types for the knowledge-graph storage engine.
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Concept identifier: 16-byte digest derived from `(tenant_id, normalized content)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
pub struct ConceptId(pub [u8; 16]);

impl ConceptId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Deterministic id for `(tenant, content)`: md5 of the tenant id followed
    /// by the normalized (trimmed, lowercased) content bytes. Same tenant and
    /// content always yield the same id (invariant #3).
    pub fn derive(tenant: Option<TenantId>, content: &str) -> Self {
        let normalized = content.trim().to_lowercase();
        let mut buf = Vec::with_capacity(16 + normalized.len());
        buf.extend_from_slice(&tenant.map(|t| t.0).unwrap_or([0u8; 16]));
        buf.extend_from_slice(normalized.as_bytes());
        let digest = md5::compute(&buf);
        Self(digest.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s)?;
        anyhow::ensure!(bytes.len() == 16, "concept id must decode to 16 bytes");
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Tenant identifier: opaque 16-byte value, caller-assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
pub struct TenantId(pub [u8; 16]);

impl TenantId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

/// Association type (5 tags, §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AssociationType {
    Semantic = 0,
    Causal = 1,
    Temporal = 2,
    Hierarchical = 3,
    Compositional = 4,
}

impl AssociationType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Semantic),
            1 => Some(Self::Causal),
            2 => Some(Self::Temporal),
            3 => Some(Self::Hierarchical),
            4 => Some(Self::Compositional),
            _ => None,
        }
    }
}

/// Small inline key/value metadata, serialized compactly alongside a concept.
/// Callers are expected to keep the serialized size at or under 1 KiB (§3);
/// `Store::learn_concept` enforces this.
pub type Metadata = std::collections::BTreeMap<String, String>;

/// Clamp strength into `[1.0, 10.0]` (invariant #2).
pub fn clamp_strength(value: f32) -> f32 {
    value.clamp(1.0, 10.0)
}

/// Clamp confidence into `[0.0, 1.0]` (invariant #2).
pub fn clamp_confidence(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// Clamp association weight into `[0.0, 10.0]`.
pub fn clamp_weight(value: f32) -> f32 {
    value.clamp(0.0, 10.0)
}

/// In-memory concept record held by `GraphIndex`. The on-disk layout
/// (`segment::ConceptSlot`) is a packed subset of this plus an offset into
/// the content heap and the vector block.
#[derive(Debug, Clone)]
pub struct Concept {
    pub id: ConceptId,
    pub content: String,
    pub embedding: Vec<f32>,
    pub strength: f32,
    pub confidence: f32,
    pub access_count: u64,
    pub created: u64,
    pub last_accessed: u64,
    pub tenant: Option<TenantId>,
    pub metadata: Metadata,
    pub tombstoned: bool,
}

impl Concept {
    pub fn new(
        id: ConceptId,
        content: String,
        embedding: Vec<f32>,
        tenant: Option<TenantId>,
        metadata: Metadata,
        now: u64,
    ) -> Self {
        Self {
            id,
            content,
            embedding,
            strength: 1.0,
            confidence: 1.0,
            access_count: 1,
            created: now,
            last_accessed: now,
            tenant,
            metadata,
            tombstoned: false,
        }
    }

    /// Apply an access-driven refresh: strength bump saturating at 10.0, plus
    /// access-count increment (§4.2 `upsert_concept`).
    pub fn touch(&mut self, now: u64) {
        self.strength = clamp_strength(self.strength + (10.0 - self.strength).min(0.02));
        self.access_count += 1;
        self.last_accessed = now;
    }
}

/// In-memory association record.
#[derive(Debug, Clone)]
pub struct Association {
    pub source: ConceptId,
    pub target: ConceptId,
    pub assoc_type: AssociationType,
    pub weight: f32,
    pub confidence: f32,
    pub created: u64,
    pub last_used: u64,
    pub tenant: Option<TenantId>,
}

impl Association {
    pub fn new(
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
        tenant: Option<TenantId>,
        now: u64,
    ) -> Self {
        Self {
            source,
            target,
            assoc_type,
            weight: 1.0,
            confidence: clamp_confidence(confidence),
            created: now,
            last_used: now,
            tenant,
        }
    }

    pub fn key(&self) -> (ConceptId, ConceptId, AssociationType) {
        (self.source, self.target, self.assoc_type)
    }

    /// Strengthen on re-learn or traversal: weight saturates at 10, confidence
    /// takes the max of old/new (§4.2 `upsert_association`).
    pub fn strengthen(&mut self, delta_weight: f32, confidence: f32, now: u64) {
        self.weight = clamp_weight(self.weight + delta_weight);
        self.confidence = clamp_confidence(self.confidence.max(confidence));
        self.last_used = now;
    }

    pub fn score(&self) -> f32 {
        self.weight * self.confidence
    }
}

/// A path through the knowledge graph, as returned by `find_path` (§4.3).
#[derive(Debug, Clone)]
pub struct GraphPath {
    pub concepts: Vec<ConceptId>,
    pub edges: Vec<(ConceptId, ConceptId, AssociationType)>,
    pub confidence: f32,
}

pub fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

pub fn now_unix_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_id() {
        let a = ConceptId::derive(None, "Cats are mammals.");
        let b = ConceptId::derive(None, "  cats are mammals.  ");
        assert_eq!(a, b);
    }

    #[test]
    fn tenant_changes_id() {
        let t1 = TenantId::from_bytes([1; 16]);
        let t2 = TenantId::from_bytes([2; 16]);
        let a = ConceptId::derive(Some(t1), "same content");
        let b = ConceptId::derive(Some(t2), "same content");
        assert_ne!(a, b);
    }

    #[test]
    fn strength_clamps() {
        assert_eq!(clamp_strength(0.0), 1.0);
        assert_eq!(clamp_strength(11.0), 10.0);
    }

    #[test]
    fn touch_saturates() {
        let mut c = Concept::new(ConceptId::from_bytes([0; 16]), "x".into(), vec![], None, Metadata::new(), 0);
        for _ in 0..10_000 {
            c.touch(0);
        }
        assert_eq!(c.strength, 10.0);
    }
}
