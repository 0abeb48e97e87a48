//! Closed error taxonomy for the storage engine (§7).
use thiserror::Error;

/// Errors a storage node can return to a caller. The taxonomy is closed: the
/// wire protocol maps each variant to a fixed numeric code (see
/// `noema_protocol::ErrorPayload`).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("content too large: {0} bytes (limit {1})")]
    ContentTooLarge(usize, usize),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("unknown association type: {0}")]
    InvalidType(u8),

    #[error("traversal depth {0} exceeds limit {1}")]
    DepthExceeded(u32, u32),

    #[error("batch size {0} exceeds limit {1}")]
    BatchTooLarge(usize, usize),

    #[error("vector search k={0} exceeds limit {1}")]
    KTooLarge(usize, usize),

    #[error("concept not found: {0}")]
    ConceptNotFound(crate::types::ConceptId),

    #[error("association not found")]
    AssociationNotFound,

    #[error("storage node not found: {0}")]
    NodeNotFound(String),

    #[error("tenant mismatch: concepts belong to different tenants")]
    TenantMismatch,

    #[error("duplicate non-idempotent operation")]
    Conflict,

    #[error("transient failure, retry: {0}")]
    Transient(String),

    #[error("durability failure: {0}")]
    Durability(String),

    #[error("shard corrupted: {0}")]
    Corruption(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl StoreError {
    /// Stable numeric code carried in the wire protocol's error payload.
    pub fn code(&self) -> u16 {
        match self {
            Self::ContentTooLarge(..) => 1001,
            Self::DimensionMismatch { .. } => 1002,
            Self::InvalidType(_) => 1003,
            Self::DepthExceeded(..) => 1004,
            Self::BatchTooLarge(..) => 1005,
            Self::KTooLarge(..) => 1006,
            Self::ConceptNotFound(_) => 2001,
            Self::AssociationNotFound => 2002,
            Self::NodeNotFound(_) => 2003,
            Self::TenantMismatch => 3001,
            Self::Conflict => 3002,
            Self::Transient(_) => 4001,
            Self::Durability(_) => 5001,
            Self::Corruption(_) => 6001,
            Self::Protocol(_) => 7001,
            Self::DeadlineExceeded => 4002,
        }
    }

    /// Whether the shard must stop serving writes after this error (§7).
    pub fn is_fatal_for_shard(&self) -> bool {
        matches!(self, Self::Durability(_) | Self::Corruption(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::ContentTooLarge(..)
                | Self::DimensionMismatch { .. }
                | Self::InvalidType(_)
                | Self::DepthExceeded(..)
                | Self::BatchTooLarge(..)
                | Self::KTooLarge(..)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
