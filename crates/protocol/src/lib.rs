//! Framed binary wire protocol shared by every internal connection in the
//! cluster (§4.4): storage client ↔ storage node, agent ↔ master, and the
//! event-emission path. One codec, one `Frame`, one multiplexing client;
//! each service layers its own request/response vocabulary on top.
//!
//! Framing: `u32 length` (big-endian, excludes itself) + `u8 opcode` +
//! `u8 flags` + `u16 request_id` + payload. Payload is `rmp-serde`-encoded.
//! Responses reuse the request's id, set flag bit 0 (`RESPONSE`); bit 1
//! (`ERROR`) marks the payload as an `ErrorPayload`.

pub mod client;
pub mod error;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use client::Client;
pub use error::{ProtocolError, Result};

/// Single wire message hard limit (§4.2 admission control).
pub const MAX_MESSAGE_SIZE: u32 = 100 * 1024 * 1024;

pub const FLAG_RESPONSE: u8 = 0b01;
pub const FLAG_ERROR: u8 = 0b10;

/// Opcode ranges (§4.4): learn 0x10-0x1F, query 0x20-0x2F, search 0x30-0x3F,
/// transaction 0x40-0x4F, admin/stats 0x50-0x5F, event 0x60-0x6F.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    LearnConcept = 0x10,
    LearnAssociation = 0x11,
    LearnBatch = 0x12,
    GetConcept = 0x20,
    GetNeighbors = 0x21,
    GetAssociation = 0x22,
    FindPath = 0x23,
    VectorSearch = 0x30,
    TxnPrepare = 0x40,
    TxnCommit = 0x41,
    TxnAbort = 0x42,
    Stats = 0x50,
    Ping = 0x51,
    Auth = 0x52,
    DecayAndPrune = 0x53,
    RegisterAgent = 0x54,
    Heartbeat = 0x55,
    SpawnNode = 0x56,
    StopNode = 0x57,
    NodeStatus = 0x58,
    ListAgents = 0x59,
    ClusterStatus = 0x5a,
    UnregisterAgent = 0x5b,
    Event = 0x60,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        use Opcode::*;
        let all = [
            LearnConcept, LearnAssociation, LearnBatch, GetConcept, GetNeighbors, GetAssociation, FindPath,
            VectorSearch, TxnPrepare, TxnCommit, TxnAbort, Stats, Ping, Auth, DecayAndPrune, RegisterAgent,
            Heartbeat, SpawnNode, StopNode, NodeStatus, ListAgents, ClusterStatus, UnregisterAgent, Event,
        ];
        all.into_iter().find(|op| *op as u8 == value)
    }
}

/// A decoded frame, payload still encoded.
#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: u8,
    pub flags: u8,
    pub request_id: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(opcode: u8, request_id: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            flags: 0,
            request_id,
            payload,
        }
    }

    pub fn response(opcode: u8, request_id: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            flags: FLAG_RESPONSE,
            request_id,
            payload,
        }
    }

    pub fn error_response(opcode: u8, request_id: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            flags: FLAG_RESPONSE | FLAG_ERROR,
            request_id,
            payload,
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }
}

/// §4.4 error response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
    pub details: Option<String>,
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    if frame.payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(frame.payload.len(), MAX_MESSAGE_SIZE as usize));
    }
    // length covers opcode + flags + request_id + payload, not itself.
    let length = 1 + 1 + 2 + frame.payload.len() as u32;
    writer.write_u32(length).await?;
    writer.write_u8(frame.opcode).await?;
    writer.write_u8(frame.flags).await?;
    writer.write_u16(frame.request_id).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let length = reader.read_u32().await?;
    if length > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(length as usize, MAX_MESSAGE_SIZE as usize));
    }
    if length < 4 {
        return Err(ProtocolError::MalformedFrame(format!("length {length} too short for header")));
    }
    let opcode = reader.read_u8().await?;
    let flags = reader.read_u8().await?;
    let request_id = reader.read_u16().await?;
    let payload_len = (length - 4) as usize;
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        opcode,
        flags,
        request_id,
        payload,
    })
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

// ---------------------------------------------------------------------------
// Storage-node request/response vocabulary (learn/query/search/transaction
// /admin groups). `tcp_server` decodes these; `Client` encodes them.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptPayload {
    pub content: String,
    pub embedding: Vec<f32>,
    pub tenant: Option<[u8; 16]>,
    pub metadata: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageRequest {
    LearnConcept(ConceptPayload),
    LearnBatch(Vec<ConceptPayload>),
    LearnAssociation {
        source: [u8; 16],
        target: [u8; 16],
        assoc_type: u8,
        confidence: f32,
        tenant: Option<[u8; 16]>,
    },
    GetConcept {
        id: [u8; 16],
    },
    GetNeighbors {
        id: [u8; 16],
    },
    GetAssociation {
        source: [u8; 16],
        target: [u8; 16],
        assoc_type: u8,
    },
    FindPath {
        source: [u8; 16],
        target: [u8; 16],
        max_depth: u32,
    },
    VectorSearch {
        query: Vec<f32>,
        k: usize,
        ef_search: usize,
    },
    DecayAndPrune {
        half_life_seconds: u64,
        min_score: f32,
    },
    TxnPrepare {
        txn_id: u64,
        source: [u8; 16],
        target: [u8; 16],
        assoc_type: u8,
        confidence: f32,
        tenant: Option<[u8; 16]>,
    },
    TxnCommit {
        txn_id: u64,
    },
    TxnAbort {
        txn_id: u64,
    },
    Stats,
    Ping,
    Auth {
        token: String,
    },
}

impl StorageRequest {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::LearnConcept(_) => Opcode::LearnConcept,
            Self::LearnBatch(_) => Opcode::LearnBatch,
            Self::LearnAssociation { .. } => Opcode::LearnAssociation,
            Self::GetConcept { .. } => Opcode::GetConcept,
            Self::GetNeighbors { .. } => Opcode::GetNeighbors,
            Self::GetAssociation { .. } => Opcode::GetAssociation,
            Self::FindPath { .. } => Opcode::FindPath,
            Self::VectorSearch { .. } => Opcode::VectorSearch,
            Self::DecayAndPrune { .. } => Opcode::DecayAndPrune,
            Self::TxnPrepare { .. } => Opcode::TxnPrepare,
            Self::TxnCommit { .. } => Opcode::TxnCommit,
            Self::TxnAbort { .. } => Opcode::TxnAbort,
            Self::Stats => Opcode::Stats,
            Self::Ping => Opcode::Ping,
            Self::Auth { .. } => Opcode::Auth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptView {
    pub id: [u8; 16],
    pub content: String,
    pub strength: f32,
    pub confidence: f32,
    pub access_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborView {
    pub neighbor: [u8; 16],
    pub assoc_type: u8,
    pub weight: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationView {
    pub source: [u8; 16],
    pub target: [u8; 16],
    pub assoc_type: u8,
    pub weight: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathView {
    pub concepts: Vec<[u8; 16]>,
    pub edges: Vec<([u8; 16], [u8; 16], u8)>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageResponse {
    ConceptOk(ConceptView),
    NeighborsOk(Vec<NeighborView>),
    AssociationOk(Option<AssociationView>),
    PathOk(Option<PathView>),
    VectorSearchOk(Vec<(ConceptView, f32)>),
    PruneOk { associations_pruned: usize },
    TxnAck,
    AuthOk,
    StatsOk {
        concept_count: u64,
        association_count: u64,
        wal_sequence: u64,
        uptime_seconds: u64,
    },
    Pong,
}

// ---------------------------------------------------------------------------
// Cluster control-plane vocabulary (§4.5): agent ↔ master.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GridRequest {
    RegisterAgent {
        agent_id: String,
        hostname: String,
        platform: String,
        max_storage_nodes: u32,
        agent_endpoint: String,
    },
    Heartbeat {
        agent_id: String,
        storage_node_count: u32,
    },
    SpawnNode {
        agent_id: String,
        storage_path: String,
        memory_limit_mb: u64,
        port: u16,
    },
    StopNode {
        agent_id: String,
        node_id: String,
    },
    GetNodeStatus {
        node_id: String,
    },
    ListNodes {
        agent_id: String,
    },
    ListAgents,
    GetClusterStatus,
    UnregisterAgent {
        agent_id: String,
    },
}

impl GridRequest {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::RegisterAgent { .. } => Opcode::RegisterAgent,
            Self::Heartbeat { .. } => Opcode::Heartbeat,
            Self::SpawnNode { .. } => Opcode::SpawnNode,
            Self::StopNode { .. } => Opcode::StopNode,
            Self::GetNodeStatus { .. } | Self::ListNodes { .. } => Opcode::NodeStatus,
            Self::ListAgents => Opcode::ListAgents,
            Self::GetClusterStatus => Opcode::ClusterStatus,
            Self::UnregisterAgent { .. } => Opcode::UnregisterAgent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub hostname: String,
    pub platform: String,
    pub status: String,
    pub max_storage_nodes: u32,
    pub current_storage_nodes: u32,
    pub last_heartbeat_secs_ago: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub agent_id: String,
    pub endpoint: String,
    pub status: String,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GridResponse {
    RegisterAgentOk { accepted: bool, master_version: String },
    HeartbeatOk,
    SpawnNodeOk(NodeRecord),
    StopNodeOk,
    NodeStatusOk(NodeRecord),
    ListNodesOk(Vec<NodeRecord>),
    ListAgentsOk(Vec<AgentRecord>),
    ClusterStatusOk {
        total_agents: u32,
        healthy_agents: u32,
        total_nodes: u32,
        running_nodes: u32,
    },
    UnregisterAgentOk,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = duplex(4096);
        let payload = encode(&StorageRequest::Ping).unwrap();
        let frame = Frame::request(Opcode::Ping as u8, 7, payload);
        write_frame(&mut a, &frame).await.unwrap();

        let decoded = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded.opcode, Opcode::Ping as u8);
        assert_eq!(decoded.request_id, 7);
        assert!(!decoded.is_response());
        let req: StorageRequest = decode(&decoded.payload).unwrap();
        assert!(matches!(req, StorageRequest::Ping));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = duplex(4096);
        let frame = Frame::request(Opcode::Ping as u8, 1, vec![0u8; (MAX_MESSAGE_SIZE + 1) as usize]);
        let result = write_frame(&mut a, &frame).await;
        assert!(result.is_err());
        drop(b.shutdown());
    }

    #[test]
    fn opcode_ranges_match_spec_groups() {
        assert_eq!(Opcode::LearnConcept as u8, 0x10);
        assert_eq!(Opcode::GetConcept as u8, 0x20);
        assert_eq!(Opcode::VectorSearch as u8, 0x30);
        assert_eq!(Opcode::TxnPrepare as u8, 0x40);
        assert_eq!(Opcode::Stats as u8, 0x50);
        assert_eq!(Opcode::Event as u8, 0x60);
    }
}
