//! Write-ahead log (§4.1, §6).
//!
//! Every mutation is appended here before it is applied to the in-memory
//! index, and replayed on startup to restore state since the last
//! checkpoint. Record format on disk:
//!
//! ```text
//! u32 length | u64 sequence | u8 opcode | u16 payload_len | payload | u32 crc32(payload)
//! ```
//!
//! `length` covers everything after itself (sequence through the trailing
//! crc32). The payload is `rmp-serde`-encoded. Recovery replays records in
//! order and stops at the first CRC mismatch or short read, truncating the
//! log there (§4.1 "Recovery") — a half-written record from a crash mid-append
//! is simply discarded, never propagated as corruption.
use crate::types::{Association, AssociationType, Concept, ConceptId, Metadata, TenantId};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const LENGTH_PREFIX_SIZE: usize = 4;
const RECORD_HEADER_SIZE: usize = 8 + 1 + 2; // sequence + opcode + payload_len
const CRC_SIZE: usize = 4;

/// A concept exactly as it is durably recorded; distinct from `types::Concept`
/// because the WAL never needs to store derived/runtime-only state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptRecord {
    pub id: ConceptId,
    pub content: String,
    pub embedding: Vec<f32>,
    pub tenant: Option<TenantId>,
    pub metadata: Metadata,
    pub created: u64,
}

impl From<&Concept> for ConceptRecord {
    fn from(c: &Concept) -> Self {
        Self {
            id: c.id,
            content: c.content.clone(),
            embedding: c.embedding.clone(),
            tenant: c.tenant,
            metadata: c.metadata.clone(),
            created: c.created,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationRecord {
    pub source: ConceptId,
    pub target: ConceptId,
    pub assoc_type: AssociationType,
    pub confidence: f32,
    pub tenant: Option<TenantId>,
    pub created: u64,
}

impl From<&Association> for AssociationRecord {
    fn from(a: &Association) -> Self {
        Self {
            source: a.source,
            target: a.target,
            assoc_type: a.assoc_type,
            confidence: a.confidence,
            tenant: a.tenant,
            created: a.created,
        }
    }
}

/// The ten durable operation tags (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    AddConcept(ConceptRecord),
    UpdateConcept {
        id: ConceptId,
        strength: f32,
        confidence: f32,
        access_count: u64,
        last_accessed: u64,
    },
    AddAssociation(AssociationRecord),
    StrengthenAssociation {
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        weight: f32,
        confidence: f32,
        last_used: u64,
    },
    Prune {
        concept_ids: Vec<ConceptId>,
    },
    /// Durably records associations dropped by `decay_and_prune` so WAL
    /// replay after a crash does not resurrect them (§8 invariant 3).
    PruneAssociations {
        keys: Vec<(ConceptId, ConceptId, AssociationType)>,
    },
    BeginTransaction {
        txn_id: u64,
    },
    Prepare {
        txn_id: u64,
    },
    Commit {
        txn_id: u64,
    },
    Abort {
        txn_id: u64,
    },
}

impl Operation {
    fn opcode(&self) -> u8 {
        match self {
            Self::AddConcept(_) => 0,
            Self::UpdateConcept { .. } => 1,
            Self::AddAssociation(_) => 2,
            Self::StrengthenAssociation { .. } => 3,
            Self::Prune { .. } => 4,
            Self::BeginTransaction { .. } => 5,
            Self::Prepare { .. } => 6,
            Self::Commit { .. } => 7,
            Self::Abort { .. } => 8,
            Self::PruneAssociations { .. } => 9,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub sequence: u64,
    pub operation: Operation,
}

/// Append-only write-ahead log.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: AtomicU64,
    fsync: bool,
}

impl WriteAheadLog {
    pub fn create<P: AsRef<Path>>(path: P, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("failed to create WAL file")?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_sequence: AtomicU64::new(0),
            fsync,
        })
    }

    /// Open an existing WAL (or create a fresh one), picking up the sequence
    /// counter from the last valid record.
    pub fn open<P: AsRef<Path>>(path: P, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = Self::recover(&path)?;
        let next_sequence = records.last().map(|r| r.sequence + 1).unwrap_or(0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("failed to open WAL file")?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_sequence: AtomicU64::new(next_sequence),
            fsync,
        })
    }

    pub fn append(&mut self, operation: Operation) -> Result<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let payload = rmp_serde::to_vec(&operation).context("failed to encode WAL payload")?;
        if payload.len() > u16::MAX as usize {
            bail!("WAL payload too large: {} bytes", payload.len());
        }

        let mut body = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + CRC_SIZE);
        body.extend_from_slice(&sequence.to_le_bytes());
        body.push(operation.opcode());
        body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        body.extend_from_slice(&payload);
        body.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

        self.writer.write_all(&(body.len() as u32).to_le_bytes())?;
        self.writer.write_all(&body)?;

        if self.fsync {
            self.writer.flush()?;
            self.writer.get_ref().sync_all()?;
        }
        Ok(sequence)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush WAL")
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all().context("failed to fsync WAL")
    }

    /// Replay every valid record from `path`, stopping at the first CRC
    /// mismatch or short read. Does not mutate the file.
    pub fn recover<P: AsRef<Path>>(path: P) -> Result<Vec<LogRecord>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut file = File::open(path).context("failed to open WAL for recovery")?;
        let mut records = Vec::new();

        loop {
            let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).context("failed reading WAL length prefix"),
            }
            let body_len = u32::from_le_bytes(len_buf) as usize;
            if body_len < RECORD_HEADER_SIZE + CRC_SIZE {
                break;
            }

            let mut body = vec![0u8; body_len];
            if file.read_exact(&mut body).is_err() {
                break; // truncated mid-record — stop here (§4.1 Recovery)
            }

            let sequence = u64::from_le_bytes(body[0..8].try_into().unwrap());
            let opcode = body[8];
            let payload_len = u16::from_le_bytes(body[9..11].try_into().unwrap()) as usize;
            if RECORD_HEADER_SIZE + payload_len + CRC_SIZE != body_len {
                break;
            }
            let payload = &body[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload_len];
            let crc_bytes = &body[RECORD_HEADER_SIZE + payload_len..];
            let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
            if crc32fast::hash(payload) != stored_crc {
                break; // corruption — stop replay, truncate logically here
            }

            let operation: Operation = match rmp_serde::from_slice(payload) {
                Ok(op) => op,
                Err(_) => break,
            };
            debug_assert_eq!(operation.opcode(), opcode);
            records.push(LogRecord { sequence, operation });
        }

        Ok(records)
    }

    /// Drop all records and start a fresh log (used after a checkpoint, once
    /// the segment on disk reflects everything replayed so far).
    pub fn truncate(&mut self) -> Result<()> {
        let file = File::create(&self.path).context("failed to truncate WAL")?;
        self.writer = BufWriter::new(file);
        self.next_sequence.store(0, Ordering::SeqCst);
        Ok(())
    }

    pub fn sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(seed: u8) -> ConceptId {
        ConceptId([seed; 16])
    }

    #[test]
    fn append_and_recover_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = WriteAheadLog::create(&path, true).unwrap();

        wal.append(Operation::AddConcept(ConceptRecord {
            id: id(1),
            content: "hello".into(),
            embedding: vec![1.0, 2.0],
            tenant: None,
            metadata: Metadata::new(),
            created: 100,
        }))
        .unwrap();
        wal.append(Operation::StrengthenAssociation {
            source: id(1),
            target: id(2),
            assoc_type: AssociationType::Semantic,
            weight: 2.0,
            confidence: 0.9,
            last_used: 200,
        })
        .unwrap();

        let records = WriteAheadLog::recover(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 0);
        assert_eq!(records[1].sequence, 1);
        assert!(matches!(records[0].operation, Operation::AddConcept(_)));
        assert!(matches!(records[1].operation, Operation::StrengthenAssociation { .. }));
    }

    #[test]
    fn truncated_tail_record_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = WriteAheadLog::create(&path, true).unwrap();
        wal.append(Operation::BeginTransaction { txn_id: 1 }).unwrap();
        wal.append(Operation::Commit { txn_id: 1 }).unwrap();
        wal.flush().unwrap();
        drop(wal);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3); // chop the tail of the last record
        std::fs::write(&path, &bytes).unwrap();

        let records = WriteAheadLog::recover(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].operation, Operation::BeginTransaction { .. }));
    }

    #[test]
    fn corrupted_payload_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = WriteAheadLog::create(&path, true).unwrap();
        wal.append(Operation::Prune { concept_ids: vec![id(1)] }).unwrap();
        wal.append(Operation::Abort { txn_id: 9 }).unwrap();
        wal.flush().unwrap();
        drop(wal);

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF; // flip a byte inside the trailing CRC
        std::fs::write(&path, &bytes).unwrap();

        let records = WriteAheadLog::recover(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].operation, Operation::Prune { .. }));
    }

    #[test]
    fn truncate_resets_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = WriteAheadLog::create(&path, true).unwrap();
        wal.append(Operation::BeginTransaction { txn_id: 1 }).unwrap();
        wal.truncate().unwrap();
        assert_eq!(wal.sequence(), 0);
        assert_eq!(WriteAheadLog::recover(&path).unwrap().len(), 0);
    }
}
