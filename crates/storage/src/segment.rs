//! On-disk segment format (§4.1, §6).
//!
//! Layout, in file order:
//! ```text
//! ┌───────────────┬───────────────┬──────────────────┬─────────────┬─────────────┬───────────┐
//! │ Header (128B) │ Concept table │ Association table │ Vector block│ Content heap│ Tombstones│
//! └───────────────┴───────────────┴──────────────────┴─────────────┴─────────────┴───────────┘
//! ```
//! The concept table is sorted by id (binary search). The association table
//! is sorted lexicographically by `(src_id, tgt_id, type)`. The vector block
//! holds `D` little-endian f32s per concept in the same order as the concept
//! table — there is no per-row offset, the row index is the concept's
//! position in the table. The segment is always opened read-only via mmap;
//! it is only ever rewritten wholesale during a checkpoint (§4.1).
use crate::types::{Association, AssociationType, Concept, ConceptId, TenantId};
use anyhow::{bail, ensure, Context, Result};
use bytemuck::{bytes_of, from_bytes, Pod, Zeroable};
use memmap2::{Mmap, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const MAGIC: [u8; 8] = *b"SUTRADAT";
pub const FORMAT_VERSION: u32 = 2;
pub const HEADER_SIZE: usize = 128;
pub const CONCEPT_SLOT_SIZE: usize = 80;
pub const ASSOCIATION_SLOT_SIZE: usize = 80;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SegmentHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub dimension: u32,
    pub tenant_mode: u8,
    pub _pad: [u8; 3],
    pub concept_count: u64,
    pub association_count: u64,
    pub concept_table_offset: u64,
    pub association_table_offset: u64,
    pub vector_block_offset: u64,
    pub content_heap_offset: u64,
    pub content_heap_len: u64,
    pub tombstone_offset: u64,
    pub header_crc32: u32,
    pub reserved: [u8; 40],
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == HEADER_SIZE);

impl SegmentHeader {
    fn checksum(&self) -> u32 {
        let mut copy = *self;
        copy.header_crc32 = 0;
        crc32fast::hash(bytes_of(&copy))
    }

    pub fn validate(&self, expected_dimension: u32) -> Result<()> {
        ensure!(self.magic == MAGIC, "bad segment magic");
        ensure!(self.version == FORMAT_VERSION, "unsupported segment version {}", { self.version });
        ensure!(
            self.dimension == expected_dimension,
            "segment dimension {} does not match configured dimension {}",
            { self.dimension },
            expected_dimension
        );
        let stored = self.header_crc32;
        ensure!(stored == self.checksum(), "segment header checksum mismatch");
        Ok(())
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ConceptSlot {
    id: ConceptId,
    tenant: TenantId,
    strength: f32,
    confidence: f32,
    access_count: u64,
    created: u64,
    last_accessed: u64,
    content_offset: u64,
    content_length: u32,
    flags: u32,
}

const _: () = assert!(std::mem::size_of::<ConceptSlot>() == CONCEPT_SLOT_SIZE);

const FLAG_HAS_TENANT: u32 = 1;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct AssociationSlot {
    source: ConceptId,
    target: ConceptId,
    tenant: TenantId,
    assoc_type: u8,
    flags: u8,
    _pad: u16,
    weight: f32,
    confidence: f32,
    created: u64,
    last_used: u64,
}

const _: () = assert!(std::mem::size_of::<AssociationSlot>() == ASSOCIATION_SLOT_SIZE);

/// A read-only, memory-mapped segment file.
pub struct Segment {
    path: PathBuf,
    mmap: Arc<Mmap>,
    header: SegmentHeader,
}

impl Segment {
    /// Write a brand-new segment from the given in-memory state (used both
    /// for initial creation and for checkpoint rewrites — see `Store::checkpoint`).
    pub fn write_new<P: AsRef<Path>>(
        path: P,
        dimension: u32,
        tenant_mode: bool,
        concepts: &[Concept],
        associations: &[Association],
    ) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");

        let mut sorted_concepts: Vec<&Concept> = concepts.iter().collect();
        sorted_concepts.sort_by_key(|c| c.id);
        let mut sorted_assocs: Vec<&Association> = associations.iter().collect();
        sorted_assocs.sort_by_key(|a| a.key());

        let concept_table_offset = HEADER_SIZE as u64;
        let association_table_offset =
            concept_table_offset + (sorted_concepts.len() * CONCEPT_SLOT_SIZE) as u64;
        let vector_block_offset =
            association_table_offset + (sorted_assocs.len() * ASSOCIATION_SLOT_SIZE) as u64;
        let vector_bytes = sorted_concepts.len() as u64 * dimension as u64 * 4;
        let content_heap_offset = vector_block_offset + vector_bytes;

        let mut content_heap = Vec::new();
        let mut concept_slots = Vec::with_capacity(sorted_concepts.len());
        let mut vector_block = Vec::with_capacity(vector_bytes as usize);

        for c in &sorted_concepts {
            ensure!(
                c.embedding.len() == dimension as usize,
                "embedding dimension mismatch while writing segment"
            );
            let content_offset = content_heap_offset + content_heap.len() as u64;
            content_heap.extend_from_slice(c.content.as_bytes());
            for f in &c.embedding {
                vector_block.extend_from_slice(&f.to_le_bytes());
            }
            concept_slots.push(ConceptSlot {
                id: c.id,
                tenant: c.tenant.unwrap_or(TenantId([0; 16])),
                strength: c.strength,
                confidence: c.confidence,
                access_count: c.access_count,
                created: c.created,
                last_accessed: c.last_accessed,
                content_offset,
                content_length: c.content.as_bytes().len() as u32,
                flags: if c.tenant.is_some() { FLAG_HAS_TENANT } else { 0 },
            });
        }

        let mut assoc_slots = Vec::with_capacity(sorted_assocs.len());
        for a in &sorted_assocs {
            assoc_slots.push(AssociationSlot {
                source: a.source,
                target: a.target,
                tenant: a.tenant.unwrap_or(TenantId([0; 16])),
                assoc_type: a.assoc_type as u8,
                flags: if a.tenant.is_some() { FLAG_HAS_TENANT as u8 } else { 0 },
                _pad: 0,
                weight: a.weight,
                confidence: a.confidence,
                created: a.created,
                last_used: a.last_used,
            });
        }

        let tombstone_offset = content_heap_offset + content_heap.len() as u64;
        let tombstone_bytes = (sorted_concepts.len() + 7) / 8;
        let mut tombstones = vec![0u8; tombstone_bytes.max(1)];
        for (i, c) in sorted_concepts.iter().enumerate() {
            if c.tombstoned {
                tombstones[i / 8] |= 1 << (i % 8);
            }
        }

        let mut header = SegmentHeader {
            magic: MAGIC,
            version: FORMAT_VERSION,
            dimension,
            tenant_mode: tenant_mode as u8,
            _pad: [0; 3],
            concept_count: sorted_concepts.len() as u64,
            association_count: sorted_assocs.len() as u64,
            concept_table_offset,
            association_table_offset,
            vector_block_offset,
            content_heap_offset,
            content_heap_len: content_heap.len() as u64,
            tombstone_offset,
            header_crc32: 0,
            reserved: [0; 36],
        };
        header.header_crc32 = header.checksum();

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .context("failed to create temporary segment file")?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes_of(&header))?;
        for slot in &concept_slots {
            writer.write_all(bytes_of(slot))?;
        }
        for slot in &assoc_slots {
            writer.write_all(bytes_of(slot))?;
        }
        writer.write_all(&vector_block)?;
        writer.write_all(&content_heap)?;
        writer.write_all(&tombstones)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        // Atomic rename over the previous segment (§4.1 checkpoint step 4).
        std::fs::rename(&tmp_path, path).context("failed to install new segment")?;
        if let Some(dir) = path.parent() {
            if let Ok(dir_file) = File::open(dir) {
                let _ = dir_file.sync_all();
            }
        }
        Ok(())
    }

    pub fn open<P: AsRef<Path>>(path: P, expected_dimension: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).context("failed to open segment file")?;
        let mmap = unsafe { MmapOptions::new().map(&file).context("failed to mmap segment")? };
        if mmap.len() < HEADER_SIZE {
            bail!("segment file too small to contain a header");
        }
        let header: SegmentHeader = *from_bytes(&mmap[..HEADER_SIZE]);
        header.validate(expected_dimension)?;
        Ok(Self {
            path,
            mmap: Arc::new(mmap),
            header,
        })
    }

    /// Create and immediately open an empty segment at `path` for a brand
    /// new store.
    pub fn create_empty<P: AsRef<Path>>(path: P, dimension: u32, tenant_mode: bool) -> Result<Self> {
        Self::write_new(path.as_ref(), dimension, tenant_mode, &[], &[])?;
        Self::open(path, dimension)
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn concept_slot(&self, idx: usize) -> ConceptSlot {
        let start = self.header.concept_table_offset as usize + idx * CONCEPT_SLOT_SIZE;
        *from_bytes(&self.mmap[start..start + CONCEPT_SLOT_SIZE])
    }

    fn association_slot(&self, idx: usize) -> AssociationSlot {
        let start = self.header.association_table_offset as usize + idx * ASSOCIATION_SLOT_SIZE;
        *from_bytes(&self.mmap[start..start + ASSOCIATION_SLOT_SIZE])
    }

    fn read_content(&self, offset: u64, length: u32) -> Result<String> {
        let start = offset as usize;
        let end = start + length as usize;
        ensure!(end <= self.mmap.len(), "content range out of bounds");
        Ok(String::from_utf8(self.mmap[start..end].to_vec())?)
    }

    fn read_vector(&self, row: usize, dimension: usize) -> Vec<f32> {
        let start = self.header.vector_block_offset as usize + row * dimension * 4;
        let end = start + dimension * 4;
        bytemuck::cast_slice(&self.mmap[start..end]).to_vec()
    }

    fn is_tombstoned(&self, row: usize) -> bool {
        let byte = self.header.tombstone_offset as usize + row / 8;
        if byte >= self.mmap.len() {
            return false;
        }
        (self.mmap[byte] >> (row % 8)) & 1 == 1
    }

    /// Binary search the concept table by id.
    pub fn find_concept(&self, id: ConceptId) -> Option<Concept> {
        let count = self.header.concept_count as usize;
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let slot = self.concept_slot(mid);
            match slot.id.cmp(&id) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(self.materialize_concept(mid, &slot)),
            }
        }
        None
    }

    fn materialize_concept(&self, row: usize, slot: &ConceptSlot) -> Concept {
        let content = self
            .read_content(slot.content_offset, slot.content_length)
            .unwrap_or_default();
        let embedding = self.read_vector(row, self.header.dimension as usize);
        let tenant = if slot.flags & FLAG_HAS_TENANT != 0 {
            Some(slot.tenant)
        } else {
            None
        };
        Concept {
            id: slot.id,
            content,
            embedding,
            strength: slot.strength,
            confidence: slot.confidence,
            access_count: slot.access_count,
            created: slot.created,
            last_accessed: slot.last_accessed,
            tenant,
            metadata: Default::default(),
            tombstoned: self.is_tombstoned(row),
        }
    }

    pub fn iter_concepts(&self) -> impl Iterator<Item = Concept> + '_ {
        (0..self.header.concept_count as usize).map(move |row| {
            let slot = self.concept_slot(row);
            self.materialize_concept(row, &slot)
        })
    }

    pub fn iter_associations(&self) -> impl Iterator<Item = Association> + '_ {
        (0..self.header.association_count as usize).map(move |row| {
            let slot = self.association_slot(row);
            let tenant = if slot.flags & FLAG_HAS_TENANT != 0 {
                Some(slot.tenant)
            } else {
                None
            };
            Association {
                source: slot.source,
                target: slot.target,
                assoc_type: AssociationType::from_u8(slot.assoc_type).unwrap_or(AssociationType::Semantic),
                weight: slot.weight,
                confidence: slot.confidence,
                created: slot.created,
                last_used: slot.last_used,
                tenant,
            }
        })
    }

    pub fn stats(&self) -> SegmentStats {
        SegmentStats {
            concept_count: self.header.concept_count,
            association_count: self.header.association_count,
            dimension: self.header.dimension,
            file_size: self.mmap.len() as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentStats {
    pub concept_count: u64,
    pub association_count: u64,
    pub dimension: u32,
    pub file_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;
    use tempfile::TempDir;

    fn concept(seed: u8, dim: usize) -> Concept {
        Concept::new(
            ConceptId([seed; 16]),
            format!("content-{seed}"),
            vec![seed as f32; dim],
            None,
            Metadata::new(),
            1000,
        )
    }

    #[test]
    fn write_and_reopen_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment.dat");

        let concepts: Vec<Concept> = (0..5).map(|i| concept(i, 4)).collect();
        let assoc = Association::new(
            concepts[0].id,
            concepts[1].id,
            AssociationType::Semantic,
            0.9,
            None,
            1000,
        );

        Segment::write_new(&path, 4, false, &concepts, &[assoc]).unwrap();
        let segment = Segment::open(&path, 4).unwrap();

        assert_eq!({ segment.header().concept_count }, 5);
        assert_eq!({ segment.header().association_count }, 1);

        let found = segment.find_concept(concepts[2].id).unwrap();
        assert_eq!(found.content, concepts[2].content);
        assert_eq!(found.embedding, concepts[2].embedding);

        let missing = segment.find_concept(ConceptId([99; 16]));
        assert!(missing.is_none());
    }

    #[test]
    fn dimension_mismatch_on_load_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment.dat");
        Segment::write_new(&path, 4, false, &[], &[]).unwrap();
        assert!(Segment::open(&path, 8).is_err());
    }

    #[test]
    fn tombstones_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment.dat");
        let mut c = concept(1, 4);
        c.tombstoned = true;
        Segment::write_new(&path, 4, false, &[c], &[]).unwrap();
        let segment = Segment::open(&path, 4).unwrap();
        let found = segment.find_concept(ConceptId([1; 16])).unwrap();
        assert!(found.tombstoned);
    }
}
