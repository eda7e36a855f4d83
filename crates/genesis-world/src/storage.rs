//! Cell persistence: the storage seam, the persisted record, and two
//! backends.

use crate::cell::{ScheduledTick, StructureStart, SubEntityPayload};
use dashmap::DashMap;
use genesis_common::{CellPos, Identifier, MagicBytes, SchemaVersion, StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Everything about a cell that survives an unload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCell {
    /// Position
    pub pos: CellPos,
    /// Name of the last committed stage
    pub stage: String,
    /// Whether the cell reached the final stage
    pub full: bool,
    /// Lowest section index the sections start at
    pub min_section: i32,
    /// Raw section contents, bottom first; `None` for empty sections
    pub sections: Vec<Option<Vec<u16>>>,
    /// Packed heightmaps by serialization key
    pub heightmaps: Vec<(String, Vec<u64>)>,
    /// Structure starts held by the cell
    pub structure_starts: Vec<StructureStart>,
    /// Cells holding starts that reach this cell, by structure kind
    pub structure_references: Vec<(Identifier, Vec<CellPos>)>,
    /// Sub-entities, pending and live alike
    pub sub_entities: Vec<SubEntityPayload>,
    /// Packed post-processing offsets per section
    pub post_processing: Vec<Vec<u16>>,
    /// Scheduled content ticks
    pub block_ticks: Vec<ScheduledTick>,
    /// Scheduled fluid ticks
    pub fluid_ticks: Vec<ScheduledTick>,
    /// Lighting state
    pub light_correct: bool,
}

/// Header written in front of every encoded record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Magic bytes for format identification
    pub magic: MagicBytes,
    /// Schema version
    pub version: SchemaVersion,
    /// Cell X coordinate
    pub x: i32,
    /// Cell Z coordinate
    pub z: i32,
    /// Compression type (0 = none, 1 = lz4)
    pub compression: u8,
}

impl RecordHeader {
    /// Creates a header for a cell.
    #[must_use]
    pub fn new(pos: CellPos) -> Self {
        Self {
            magic: MagicBytes::CELL,
            version: SchemaVersion::CELL_RECORD,
            x: pos.x,
            z: pos.z,
            compression: 1,
        }
    }

    /// Validates the header.
    pub fn validate(&self) -> StorageResult<()> {
        if self.magic != MagicBytes::CELL {
            return Err(StorageError::InvalidFormat("bad magic bytes".into()));
        }
        if !SchemaVersion::CELL_RECORD.can_read(&self.version) {
            return Err(StorageError::VersionMismatch {
                expected: SchemaVersion::CELL_RECORD.to_string(),
                actual: self.version.to_string(),
            });
        }
        Ok(())
    }
}

impl PersistedCell {
    /// Encodes as header length, header, then the lz4-compressed body.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let header = bincode::serialize(&RecordHeader::new(self.pos))
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let body =
            bincode::serialize(self).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&body);

        let mut result = Vec::with_capacity(4 + header.len() + compressed.len());
        result.extend_from_slice(&(header.len() as u32).to_le_bytes());
        result.extend_from_slice(&header);
        result.extend_from_slice(&compressed);
        Ok(result)
    }

    /// Inverse of [`PersistedCell::encode`].
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < 8 {
            return Err(StorageError::InvalidFormat("data too short".into()));
        }
        let header_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let rest = &bytes[4..];
        if rest.len() < header_len {
            return Err(StorageError::InvalidFormat("header length mismatch".into()));
        }
        let (header, body) = rest.split_at(header_len);
        let header: RecordHeader = bincode::deserialize(header)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        header.validate()?;

        let body = match header.compression {
            0 => body.to_vec(),
            1 => lz4_flex::decompress_size_prepended(body)
                .map_err(|e| StorageError::Compression(e.to_string()))?,
            other => {
                return Err(StorageError::InvalidFormat(format!(
                    "unknown compression {other}"
                )))
            },
        };
        let record: Self =
            bincode::deserialize(&body).map_err(|e| StorageError::Serialization(e.to_string()))?;
        if record.pos != CellPos::new(header.x, header.z) {
            return Err(StorageError::InvalidFormat(format!(
                "header says [{}, {}], body says {}",
                header.x, header.z, record.pos
            )));
        }
        Ok(record)
    }
}

/// Where cells go when they are unloaded. Called from the blocking pool.
pub trait CellStorage: Send + Sync {
    /// Reads the record for `pos`, or `None` if nothing was stored.
    fn read(&self, pos: CellPos) -> StorageResult<Option<PersistedCell>>;

    /// Writes a record, replacing any previous one.
    fn write(&self, record: &PersistedCell) -> StorageResult<()>;
}

/// One file per cell in a directory.
#[derive(Debug, Clone)]
pub struct FileCellStorage {
    dir: PathBuf,
}

impl FileCellStorage {
    /// Stores cells under `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the cell files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file path for a cell.
    #[must_use]
    pub fn cell_path(&self, pos: CellPos) -> PathBuf {
        self.dir.join(format!("cell_{}_{}.gncl", pos.x, pos.z))
    }
}

impl CellStorage for FileCellStorage {
    fn read(&self, pos: CellPos) -> StorageResult<Option<PersistedCell>> {
        let path = self.cell_path(pos);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        PersistedCell::decode(&bytes).map(Some)
    }

    fn write(&self, record: &PersistedCell) -> StorageResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.cell_path(record.pos);
        let tmp = path.with_extension("gncl.tmp");
        std::fs::write(&tmp, record.encode()?)?;
        std::fs::rename(&tmp, &path)?;
        debug!("Wrote cell {} to {}", record.pos, path.display());
        Ok(())
    }
}

/// In-memory storage keeping encoded records.
#[derive(Debug, Default)]
pub struct MemoryCellStorage {
    records: DashMap<CellPos, Vec<u8>>,
}

impl MemoryCellStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether a record exists for `pos`.
    #[must_use]
    pub fn contains(&self, pos: CellPos) -> bool {
        self.records.contains_key(&pos)
    }
}

impl CellStorage for MemoryCellStorage {
    fn read(&self, pos: CellPos) -> StorageResult<Option<PersistedCell>> {
        self.records
            .get(&pos)
            .map(|bytes| PersistedCell::decode(bytes.value()))
            .transpose()
    }

    fn write(&self, record: &PersistedCell) -> StorageResult<()> {
        self.records.insert(record.pos, record.encode()?);
        Ok(())
    }
}
