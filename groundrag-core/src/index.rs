//! Exact flat vector index and its on-disk artifact.
//!
//! An artifact directory holds three row-aligned files:
//!
//! | file            | contents                                        |
//! |-----------------|-------------------------------------------------|
//! | `index.bin`     | header + row-major little-endian `f32` vectors |
//! | `chunks.json`   | ordered chunk texts                             |
//! | `metadata.json` | ordered [`ChunkMetadata`]                       |
//!
//! All three carry the same generation id. Loading rejects any directory in
//! which a file is missing, the generations differ, or the row counts differ.

use crate::chunk::ChunkMetadata;
use crate::error::{RagError, Result};
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

pub const INDEX_FILE: &str = "index.bin";
pub const CHUNKS_FILE: &str = "chunks.json";
pub const METADATA_FILE: &str = "metadata.json";

const MAGIC: &[u8; 4] = b"GRIX";
const FORMAT_VERSION: u32 = 1;
// magic + version + generation + dim + rows
const HEADER_LEN: usize = 4 + 4 + 16 + 4 + 8;

// ---------------------------------------------------------------------------
// Flat index
// ---------------------------------------------------------------------------

/// Brute-force squared-Euclidean index. No training, no approximation.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dim: usize,
    vectors: Vec<f32>,
}

/// Rows nearest to a query, closest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub row_ids: Vec<usize>,
    pub distances: Vec<f32>,
}

impl FlatIndex {
    /// Build from one embedding per row. All rows must share a dimension.
    pub fn build(embeddings: &[Vec<f32>]) -> Result<Self> {
        let dim = embeddings
            .first()
            .map(Vec::len)
            .ok_or_else(|| RagError::invalid_input("cannot build an index from zero embeddings"))?;
        if dim == 0 {
            return Err(RagError::invalid_input("embeddings have zero dimensions"));
        }
        let mut vectors = Vec::with_capacity(dim * embeddings.len());
        for (row, embedding) in embeddings.iter().enumerate() {
            if embedding.len() != dim {
                return Err(RagError::invalid_input(format!(
                    "row {row} has dimension {}, expected {dim}",
                    embedding.len()
                )));
            }
            vectors.extend_from_slice(embedding);
        }
        Ok(Self { dim, vectors })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vectors.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn vector(&self, row: usize) -> Option<&[f32]> {
        let start = row.checked_mul(self.dim)?;
        self.vectors.get(start..start + self.dim)
    }

    /// The `k` nearest rows by squared Euclidean distance.
    ///
    /// When `k` exceeds the number of rows every row is returned; results
    /// are never padded. Equal distances are ordered by row id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<SearchHits> {
        if query.len() != self.dim {
            return Err(RagError::invalid_input(format!(
                "query has dimension {}, index has {}",
                query.len(),
                self.dim
            )));
        }
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(row, v)| (row, squared_l2(query, v)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(SearchHits {
            row_ids: scored.iter().map(|(row, _)| *row).collect(),
            distances: scored.iter().map(|(_, d)| *d).collect(),
        })
    }

    fn encode(&self, generation: Uuid) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.vectors.len() * 4);
        buf.put_slice(MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_slice(generation.as_bytes());
        buf.put_u32_le(self.dim as u32);
        buf.put_u64_le(self.len() as u64);
        for v in &self.vectors {
            buf.put_f32_le(*v);
        }
        buf
    }

    fn decode(path: &Path, mut bytes: &[u8]) -> Result<(Uuid, Self)> {
        let generation = decode_header_generation(path, bytes)?;
        bytes.advance(4 + 4 + 16);
        let dim = bytes.get_u32_le() as usize;
        let rows = bytes.get_u64_le() as usize;
        if dim == 0 {
            return Err(RagError::corrupt(path, "index header declares zero dimensions"));
        }
        let expected = rows
            .checked_mul(dim)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| RagError::corrupt(path, "index header overflows"))?;
        if bytes.remaining() != expected {
            return Err(RagError::corrupt(
                path,
                format!(
                    "index body has {} bytes, header declares {rows} rows x {dim} dims",
                    bytes.remaining()
                ),
            ));
        }
        let mut vectors = Vec::with_capacity(rows * dim);
        while bytes.has_remaining() {
            vectors.push(bytes.get_f32_le());
        }
        Ok((generation, Self { dim, vectors }))
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn decode_header_generation(path: &Path, bytes: &[u8]) -> Result<Uuid> {
    if bytes.len() < HEADER_LEN {
        return Err(RagError::corrupt(path, "index file is truncated"));
    }
    if &bytes[..4] != MAGIC {
        return Err(RagError::corrupt(path, "index file has an unknown format"));
    }
    let version = (&bytes[4..8]).get_u32_le();
    if version != FORMAT_VERSION {
        return Err(RagError::corrupt(
            path,
            format!("unsupported index format version {version}"),
        ));
    }
    Uuid::from_slice(&bytes[8..24]).map_err(|e| RagError::corrupt(path, e.to_string()))
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct ChunksFile {
    generation: Uuid,
    chunks: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct MetadataFile {
    generation: Uuid,
    metadata: Vec<ChunkMetadata>,
}

/// Index, chunk texts and chunk metadata, row-aligned and jointly versioned.
#[derive(Debug, Clone)]
pub struct IndexArtifact {
    generation: Uuid,
    index: FlatIndex,
    chunks: Vec<String>,
    metadata: Vec<ChunkMetadata>,
}

/// Chunks and metadata for the rows returned by a search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Retrieved {
    pub chunks: Vec<String>,
    pub metadata: Vec<ChunkMetadata>,
    pub distances: Vec<f32>,
}

impl IndexArtifact {
    /// Assemble an artifact under a fresh generation id.
    pub fn new(
        index: FlatIndex,
        chunks: Vec<String>,
        metadata: Vec<ChunkMetadata>,
    ) -> Result<Self> {
        if index.len() != chunks.len() || chunks.len() != metadata.len() {
            return Err(RagError::invalid_input(format!(
                "index has {} rows, {} chunks, {} metadata entries",
                index.len(),
                chunks.len(),
                metadata.len()
            )));
        }
        Ok(Self {
            generation: Uuid::new_v4(),
            index,
            chunks,
            metadata,
        })
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn index(&self) -> &FlatIndex {
        &self.index
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn metadata(&self) -> &[ChunkMetadata] {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of distinct source documents.
    pub fn document_count(&self) -> usize {
        self.metadata
            .iter()
            .map(|m| m.doc_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Search and resolve row ids to their chunk texts and metadata.
    pub fn retrieve(&self, query: &[f32], k: usize) -> Result<Retrieved> {
        let hits = self.index.search(query, k)?;
        Ok(Retrieved {
            chunks: hits.row_ids.iter().map(|&r| self.chunks[r].clone()).collect(),
            metadata: hits.row_ids.iter().map(|&r| self.metadata[r].clone()).collect(),
            distances: hits.distances,
        })
    }

    /// Whether `dir` contains an index file at all.
    pub fn exists(dir: &Path) -> bool {
        dir.join(INDEX_FILE).is_file()
    }

    /// Persist the three stores. Each file is written to a temporary sibling
    /// and renamed into place.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        write_replacing(&dir.join(INDEX_FILE), &self.index.encode(self.generation))?;
        write_replacing(
            &dir.join(CHUNKS_FILE),
            &serde_json::to_vec(&ChunksFile {
                generation: self.generation,
                chunks: self.chunks.clone(),
            })?,
        )?;
        write_replacing(
            &dir.join(METADATA_FILE),
            &serde_json::to_vec(&MetadataFile {
                generation: self.generation,
                metadata: self.metadata.clone(),
            })?,
        )?;
        info!(
            dir = %dir.display(),
            rows = self.len(),
            generation = %self.generation,
            "Saved index artifact"
        );
        Ok(())
    }

    /// Load all three stores, failing with `CorruptArtifact` unless they are
    /// present, from one generation, and of equal length.
    pub fn load(dir: &Path) -> Result<Self> {
        let index_path = dir.join(INDEX_FILE);
        let chunks_path = dir.join(CHUNKS_FILE);
        let metadata_path = dir.join(METADATA_FILE);

        let index_bytes = read_store(&index_path)?;
        let chunks_bytes = read_store(&chunks_path)?;
        let metadata_bytes = read_store(&metadata_path)?;

        let (generation, index) = FlatIndex::decode(&index_path, &index_bytes)?;
        let chunks_file: ChunksFile = serde_json::from_slice(&chunks_bytes)
            .map_err(|e| RagError::corrupt(&chunks_path, e.to_string()))?;
        let metadata_file: MetadataFile = serde_json::from_slice(&metadata_bytes)
            .map_err(|e| RagError::corrupt(&metadata_path, e.to_string()))?;

        if chunks_file.generation != generation || metadata_file.generation != generation {
            return Err(RagError::corrupt(
                dir,
                format!(
                    "stores come from different builds \
                     (index {generation}, chunks {}, metadata {})",
                    chunks_file.generation, metadata_file.generation
                ),
            ));
        }
        if index.len() != chunks_file.chunks.len() || index.len() != metadata_file.metadata.len() {
            return Err(RagError::corrupt(
                dir,
                format!(
                    "length mismatch: index {}, chunks {}, metadata {}",
                    index.len(),
                    chunks_file.chunks.len(),
                    metadata_file.metadata.len()
                ),
            ));
        }

        Ok(Self {
            generation,
            index,
            chunks: chunks_file.chunks,
            metadata: metadata_file.metadata,
        })
    }

    /// Read only the generation id from `index.bin`.
    pub fn peek_generation(dir: &Path) -> Result<Uuid> {
        let path = dir.join(INDEX_FILE);
        let bytes = read_store(&path)?;
        decode_header_generation(&path, &bytes)
    }
}

fn read_store(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => RagError::corrupt(path, "file is missing"),
        _ => RagError::Io(e),
    })
}

fn write_replacing(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared store
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Loaded {
    artifact: Arc<IndexArtifact>,
    loaded_at: DateTime<Utc>,
}

/// Read-mostly holder of the current artifact.
///
/// Readers take an `Arc` snapshot and keep using it for the whole request;
/// a reload swaps the snapshot in one step, so chunks and metadata from
/// different builds are never paired.
#[derive(Debug, Default)]
pub struct IndexStore {
    current: RwLock<Option<Loaded>>,
}

/// Summary of the loaded artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStatus {
    pub loaded: bool,
    pub generation: Option<Uuid>,
    pub total_chunks: usize,
    pub total_documents: usize,
    pub dimensions: Option<usize>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot, if an artifact is loaded.
    pub fn current(&self) -> Option<Arc<IndexArtifact>> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|l| Arc::clone(&l.artifact))
    }

    /// Replace the snapshot with an in-memory artifact.
    pub fn install(&self, artifact: IndexArtifact) -> Arc<IndexArtifact> {
        let artifact = Arc::new(artifact);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Loaded {
            artifact: Arc::clone(&artifact),
            loaded_at: Utc::now(),
        });
        artifact
    }

    /// Load `dir` and swap it in. On failure the previous snapshot stays.
    pub fn reload(&self, dir: &Path) -> Result<Arc<IndexArtifact>> {
        match IndexArtifact::load(dir) {
            Ok(artifact) => {
                info!(
                    dir = %dir.display(),
                    rows = artifact.len(),
                    generation = %artifact.generation(),
                    "Loaded index artifact"
                );
                Ok(self.install(artifact))
            }
            Err(e) => {
                warn!(
                    dir = %dir.display(),
                    error = %e,
                    "Index load failed, keeping previous index"
                );
                Err(e)
            }
        }
    }

    /// Reload only when the on-disk generation differs from the loaded one.
    pub fn refresh(&self, dir: &Path) -> Result<Arc<IndexArtifact>> {
        let on_disk = IndexArtifact::peek_generation(dir)?;
        match self.current() {
            Some(current) if current.generation() == on_disk => Ok(current),
            _ => self.reload(dir),
        }
    }

    pub fn status(&self) -> IndexStatus {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(loaded) => IndexStatus {
                loaded: true,
                generation: Some(loaded.artifact.generation()),
                total_chunks: loaded.artifact.len(),
                total_documents: loaded.artifact.document_count(),
                dimensions: Some(loaded.artifact.index().dim()),
                loaded_at: Some(loaded.loaded_at),
            },
            None => IndexStatus {
                loaded: false,
                generation: None,
                total_chunks: 0,
                total_documents: 0,
                dimensions: None,
                loaded_at: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn meta(doc: &str, idx: usize, page: Option<u32>) -> ChunkMetadata {
        ChunkMetadata {
            source_file: format!("{doc}.pdf"),
            doc_id: doc.to_string(),
            chunk_idx: idx,
            page,
        }
    }

    fn sample_artifact() -> IndexArtifact {
        let index = FlatIndex::build(&[
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 2.0],
        ])
        .unwrap();
        IndexArtifact::new(
            index,
            vec!["origin".into(), "east".into(), "north".into()],
            vec![meta("a", 0, Some(1)), meta("a", 1, Some(2)), meta("b", 0, None)],
        )
        .unwrap()
    }

    #[test]
    fn test_search_orders_by_distance() {
        let index = FlatIndex::build(&[vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 2.0]]).unwrap();
        let hits = index.search(&[0.9, 0.0], 2).unwrap();
        assert_eq!(hits.row_ids, vec![1, 0]);
        assert!((hits.distances[0] - 0.01).abs() < 1e-6);
        assert!((hits.distances[1] - 0.81).abs() < 1e-6);
    }

    #[test]
    fn test_search_k_larger_than_rows_returns_all() {
        let index = FlatIndex::build(&[vec![0.0], vec![3.0]]).unwrap();
        let hits = index.search(&[1.0], 10).unwrap();
        assert_eq!(hits.row_ids, vec![0, 1]);
        assert_eq!(hits.distances.len(), 2);
    }

    #[test]
    fn test_search_ties_break_by_row() {
        let index = FlatIndex::build(&[vec![1.0], vec![-1.0], vec![1.0]]).unwrap();
        let hits = index.search(&[0.0], 3).unwrap();
        assert_eq!(hits.row_ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_build_rejects_ragged_and_empty() {
        assert!(FlatIndex::build(&[]).is_err());
        assert!(FlatIndex::build(&[vec![1.0, 2.0], vec![1.0]]).is_err());
    }

    #[test]
    fn test_search_rejects_wrong_dimension() {
        let index = FlatIndex::build(&[vec![1.0, 2.0]]).unwrap();
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_artifact_rejects_misaligned_stores() {
        let index = FlatIndex::build(&[vec![1.0]]).unwrap();
        assert!(IndexArtifact::new(index, vec![], vec![]).is_err());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = sample_artifact();
        artifact.save(dir.path()).unwrap();

        let loaded = IndexArtifact::load(dir.path()).unwrap();
        assert_eq!(loaded.generation(), artifact.generation());
        assert_eq!(loaded.chunks(), artifact.chunks());
        assert_eq!(loaded.metadata(), artifact.metadata());
        assert_eq!(loaded.index(), artifact.index());
        assert_eq!(
            loaded.retrieve(&[0.1, 1.9], 2).unwrap(),
            artifact.retrieve(&[0.1, 1.9], 2).unwrap()
        );
        assert!(!dir.path().join("index.bin.tmp").exists());
    }

    #[test]
    fn test_load_missing_store_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        sample_artifact().save(dir.path()).unwrap();
        std::fs::remove_file(dir.path().join(METADATA_FILE)).unwrap();
        let err = IndexArtifact::load(dir.path()).unwrap_err();
        assert!(matches!(err, RagError::CorruptArtifact { .. }), "{err}");
    }

    #[test]
    fn test_load_length_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = sample_artifact();
        artifact.save(dir.path()).unwrap();
        let truncated = ChunksFile {
            generation: artifact.generation(),
            chunks: vec!["origin".into()],
        };
        std::fs::write(
            dir.path().join(CHUNKS_FILE),
            serde_json::to_vec(&truncated).unwrap(),
        )
        .unwrap();
        let err = IndexArtifact::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("length mismatch"), "{err}");
    }

    #[test]
    fn test_load_mixed_generations_is_corrupt() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        sample_artifact().save(first.path()).unwrap();
        sample_artifact().save(second.path()).unwrap();
        std::fs::copy(
            second.path().join(METADATA_FILE),
            first.path().join(METADATA_FILE),
        )
        .unwrap();
        let err = IndexArtifact::load(first.path()).unwrap_err();
        assert!(err.to_string().contains("different builds"), "{err}");
    }

    #[test]
    fn test_load_truncated_index_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        sample_artifact().save(dir.path()).unwrap();
        let bytes = std::fs::read(dir.path().join(INDEX_FILE)).unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            IndexArtifact::load(dir.path()),
            Err(RagError::CorruptArtifact { .. })
        ));
    }

    #[test]
    fn test_store_keeps_previous_on_failed_reload() {
        let good = tempfile::tempdir().unwrap();
        let empty = tempfile::tempdir().unwrap();
        let artifact = sample_artifact();
        artifact.save(good.path()).unwrap();

        let store = IndexStore::new();
        assert!(!store.status().loaded);
        store.reload(good.path()).unwrap();
        let snapshot = store.current().unwrap();

        assert!(store.reload(empty.path()).is_err());
        let after = store.current().unwrap();
        assert_eq!(after.generation(), snapshot.generation());

        let status = store.status();
        assert!(status.loaded);
        assert_eq!(status.total_chunks, 3);
        assert_eq!(status.total_documents, 2);
        assert_eq!(status.dimensions, Some(2));
    }

    #[test]
    fn test_store_refresh_swaps_on_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let first = sample_artifact();
        first.save(dir.path()).unwrap();

        let store = IndexStore::new();
        let held = store.refresh(dir.path()).unwrap();
        assert_eq!(held.generation(), first.generation());
        assert_eq!(
            store.refresh(dir.path()).unwrap().generation(),
            first.generation()
        );

        let second = sample_artifact();
        second.save(dir.path()).unwrap();
        let swapped = store.refresh(dir.path()).unwrap();
        assert_eq!(swapped.generation(), second.generation());
        // A reader holding the old snapshot still sees a consistent artifact.
        assert_eq!(held.generation(), first.generation());
        assert_eq!(held.len(), held.metadata().len());
    }
}
