// Vector index module
// Brute-force nearest neighbour search over stored chunk embeddings,
// persisted as a directory bundle

#[cfg(test)]
mod tests;

use std::fmt;
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::embeddings::chunking::Chunk;
use crate::{RagError, Result};

pub const FORMAT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const VECTORS_FILE: &str = "vectors.bin";
const CHUNKS_FILE: &str = "chunks.json";
const STAGING_SUFFIX: &str = ".saving";
const PREVIOUS_SUFFIX: &str = ".previous";

/// A dense embedding vector
pub type Embedding = Vec<f32>;

/// How distance between two embeddings is measured. Smaller is closer for both.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, in `[0, 2]`
    #[default]
    Cosine,
    /// Euclidean distance
    L2,
}

impl DistanceMetric {
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => 1.0 - cosine_similarity(a, b),
            Self::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }
}

impl fmt::Display for DistanceMetric {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cosine => write!(f, "cosine"),
            Self::L2 => write!(f, "l2"),
        }
    }
}

/// Cosine similarity, or 0.0 when either vector has zero magnitude
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// An embedding paired with the chunk it was computed from
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub embedding: Embedding,
    pub chunk: Chunk,
}

/// A retrieved chunk with its distance from the query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub distance: f32,
}

/// Search hits ranked by ascending distance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredChunk>,
}

impl RetrievalResult {
    #[inline]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    #[inline]
    pub fn top(&self) -> Option<&ScoredChunk> {
        self.hits.first()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, ScoredChunk> {
        self.hits.iter()
    }
}

impl<'a> IntoIterator for &'a RetrievalResult {
    type Item = &'a ScoredChunk;
    type IntoIter = std::slice::Iter<'a, ScoredChunk>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.hits.iter()
    }
}

/// Metadata written alongside the vectors of a saved index
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexManifest {
    pub format_version: u32,
    pub metric: DistanceMetric,
    pub dimension: Option<usize>,
    pub entry_count: usize,
    pub embedding_model: Option<String>,
    pub saved_at: DateTime<Utc>,
}

/// In-memory vector index. Entries keep their insertion order, which also
/// breaks ties between equally distant results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorIndex {
    metric: DistanceMetric,
    dimension: Option<usize>,
    embedding_model: Option<String>,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    #[inline]
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            ..Self::default()
        }
    }

    /// Record which embedding model produced the stored vectors
    #[inline]
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    #[inline]
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Dimension shared by every stored vector, fixed by the first insert
    #[inline]
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    #[inline]
    pub fn embedding_model(&self) -> Option<&str> {
        self.embedding_model.as_deref()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Add entries to the index. Either every entry is stored or, on a
    /// dimension mismatch, none are.
    #[inline]
    pub fn add(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        let Some(first) = entries.first() else {
            debug!("No entries to add");
            return Ok(());
        };

        let dimension = self.dimension.unwrap_or(first.embedding.len());
        if dimension == 0 {
            return Err(RagError::Index(
                "embeddings must have at least one dimension".to_string(),
            ));
        }

        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != dimension) {
            return Err(RagError::Index(format!(
                "embedding for chunk {} of '{}' has dimension {}, index expects {}",
                bad.chunk.chunk_index,
                bad.chunk.document_id,
                bad.embedding.len(),
                dimension
            )));
        }

        debug!("Adding {} entries to index", entries.len());
        self.dimension = Some(dimension);
        self.entries.extend(entries);
        Ok(())
    }

    /// Return the `k` entries closest to `query`, nearest first
    #[inline]
    pub fn search(&self, query: &[f32], k: usize) -> Result<RetrievalResult> {
        let Some(dimension) = self.dimension else {
            return Ok(RetrievalResult::default());
        };

        if query.len() != dimension {
            return Err(RagError::Index(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                dimension
            )));
        }

        let mut scored: Vec<(f32, &IndexEntry)> = self
            .entries
            .iter()
            .map(|entry| (self.metric.distance(&entry.embedding, query), entry))
            .collect();

        // Stable sort keeps insertion order among equal distances
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.truncate(k);

        debug!(
            "Search over {} entries returned {} hits",
            self.entries.len(),
            scored.len()
        );

        Ok(RetrievalResult {
            hits: scored
                .into_iter()
                .map(|(distance, entry)| ScoredChunk {
                    chunk: entry.chunk.clone(),
                    distance,
                })
                .collect(),
        })
    }

    /// Drop every entry, returning the index to its freshly created state
    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear();
        self.dimension = None;
    }

    /// Persist the index into `dir`, creating it if needed.
    ///
    /// The bundle is written into a sibling staging directory which then
    /// replaces `dir` by rename. Until the new bundle is in place the old one
    /// stays readable, either at `dir` or under its backup name.
    #[inline]
    pub fn save(&self, dir: &Path) -> Result<()> {
        let staging = sibling(dir, STAGING_SUFFIX)?;
        let previous = sibling(dir, PREVIOUS_SUFFIX)?;

        if staging.exists() {
            debug!("Removing stale staging directory {}", staging.display());
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let manifest = IndexManifest {
            format_version: FORMAT_VERSION,
            metric: self.metric,
            dimension: self.dimension,
            entry_count: self.entries.len(),
            embedding_model: self.embedding_model.clone(),
            saved_at: Utc::now(),
        };

        write_file(&staging.join(VECTORS_FILE), |writer| {
            for entry in &self.entries {
                for value in &entry.embedding {
                    writer.write_all(&value.to_le_bytes())?;
                }
            }
            Ok(())
        })?;

        let chunks: Vec<&Chunk> = self.entries.iter().map(|e| &e.chunk).collect();
        write_file(&staging.join(CHUNKS_FILE), |writer| {
            serde_json::to_writer(writer, &chunks).map_err(std::io::Error::other)
        })?;

        // Manifest last so a partially written bundle never looks complete
        write_file(&staging.join(MANIFEST_FILE), |writer| {
            serde_json::to_writer_pretty(writer, &manifest).map_err(std::io::Error::other)
        })?;

        if dir.exists() {
            if previous.exists() {
                fs::remove_dir_all(&previous)?;
            }
            fs::rename(dir, &previous)?;
        }
        fs::rename(&staging, dir)?;
        if previous.exists() {
            fs::remove_dir_all(&previous)?;
        }

        info!(
            "Saved index with {} entries to {}",
            self.entries.len(),
            dir.display()
        );
        Ok(())
    }

    /// Load an index previously written by [`VectorIndex::save`]
    #[inline]
    pub fn load(dir: &Path) -> Result<Self> {
        let requested = dir;
        let dir = &complete_bundle(requested);
        if dir != requested {
            warn!(
                "No index at {}, recovering the bundle left at {} by an interrupted save",
                requested.display(),
                dir.display()
            );
        }

        let manifest = Self::read_manifest(dir)?;

        if manifest.format_version != FORMAT_VERSION {
            return Err(RagError::Index(format!(
                "unsupported index format version {} (expected {})",
                manifest.format_version, FORMAT_VERSION
            )));
        }

        let chunks: Vec<Chunk> = {
            let file = fs::File::open(dir.join(CHUNKS_FILE))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| RagError::Index(format!("corrupt chunk file: {}", e)))?
        };

        if chunks.len() != manifest.entry_count {
            return Err(RagError::Index(format!(
                "manifest lists {} entries but chunk file holds {}",
                manifest.entry_count,
                chunks.len()
            )));
        }

        let mut bytes = Vec::new();
        fs::File::open(dir.join(VECTORS_FILE))?.read_to_end(&mut bytes)?;

        let dimension = manifest.dimension.unwrap_or(0);
        let expected_len = manifest.entry_count * dimension * size_of::<f32>();
        if bytes.len() != expected_len {
            return Err(RagError::Index(format!(
                "vector file holds {} bytes, expected {}",
                bytes.len(),
                expected_len
            )));
        }

        let values: Vec<f32> = bytes
            .chunks_exact(size_of::<f32>())
            .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            .collect();

        let entries = if dimension == 0 {
            Vec::new()
        } else {
            values
                .chunks_exact(dimension)
                .zip(chunks)
                .map(|(embedding, chunk)| IndexEntry {
                    embedding: embedding.to_vec(),
                    chunk,
                })
                .collect()
        };

        info!(
            "Loaded index with {} entries from {}",
            manifest.entry_count,
            dir.display()
        );

        Ok(Self {
            metric: manifest.metric,
            dimension: manifest.dimension,
            embedding_model: manifest.embedding_model,
            entries,
        })
    }

    /// Whether `dir` contains a saved index
    #[inline]
    pub fn exists(dir: &Path) -> bool {
        complete_bundle(dir).join(MANIFEST_FILE).is_file()
    }

    /// Read only the manifest of a saved index
    #[inline]
    pub fn read_manifest(dir: &Path) -> Result<IndexManifest> {
        let file = fs::File::open(complete_bundle(dir).join(MANIFEST_FILE))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| RagError::Index(format!("corrupt manifest: {}", e)))
    }
}

fn write_file<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<fs::File>) -> std::io::Result<()>,
{
    let mut writer = BufWriter::new(fs::File::create(path)?);
    write(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// `dir` with `suffix` appended to its last component
fn sibling(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let name = dir.file_name().ok_or_else(|| {
        RagError::Index(format!(
            "index path {} does not name a directory",
            dir.display()
        ))
    })?;
    let mut sibling_name = name.to_os_string();
    sibling_name.push(suffix);
    Ok(dir.with_file_name(sibling_name))
}

/// The directory holding the last complete bundle for `dir`. A save that
/// stopped between its two renames leaves that bundle under the backup name.
fn complete_bundle(dir: &Path) -> PathBuf {
    if dir.join(MANIFEST_FILE).is_file() {
        return dir.to_path_buf();
    }
    match sibling(dir, PREVIOUS_SUFFIX) {
        Ok(previous) if previous.join(MANIFEST_FILE).is_file() => previous,
        _ => dir.to_path_buf(),
    }
}
