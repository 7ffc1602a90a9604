//! Vector index over message chunks.
//!
//! # Lifecycle
//!
//! ```text
//! empty ──build()/restore()──▶ built ──build()──▶ built (full replace)
//!                               │
//!                               └── search() / persist() / stats()
//! ```
//!
//! Vectors are stored contiguously (`count × dims` `f32`s) alongside a
//! parallel list of [`Chunk`]s in insertion order. Search is exhaustive
//! squared-L2, which is exact for the corpus sizes a single workspace
//! produces.
//!
//! # Re-ranking
//!
//! When a channel filter or a priority-channel list is active, the `3k`
//! nearest entries (capped at the index size) form the candidate pool.
//! Filtered-out channels are dropped, priority channels have their distance
//! scaled by `1 − boost`, and the survivors are ordered by adjusted
//! distance (ties by raw distance). The boost is capped at
//! [`MAX_BOOST`], so a priority hit can never collapse to a perfect match.
//!
//! # On-disk layout
//!
//! | File | Contents |
//! |------|----------|
//! | `vectors.bin` | little-endian `f32` matrix |
//! | `documents.json` | model, dims, count, SHA-256 of `vectors.bin`, build id, chunks |

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::embedding::{blob_to_vec, squared_l2_distance, vec_to_blob, EmbeddingProvider};
use crate::error::{Error, FailureKind, Result, ServiceError};
use crate::models::{Chunk, SearchResult};
use crate::progress::{BuildProgressEvent, BuildProgressReporter};
use crate::resilience::{Guard, RetryObserver};

pub const VECTORS_FILE: &str = "vectors.bin";
pub const DOCUMENTS_FILE: &str = "documents.json";

/// Upper bound on the priority boost.
pub const MAX_BOOST: f32 = 0.95;

const FORMAT_VERSION: u32 = 1;

/// Priority-channel re-ranking policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityPolicy {
    channels: Vec<String>,
    boost: f32,
}

impl PriorityPolicy {
    /// Channel names match case-insensitively, ignoring a leading `#`.
    pub fn new<S: AsRef<str>>(channels: &[S], boost: f32) -> Self {
        Self {
            channels: channels
                .iter()
                .map(|c| normalize_channel(c.as_ref()))
                .filter(|c| !c.is_empty())
                .collect(),
            boost: if boost.is_finite() {
                boost.clamp(0.0, MAX_BOOST)
            } else {
                0.0
            },
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(&config.priority_channels, config.priority_boost)
    }

    pub fn boost(&self) -> f32 {
        self.boost
    }

    pub fn is_active(&self) -> bool {
        !self.channels.is_empty() && self.boost > 0.0
    }

    pub fn is_priority(&self, channel_name: &str) -> bool {
        let name = normalize_channel(channel_name);
        self.channels.iter().any(|c| *c == name)
    }

    /// Adjusted ranking distance. Never negative.
    pub fn adjust(&self, distance: f32, is_priority: bool) -> f32 {
        if is_priority {
            (distance * (1.0 - self.boost)).max(0.0)
        } else {
            distance.max(0.0)
        }
    }
}

fn normalize_channel(name: &str) -> String {
    name.trim().trim_start_matches('#').to_lowercase()
}

#[derive(Debug)]
struct IndexData {
    model: String,
    dims: usize,
    vectors: Vec<f32>,
    chunks: Vec<Chunk>,
    build_id: String,
    created_at: DateTime<Utc>,
}

impl IndexData {
    fn vector(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dims..(i + 1) * self.dims]
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    model: String,
    dims: usize,
    count: usize,
    vectors_sha256: String,
    build_id: String,
    created_at: DateTime<Utc>,
    chunks: Vec<Chunk>,
}

/// Summary returned by [`VectorIndex::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub loaded: bool,
    pub total_vectors: usize,
    pub dims: usize,
    pub model: String,
    pub build_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Embeddings plus chunk metadata, searchable by squared L2 distance.
///
/// `build` and `restore` take `&mut self`, so a build can never overlap a
/// search on the same instance. A built index is shared read-only (e.g.
/// behind an `Arc`) by concurrent searches.
pub struct VectorIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    embedding_guard: Guard,
    storage_guard: Guard,
    priority: PriorityPolicy,
    batch_size: usize,
    data: Option<IndexData>,
}

impl VectorIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, embedding_guard: Guard, storage_guard: Guard) -> Self {
        Self {
            embedder,
            embedding_guard,
            storage_guard,
            priority: PriorityPolicy::default(),
            batch_size: 64,
            data: None,
        }
    }

    pub fn with_priority(mut self, priority: PriorityPolicy) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn priority(&self) -> &PriorityPolicy {
        &self.priority
    }

    pub fn is_built(&self) -> bool {
        self.data.is_some()
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.chunks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embed every chunk and replace the current contents.
    ///
    /// On failure the previous contents are left untouched.
    pub async fn build(&mut self, chunks: Vec<Chunk>, progress: &dyn BuildProgressReporter) -> Result<()> {
        if chunks.is_empty() {
            return Err(Error::EmptyInput);
        }

        let dims = self.embedder.dims();
        let total = chunks.len();
        let mut vectors = Vec::with_capacity(total * dims);
        let mut embedded = 0usize;

        tracing::info!(
            chunks = total,
            model = self.embedder.model_name(),
            batch_size = self.batch_size,
            "building index"
        );

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embeddings = self.embed_batch(&texts, Some(progress)).await?;
            for embedding in embeddings {
                check_dims(dims, embedding.len())?;
                vectors.extend_from_slice(&embedding);
            }
            embedded += batch.len();
            progress.report(BuildProgressEvent::Embedding {
                n: embedded as u64,
                total: total as u64,
            });
        }

        self.data = Some(IndexData {
            model: self.embedder.model_name().to_string(),
            dims,
            vectors,
            chunks,
            build_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        });
        progress.report(BuildProgressEvent::Done {
            vectors: total as u64,
            dims: dims as u64,
        });
        tracing::info!(vectors = total, dims, "index built");
        Ok(())
    }

    /// Return up to `k` nearest chunks, optionally limited to channels whose
    /// name contains `channel_filter` (case-insensitive).
    pub async fn search(&self, query: &str, k: usize, channel_filter: Option<&str>) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::EmptyQuery);
        }
        let data = self.data.as_ref().ok_or(Error::IndexNotBuilt)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self
            .embed_batch(&[query.to_string()], None)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ServiceError::new("embedding", FailureKind::InvalidResponse, "no vector for query")
            })?;
        check_dims(data.dims, query_vector.len())?;

        let filter = channel_filter
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_lowercase);

        let total = data.chunks.len();
        let pool_size = if filter.is_some() || self.priority.is_active() {
            k.saturating_mul(3).min(total)
        } else {
            k.min(total)
        };

        let mut nearest: Vec<(usize, f32)> = (0..total)
            .map(|i| (i, squared_l2_distance(&query_vector, data.vector(i))))
            .collect();
        nearest.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        nearest.truncate(pool_size);

        let results = rank_candidates(&nearest, &data.chunks, k, filter.as_deref(), &self.priority);
        tracing::debug!(
            k,
            pool = pool_size,
            returned = results.len(),
            filter = filter.as_deref().unwrap_or(""),
            "search complete"
        );
        Ok(results)
    }

    /// Write `vectors.bin` and `documents.json` into `dir`.
    pub async fn persist(&self, dir: &Path) -> Result<()> {
        let data = self.data.as_ref().ok_or(Error::IndexNotBuilt)?;

        let blob = vec_to_blob(&data.vectors);
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            model: data.model.clone(),
            dims: data.dims,
            count: data.chunks.len(),
            vectors_sha256: sha256_hex(&blob),
            build_id: data.build_id.clone(),
            created_at: data.created_at,
            chunks: data.chunks.clone(),
        };
        let documents = serde_json::to_vec_pretty(&manifest)?;

        self.storage_guard
            .call(|| write_artifacts(dir, &blob, &documents))
            .await?;

        tracing::info!(
            path = %dir.display(),
            vectors = manifest.count,
            build_id = %manifest.build_id,
            "index saved"
        );
        Ok(())
    }

    /// Load a persisted index from `dir`, replacing the current contents.
    ///
    /// A different model name is only a warning; a different vector
    /// dimension is an error.
    pub async fn restore(&mut self, dir: &Path) -> Result<()> {
        let vectors_path = dir.join(VECTORS_FILE);
        let documents_path = dir.join(DOCUMENTS_FILE);
        if !vectors_path.is_file() || !documents_path.is_file() {
            return Err(Error::IndexNotFound {
                path: dir.to_path_buf(),
            });
        }

        let (blob, documents) = self
            .storage_guard
            .call(|| read_artifacts(&vectors_path, &documents_path))
            .await?;

        let corrupt = |message: String| Error::CorruptIndex {
            path: dir.to_path_buf(),
            message,
        };

        let manifest: Manifest = serde_json::from_slice(&documents)
            .map_err(|e| corrupt(format!("unreadable {}: {}", DOCUMENTS_FILE, e)))?;

        if manifest.model != self.embedder.model_name() {
            tracing::warn!(
                saved = %manifest.model,
                configured = self.embedder.model_name(),
                "index was built with a different embedding model"
            );
        }
        check_dims(self.embedder.dims(), manifest.dims)?;

        if sha256_hex(&blob) != manifest.vectors_sha256 {
            return Err(corrupt(format!("{} checksum mismatch", VECTORS_FILE)));
        }
        if blob.len() % 4 != 0 {
            return Err(corrupt(format!("{} is not a whole number of f32s", VECTORS_FILE)));
        }
        let vectors = blob_to_vec(&blob);
        if manifest.chunks.len() != manifest.count || vectors.len() != manifest.count * manifest.dims {
            return Err(corrupt(format!(
                "expected {} vectors of {} dims, found {} floats and {} chunks",
                manifest.count,
                manifest.dims,
                vectors.len(),
                manifest.chunks.len()
            )));
        }

        tracing::info!(
            path = %dir.display(),
            vectors = manifest.count,
            build_id = %manifest.build_id,
            "index loaded"
        );
        self.data = Some(IndexData {
            model: manifest.model,
            dims: manifest.dims,
            vectors,
            chunks: manifest.chunks,
            build_id: manifest.build_id,
            created_at: manifest.created_at,
        });
        Ok(())
    }

    pub fn stats(&self) -> IndexStats {
        match &self.data {
            Some(data) => IndexStats {
                loaded: true,
                total_vectors: data.chunks.len(),
                dims: data.dims,
                model: data.model.clone(),
                build_id: Some(data.build_id.clone()),
                created_at: Some(data.created_at),
            },
            None => IndexStats {
                loaded: false,
                total_vectors: 0,
                dims: self.embedder.dims(),
                model: self.embedder.model_name().to_string(),
                build_id: None,
                created_at: None,
            },
        }
    }

    /// Indexed chunks in insertion order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.data.iter().flat_map(|d| d.chunks.iter())
    }

    /// Sorted, de-duplicated channel names present in the index.
    pub fn channels(&self) -> Vec<String> {
        let Some(data) = &self.data else {
            return Vec::new();
        };
        data.chunks
            .iter()
            .map(|c| c.metadata.channel_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        progress: Option<&dyn BuildProgressReporter>,
    ) -> Result<Vec<Vec<f32>>> {
        let embedder = &self.embedder;
        let observer: &RetryObserver<'_, ServiceError> = &|err: &ServiceError, attempt: u32| {
            if let Some(progress) = progress {
                progress.report(BuildProgressEvent::Retrying {
                    attempt,
                    reason: err.kind.to_string(),
                });
            }
        };

        let vectors = self
            .embedding_guard
            .call_observed(|| embedder.embed(texts), Some(observer))
            .await?;

        if vectors.len() != texts.len() {
            return Err(ServiceError::new(
                "embedding",
                FailureKind::InvalidResponse,
                format!("expected {} vectors, got {}", texts.len(), vectors.len()),
            )
            .into());
        }
        Ok(vectors)
    }
}

/// Filter and re-rank a distance-ordered candidate pool.
fn rank_candidates(
    nearest: &[(usize, f32)],
    chunks: &[Chunk],
    k: usize,
    filter: Option<&str>,
    priority: &PriorityPolicy,
) -> Vec<SearchResult> {
    let mut survivors: Vec<SearchResult> = nearest
        .iter()
        .filter(|(i, _)| {
            filter.map_or(true, |f| chunks[*i].metadata.channel_name.to_lowercase().contains(f))
        })
        .map(|&(i, distance)| {
            let chunk = &chunks[i];
            let is_priority = priority.is_priority(&chunk.metadata.channel_name);
            SearchResult {
                chunk: chunk.clone(),
                distance,
                score: priority.adjust(distance, is_priority),
                rank: 0,
                is_priority,
            }
        })
        .collect();

    survivors.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then(a.distance.total_cmp(&b.distance))
    });
    survivors.truncate(k);
    for (i, result) in survivors.iter_mut().enumerate() {
        result.rank = i + 1;
    }
    survivors
}

fn check_dims(expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(Error::DimensionMismatch { expected, found });
    }
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn storage_error(path: &Path, err: std::io::Error) -> ServiceError {
    ServiceError::new(
        "storage",
        FailureKind::Io,
        format!("{}: {}", path.display(), err),
    )
}

/// Write both artifacts through temporary files so a failed save never
/// leaves a half-written pair behind.
async fn write_artifacts(dir: &Path, blob: &[u8], documents: &[u8]) -> std::result::Result<(), ServiceError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| storage_error(dir, e))?;

    let staged: [(PathBuf, PathBuf, &[u8]); 2] = [
        (dir.join(VECTORS_FILE), dir.join(format!("{}.tmp", VECTORS_FILE)), blob),
        (dir.join(DOCUMENTS_FILE), dir.join(format!("{}.tmp", DOCUMENTS_FILE)), documents),
    ];
    for (_, tmp, bytes) in &staged {
        tokio::fs::write(tmp, bytes)
            .await
            .map_err(|e| storage_error(tmp, e))?;
    }
    for (target, tmp, _) in &staged {
        tokio::fs::rename(tmp, target)
            .await
            .map_err(|e| storage_error(target, e))?;
    }
    Ok(())
}

async fn read_artifacts(
    vectors_path: &Path,
    documents_path: &Path,
) -> std::result::Result<(Vec<u8>, Vec<u8>), ServiceError> {
    let blob = tokio::fs::read(vectors_path)
        .await
        .map_err(|e| storage_error(vectors_path, e))?;
    let documents = tokio::fs::read(documents_path)
        .await
        .map_err(|e| storage_error(documents_path, e))?;
    Ok((blob, documents))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UnitMetadata;
    use crate::progress::NoProgress;
    use crate::resilience::{CircuitBreakerConfig, RetryConfig, EMBEDDING_RETRYABLE, STORAGE_RETRYABLE};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Maps text whose first token is a number `x` to `[x, 0.0]`.
    struct AxisEmbedder {
        model: &'static str,
        dims: usize,
        failures_left: AtomicU32,
    }

    impl AxisEmbedder {
        fn new() -> Self {
            Self::flaky(0)
        }

        fn flaky(failures: u32) -> Self {
            Self {
                model: "axis",
                dims: 2,
                failures_left: AtomicU32::new(failures),
            }
        }

        fn named(model: &'static str) -> Self {
            Self {
                model,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for AxisEmbedder {
        fn model_name(&self) -> &str {
            self.model
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ServiceError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ServiceError::new("embedding", FailureKind::Timeout, "slow"));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let x = t
                        .split_whitespace()
                        .next()
                        .and_then(|w| w.parse::<f32>().ok())
                        .unwrap_or(0.0);
                    let mut v = vec![0.0; self.dims];
                    v[0] = x;
                    v
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<BuildProgressEvent>>);

    impl BuildProgressReporter for Recorder {
        fn report(&self, event: BuildProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn guards() -> (Guard, Guard) {
        let retry = RetryConfig {
            max_attempts: 3,
            initial_delay_secs: 0.1,
            max_delay_secs: 1.0,
            exponential_base: 2.0,
            jitter: false,
        };
        (
            Guard::new("embedding", retry.clone(), CircuitBreakerConfig::default(), EMBEDDING_RETRYABLE),
            Guard::new("storage", retry, CircuitBreakerConfig::default(), STORAGE_RETRYABLE),
        )
    }

    fn index_with(embedder: AxisEmbedder) -> VectorIndex {
        let (embedding, storage) = guards();
        VectorIndex::new(Arc::new(embedder), embedding, storage).with_batch_size(2)
    }

    fn corpus() -> Vec<Chunk> {
        vec![
            chunk("general", "0 lunch plans"),
            chunk("dev-team", "1 deploy friday"),
            chunk("leadership", "2 quarterly goals"),
            chunk("random", "3 cat pictures"),
            chunk("dev-ops", "4 pager rotation"),
        ]
    }

    fn chunk(channel: &str, text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            metadata: UnitMetadata {
                author: "alice".to_string(),
                channel_name: channel.to_string(),
                ..Default::default()
            },
            chunk_index: 0,
            total_chunks: 1,
        }
    }

    #[test]
    fn test_priority_matching_is_case_insensitive_and_exact() {
        let policy = PriorityPolicy::new(&["Leadership", "#announcements"], 0.3);
        assert!(policy.is_priority("leadership"));
        assert!(policy.is_priority("ANNOUNCEMENTS"));
        assert!(!policy.is_priority("leadership-social"));
        assert!(!policy.is_priority("general"));
    }

    #[test]
    fn test_boost_is_clamped() {
        let policy = PriorityPolicy::new(&["leadership"], 1.0);
        assert!((policy.boost() - MAX_BOOST).abs() < f32::EPSILON);
        assert!(policy.adjust(2.0, true) > 0.0);
        assert_eq!(PriorityPolicy::new(&["x"], -0.5).boost(), 0.0);
        assert!(!PriorityPolicy::new(&["x"], 0.0).is_active());
    }

    #[test]
    fn test_adjust_scales_priority_only() {
        let policy = PriorityPolicy::new(&["leadership"], 0.5);
        assert!((policy.adjust(1.0, true) - 0.5).abs() < 1e-6);
        assert!((policy.adjust(1.0, false) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_priority_outranks_equal_distance() {
        let chunks = vec![chunk("general", "a"), chunk("leadership", "b")];
        let policy = PriorityPolicy::new(&["leadership"], 0.3);
        let results = rank_candidates(&[(0, 1.0), (1, 1.0)], &chunks, 2, None, &policy);
        assert_eq!(results[0].chunk.metadata.channel_name, "leadership");
        assert!(results[0].is_priority);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[1].rank, 2);
        assert!((results[0].distance - 1.0).abs() < 1e-6);
        assert!((results[0].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_priority_does_not_beat_much_closer_result() {
        let chunks = vec![chunk("general", "a"), chunk("leadership", "b")];
        let policy = PriorityPolicy::new(&["leadership"], 0.3);
        let results = rank_candidates(&[(0, 0.2), (1, 1.5)], &chunks, 2, None, &policy);
        assert_eq!(results[0].chunk.metadata.channel_name, "general");
    }

    #[test]
    fn test_filter_is_substring_and_bounded_by_k() {
        let chunks = vec![
            chunk("dev-team", "a"),
            chunk("general", "b"),
            chunk("Dev-Ops", "c"),
            chunk("devrel", "d"),
        ];
        let nearest = [(0, 0.1), (1, 0.2), (2, 0.3), (3, 0.4)];
        let results = rank_candidates(&nearest, &chunks, 2, Some("dev"), &PriorityPolicy::default());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.metadata.channel_name, "dev-team");
        assert_eq!(results[1].chunk.metadata.channel_name, "Dev-Ops");
        assert!(results.iter().all(|r| !r.is_priority));
    }

    #[test]
    fn test_filter_may_return_fewer_than_k() {
        let chunks = vec![chunk("general", "a"), chunk("random", "b")];
        let results = rank_candidates(
            &[(0, 0.1), (1, 0.2)],
            &chunks,
            5,
            Some("dev"),
            &PriorityPolicy::default(),
        );
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_build_and_search_nearest_first() {
        let mut index = index_with(AxisEmbedder::new());
        let recorder = Recorder::default();
        index.build(corpus(), &recorder).await.unwrap();
        assert_eq!(index.len(), 5);

        let results = index.search("1.1 when do we deploy", 3, None).await.unwrap();
        let texts: Vec<&str> = results.iter().map(|r| r.chunk.text.as_str()).collect();
        assert_eq!(texts, vec!["1 deploy friday", "2 quarterly goals", "0 lunch plans"]);
        assert_eq!(results[0].rank, 1);
        assert!((results[0].distance - 0.01).abs() < 1e-4);
        assert!(results.windows(2).all(|w| w[0].score <= w[1].score));

        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[2], BuildProgressEvent::Embedding { n: 5, total: 5 });
        assert_eq!(events[3], BuildProgressEvent::Done { vectors: 5, dims: 2 });
    }

    #[tokio::test]
    async fn test_search_k_larger_than_index() {
        let mut index = index_with(AxisEmbedder::new());
        index.build(corpus(), &NoProgress).await.unwrap();
        let results = index.search("0", 50, None).await.unwrap();
        assert_eq!(results.len(), 5);
        let ranks: Vec<usize> = results.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
        assert!(index.search("0", 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_with_channel_filter() {
        let mut index = index_with(AxisEmbedder::new());
        index.build(corpus(), &NoProgress).await.unwrap();
        let results = index.search("0", 2, Some("DEV")).await.unwrap();
        let channels: Vec<&str> = results
            .iter()
            .map(|r| r.chunk.metadata.channel_name.as_str())
            .collect();
        assert_eq!(channels, vec!["dev-team", "dev-ops"]);
    }

    #[tokio::test]
    async fn test_priority_channel_reranked() {
        let mut index = index_with(AxisEmbedder::new())
            .with_priority(PriorityPolicy::new(&["leadership"], 0.9));
        index.build(corpus(), &NoProgress).await.unwrap();
        // leadership is at distance 4.0, adjusted to 0.4, ahead of dev-team at 1.0
        let results = index.search("0", 2, None).await.unwrap();
        assert_eq!(results[0].chunk.metadata.channel_name, "general");
        assert_eq!(results[1].chunk.metadata.channel_name, "leadership");
        assert!(results[1].is_priority);
        assert!((results[1].distance - 4.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_invalid_queries_and_states() {
        let index = index_with(AxisEmbedder::new());
        assert!(matches!(index.search("   ", 3, None).await, Err(Error::EmptyQuery)));
        assert!(matches!(index.search("hi", 3, None).await, Err(Error::IndexNotBuilt)));
        assert!(!index.stats().loaded);
        assert!(index.channels().is_empty());

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(index.persist(dir.path()).await, Err(Error::IndexNotBuilt)));
    }

    #[tokio::test]
    async fn test_build_empty_input_keeps_previous() {
        let mut index = index_with(AxisEmbedder::new());
        index.build(corpus(), &NoProgress).await.unwrap();
        assert!(matches!(index.build(Vec::new(), &NoProgress).await, Err(Error::EmptyInput)));
        assert_eq!(index.len(), 5);
    }

    #[tokio::test]
    async fn test_rebuild_replaces_contents() {
        let mut index = index_with(AxisEmbedder::new());
        index.build(corpus(), &NoProgress).await.unwrap();
        index
            .build(vec![chunk("announcements", "7 new office")], &NoProgress)
            .await
            .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.channels(), vec!["announcements".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_retries_transient_embedding_failures() {
        let mut index = index_with(AxisEmbedder::flaky(2));
        let recorder = Recorder::default();
        index.build(corpus(), &recorder).await.unwrap();
        assert_eq!(index.len(), 5);

        let events = recorder.0.lock().unwrap();
        let retries: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                BuildProgressEvent::Retrying { attempt, reason } => {
                    assert_eq!(reason, "timeout");
                    Some(*attempt)
                }
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_gives_up_after_max_attempts() {
        let mut index = index_with(AxisEmbedder::flaky(10));
        let err = index.build(corpus(), &NoProgress).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert!(!index.is_built());
    }

    #[tokio::test]
    async fn test_persist_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_with(AxisEmbedder::new());
        index.build(corpus(), &NoProgress).await.unwrap();
        index.persist(dir.path()).await.unwrap();
        assert!(dir.path().join(VECTORS_FILE).is_file());
        assert!(dir.path().join(DOCUMENTS_FILE).is_file());

        let mut restored = index_with(AxisEmbedder::new());
        restored.restore(dir.path()).await.unwrap();
        assert_eq!(restored.stats(), index.stats());

        let before = index.search("3", 3, None).await.unwrap();
        let after = restored.search("3", 3, None).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(
            restored.channels(),
            vec!["dev-ops", "dev-team", "general", "leadership", "random"]
        );
    }

    #[tokio::test]
    async fn test_restore_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_with(AxisEmbedder::new());
        let err = index.restore(&dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, Error::IndexNotFound { .. }));
    }

    #[tokio::test]
    async fn test_restore_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_with(AxisEmbedder::new());
        index.build(corpus(), &NoProgress).await.unwrap();
        index.persist(dir.path()).await.unwrap();

        let wide = AxisEmbedder {
            dims: 3,
            ..AxisEmbedder::new()
        };
        let mut restored = index_with(wide);
        let err = restored.restore(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, found: 2 }));
    }

    #[tokio::test]
    async fn test_restore_with_other_model_same_dims_loads() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_with(AxisEmbedder::named("axis-v1"));
        index.build(corpus(), &NoProgress).await.unwrap();
        index.persist(dir.path()).await.unwrap();

        let mut restored = index_with(AxisEmbedder::named("axis-v2"));
        restored.restore(dir.path()).await.unwrap();
        assert!(restored.is_built());
        assert_eq!(restored.stats().model, "axis-v1");

        let before = index.search("3", 3, None).await.unwrap();
        let after = restored.search("3", 3, None).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_restore_detects_tampered_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index_with(AxisEmbedder::new());
        index.build(corpus(), &NoProgress).await.unwrap();
        index.persist(dir.path()).await.unwrap();

        std::fs::write(dir.path().join(VECTORS_FILE), [0u8; 8]).unwrap();
        let mut restored = index_with(AxisEmbedder::new());
        let err = restored.restore(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::CorruptIndex { .. }));
    }

    #[tokio::test]
    async fn test_restore_rejects_garbled_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VECTORS_FILE), b"").unwrap();
        std::fs::write(dir.path().join(DOCUMENTS_FILE), "{not json").unwrap();
        let mut index = index_with(AxisEmbedder::new());
        let err = index.restore(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::CorruptIndex { .. }));
    }
}
