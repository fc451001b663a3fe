//! Embedding providers.
//!
//! - `Embedder`: the seam the index talks to, a pure batch `embed(texts)`
//! - `EmbeddingModel`: local fastembed model with a download timeout
//! - `TimeoutEmbedder`: bounds every embedding call

use fastembed::{InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Error type for embedding operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Embedding timed out after {0} seconds")]
    Timeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Turns texts into fixed-size vectors. Same input, same output.
pub trait Embedder: Send + Sync {
    /// Identifier stored with persisted vectors; a change invalidates them.
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One vector per input text, same order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

/// SHA256 of a model id, used to tag persisted vectors.
pub fn model_id_hash(model_id: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.finalize().into()
}

/// Run a batch through `embedder` and check the shape of what came back.
pub fn embed_checked(
    embedder: &dyn Embedder,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
        return Ok(vec![]);
    }

    let vectors = embedder.embed_batch(texts)?;
    if vectors.len() != texts.len() {
        return Err(EmbeddingError::EmbeddingFailed(format!(
            "expected {} embeddings, got {}",
            texts.len(),
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != embedder.dimensions()) {
        return Err(EmbeddingError::EmbeddingFailed(format!(
            "expected {} dimensions, got {}",
            embedder.dimensions(),
            bad.len()
        )));
    }
    Ok(vectors)
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Load (downloading on first use) the named model.
    ///
    /// Models are cached in `cache_dir`. Loading runs on a helper thread so
    /// a stalled download gives up after `download_timeout`.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let options = InitOptions::new(model_enum)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(true);

            let result = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))
                .and_then(|mut model| {
                    let dimensions = Self::probe_dimensions(&mut model)?;
                    Ok((model, dimensions))
                });

            let _ = tx.send(result);
        });

        let (model, dimensions) = match rx.recv_timeout(timeout) {
            Ok(result) => result?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(EmbeddingError::DownloadTimeout(timeout.as_secs()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(EmbeddingError::InitFailed(
                    "model loader thread exited".to_string(),
                ))
            }
        };

        log::info!("Loaded embedding model '{model_name}' ({dimensions} dimensions)");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(
        name: &str,
    ) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-small-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGESmallENV15Q),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
            "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5 (add -q suffix to bge models for quantized)",
                name
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl Embedder for EmbeddingModel {
    fn model_id(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}

/// Bounds each call of the inner embedder. A call that overruns is reported
/// as `EmbeddingError::Timeout`; its worker thread is left to finish on its
/// own and the result is dropped.
pub struct TimeoutEmbedder {
    inner: Arc<dyn Embedder>,
    timeout: Duration,
}

impl TimeoutEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl Embedder for TimeoutEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let inner = self.inner.clone();
        let texts = texts.to_vec();
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            let _ = tx.send(inner.embed_batch(&texts));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!("embedding call exceeded {:?}", self.timeout);
                Err(EmbeddingError::Timeout(self.timeout.as_secs()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(EmbeddingError::EmbeddingFailed(
                "embedding worker panicked".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow(Duration);

    impl Embedder for Slow {
        fn model_id(&self) -> &str {
            "slow"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            std::thread::sleep(self.0);
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_model_creation_and_embedding() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model =
            EmbeddingModel::new("bge-small-en-v1.5", temp_dir.path().to_path_buf(), None).unwrap();
        assert_eq!(model.model_id(), "bge-small-en-v1.5");
        assert_eq!(model.dimensions(), 384);

        let embedding = model.embed("Hello, world!").unwrap();
        assert_eq!(embedding.len(), 384);
    }

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = EmbeddingModel::new("nonexistent-model", temp_dir.path().to_path_buf(), None);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_model_id_hash_consistency() {
        assert_eq!(model_id_hash("bge-small-en-v1.5"), model_id_hash("bge-small-en-v1.5"));
        assert_ne!(model_id_hash("bge-small-en-v1.5"), model_id_hash("bge-base-en-v1.5"));
    }

    #[test]
    fn test_timeout_embedder_passes_fast_calls() {
        let embedder = TimeoutEmbedder::new(
            Arc::new(Slow(Duration::from_millis(1))),
            Duration::from_secs(5),
        );
        let out = embedder.embed_batch(&["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_timeout_embedder_gives_up() {
        let embedder = TimeoutEmbedder::new(
            Arc::new(Slow(Duration::from_millis(500))),
            Duration::from_millis(20),
        );
        assert!(matches!(
            embedder.embed("a"),
            Err(EmbeddingError::Timeout(_))
        ));
    }

    #[test]
    fn test_embed_checked_rejects_wrong_shape() {
        struct Short;
        impl Embedder for Short {
            fn model_id(&self) -> &str {
                "short"
            }
            fn dimensions(&self) -> usize {
                3
            }
            fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
                Ok(vec![vec![1.0, 0.0, 0.0]])
            }
        }

        let texts = vec!["a".to_string(), "b".to_string()];
        assert!(matches!(
            embed_checked(&Short, &texts),
            Err(EmbeddingError::EmbeddingFailed(_))
        ));
    }
}
