//! Local embedding backends and ensemble averaging.
//!
//! The cheap compute path. Backends implement [`LocalEmbedder`]; the
//! production implementation runs fastembed models behind the
//! `local-inference` feature, and tests inject fakes through the same
//! trait. The first registered backend serves the fast path; the
//! ensemble strategy averages all of them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{MimirError, Result};

/// A process-local embedding model.
#[async_trait]
pub trait LocalEmbedder: Send + Sync {
    fn name(&self) -> &str;

    /// Model id recorded in cache rows and audit records.
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Average the vectors of every registered backend into one unit vector.
///
/// Backends must agree on dimension; a mismatch is a `Protocol` error
/// rather than a silent truncation.
pub async fn ensemble_embed(embedders: &[Arc<dyn LocalEmbedder>], text: &str) -> Result<Vec<f32>> {
    let Some(first) = embedders.first() else {
        return Err(MimirError::Client("no local backends registered".into()));
    };
    let dim = first.dimension();

    let mut sum = vec![0.0f32; dim];
    for embedder in embedders {
        let vector = embedder.embed(text).await?;
        if vector.len() != dim {
            return Err(MimirError::Protocol(format!(
                "ensemble member {} produced {} dimensions, expected {dim}",
                embedder.name(),
                vector.len()
            )));
        }
        for (acc, v) in sum.iter_mut().zip(vector.iter()) {
            *acc += v;
        }
    }

    let n = embedders.len() as f32;
    for v in sum.iter_mut() {
        *v /= n;
    }
    // Unit-normalize so the average stays comparable under cosine.
    let norm = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in sum.iter_mut() {
            *v /= norm;
        }
    }
    Ok(sum)
}

#[cfg(feature = "local-inference")]
pub use fast::{FastEmbedBackend, LocalEmbeddingModel};

#[cfg(feature = "local-inference")]
mod fast {
    use std::sync::Mutex;

    use super::*;

    /// Supported fastembed models.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum LocalEmbeddingModel {
        /// all-MiniLM-L6-v2 (384 dims, fast).
        AllMiniLmL6V2,
        /// BGE-small-en (384 dims, strong retrieval).
        BgeSmallEn,
        /// BGE-base-en (768 dims, higher quality).
        BgeBaseEn,
    }

    impl LocalEmbeddingModel {
        pub fn name(&self) -> &'static str {
            match self {
                Self::AllMiniLmL6V2 => "all-MiniLM-L6-v2",
                Self::BgeSmallEn => "BGE-small-en",
                Self::BgeBaseEn => "BGE-base-en",
            }
        }

        pub fn dimensions(&self) -> usize {
            match self {
                Self::AllMiniLmL6V2 | Self::BgeSmallEn => 384,
                Self::BgeBaseEn => 768,
            }
        }
    }

    impl From<LocalEmbeddingModel> for fastembed::EmbeddingModel {
        fn from(model: LocalEmbeddingModel) -> Self {
            match model {
                LocalEmbeddingModel::AllMiniLmL6V2 => fastembed::EmbeddingModel::AllMiniLML6V2,
                LocalEmbeddingModel::BgeSmallEn => fastembed::EmbeddingModel::BGESmallENV15,
                LocalEmbeddingModel::BgeBaseEn => fastembed::EmbeddingModel::BGEBaseENV15,
            }
        }
    }

    /// fastembed-backed local embedder.
    pub struct FastEmbedBackend {
        model: Arc<Mutex<fastembed::TextEmbedding>>,
        spec: LocalEmbeddingModel,
        model_id: String,
    }

    impl FastEmbedBackend {
        /// Load (downloading if needed) a fastembed model.
        pub fn new(spec: LocalEmbeddingModel) -> Result<Self> {
            let cache_dir = dirs::cache_dir()
                .unwrap_or_else(|| std::path::PathBuf::from(".cache"))
                .join("mimir")
                .join("models");
            let options = fastembed::InitOptions::new(spec.into()).with_cache_dir(cache_dir);
            let model = fastembed::TextEmbedding::try_new(options).map_err(|e| {
                MimirError::Config(format!("failed to load local embedding model: {e}"))
            })?;
            Ok(Self {
                model: Arc::new(Mutex::new(model)),
                spec,
                model_id: format!("local.{}", spec.name()),
            })
        }
    }

    #[async_trait]
    impl LocalEmbedder for FastEmbedBackend {
        fn name(&self) -> &str {
            self.spec.name()
        }

        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn dimension(&self) -> usize {
            self.spec.dimensions()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // fastembed is sync and CPU-bound.
            let model = self.model.clone();
            let text = text.to_owned();
            let dim = self.spec.dimensions();
            let vectors = tokio::task::spawn_blocking(move || {
                let mut guard = model
                    .lock()
                    .map_err(|e| MimirError::Config(format!("model lock poisoned: {e}")))?;
                guard
                    .embed(vec![text], None)
                    .map_err(|e| MimirError::Transient(format!("local embedding failed: {e}")))
            })
            .await
            .map_err(|e| MimirError::Transient(format!("embedding task join error: {e}")))??;

            let vector = vectors
                .into_iter()
                .next()
                .ok_or_else(|| MimirError::Protocol("no embedding returned".into()))?;
            if vector.len() != dim {
                return Err(MimirError::Protocol(format!(
                    "local model produced {} dimensions, expected {dim}",
                    vector.len()
                )));
            }
            Ok(vector)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder {
        vector: Vec<f32>,
    }

    #[async_trait]
    impl LocalEmbedder for FixedEmbedder {
        fn name(&self) -> &str {
            "fixed"
        }

        fn model_id(&self) -> &str {
            "local.fixed"
        }

        fn dimension(&self) -> usize {
            self.vector.len()
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.vector.clone())
        }
    }

    #[tokio::test]
    async fn ensemble_averages_and_normalizes() {
        let embedders: Vec<Arc<dyn LocalEmbedder>> = vec![
            Arc::new(FixedEmbedder {
                vector: vec![1.0, 0.0],
            }),
            Arc::new(FixedEmbedder {
                vector: vec![0.0, 1.0],
            }),
        ];
        let out = ensemble_embed(&embedders, "x").await.unwrap();
        // Average is (0.5, 0.5); normalized to unit length.
        assert!((out[0] - out[1]).abs() < 1e-6);
        let norm: f32 = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn ensemble_rejects_dimension_mismatch() {
        let embedders: Vec<Arc<dyn LocalEmbedder>> = vec![
            Arc::new(FixedEmbedder {
                vector: vec![1.0, 0.0],
            }),
            Arc::new(FixedEmbedder {
                vector: vec![1.0, 0.0, 0.0],
            }),
        ];
        let err = ensemble_embed(&embedders, "x").await.unwrap_err();
        assert!(matches!(err, MimirError::Protocol(_)));
    }

    #[tokio::test]
    async fn ensemble_requires_members() {
        let err = ensemble_embed(&[], "x").await.unwrap_err();
        assert!(matches!(err, MimirError::Client(_)));
    }
}
