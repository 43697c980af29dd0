// Embeddings module
// Content chunking and the embedding backend abstraction

pub mod chunking;

pub use chunking::{
    Chunk, ChunkingConfig, Document, chunk_document, estimate_token_count, reconstruct,
};

use crate::Result;
use crate::index::Embedding;

/// Maps text to fixed-length vectors.
///
/// Implementations are blocking; async callers should run them on a blocking
/// thread. Failures of the backing service surface as
/// [`RagError::EmbeddingService`](crate::RagError::EmbeddingService) and are
/// never retried here.
pub trait Embedder: Send + Sync {
    /// Identifier of the model producing the vectors
    fn embedding_model(&self) -> &str;

    /// Largest number of texts worth sending in one [`Embedder::embed_batch`]
    /// call. Callers that can be cancelled split their work into batches of
    /// this size and stop between them.
    #[inline]
    fn max_batch_size(&self) -> usize {
        1
    }

    /// Embed a single text
    fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed many texts, returning one vector per input in the same order.
    ///
    /// Must agree with calling [`Embedder::embed`] on each input; backends
    /// override it only for throughput.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}
