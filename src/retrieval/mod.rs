#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::debug;

use crate::Result;
use crate::embeddings::Embedder;
use crate::index::{RetrievalResult, VectorIndex};

/// Embeds questions and looks them up in a [`VectorIndex`]
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    #[inline]
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    #[inline]
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Return the `k` chunks nearest to `question`
    #[inline]
    pub fn retrieve(&self, index: &VectorIndex, question: &str, k: usize) -> Result<RetrievalResult> {
        debug!("Retrieving top {} chunks for question", k);
        let query = self.embedder.embed(question)?;
        index.search(&query, k)
    }
}
