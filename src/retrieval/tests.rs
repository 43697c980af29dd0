use super::*;
use crate::RagError;
use crate::embeddings::Chunk;
use crate::index::{DistanceMetric, IndexEntry};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Maps text onto three axes by keyword and counts calls
#[derive(Default)]
struct KeywordEmbedder {
    calls: AtomicUsize,
}

impl Embedder for KeywordEmbedder {
    fn embedding_model(&self) -> &str {
        "keywords"
    }

    fn embed(&self, text: &str) -> Result<crate::index::Embedding> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = text.to_lowercase();
        Ok(["france", "germany", "italy"]
            .iter()
            .map(|word| if text.contains(word) { 1.0 } else { 0.0 })
            .collect())
    }
}

fn index() -> VectorIndex {
    let mut index = VectorIndex::new(DistanceMetric::Cosine);
    let entries = [
        ("Paris is in France.", vec![1.0, 0.0, 0.0]),
        ("Berlin is in Germany.", vec![0.0, 1.0, 0.0]),
        ("Rome is in Italy.", vec![0.0, 0.0, 1.0]),
    ]
    .into_iter()
    .enumerate()
    .map(|(chunk_index, (text, embedding))| IndexEntry {
        embedding,
        chunk: Chunk {
            document_id: "europe.txt".to_string(),
            chunk_index,
            offset: 0,
            text: text.to_string(),
            token_count: 4,
        },
    })
    .collect();
    index.add(entries).expect("add should succeed");
    index
}

#[test]
fn retrieves_nearest_chunk_first() {
    let retriever = Retriever::new(Arc::new(KeywordEmbedder::default()));

    let result = retriever
        .retrieve(&index(), "Which city is in Germany?", 2)
        .expect("retrieve should succeed");

    assert_eq!(result.len(), 2);
    assert_eq!(
        result.top().map(|hit| hit.chunk.text.as_str()),
        Some("Berlin is in Germany.")
    );
}

#[test]
fn every_question_is_embedded_again() {
    let embedder = Arc::new(KeywordEmbedder::default());
    let retriever = Retriever::new(embedder.clone());
    let index = index();

    for _ in 0..3 {
        retriever
            .retrieve(&index, "France", 1)
            .expect("retrieve should succeed");
    }

    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn empty_index_yields_empty_result() {
    let retriever = Retriever::new(Arc::new(KeywordEmbedder::default()));
    let result = retriever
        .retrieve(&VectorIndex::default(), "France", 4)
        .expect("retrieve should succeed");
    assert!(result.is_empty());
}

#[test]
fn embedding_failures_propagate() {
    struct Down;
    impl Embedder for Down {
        fn embedding_model(&self) -> &str {
            "down"
        }
        fn embed(&self, _text: &str) -> Result<crate::index::Embedding> {
            Err(RagError::EmbeddingService("connection refused".to_string()))
        }
    }

    let retriever = Retriever::new(Arc::new(Down));
    assert!(matches!(
        retriever.retrieve(&index(), "France", 1),
        Err(RagError::EmbeddingService(_))
    ));
}
