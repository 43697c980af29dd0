use super::*;
use proptest::prelude::*;
use tempfile::TempDir;

fn chunk(document_id: &str, chunk_index: usize, text: &str) -> Chunk {
    Chunk {
        document_id: document_id.to_string(),
        chunk_index,
        offset: 0,
        text: text.to_string(),
        token_count: 1,
    }
}

fn entry(text: &str, embedding: Vec<f32>) -> IndexEntry {
    IndexEntry {
        embedding,
        chunk: chunk("doc", 0, text),
    }
}

fn three_entry_index(metric: DistanceMetric) -> VectorIndex {
    let mut index = VectorIndex::new(metric).with_embedding_model("test-embed");
    index
        .add(vec![
            entry("north", vec![0.0, 1.0, 0.0]),
            entry("east", vec![1.0, 0.0, 0.0]),
            entry("up", vec![0.0, 0.0, 1.0]),
        ])
        .expect("add should succeed");
    index
}

#[test]
fn new_index_is_empty() {
    let index = VectorIndex::new(DistanceMetric::Cosine);
    assert!(index.is_empty());
    assert_eq!(index.len(), 0);
    assert_eq!(index.dimension(), None);
    assert_eq!(index.metric(), DistanceMetric::Cosine);
}

#[test]
fn search_on_empty_index_returns_nothing() {
    let index = VectorIndex::new(DistanceMetric::L2);
    let result = index.search(&[1.0, 2.0], 5).expect("search should succeed");
    assert!(result.is_empty());
}

#[test]
fn added_entries_are_searchable() {
    let index = three_entry_index(DistanceMetric::Cosine);

    assert_eq!(index.len(), 3);
    assert_eq!(index.dimension(), Some(3));

    let result = index
        .search(&[0.9, 0.1, 0.0], 1)
        .expect("search should succeed");
    assert_eq!(result.len(), 1);
    assert_eq!(result.top().map(|hit| hit.chunk.text.as_str()), Some("east"));
}

#[test]
fn search_returns_min_of_k_and_len() {
    let index = three_entry_index(DistanceMetric::L2);

    for k in 0..6 {
        let result = index.search(&[1.0, 1.0, 1.0], k).expect("search");
        assert_eq!(result.len(), k.min(3));
    }
}

#[test]
fn results_are_sorted_by_distance() {
    let mut index = VectorIndex::new(DistanceMetric::L2);
    index
        .add(vec![
            entry("far", vec![10.0, 0.0]),
            entry("near", vec![1.0, 0.0]),
            entry("middle", vec![5.0, 0.0]),
        ])
        .expect("add should succeed");

    let result = index.search(&[0.0, 0.0], 3).expect("search");
    let texts: Vec<&str> = result.iter().map(|h| h.chunk.text.as_str()).collect();
    assert_eq!(texts, vec!["near", "middle", "far"]);
    assert!((result.hits[0].distance - 1.0).abs() < f32::EPSILON);
    assert!((result.hits[2].distance - 10.0).abs() < f32::EPSILON);
}

#[test]
fn ties_keep_insertion_order() {
    let mut index = VectorIndex::new(DistanceMetric::Cosine);
    index
        .add(vec![
            entry("first", vec![1.0, 0.0]),
            entry("second", vec![2.0, 0.0]),
        ])
        .expect("add should succeed");
    index
        .add(vec![entry("third", vec![3.0, 0.0])])
        .expect("add should succeed");

    let result = index.search(&[1.0, 0.0], 3).expect("search");
    let texts: Vec<&str> = result.iter().map(|h| h.chunk.text.as_str()).collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
}

#[test]
fn cosine_distance_handles_zero_vectors() {
    assert!((DistanceMetric::Cosine.distance(&[0.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    assert!(DistanceMetric::Cosine.distance(&[1.0, 1.0], &[2.0, 2.0]).abs() < 1e-6);
    assert!((DistanceMetric::Cosine.distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
}

#[test]
fn mismatched_dimension_rejects_whole_batch() {
    let mut index = three_entry_index(DistanceMetric::Cosine);

    let result = index.add(vec![
        entry("ok", vec![1.0, 1.0, 1.0]),
        entry("bad", vec![1.0, 1.0]),
    ]);

    assert!(matches!(result, Err(RagError::Index(_))));
    assert_eq!(index.len(), 3);
}

#[test]
fn zero_dimension_embeddings_are_rejected() {
    let mut index = VectorIndex::new(DistanceMetric::Cosine);

    let result = index.add(vec![entry("empty", Vec::new())]);

    assert!(matches!(result, Err(RagError::Index(_))));
    assert!(index.is_empty());
    assert_eq!(index.dimension(), None);
}

#[test]
fn query_with_wrong_dimension_fails() {
    let index = three_entry_index(DistanceMetric::Cosine);
    assert!(matches!(
        index.search(&[1.0, 0.0], 1),
        Err(RagError::Index(_))
    ));
}

#[test]
fn adding_nothing_is_a_no_op() {
    let mut index = VectorIndex::new(DistanceMetric::Cosine);
    index.add(Vec::new()).expect("empty add should succeed");
    assert!(index.is_empty());
    assert_eq!(index.dimension(), None);
}

#[test]
fn duplicate_entries_are_kept() {
    let mut index = three_entry_index(DistanceMetric::Cosine);
    index
        .add(vec![entry("north", vec![0.0, 1.0, 0.0])])
        .expect("add should succeed");

    assert_eq!(index.len(), 4);
    let result = index.search(&[0.0, 1.0, 0.0], 1).expect("search");
    assert_eq!(result.len(), 1);
    assert_eq!(result.hits[0].chunk.text, "north");
}

#[test]
fn clear_resets_dimension() {
    let mut index = three_entry_index(DistanceMetric::Cosine);
    index.clear();

    assert!(index.is_empty());
    assert_eq!(index.dimension(), None);
    index
        .add(vec![entry("two-d", vec![1.0, 0.0])])
        .expect("add after clear should accept a new dimension");
}

#[test]
fn save_then_load_preserves_search_results() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = three_entry_index(DistanceMetric::Cosine);
    let query = [0.3_f32, 0.7, 0.1];

    let before = index.search(&query, 3).expect("search before save");
    index.save(&temp_dir.path().join("index")).expect("save should succeed");

    let loaded = VectorIndex::load(&temp_dir.path().join("index")).expect("load should succeed");
    let after = loaded.search(&query, 3).expect("search after load");

    assert_eq!(before, after);
    assert_eq!(loaded, index);
    assert_eq!(loaded.embedding_model(), Some("test-embed"));
}

#[test]
fn save_preserves_exact_float_bits() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut index = VectorIndex::new(DistanceMetric::L2);
    let awkward = vec![0.1_f32, f32::MIN_POSITIVE, -1.0e-38, 3.402_823_5e38];
    index
        .add(vec![entry("awkward", awkward.clone())])
        .expect("add should succeed");

    index.save(&temp_dir.path().join("index")).expect("save should succeed");
    let loaded = VectorIndex::load(&temp_dir.path().join("index")).expect("load should succeed");

    let bits: Vec<u32> = loaded.entries()[0]
        .embedding
        .iter()
        .map(|v| v.to_bits())
        .collect();
    let expected: Vec<u32> = awkward.iter().map(|v| v.to_bits()).collect();
    assert_eq!(bits, expected);
}

#[test]
fn empty_index_round_trips() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = VectorIndex::new(DistanceMetric::L2);

    index.save(&temp_dir.path().join("index")).expect("save should succeed");
    let loaded = VectorIndex::load(&temp_dir.path().join("index")).expect("load should succeed");

    assert!(loaded.is_empty());
    assert_eq!(loaded.metric(), DistanceMetric::L2);
}

#[test]
fn save_writes_bundle_files() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let dir = temp_dir.path().join("index");
    three_entry_index(DistanceMetric::Cosine)
        .save(&dir)
        .expect("save should succeed");

    assert!(VectorIndex::exists(&dir));
    assert!(dir.join("vectors.bin").is_file());
    assert!(dir.join("chunks.json").is_file());
    assert!(!temp_dir.path().join("index.saving").exists());
    assert!(!temp_dir.path().join("index.previous").exists());

    let manifest = VectorIndex::read_manifest(&dir).expect("manifest should parse");
    assert_eq!(manifest.format_version, FORMAT_VERSION);
    assert_eq!(manifest.entry_count, 3);
    assert_eq!(manifest.dimension, Some(3));
    assert_eq!(
        std::fs::metadata(dir.join("vectors.bin"))
            .expect("vectors file exists")
            .len(),
        3 * 3 * 4
    );
}

#[test]
fn load_detects_truncated_vectors() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let dir = temp_dir.path().join("index");
    three_entry_index(DistanceMetric::Cosine)
        .save(&dir)
        .expect("save should succeed");

    std::fs::write(dir.join("vectors.bin"), [0_u8; 7]).expect("should truncate");

    assert!(matches!(
        VectorIndex::load(&dir),
        Err(RagError::Index(_))
    ));
}

#[test]
fn save_replaces_existing_bundle() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let dir = temp_dir.path().join("index");
    three_entry_index(DistanceMetric::Cosine)
        .save(&dir)
        .expect("first save should succeed");

    let mut smaller = VectorIndex::new(DistanceMetric::L2);
    smaller
        .add(vec![entry("only", vec![1.0, 2.0])])
        .expect("add should succeed");
    smaller.save(&dir).expect("second save should succeed");

    let loaded = VectorIndex::load(&dir).expect("load should succeed");
    assert_eq!(loaded, smaller);
    assert!(!temp_dir.path().join("index.saving").exists());
    assert!(!temp_dir.path().join("index.previous").exists());
}

#[test]
fn interrupted_save_keeps_previous_bundle_loadable() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let dir = temp_dir.path().join("index");
    let original = three_entry_index(DistanceMetric::Cosine);
    original.save(&dir).expect("save should succeed");

    // State after a crash between moving the old bundle aside and moving the new one in
    let previous = temp_dir.path().join("index.previous");
    let staging = temp_dir.path().join("index.saving");
    std::fs::rename(&dir, &previous).expect("should move bundle aside");
    std::fs::create_dir_all(&staging).expect("should create staging dir");
    std::fs::write(staging.join("vectors.bin"), [0_u8; 5]).expect("should write partial file");

    assert!(VectorIndex::exists(&dir));
    assert_eq!(
        VectorIndex::read_manifest(&dir)
            .expect("manifest should be found")
            .entry_count,
        3
    );
    let recovered = VectorIndex::load(&dir).expect("previous bundle should load");
    assert_eq!(recovered, original);

    recovered.save(&dir).expect("save after crash should succeed");
    assert!(dir.join("manifest.json").is_file());
    assert!(!previous.exists());
    assert!(!staging.exists());
    assert_eq!(
        VectorIndex::load(&dir).expect("load should succeed"),
        original
    );
}

#[test]
fn load_missing_directory_fails() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let missing = temp_dir.path().join("nope");

    assert!(!VectorIndex::exists(&missing));
    assert!(matches!(VectorIndex::load(&missing), Err(RagError::Io(_))));
}

proptest! {
    #[test]
    fn search_is_bounded_and_sorted(
        vectors in proptest::collection::vec(proptest::collection::vec(-1.0f32..1.0, 4), 0..30),
        query in proptest::collection::vec(-1.0f32..1.0, 4),
        k in 0usize..40,
        use_l2 in any::<bool>(),
    ) {
        let metric = if use_l2 { DistanceMetric::L2 } else { DistanceMetric::Cosine };
        let mut index = VectorIndex::new(metric);
        let count = vectors.len();
        index
            .add(
                vectors
                    .into_iter()
                    .enumerate()
                    .map(|(i, embedding)| IndexEntry { embedding, chunk: chunk("doc", i, "text") })
                    .collect(),
            )
            .expect("add should succeed");

        let result = index.search(&query, k).expect("search should succeed");

        prop_assert_eq!(result.len(), k.min(count));
        for pair in result.hits.windows(2) {
            prop_assert!(pair[0].distance <= pair[1].distance);
            if pair[0].distance == pair[1].distance {
                prop_assert!(pair[0].chunk.chunk_index < pair[1].chunk.chunk_index);
            }
        }
    }
}
