//! End-to-end scenarios: rebuild, persist, reload, retrieve and answer.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::Arc;

use groundrag_core::chunk::ChunkMetadata;
use groundrag_core::citation::PageRef;
use groundrag_core::config::RagConfig;
use groundrag_core::embeddings::LocalEmbedder;
use groundrag_core::generator::Generator;
use groundrag_core::index::{IndexArtifact, IndexStore};
use groundrag_core::ingest::{IndexBuilder, SourceDocument};
use groundrag_core::pipeline::{ModelContext, PipelineSettings, RETRIEVAL_ONLY_ANSWER, RagSystem};
use groundrag_core::query::QueryService;
use groundrag_core::reranker::{LexicalScorer, Reranker};
use groundrag_core::verifier::REFUSAL;

struct FixedAnswer(&'static str);

#[async_trait]
impl Generator for FixedAnswer {
    async fn generate(&self, _query: &str, _context: &[String]) -> String {
        self.0.to_string()
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

fn chunks() -> Vec<String> {
    vec![
        "Paris is the capital of France.".into(),
        "Berlin is the capital of Germany.".into(),
        "The sky is blue.".into(),
    ]
}

fn metadata() -> Vec<ChunkMetadata> {
    vec![
        ChunkMetadata {
            source_file: "france.pdf".into(),
            doc_id: "doc-france".into(),
            chunk_idx: 0,
            page: Some(2),
        },
        ChunkMetadata {
            source_file: "germany.txt".into(),
            doc_id: "doc-germany".into(),
            chunk_idx: 0,
            page: None,
        },
        ChunkMetadata {
            source_file: "sky.txt".into(),
            doc_id: "doc-sky".into(),
            chunk_idx: 0,
            page: None,
        },
    ]
}

fn rag(answer: Option<&'static str>, settings: PipelineSettings) -> RagSystem {
    let generator = answer.map(|a| Arc::new(FixedAnswer(a)) as Arc<dyn Generator>);
    let models = ModelContext::new(
        Arc::new(LocalEmbedder::new(384)),
        Some(Reranker::new(Arc::new(LexicalScorer::default()))),
        generator,
    );
    RagSystem::new(models, settings)
}

#[tokio::test]
async fn grounded_answer_is_accepted_and_cited() {
    let rag = rag(Some("Paris is the capital of France."), PipelineSettings::default());
    let result = rag
        .answer("What is the capital of France?", &chunks(), &metadata())
        .await;

    assert_eq!(result.answer, "Paris is the capital of France.");
    assert_eq!(result.confidence, 1.0);
    assert_eq!(result.support_details.len(), 1);
    assert!(result.support_details[0].is_supported);
    assert_eq!(result.citations.len(), 1);
    assert_eq!(result.citations[0].source_file, "france.pdf");
    assert_eq!(result.citations[0].page, PageRef::Page(2));
    assert!(result.citations[0].similarity > 0.99);
    assert_eq!(result.retrieved_chunks, chunks());
}

#[tokio::test]
async fn unsupported_answer_is_refused() {
    let settings = PipelineSettings {
        similarity_threshold: 0.5,
        confidence_threshold: 0.7,
        ..PipelineSettings::default()
    };
    let rag = rag(Some("The moon is made of cheese."), settings);
    let result = rag
        .answer("What is the capital of France?", &chunks(), &metadata())
        .await;

    assert_eq!(result.answer, REFUSAL);
    assert_eq!(result.confidence, 0.0);
    assert_eq!(result.support_details.len(), 1);
    assert_eq!(result.support_details[0].sentence, "The moon is made of cheese.");
    assert!(!result.support_details[0].is_supported);
    for citation in &result.citations {
        assert_eq!(citation.sentence, REFUSAL);
    }
}

#[tokio::test]
async fn empty_retrieval_set_yields_zero_confidence() {
    let rag = rag(Some("Paris is the capital of France."), PipelineSettings::default());
    let result = rag.answer("What is the capital of France?", &[], &[]).await;

    assert_eq!(result.confidence, 0.0);
    assert!(result.citations.is_empty());
    assert!(result.support_details.is_empty());
    assert!(result.retrieved_chunks.is_empty());
}

#[tokio::test]
async fn retrieval_only_mode_returns_advisory() {
    let rag = rag(None, PipelineSettings::default());
    let result = rag.answer("What is the capital of France?", &chunks(), &metadata()).await;

    assert_eq!(result.answer, RETRIEVAL_ONLY_ANSWER);
    assert_eq!(result.confidence, 1.0);
    assert!(result.citations.is_empty());
    assert_eq!(result.latency.verification_ms, 0.0);
}

#[tokio::test]
async fn rebuild_save_reload_and_ask() {
    let dir = tempfile::tempdir().unwrap();
    let config = RagConfig::default();
    let embedder = Arc::new(LocalEmbedder::new(config.embedding.dimensions));

    let documents = vec![
        SourceDocument {
            id: "doc-france".into(),
            original_filename: "france.pdf".into(),
            content: r#"[{"text": "Paris is the capital of France.", "page": 7}]"#.into(),
        },
        SourceDocument {
            id: "doc-germany".into(),
            original_filename: "germany.txt".into(),
            content: "Berlin is the capital of Germany.".into(),
        },
        SourceDocument {
            id: "doc-sky".into(),
            original_filename: "sky.txt".into(),
            content: "The sky is blue.".into(),
        },
    ];
    let builder = IndexBuilder::from_config(&config, embedder.clone()).unwrap();
    let outcome = builder.rebuild_and_save(&documents, dir.path()).await.unwrap();
    assert_eq!(outcome.chunk_count, 3);

    let store = Arc::new(IndexStore::new());
    store.reload(dir.path()).unwrap();
    let status = store.status();
    assert!(status.loaded);
    assert_eq!(status.total_documents, 3);
    assert_eq!(status.generation, Some(outcome.artifact.generation()));

    let models = ModelContext::new(
        embedder,
        Some(Reranker::new(Arc::new(LexicalScorer::default()))),
        Some(Arc::new(FixedAnswer("Paris is the capital of France."))),
    );
    let rag = Arc::new(RagSystem::new(models, PipelineSettings::from_config(&config)));
    let service = QueryService::new(Arc::clone(&store), rag, config.retrieval.k_retrieve);

    let result = service.ask("What is the capital of France?").await.unwrap();
    assert_eq!(result.retrieved_chunks[0], "Paris is the capital of France.");
    assert_eq!(result.confidence, 1.0);
    assert_eq!(result.citations[0].source_file, "france.pdf");
    assert_eq!(result.citations[0].page, PageRef::Page(7));

    // The reloaded artifact answers searches exactly like the built one.
    let loaded = IndexArtifact::load(dir.path()).unwrap();
    let probe = LocalEmbedder::new(config.embedding.dimensions).embed_text("capital");
    assert_eq!(
        loaded.retrieve(&probe, 3).unwrap(),
        outcome.artifact.retrieve(&probe, 3).unwrap()
    );
}
