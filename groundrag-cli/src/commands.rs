//! CLI subcommand handlers.

use crate::Commands;
use anyhow::Context;
use groundrag_core::evaluation::{baseline_settings, evaluate, load_test_set};
use groundrag_core::{
    AnswerResult, IndexArtifact, IndexBuilder, IndexStatus, IndexStore, ModelContext,
    PipelineSettings, QueryService, RagConfig, RagError, RagSystem, SourceDocument,
    create_embedder,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

const INDEXABLE_EXTENSIONS: &[&str] = &["txt", "md", "json"];

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config: RagConfig,
) -> anyhow::Result<()> {
    match command {
        Commands::Index { dir } => handle_index(&dir, workspace, &config).await,
        Commands::Ask { question, k, json } => {
            handle_ask(&question, k, json, workspace, &config).await
        }
        Commands::Status { json } => handle_status(json, workspace, &config),
        Commands::Eval {
            test_set,
            baseline,
            output,
        } => handle_eval(&test_set, baseline, output.as_deref(), workspace, &config).await,
    }
}

fn index_dir(workspace: &Path, config: &RagConfig) -> PathBuf {
    if config.index.dir.is_absolute() {
        config.index.dir.clone()
    } else {
        workspace.join(&config.index.dir)
    }
}

/// Every indexable file under `dir`, sorted by path, keyed by relative path.
fn collect_documents(dir: &Path) -> anyhow::Result<Vec<SourceDocument>> {
    let mut documents = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        let path = entry.path();
        let indexable = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| INDEXABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !entry.file_type().is_file() || !indexable {
            continue;
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let relative = path.strip_prefix(dir).unwrap_or(path);
        documents.push(SourceDocument {
            id: relative.to_string_lossy().replace('\\', "/"),
            original_filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            content,
        });
    }
    Ok(documents)
}

async fn handle_index(dir: &Path, workspace: &Path, config: &RagConfig) -> anyhow::Result<()> {
    let documents = collect_documents(dir)?;
    if documents.is_empty() {
        anyhow::bail!("No .txt, .md or .json files found under {}", dir.display());
    }

    let embedder = create_embedder(&config.embedding);
    let builder = IndexBuilder::from_config(config, embedder)?;
    let target = index_dir(workspace, config);
    let outcome = builder.rebuild_and_save(&documents, &target).await?;

    println!(
        "Indexed {} chunks from {} documents into {}",
        outcome.chunk_count,
        documents.len(),
        target.display()
    );
    for doc in &outcome.documents {
        println!("  {:>5}  {}", doc.chunk_count, doc.doc_id);
    }
    Ok(())
}

/// Load the index under `dir` if one was built. A corrupt artifact leaves the
/// store empty and comes back as the load error.
fn open_store(dir: &Path) -> (Arc<IndexStore>, Option<RagError>) {
    let store = Arc::new(IndexStore::new());
    let load_error = if IndexArtifact::exists(dir) {
        store.reload(dir).err()
    } else {
        None
    };
    (store, load_error)
}

fn build_service(workspace: &Path, config: &RagConfig, settings: PipelineSettings) -> QueryService {
    let models = ModelContext::from_config(config);
    let rag = Arc::new(RagSystem::new(models, settings));
    let (store, _) = open_store(&index_dir(workspace, config));
    QueryService::new(store, rag, config.retrieval.k_retrieve)
}

async fn handle_ask(
    question: &str,
    k: Option<usize>,
    json: bool,
    workspace: &Path,
    config: &RagConfig,
) -> anyhow::Result<()> {
    let service = build_service(workspace, config, PipelineSettings::from_config(config));
    let k = k.unwrap_or(config.retrieval.k_retrieve);
    let result = service
        .ask_with_k(question, k)
        .await
        .context("Run `groundrag index <dir>` first if the index has not been built")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_answer(&result);
    }
    Ok(())
}

fn print_answer(result: &AnswerResult) {
    println!("{}", result.answer);
    println!();
    println!("Confidence: {:.0}%", result.confidence * 100.0);
    if !result.citations.is_empty() {
        println!("Citations:");
        for (i, c) in result.citations.iter().enumerate() {
            println!(
                "  [{}] {} (page {}, similarity {:.2}): {}",
                i + 1,
                c.source_file,
                c.page,
                c.similarity,
                c.sentence
            );
        }
    }
    println!(
        "Latency: generation {:.0} ms, verification {:.0} ms, citation {:.0} ms, total {:.0} ms",
        result.latency.generation_ms,
        result.latency.verification_ms,
        result.latency.citation_ms,
        result.latency.total_ms
    );
}

fn index_state(status: &IndexStatus, load_error: Option<&RagError>) -> String {
    match load_error {
        Some(e) => format!("unreadable ({e})"),
        None if status.loaded => "loaded".to_string(),
        None => "not built".to_string(),
    }
}

fn handle_status(json: bool, workspace: &Path, config: &RagConfig) -> anyhow::Result<()> {
    let dir = index_dir(workspace, config);
    let (store, load_error) = open_store(&dir);
    let status = store.status();
    if json {
        let mut value = serde_json::to_value(&status)?;
        if let Some(e) = &load_error {
            value["error"] = serde_json::Value::String(e.to_string());
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Index directory: {}", dir.display());
    println!("Index: {}", index_state(&status, load_error.as_ref()));
    if !status.loaded {
        return Ok(());
    }
    println!("Chunks:     {}", status.total_chunks);
    println!("Documents:  {}", status.total_documents);
    if let Some(dims) = status.dimensions {
        println!("Dimensions: {dims}");
    }
    if let Some(generation) = status.generation {
        println!("Generation: {generation}");
    }
    Ok(())
}

async fn handle_eval(
    test_set: &Path,
    baseline: bool,
    output: Option<&Path>,
    workspace: &Path,
    config: &RagConfig,
) -> anyhow::Result<()> {
    let cases = load_test_set(test_set)
        .with_context(|| format!("Failed to load test set {}", test_set.display()))?;

    let mut settings = PipelineSettings::from_config(config);
    if baseline {
        settings = baseline_settings(settings);
    }
    let service = build_service(workspace, config, settings);
    if service.store().current().is_none() {
        anyhow::bail!("Index not built. Run `groundrag index <dir>` first.");
    }

    let report = evaluate(&service, &cases, baseline).await;
    let s = &report.summary;
    println!("Evaluation summary (baseline: {})", s.baseline);
    println!("  Questions:  {} evaluated, {} skipped", s.evaluated, s.skipped);
    println!("  Grounding:  {:.2}%", s.mean_confidence * 100.0);
    println!("  Precision:  {:.2}%", s.mean_precision * 100.0);
    println!("  Recall:     {:.2}%", s.mean_recall * 100.0);
    println!("  ROUGE-L:    {:.2}%", s.mean_rouge_l * 100.0);
    println!("  Latency:    {:.0} ms", s.mean_latency_ms);

    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Results written to {}", path.display());
    }
    Ok(())
}
