use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::embeddings::{EmbeddingService, OllamaEmbedder};
use crate::generation::{GenerationOrchestrator, provider_from_config};
use crate::ingest::{DocumentStatus, Ingestor, load_documents};
use crate::retrieval::Query;
use crate::store::VectorStore;

/// Load the configuration from `config_dir`, or from the default directory
#[inline]
pub fn load_config(config_dir: Option<&Path>) -> Result<Config> {
    let dir = match config_dir {
        Some(dir) => dir.to_path_buf(),
        None => Config::config_dir().context("Failed to locate the configuration directory")?,
    };
    Config::load(&dir)
        .with_context(|| format!("Failed to load configuration from {}", dir.display()))
}

fn embedding_service(config: &Config) -> Arc<EmbeddingService> {
    Arc::new(EmbeddingService::new(
        Arc::new(OllamaEmbedder::new(&config.embedding)),
        &config.embedding,
        config.retry,
    ))
}

async fn open_store(config: &Config) -> Result<Arc<VectorStore>> {
    let store = VectorStore::new(config).await.with_context(|| {
        format!(
            "Failed to open vector store at {}",
            config.vector_database_path().display()
        )
    })?;
    Ok(Arc::new(store))
}

/// Ingest every Markdown file in `dir`
#[inline]
pub async fn ingest(config: &Config, dir: &Path, reset: bool) -> Result<()> {
    info!("Ingesting documents from {}", dir.display());

    let loaded = load_documents(dir)
        .await
        .with_context(|| format!("Failed to read documents from {}", dir.display()))?;
    if loaded.documents.is_empty() && loaded.unreadable.is_empty() {
        println!("📭 No Markdown files found in {}", dir.display());
        return Ok(());
    }

    let ingestor = Ingestor::new(
        config.chunking.clone(),
        embedding_service(config),
        open_store(config).await?,
    );

    let bar = if console::user_attended_stderr() {
        ProgressBar::new(loaded.documents.len() as u64).with_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] Ingesting {msg}")
                .expect("style template is valid"),
        )
    } else {
        ProgressBar::hidden()
    };

    let mut report = ingestor
        .ingest_all_with_progress(&loaded.documents, reset, |outcome| {
            bar.set_message(outcome.document_id.clone());
            bar.inc(1);
        })
        .await
        .context("Ingestion failed")?;
    bar.finish_and_clear();

    report.documents.extend(loaded.unreadable);

    println!("📚 Ingestion finished in {} ms", report.elapsed_ms);
    for outcome in &report.documents {
        match outcome.status {
            DocumentStatus::Succeeded => println!(
                "   ✅ {}: {} chunks ({} replaced)",
                outcome.document_id, outcome.chunks, outcome.replaced
            ),
            DocumentStatus::Failed => println!(
                "   ❌ {}: {}",
                outcome.document_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    println!(
        "   📊 {} succeeded, {} failed, {} chunks stored",
        report.succeeded(),
        report.failed(),
        report.total_chunks()
    );

    match report.save(&config.reports_dir()).await {
        Ok(path) => println!("   📝 Report saved to {}", path.display()),
        Err(e) => warn!("Could not save ingestion report: {}", e),
    }

    Ok(())
}

/// Answer one question, printing text or JSON
#[inline]
pub async fn ask(
    config: &Config,
    question: &str,
    chapter: Option<u32>,
    json: bool,
) -> Result<()> {
    let provider = provider_from_config(&config.generation)
        .context("Failed to set up the generation provider")?;
    let orchestrator = GenerationOrchestrator::new(
        config,
        embedding_service(config),
        open_store(config).await?,
        provider,
    );

    let query = match chapter {
        Some(chapter) => Query::new(question).in_chapter(chapter),
        None => Query::new(question),
    };
    let answer = orchestrator.ask(&query).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    println!("{}", answer.answer);
    if !answer.citations.is_empty() {
        println!();
        println!("📖 Sources:");
        for citation in &answer.citations {
            println!(
                "   • Chapter {}: {} ({})",
                citation.section, citation.title, citation.text_preview
            );
        }
    }
    println!();
    println!(
        "⏱️  {:.2} ms, {} of {} chunks used, model {}",
        answer.metadata.response_time_ms,
        answer.metadata.chunks_used,
        answer.metadata.chunks_found,
        answer.metadata.model
    );

    Ok(())
}

/// Remove every stored chunk
#[inline]
pub async fn reset_store(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let before = store.count().await.context("Failed to count chunks")?;
    store.reset().await.context("Failed to reset vector store")?;
    println!("🗑️  Removed {} chunks from the vector store", before);
    Ok(())
}

/// Show provider connectivity and what the store holds
#[inline]
pub async fn show_status(config: &Config) -> Result<()> {
    println!("🔍 textbook-rag status");
    println!();

    println!(
        "🧮 Embeddings ({} at {}):",
        config.embedding.model, config.embedding.url
    );
    let embedder = OllamaEmbedder::new(&config.embedding);
    match embedder.health_check().await {
        Ok(()) => println!("   ✅ Model available"),
        Err(e) => println!("   ❌ {}", e),
    }
    match embedder.list_models().await {
        Ok(models) => println!("   📦 {} models installed", models.len()),
        Err(e) => warn!("Could not list models: {}", e),
    }

    println!();
    println!(
        "🤖 Generation: {:?} {} at {}",
        config.generation.provider,
        config.generation.model,
        config.generation.endpoint()
    );

    println!();
    println!("🗄️  Vector store ({}):", config.vector_database_path().display());
    let stats = open_store(config)
        .await?
        .stats()
        .await
        .context("Failed to read store statistics")?;
    if stats.total_chunks == 0 {
        println!("   📭 Empty; run 'textbook-rag ingest <dir>' first");
    } else {
        println!("   📄 Chunks: {}", stats.total_chunks);
        println!("   📚 Documents: {}", stats.documents.join(", "));
        println!(
            "   🔖 Chapters: {}",
            itertools::join(stats.chapters.iter(), ", ")
        );
        println!("   🧩 Sections: {}", stats.sections);
        if let Some(dimension) = stats.dimension {
            println!("   📐 Dimension: {}", dimension);
        }
    }

    println!();
    println!(
        "⚙️  Retrieval: top_k {}, context {} chunks / {} tokens",
        config.retrieval.top_k,
        config.context.max_context_chunks,
        config.context.max_context_tokens
    );

    Ok(())
}
