//! Guideline GraphRAG command line
//!
//! Entry point for indexing guideline documents and querying built graphs.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::map_err_ignore)]

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser};
use dotenvy::dotenv;
use tracing::{info, warn};

use guideline_graphrag::config::{AppConfig, Cli, Command};
use guideline_graphrag::graphrag::domain::QueryRequest;
use guideline_graphrag::graphrag::embedding::{FastEmbedder, InMemoryVectorStoreProvider};
use guideline_graphrag::graphrag::rag::loader::load_path;
use guideline_graphrag::graphrag::{GraphRagService, telemetry};
use guideline_graphrag::llm::ChatCompletionsDriver;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    telemetry::init(std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")));

    let cli = Cli::parse();
    let config = AppConfig::load_with_cli(&cli).context("Failed to load configuration")?;
    let Some(command) = cli.command.clone() else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let service = build_service(config)?;
    match command {
        Command::Index {
            path,
            force_rebuild,
            archive,
        } => index(&service, &cli.graph_id, &path, force_rebuild, archive).await,
        Command::Query {
            archive,
            method,
            question,
        } => {
            service.restore(&cli.graph_id, &archive).await?;
            let mut request = QueryRequest::new(question);
            if let Some(method) = method {
                request = request.with_method(method);
            }
            let result = service.query(&cli.graph_id, request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Stats { archive } => {
            let manifest = service.restore(&cli.graph_id, &archive).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
            Ok(())
        }
    }
}

fn build_service(config: AppConfig) -> Result<GraphRagService> {
    let llm_settings = config.llm_settings();
    info!(
        base_url = %llm_settings.base_url,
        model = %llm_settings.model,
        embedding_model = %config.embedding.model,
        "Configuration loaded"
    );
    if llm_settings.api_key.is_none() {
        warn!("No API key configured; requests may be rejected by the provider");
    }

    let model = ChatCompletionsDriver::new(llm_settings).context("Failed to create LLM driver")?;
    let embedder = FastEmbedder::new(&config.embedding.model, config.embedding.batch_size)
        .context("Failed to create embedder")?;
    Ok(GraphRagService::new(
        config,
        Arc::new(model),
        Arc::new(embedder),
        Arc::new(InMemoryVectorStoreProvider),
    )?)
}

async fn index(
    service: &GraphRagService,
    graph_id: &str,
    path: &Path,
    force_rebuild: bool,
    archive: Option<PathBuf>,
) -> Result<()> {
    let loaded = load_path(path).await?;
    for (file, err) in &loaded.rejected {
        warn!(file = %file.display(), error = %err, "File skipped");
    }
    if loaded.documents.is_empty() {
        bail!("no loadable documents under {}", path.display());
    }

    let report = service.index(graph_id, loaded.documents).wait().await?;
    info!(
        accepted = report.accepted.len(),
        rejected = report.rejected.len(),
        chunks = report.chunks,
        "Documents indexed"
    );

    let manifest = service.build(graph_id, force_rebuild).wait().await?;
    let dir = archive.unwrap_or_else(|| service.config().storage.root_dir.join(graph_id));
    service.archive(graph_id, &dir).await?;
    info!(dir = %dir.display(), "Graph archived");

    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}
