pub mod config;
pub mod database;
pub mod error;
pub mod ollama;
pub mod pipeline;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};

use config::AppConfig;
use database::Database;
use ollama::{OllamaAnalyzer, OllamaClient};
use pipeline::{JobRegistry, Orchestrator, OrchestratorSettings};
use worker::download::AutoFetcher;
use worker::index::ChunkIndex;
use worker::transcribe::WhisperCliTranscriber;
use worker::ImportService;

/// Install the global subscriber. `RUST_LOG` wins over `level`; calling this
/// twice is harmless.
pub fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Wire the production collaborators into a running import service.
pub fn build_service(config: &AppConfig) -> Result<(ImportService, Arc<Database>)> {
    for dir in [
        config.paths.data_dir.clone(),
        config.paths.media_path(),
        config.paths.transcripts_path(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let db_path = config.paths.database_path();
    let db = Arc::new(Database::new(&db_path)?);
    log::info!("Database ready at {}", db_path.display());

    let ollama = OllamaClient::from_config(&config.analysis);
    let embedder = ollama.clone().with_model(&config.index.embedding_model);

    let registry = Arc::new(JobRegistry::new(config.jobs.retention()));
    let orchestrator = Orchestrator::new(
        registry,
        Arc::new(AutoFetcher::from_config(config)?),
        Arc::new(WhisperCliTranscriber::new(
            &config.transcription,
            config.paths.transcripts_path(),
        )),
        Arc::new(OllamaAnalyzer::new(ollama, &config.analysis)),
        db.clone(),
        Arc::new(ChunkIndex::new(Arc::clone(&db), embedder, &config.index)),
        OrchestratorSettings::from_config(config),
    );

    let service = ImportService::new(Arc::new(orchestrator), &config.workers);
    Ok((service, db))
}
