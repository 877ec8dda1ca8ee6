//! clip-insights: import short-form videos into a searchable library.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use clip_insights_lib::config::AppConfig;
use clip_insights_lib::database::Database;
use clip_insights_lib::ollama::OllamaClient;
use clip_insights_lib::pipeline::{JobStatus, JobStatusView};
use clip_insights_lib::worker::ImportService;
use clip_insights_lib::{build_service, init_logging};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "clip-insights")]
#[command(about = "Download, transcribe, analyze and index short-form videos")]
#[command(version)]
struct Args {
    /// Config file (defaults to the data directory's config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import one or more video URLs for a user and wait for the results
    Import {
        /// Requesting user id
        #[arg(long)]
        user: i64,

        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Rebuild the search index for saved videos
    Reindex {
        /// Every video that is not yet indexed
        #[arg(long, conflicts_with = "ids")]
        all: bool,

        ids: Vec<i64>,
    },

    /// Register a user and print their id
    AddUser { email: String },

    /// List a user's library with summaries, tags and highlights
    Videos {
        #[arg(long)]
        user: i64,
    },

    /// Print library counts
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;
    init_logging(&config.log_level);

    let (service, db) = build_service(&config)?;
    let outcome = match args.command {
        Command::Import { user, urls } => import(&config, &service, &db, user, &urls).await,
        Command::Reindex { all, ids } => reindex(&service, &db, all, ids).await,
        Command::AddUser { email } => {
            let id = db.add_user(&email)?;
            println!("{}", id);
            Ok(true)
        }
        Command::Videos { user } => videos(&db, user).map(|()| true),
        Command::Stats => {
            let stats = db.get_stats()?;
            println!("users:      {}", stats.total_users);
            println!("videos:     {} ({} indexed)", stats.total_videos, stats.indexed_videos);
            println!("highlights: {}", stats.total_highlights);
            println!("chunks:     {}", stats.total_chunks);
            Ok(true)
        }
    };

    service.shutdown().await;
    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Submit every URL, then poll until each job is terminal. Returns false if
/// any submission was rejected or any job failed.
async fn import(
    config: &AppConfig,
    service: &ImportService,
    db: &Arc<Database>,
    user_id: i64,
    urls: &[String],
) -> Result<bool> {
    if db.get_user(user_id)?.is_none() {
        bail!("User {} does not exist, add it with `clip-insights add-user`", user_id);
    }

    match OllamaClient::from_config(&config.analysis).health_check().await {
        Ok(status) if !status.model_available => log::warn!(
            "Ollama model {} is not pulled, analysis will fail",
            status.model
        ),
        Ok(_) => {}
        Err(e) => log::warn!("Ollama is not reachable, analysis will fail: {:#}", e),
    }

    let mut ok = true;
    let mut jobs: HashMap<String, Option<JobStatusView>> = HashMap::new();
    for url in urls {
        match service.submit_import(user_id, url) {
            Ok(outcome) => {
                if outcome.already_active {
                    println!("{} already in progress as job {}", url, outcome.job_id);
                } else {
                    println!("{} queued as job {}", url, outcome.job_id);
                }
                jobs.insert(outcome.job_id, None);
            }
            Err(e) => {
                eprintln!("{}: {}", url, e);
                ok = false;
            }
        }
    }

    loop {
        let mut pending = 0;
        for (job_id, last) in jobs.iter_mut() {
            let Some(view) = service.get_job_status(job_id) else {
                continue;
            };
            if last.as_ref() != Some(&view) {
                println!("[{}] {:>3}% {}: {}", view.url, view.progress, view.status, view.message);
                *last = Some(view.clone());
            }
            if !view.status.is_terminal() {
                pending += 1;
            }
        }
        if pending == 0 {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => {
                log::warn!("Interrupted, cancelling {} job(s)", pending);
                for job_id in jobs.keys() {
                    service.cancel_job(job_id);
                }
            }
        }
    }

    let failed = jobs
        .values()
        .flatten()
        .filter(|view| view.status == JobStatus::Failed)
        .count();
    if failed > 0 {
        eprintln!("{} of {} import(s) failed", failed, jobs.len());
    }
    Ok(ok && failed == 0)
}

fn videos(db: &Database, user_id: i64) -> Result<()> {
    if db.get_user(user_id)?.is_none() {
        bail!("User {} does not exist", user_id);
    }
    let library = db.get_videos_for_user(user_id)?;
    if library.is_empty() {
        println!("No videos for user {}", user_id);
        return Ok(());
    }

    for entry in library {
        println!(
            "#{} {}",
            entry.id,
            entry.title.as_deref().unwrap_or(&entry.url)
        );
        println!("    url:     {}", entry.url);
        if let Some(author) = &entry.author_username {
            println!("    author:  @{}", author);
        }
        if let Some(summary) = &entry.summary {
            println!("    summary: {}", summary);
        }
        if let Some(niche) = &entry.niche {
            println!("    niche:   {}", niche);
        }
        let tags = db.get_video(entry.id)?.map(|v| v.tags).unwrap_or_default();
        if !tags.is_empty() {
            println!("    tags:    {}", tags.join(", "));
        }
        for h in db
            .get_highlights(entry.id)?
            .into_iter()
            .filter(|h| h.user_id == user_id)
        {
            println!("    [{:.2}] {}: {}", h.confidence, h.title, h.text);
        }
    }
    Ok(())
}

async fn reindex(
    service: &ImportService,
    db: &Arc<Database>,
    all: bool,
    ids: Vec<i64>,
) -> Result<bool> {
    let ids = if all {
        db.get_unindexed_videos()?.into_iter().map(|v| v.id).collect()
    } else {
        ids
    };
    if ids.is_empty() {
        println!("Nothing to reindex");
        return Ok(true);
    }

    let mut ok = true;
    for id in ids {
        match service.reindex_video(id).await {
            Ok(()) => println!("video {}: indexed", id),
            Err(e) => {
                eprintln!("video {}: {}", id, e);
                ok = false;
            }
        }
    }
    Ok(ok)
}
