use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nanguide::app::{App, model_dir, reranker_dir};
use nanguide::config::{Config, RerankBackend};
use nanguide::correction::scheduler::Scheduler;
use nanguide::db::models::{ProposalStatus, UnansweredStatus};
use nanguide::embedder::download::{EMBEDDER_ORG, RERANKER_ORG, download_model_files, hf_repo};
use nanguide::knowledge;
use nanguide::mcp::server::McpServer;

#[derive(Parser)]
#[command(name = "nanguide", version, about = "Self-correcting tourism RAG for Nan province")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the MCP server on stdio together with the research and ingestion jobs
    Serve {
        /// Do not start the periodic jobs
        #[arg(long)]
        no_jobs: bool,
    },
    /// Answer one question and print the result
    Ask { query: String },
    /// Research OPEN deferred questions once
    Research,
    /// Ingest APPROVED proposals once
    Ingest,
    /// Index a JSON Lines knowledge file
    Index { file: PathBuf },
    /// List proposals
    Proposals {
        #[arg(long)]
        status: Option<ProposalStatus>,
    },
    /// Approve a pending proposal, optionally replacing its answer
    Approve {
        id: i64,
        #[arg(long)]
        answer: Option<String>,
    },
    /// Reject a pending proposal
    Reject { id: i64 },
    /// List deferred questions
    Unanswered {
        #[arg(long)]
        status: Option<UnansweredStatus>,
    },
    /// Download the embedding and reranker model files
    DownloadModel,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the MCP protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    if let Command::DownloadModel = cli.command {
        let mut downloads = vec![(model_dir(&config), hf_repo(EMBEDDER_ORG, &config.model.name))];
        if config.rerank.backend == RerankBackend::Onnx {
            downloads.push((reranker_dir(&config), hf_repo(RERANKER_ORG, &config.rerank.name)));
        }
        tokio::task::spawn_blocking(move || {
            downloads
                .iter()
                .try_for_each(|(dir, repo)| download_model_files(dir, repo))
        })
        .await
        .context("download task panicked")??;
        return Ok(());
    }

    let app = App::open(config).await?;

    match cli.command {
        Command::Serve { no_jobs } => serve(app.clone(), no_jobs).await?,
        Command::Ask { query } => match app.ask(&query).await {
            Ok(result) => {
                println!("{}", result.text);
                for c in &result.citations {
                    println!("  - {} ({:.3})", c.title.as_deref().unwrap_or(&c.source_id), c.score);
                }
                println!("confidence: {:.3}{}", result.confidence, if result.deferred { " (deferred)" } else { "" });
            }
            Err(e) if e.is_request_failure() => {
                error!(error = %e, "Request failed");
                println!("{}", app.apology());
            }
            Err(e) => return Err(e.into()),
        },
        Command::Research => match app.researcher.run_once().await? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => println!("A research run is already in progress"),
        },
        Command::Ingest => match app.ingestion.run_once().await? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => println!("An ingestion run is already in progress"),
        },
        Command::Index { file } => {
            let (records, malformed) = knowledge::load_jsonl(&file)?;
            let report = knowledge::index_records(&app.index, app.embedder.clone(), &records, true).await?;
            println!(
                "Indexed {} records ({} without key, {} malformed lines)",
                report.indexed, report.skipped, malformed
            );
        }
        Command::Proposals { status } => {
            let proposals = app.approvals.list(status).await?;
            println!("{}", serde_json::to_string_pretty(&proposals)?);
        }
        Command::Approve { id, answer } => {
            if let Some(answer) = answer.as_deref() {
                app.approvals.revise(id, answer).await?;
            }
            let proposal = app.approvals.approve(id).await?;
            println!("Proposal {} is {}", proposal.id, proposal.status);
        }
        Command::Reject { id } => {
            let proposal = app.approvals.reject(id).await?;
            println!("Proposal {} is {}", proposal.id, proposal.status);
        }
        Command::Unanswered { status } => {
            let entries = app.log.list(status).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Command::DownloadModel => {}
    }

    app.orchestrator.wait_for_background().await;
    Ok(())
}

async fn serve(app: App, no_jobs: bool) -> Result<()> {
    info!("Starting NanGuide MCP Server...");
    let shutdown = CancellationToken::new();

    let jobs = (!no_jobs).then(|| {
        Scheduler::spawn(
            app.researcher.clone(),
            app.ingestion.clone(),
            Duration::from_secs(app.config.researcher.interval_secs),
            Duration::from_secs(app.config.ingestion.interval_secs),
            shutdown.clone(),
        )
    });

    let server = McpServer::new(app);
    let result = tokio::select! {
        r = server.start() => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    shutdown.cancel();
    if let Some(jobs) = jobs {
        jobs.wait().await;
    }
    result
}
