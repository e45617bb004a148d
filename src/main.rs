use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use deepresearch::chat::transcript;
use deepresearch::jobs::history::{self, StoreHistory};
use deepresearch::models::{DocumentRef, MessageRole, ResearchModifiers, ResearchParameters};
use deepresearch::storage::FileStore;
use deepresearch::{
    backend::HttpBackend, AskOutcome, ChatSession, Config, JobCollaborators, JobOrchestrator,
    StatusProjector, StatusSink,
};

#[derive(Parser, Debug)]
#[command(name = "deepresearch", version, about = "Deep research jobs and document chat")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a research job and wait until its document shows up
    Research {
        /// Analysis type, e.g. "Market Analysis"
        #[arg(long)]
        capability: String,

        #[arg(long)]
        framework: String,

        /// Free-form background for the research
        #[arg(long, default_value = "")]
        context: String,

        #[arg(long, default_value = "standard")]
        scope: String,

        #[arg(long, default_value = "standard")]
        overview_details: String,

        #[arg(long, default_value = "standard")]
        analytical_rigor: String,

        #[arg(long, default_value = "neutral")]
        perspective: String,

        /// Return right after submission instead of waiting
        #[arg(long)]
        no_wait: bool,
    },

    /// Show research jobs still being tracked
    Status,

    /// Chat about a document, one question per line on stdin
    Chat {
        #[arg(long)]
        document_id: String,

        #[arg(long)]
        title: String,

        /// Directory to write a markdown transcript to on exit
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Write the research history as JSON
    History {
        /// Output file (defaults to research-history-YYYY-MM-DD.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Prints the status indicator to stderr
struct ConsoleStatus;

impl StatusSink for ConsoleStatus {
    fn show(&self, label: &str) {
        eprintln!("[status] {}", label);
    }

    fn hide(&self) {
        eprintln!("[status] no active research");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deepresearch::utils::init_logger();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!("Configuration loaded: {}", config.api.base_url);

    let backend = Arc::new(HttpBackend::new(&config.api)?);
    let store = Arc::new(FileStore::new(&config.storage.data_dir));
    let research_history = Arc::new(StoreHistory::new(store.clone()));

    match cli.command {
        Command::Research {
            capability,
            framework,
            context,
            scope,
            overview_details,
            analytical_rigor,
            perspective,
            no_wait,
        } => {
            let orchestrator = JobOrchestrator::new(
                JobCollaborators {
                    backend: backend.clone(),
                    counter: backend,
                    store,
                    history: Some(research_history),
                },
                StatusProjector::new(Arc::new(ConsoleStatus), config.status.rotation_interval()),
                config.jobs.settings(),
            );

            let parameters = ResearchParameters {
                capability,
                framework,
                context,
                modifiers: ResearchModifiers {
                    scope,
                    overview_details,
                    analytical_rigor,
                    perspective,
                },
            };
            let id = orchestrator
                .submit(parameters)
                .await
                .context("Failed to start research")?;
            println!("Research started: {}", id);

            if !no_wait {
                wait_for_queue(&orchestrator).await;
            }
        }
        Command::Status => {
            let orchestrator = JobOrchestrator::new(
                JobCollaborators {
                    backend: backend.clone(),
                    counter: backend,
                    store,
                    history: None,
                },
                StatusProjector::new(Arc::new(ConsoleStatus), config.status.rotation_interval()),
                config.jobs.settings(),
            );
            orchestrator.restore_on_load().await;

            let now = Utc::now().timestamp_millis();
            let jobs = orchestrator.jobs();
            if jobs.is_empty() {
                println!("No active research jobs");
            }
            for job in jobs {
                println!(
                    "{}  {} / {}  started {}s ago",
                    job.id,
                    job.parameters.capability,
                    job.parameters.framework,
                    (now - job.start_time).max(0) / 1000
                );
            }
        }
        Command::Chat {
            document_id,
            title,
            export,
        } => {
            let session = ChatSession::new(backend.clone(), backend);
            session.switch_document(DocumentRef::new(document_id, title.clone()));
            run_chat(&session).await?;

            if let Some(dir) = export {
                match session.export_markdown(Local::now().date_naive()) {
                    Ok(markdown) => {
                        let path = dir.join(transcript::export_file_name(
                            &title,
                            Utc::now().timestamp_millis(),
                        ));
                        std::fs::write(&path, markdown)
                            .with_context(|| format!("Failed to write {}", path.display()))?;
                        println!("Transcript written to {}", path.display());
                    }
                    Err(e) => eprintln!("{}", e),
                }
            }
            session.close();
        }
        Command::History { output } => {
            let json = history::export_json(research_history.as_ref())?;
            let path = output
                .unwrap_or_else(|| PathBuf::from(history::export_file_name(Local::now().date_naive())));
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Research history written to {}", path.display());
        }
    }

    Ok(())
}

/// Block until every tracked job is matched or expired, or Ctrl-C.
///
/// Interrupted jobs stay in the snapshot and are picked up by the next run.
async fn wait_for_queue(orchestrator: &JobOrchestrator) {
    let mut queue_len = orchestrator.subscribe();
    loop {
        if *queue_len.borrow_and_update() == 0 {
            println!("All research jobs finished");
            return;
        }
        tokio::select! {
            changed = queue_len.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; active jobs will resume on the next run");
                return;
            }
        }
    }
}

async fn run_chat(session: &ChatSession) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut revisions = session.subscribe();
    let mut printed = 0;

    while let Some(line) = lines.next_line().await? {
        if session.ask(&line).await == AskOutcome::Ignored {
            continue;
        }

        while !session.input_enabled() {
            if revisions.changed().await.is_err() {
                break;
            }
        }

        let messages = session.messages();
        for msg in messages.iter().skip(printed) {
            if msg.role == MessageRole::Assistant {
                println!("{}\n", msg.content);
            }
        }
        printed = messages.len();
    }

    Ok(())
}
