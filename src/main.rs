use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pipeline_healer::{
    cli::{execute_command, HealCommands},
    config::{Config, LogFormat},
    events::{write_ndjson, ChannelPublisher, PipelineEventConsumer},
    healing::{generator, FixExecutor, HealingOrchestrator, KnowledgeBase},
    scm::GitHubClient,
    storage::SqliteStorage,
};

/// Self-healing CI engine.
#[derive(Parser)]
#[command(name = "pipeline-healer")]
#[command(about = "Classify failed CI runs, propose fixes and apply them")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume pipeline events (one JSON object per line) and heal failures.
    ///
    /// Healing and security events are written to stdout as JSON lines.
    Serve {
        /// Read events from a file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,

        /// Apply confident fixes without waiting for approval
        #[arg(long)]
        auto_apply: bool,
    },

    #[command(flatten)]
    Control(HealCommands),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    match cli.command {
        Commands::Serve { input, auto_apply } => {
            if auto_apply {
                config.healing.auto_apply = true;
            }
            let publisher = Arc::new(ChannelPublisher::default());
            let orchestrator = Arc::new(build_orchestrator(&config, storage, publisher.clone()));
            serve(&config, orchestrator, publisher, input).await
        }
        Commands::Control(command) => {
            let publisher = Arc::new(ChannelPublisher::default());
            let orchestrator = build_orchestrator(&config, storage, publisher);
            let result = execute_command(command, &orchestrator).await;
            if result.exit_code == 0 {
                print!("{}", result.message);
            } else {
                eprint!("{}", result.message);
            }
            std::process::exit(result.exit_code);
        }
    }
}

fn build_orchestrator(
    config: &Config,
    storage: SqliteStorage,
    publisher: Arc<ChannelPublisher>,
) -> HealingOrchestrator {
    let knowledge = KnowledgeBase::new(storage.pool().clone(), config.knowledge.clone());
    let mut orchestrator = HealingOrchestrator::new(
        Arc::new(storage),
        knowledge,
        generator::from_config(config),
        publisher,
        config.healing.clone(),
    );

    match GitHubClient::new(&config.scm, &config.request) {
        Ok(client) => {
            info!(base_url = %config.scm.base_url, "Source hosting client initialized");
            orchestrator = orchestrator.with_executor(FixExecutor::new(
                Arc::new(client),
                config.healing.base_branch.clone(),
            ));
        }
        Err(e) => warn!(error = %e, "Fix application disabled"),
    }

    orchestrator
}

async fn serve(
    config: &Config,
    orchestrator: Arc<HealingOrchestrator>,
    publisher: Arc<ChannelPublisher>,
    input: Option<PathBuf>,
) -> anyhow::Result<()> {
    let writer = tokio::spawn(write_ndjson(publisher.subscribe(), tokio::io::stdout()));

    let consumer = PipelineEventConsumer::new(orchestrator, config.consumer.concurrency);
    info!(
        concurrency = config.consumer.concurrency,
        auto_apply = config.healing.auto_apply,
        "Consuming pipeline events"
    );

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(path) => Box::new(BufReader::new(tokio::fs::File::open(&path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let stats = match consumer.run(reader).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Event input failed");
            return Err(e.into());
        }
    };

    // Close the outbound stream so the writer drains and exits
    drop(consumer);
    drop(publisher);
    match writer.await {
        Ok(written) => info!(written, "Outbound event stream closed"),
        Err(e) => error!(error = %e, "Outbound event writer panicked"),
    }

    info!(
        received = stats.received,
        dispatched = stats.dispatched,
        rejected = stats.rejected,
        failed = stats.failed,
        "Shutdown complete"
    );
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
