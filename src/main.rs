use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use bankgen::config::{self, Config};
use bankgen::generate::ChatProvider;
use bankgen::models::TaskStatus;
use bankgen::normalize::ChunkMethod;
use bankgen::report::{self, ProgressMode};
use bankgen::store::BankStore;
use bankgen::task::{SubmitRequest, TaskCoordinator};

#[derive(Parser)]
#[command(name = "bankgen", about = "Generate question banks from study documents", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "bankgen.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config (if missing) and initialize the database
    Init,
    /// Generate a question bank from a document
    Generate {
        /// Document to process (.pdf, .docx, .doc)
        file: PathBuf,
        /// Owner id the bank belongs to
        #[arg(long)]
        owner: i64,
        /// Bank name
        #[arg(long)]
        name: String,
        /// Bank description
        #[arg(long, default_value = "")]
        description: String,
        /// Override the configured chunk size (characters)
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Override questions requested per chunk
        #[arg(long)]
        questions_per_chunk: Option<usize>,
        /// Override the chunking method
        #[arg(long, value_enum)]
        method: Option<ChunkMethod>,
        /// Progress output mode
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },
    /// List question banks for an owner
    Banks {
        #[arg(long)]
        owner: i64,
    },
}

const STARTER_CONFIG: &str = r#"[db]
path = "bankgen.sqlite"

[chunking]
chunk_size = 800
overlap = 100
method = "recursive"

[generation]
model = "deepseek-chat"
questions_per_chunk = 2
"#;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bankgen=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => init(&cli.config).await,
        Commands::Generate {
            file,
            owner,
            name,
            description,
            chunk_size,
            questions_per_chunk,
            method,
            progress,
        } => {
            let config = load(&cli.config)?;
            generate(
                config,
                file,
                owner,
                name,
                description,
                chunk_size,
                questions_per_chunk,
                method,
                progress.unwrap_or_else(ProgressMode::default_for_tty),
            )
            .await
        }
        Commands::Banks { owner } => {
            let config = load(&cli.config)?;
            banks(config, owner).await
        }
    }
}

fn load(path: &PathBuf) -> Result<Config> {
    config::load_config(path)
}

async fn init(config_path: &PathBuf) -> Result<()> {
    if !config_path.exists() {
        std::fs::write(config_path, STARTER_CONFIG)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Wrote starter config to {}", config_path.display());
    }
    let config = load(config_path)?;
    let pool = bankgen::db::connect(&config).await?;
    bankgen::migrate::run_migrations(&pool).await?;
    println!("Database ready at {}", config.db.path.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn generate(
    config: Config,
    file: PathBuf,
    owner: i64,
    name: String,
    description: String,
    chunk_size: Option<usize>,
    questions_per_chunk: Option<usize>,
    method: Option<ChunkMethod>,
    progress_mode: ProgressMode,
) -> Result<()> {
    let bytes = std::fs::read(&file)
        .with_context(|| format!("Failed to read document: {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let pool = bankgen::db::connect(&config).await?;
    bankgen::migrate::run_migrations(&pool).await?;
    let store = Arc::new(BankStore::new(pool));
    let provider = Arc::new(ChatProvider::new(&config.generation)?);
    let coordinator = TaskCoordinator::new(config, store, provider);

    let task_id = coordinator
        .submit(SubmitRequest {
            file_name,
            bytes,
            owner,
            bank_name: name,
            description,
            chunk_size,
            questions_per_chunk,
            method,
        })
        .await?;

    let mut reporter = report::reporter(progress_mode);
    let (_, notify) = coordinator.progress().subscribe(&task_id)?;
    let mut offset = 0usize;
    loop {
        // Register the waiter before reading, so an append between the read
        // and the await still wakes us.
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let (events, next) = coordinator.progress().events_since(&task_id, offset)?;
        offset = next;
        let mut terminal: Option<TaskStatus> = None;
        for event in &events {
            reporter.report(event);
            if event.status.is_terminal() {
                terminal = Some(event.status);
                if event.status == TaskStatus::Completed {
                    if let Some(details) = &event.details {
                        println!("{}", serde_json::to_string_pretty(details)?);
                    }
                } else {
                    anyhow::bail!("task ended with status {}: {}", event.status.as_str(), event.message);
                }
            }
        }
        if terminal.is_some() {
            break;
        }
        notified.await;
    }

    Ok(())
}

async fn banks(config: Config, owner: i64) -> Result<()> {
    let pool = bankgen::db::connect(&config).await?;
    bankgen::migrate::run_migrations(&pool).await?;
    let store = BankStore::new(pool);
    let banks = store.list_banks(owner).await?;
    if banks.is_empty() {
        println!("No banks for owner {}", owner);
        return Ok(());
    }
    for bank in banks {
        println!(
            "{}  {:<30} {:>4} questions  {}  {}",
            bank.id,
            bank.name,
            bank.question_count,
            bank.status.as_str(),
            bank.source_file
        );
    }
    Ok(())
}
