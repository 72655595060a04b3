use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use judge_runner::cache::{sweep_dir, ArtifactCache};
use judge_runner::config::RunnerConfig;
use judge_runner::node::Node;
use judge_runner::queue::{QueueClient, RedisStore};
use judge_runner::shutdown::install_shutdown_handler;
use judge_runner::task::{Job, StatusUpdate};

#[derive(Parser, Debug)]
#[command(name = "judge-runner")]
#[command(version)]
#[command(about = "Queue-driven code judging worker")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a runner and process jobs until SIGTERM/SIGINT
    Run(RunArgs),

    /// Drive the queue protocol from the scheduler's side
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Inspect or maintain the local artifact cache
    Cache {
        /// Runner configuration file (YAML)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        #[command(subcommand)]
        command: CacheCommands,
    },
}

// =============================================================================
// Arguments
// =============================================================================

/// Overrides applied on top of the configuration file.
#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Runner configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Numeric runner id
    #[arg(long)]
    runner_id: Option<u64>,

    /// Runner group
    #[arg(long)]
    group: Option<String>,

    /// Queue store URL, e.g. redis://127.0.0.1:6379/0
    #[arg(long)]
    queue_url: Option<String>,
}

impl ConfigArgs {
    fn load(&self) -> Result<RunnerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => RunnerConfig::load(path)?,
            None => RunnerConfig::default(),
        };
        if let Some(id) = self.runner_id {
            config.id = id;
        }
        if let Some(group) = &self.group {
            config.group = group.clone();
        }
        if let Some(url) = &self.queue_url {
            config.queue.url = url.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Store a job payload and push its id onto the pending queue
    Enqueue {
        /// Job id
        job_id: String,
        /// Path to the job JSON
        payload: PathBuf,
    },
    /// Ask the runner holding a job to abort it
    Abort {
        /// Job id
        job_id: String,
    },
    /// Show the progress reported for a job
    Status {
        /// Job id
        job_id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum CacheCommands {
    /// Make sure an artifact is cached and print its local path
    Fetch {
        /// Artifact URL
        url: String,
    },
    /// Run one eviction pass now
    Sweep {
        /// Override the configured maximum age
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct EnqueueOutput {
    job_id: String,
    pending: String,
}

#[derive(Serialize)]
struct StatusOutput {
    job_id: String,
    updates: Vec<StatusUpdate>,
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(log_file: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn log_file(config: &RunnerConfig) -> Option<PathBuf> {
    config
        .log_dir
        .as_ref()
        .map(|dir| dir.join(format!("runner-{}.log", config.id)))
}

// =============================================================================
// Runner
// =============================================================================

async fn run_runner(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.config.load()?;
    init_logging(log_file(&config))?;

    tracing::info!(
        runner_id = config.id,
        group = %config.group,
        working_dir = %config.working_dir.display(),
        cache_dir = %config.cache_dir.display(),
        "Starting judge runner"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::connect(config).await?;
    node.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn connect_client(config: &RunnerConfig) -> Result<QueueClient, Box<dyn std::error::Error>> {
    let store = RedisStore::connect(&config.queue.url, config.queue_response_timeout()).await?;
    Ok(QueueClient::new(Arc::new(store), config))
}

async fn handle_job_enqueue(
    client: &QueueClient,
    job_id: String,
    payload: &Path,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(payload).await?;
    let job = Job::from_json(&raw)?;
    client.enqueue(&job_id, &job).await?;

    match output_format {
        OutputFormat::Json => {
            let output = EnqueueOutput {
                job_id,
                pending: client.names().pending(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job enqueued.");
            println!("Job ID:  {}", job_id);
            println!("Lane:    {}", job.lane.name());
            println!("Cases:   {}", job.testcases.len());
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &QueueClient,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let updates = client.progress(&job_id).await?;

    match output_format {
        OutputFormat::Json => {
            let output = StatusOutput { job_id, updates };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID: {}", job_id);
            if updates.is_empty() {
                println!("No progress reported.");
                return Ok(());
            }
            for update in &updates {
                match update {
                    StatusUpdate::Started => println!("Started"),
                    StatusUpdate::Error { message } => {
                        println!("Error:");
                        for line in message.lines() {
                            println!("  {}", line);
                        }
                    }
                    StatusUpdate::Done { result } => {
                        println!("Status: {}", result.status);
                        println!("Score:  {}", result.score);
                        if result.resource_usage.time_msecs >= 0 {
                            println!(
                                "Peak:   {} ms, {} KiB",
                                result.resource_usage.time_msecs,
                                result.resource_usage.memory_bytes.max(0) / 1024
                            );
                        }
                        if let Some(message) = &result.message {
                            println!("Message:");
                            for line in message.lines() {
                                println!("  {}", line);
                            }
                        }
                        if !result.testpoints.is_empty() {
                            println!();
                            println!("{:<12} {:<24} {:>8} {:>10}", "CASE", "STATUS", "SCORE", "TIME(ms)");
                            println!("{}", "-".repeat(57));
                            for point in &result.testpoints {
                                let time = point
                                    .resource_usage
                                    .map(|u| u.time_msecs.to_string())
                                    .unwrap_or_else(|| "-".to_string());
                                println!(
                                    "{:<12} {:<24} {:>8} {:>10}",
                                    point.id,
                                    point.status.to_string(),
                                    point.score,
                                    time
                                );
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_cache(
    config: RunnerConfig,
    command: CacheCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        CacheCommands::Fetch { url } => {
            let cache = ArtifactCache::new(&config.cache_dir)?;
            let cached = cache.ensure_cached(&url).await?;
            println!("{}  {}", cached.path.display(), cached.filename);
        }
        CacheCommands::Sweep { max_age_secs } => {
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.cache_max_age());
            let report = sweep_dir(&config.cache_dir, max_age, SystemTime::now())?;
            println!(
                "Scanned {} files, removed {}",
                report.scanned, report.removed
            );
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_runner(run_args).await?;
        }
        Commands::Job { client, command } => {
            init_logging(None)?;
            let config = client.config.load()?;
            let queue = connect_client(&config).await?;

            match command {
                JobCommands::Enqueue { job_id, payload } => {
                    handle_job_enqueue(&queue, job_id, &payload, &client.output).await?;
                }
                JobCommands::Abort { job_id } => {
                    queue.request_abort(&job_id).await?;
                    println!("Abort requested for job {}", job_id);
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&queue, job_id, &client.output).await?;
                }
            }
        }
        Commands::Cache { config, command } => {
            init_logging(None)?;
            let config = match config {
                Some(path) => RunnerConfig::load(&path)?,
                None => RunnerConfig::default(),
            };
            handle_cache(config, command).await?;
        }
    }

    Ok(())
}
