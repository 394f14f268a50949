use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::EnvFilter;

use capturekeep::cli::{capture, content, logs, process, queue};
use capturekeep::config::{parse_days, parse_hours, Config};
use capturekeep::model::{Priority, UserContext};
use capturekeep::pipeline::Pipeline;
use capturekeep::store::ContentStore;

#[derive(Parser)]
#[command(name = "capturekeep")]
#[command(about = "Capture links, notes and files, then ingest them in the background")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "capturekeep.yaml", global = true)]
    config: String,

    /// More log output (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture something for later processing
    Capture {
        #[command(subcommand)]
        command: CaptureCommands,
    },

    /// Inspect and operate the processing queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Run the worker pool
    Process {
        /// Drain the items ready now and exit
        #[arg(long)]
        once: bool,

        /// Number of concurrent workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Print the canonical form and content UID of a URL
    Canonicalize {
        url: String,
    },

    /// Browse ingested content
    Content {
        #[command(subcommand)]
        command: ContentCommands,
    },

    /// Failure log maintenance
    Logs {
        #[command(subcommand)]
        command: LogsCommands,
    },
}

/// Client context attached to a capture
#[derive(Args)]
struct ContextArgs {
    /// Free-form note
    #[arg(short, long)]
    note: Option<String>,

    /// Device the capture came from
    #[arg(long)]
    device: Option<String>,

    /// Where the capture happened
    #[arg(long)]
    location: Option<String>,

    /// critical, high, medium or low
    #[arg(short, long)]
    priority: Option<Priority>,

    /// Tag (repeatable)
    #[arg(short, long = "tag")]
    tags: Vec<String>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

impl ContextArgs {
    fn user_context(&self) -> UserContext {
        UserContext {
            notes: self.note.clone(),
            device: self.device.clone(),
            location: self.location.clone(),
            priority: self.priority,
            tags: self.tags.clone(),
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum CaptureCommands {
    /// Capture a URL
    Url {
        url: String,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Capture a text note
    Text {
        text: String,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Capture a file (copied, the original is left alone)
    File {
        path: PathBuf,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Show one capture
    Status {
        capture_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List recent captures
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Add an item by hand
    Add {
        capture_id: String,
        /// Item type (url, text, file, ...)
        #[arg(short = 't', long = "type")]
        item_type: String,
        /// URL or payload path handed to the handler
        #[arg(short, long)]
        source: String,
        #[arg(short, long, default_value = "medium")]
        priority: Priority,
    },
    /// Claim the next ready item
    Next {
        /// Only claim these item types
        #[arg(short = 't', long = "type")]
        item_types: Vec<String>,
        #[arg(long, default_value = "cli")]
        processor_id: String,
    },
    /// Mark a claimed item completed
    Complete {
        capture_id: String,
        /// Result artifact as KIND=PATH (repeatable)
        #[arg(short, long = "result")]
        results: Vec<String>,
    },
    /// Record a failed attempt for a claimed item
    Fail {
        capture_id: String,
        error: String,
    },
    /// Queue statistics
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Fail items stuck in processing
    Cleanup {
        /// Defaults to queue.stale_item_hours
        #[arg(long, value_parser = parse_hours)]
        max_age_hours: Option<f64>,
    },
    /// Give up on a pending or retrying item
    Abandon {
        capture_id: String,
        #[arg(short, long, default_value = "abandoned by operator")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum ContentCommands {
    /// List stored content, newest first
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum LogsCommands {
    /// Show recent failures
    Failures {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Drop log entries past retention
    Cleanup {
        /// Defaults to notifier.log_retention_days
        #[arg(long, value_parser = parse_days)]
        days: Option<i64>,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::WARN,
        (false, 1) => Level::INFO,
        (false, 2) => Level::DEBUG,
        _ => Level::TRACE,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();

    let _ = set_global_default(subscriber);
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    // Load config
    let config = Config::load(&cli.config)?;

    if let Commands::Canonicalize { url } = &cli.command {
        return content::canonical(url);
    }

    let pipeline = Pipeline::open(&config).context("Failed to open processing queue")?;

    match cli.command {
        Commands::Capture { command } => match command {
            CaptureCommands::Url { url, context } => {
                capture::url(&pipeline, &url, context.user_context(), context.json)?;
            }
            CaptureCommands::Text { text, context } => {
                capture::text(&pipeline, &text, context.user_context(), context.json)?;
            }
            CaptureCommands::File { path, context } => {
                capture::file(&pipeline, &path, context.user_context(), context.json)?;
            }
            CaptureCommands::Status { capture_id, json } => {
                capture::status(pipeline.capture(), &capture_id, json)?;
            }
            CaptureCommands::List { limit } => {
                capture::list(pipeline.capture(), limit)?;
            }
        },
        Commands::Queue { command } => {
            let q = pipeline.queue();
            match command {
                QueueCommands::Add {
                    capture_id,
                    item_type,
                    source,
                    priority,
                } => {
                    queue::add(q, capture_id, item_type, source, priority)?;
                }
                QueueCommands::Next {
                    item_types,
                    processor_id,
                } => {
                    queue::next(q, item_types, &processor_id)?;
                }
                QueueCommands::Complete {
                    capture_id,
                    results,
                } => {
                    queue::complete(q, &capture_id, results)?;
                }
                QueueCommands::Fail { capture_id, error } => {
                    queue::fail(q, &capture_id, &error)?;
                }
                QueueCommands::Status { json } => {
                    queue::status(q, json)?;
                }
                QueueCommands::Cleanup { max_age_hours } => {
                    queue::cleanup(q, max_age_hours.unwrap_or(config.queue.stale_item_hours))?;
                }
                QueueCommands::Abandon { capture_id, reason } => {
                    queue::abandon(q, &capture_id, &reason)?;
                }
            }
        }
        Commands::Process { once, workers } => {
            process::run(&config, &pipeline, once, workers)?;
        }
        Commands::Content { command } => match command {
            ContentCommands::List { limit } => {
                let store = ContentStore::open(&config.storage.content_db_path())?;
                content::list(&store, limit)?;
            }
        },
        Commands::Logs { command } => match command {
            LogsCommands::Failures { limit } => {
                logs::failures(pipeline.notifier(), limit)?;
            }
            LogsCommands::Cleanup { days } => {
                logs::cleanup(
                    pipeline.notifier(),
                    days.unwrap_or(config.notifier.log_retention_days),
                )?;
            }
        },
        Commands::Canonicalize { .. } => {}
    }

    Ok(())
}
