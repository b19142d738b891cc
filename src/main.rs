//! # Conversation ingestion CLI (`convo`)
//!
//! The `convo` binary ingests AI coding-assistant conversation logs from
//! watched directories, one-shot uploads, and remote collectors.
//!
//! ## Usage
//!
//! ```bash
//! convo --config ./config/convo.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `convo init` | Create the SQLite database and run schema migrations |
//! | `convo ingest <file>` | Ingest one log file |
//! | `convo watch add/list/remove/start/stop` | Manage watch configurations |
//! | `convo watch run` | Run the watch scheduler until Ctrl-C |
//! | `convo jobs` | Show ingestion job history |
//! | `convo collector register` | Register a collector and print its API key |
//! | `convo push <file>` | Push a log file to a server as a collector |
//! | `convo serve` | Start the collector HTTP server (and the watch scheduler) |
//!
//! ## Examples
//!
//! ```bash
//! convo init
//! convo watch add ~/.claude/projects --auto-tag
//! convo watch start <id>
//! convo serve
//!
//! # On another machine
//! convo push session.jsonl --server http://host:7340 --api-key cik_...
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use convo_ingest::collector::protocol::RegisterRequest;
use convo_ingest::collector_cmd::{self, PushOptions};
use convo_ingest::config::{self, Config};
use convo_ingest::logging::init_logging;
use convo_ingest::models::{JobStatus, UpdateMode};
use convo_ingest::{ingest, jobs, migrate, server, watch_cmd};

/// Ingest AI coding-assistant conversation logs into a deduplicated store.
///
/// All commands except `push` read a TOML configuration file given by
/// `--config`. See `config/convo.example.toml` for every option.
#[derive(Parser)]
#[command(name = "convo", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/convo.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest one conversation log file.
    ///
    /// Always a full parse. A file already ingested unchanged, through this
    /// command or a watch, is reported as a duplicate.
    Ingest {
        file: PathBuf,

        /// What to do when the conversation already exists with different
        /// content: `skip`, `replace` or `append`. Defaults to
        /// `[ingest].update_mode`.
        #[arg(long)]
        mode: Option<UpdateMode>,
    },

    /// Manage watched directories.
    Watch {
        #[command(subcommand)]
        action: WatchAction,
    },

    /// Show ingestion job history, newest first.
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: i64,

        /// Only jobs with this status.
        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Collector administration.
    Collector {
        #[command(subcommand)]
        action: CollectorAction,
    },

    /// Act as a remote collector: parse a log file and push it to a server.
    Push {
        file: PathBuf,

        /// Server base URL, e.g. `http://127.0.0.1:7340`.
        #[arg(long)]
        server: String,

        /// API key returned at registration.
        #[arg(long, env = "CONVO_API_KEY")]
        api_key: String,

        /// Session id; defaults to the log's own session id or file name.
        #[arg(long)]
        session: Option<String>,

        /// Workspace the collector is scoped to; checked by the server.
        #[arg(long)]
        workspace: Option<String>,

        /// Do not send `session_end`, so a longer log can be pushed later.
        #[arg(long)]
        keep_open: bool,

        #[arg(long, default_value_t = 100)]
        batch_size: usize,
    },

    /// Start the collector HTTP server.
    ///
    /// Binds to `[server].bind`. Unless `--no-watch` is given, also runs
    /// the watch scheduler for every active configuration.
    Serve {
        #[arg(long)]
        no_watch: bool,
    },
}

#[derive(Subcommand)]
enum WatchAction {
    /// Add a directory to watch (inactive until started).
    Add {
        dir: PathBuf,

        /// Flag conversations created from this directory for tagging.
        #[arg(long)]
        auto_tag: bool,
    },
    /// List watch configurations with their stats.
    List,
    /// Remove an inactive watch configuration.
    Remove { id: String },
    /// Mark a configuration active.
    Start { id: String },
    /// Mark a configuration inactive.
    Stop { id: String },
    /// Run the scheduler for all active configurations until Ctrl-C.
    Run,
}

#[derive(Subcommand)]
enum CollectorAction {
    /// Register a collector and print its one-time API key.
    Register {
        #[arg(long)]
        workspace: String,
        #[arg(long = "type")]
        collector_type: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        hostname: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // `push` talks to a remote server and needs no local config.
    let command = match cli.command {
        Commands::Push {
            file,
            server,
            api_key,
            session,
            workspace,
            keep_open,
            batch_size,
        } => {
            let log = config::load_config(&cli.config)
                .map(|c| c.logging)
                .unwrap_or_default();
            init_logging(&log)?;
            return collector_cmd::run_push(
                &file,
                PushOptions {
                    server: &server,
                    api_key: &api_key,
                    session: session.as_deref(),
                    workspace: workspace.as_deref(),
                    keep_open,
                    batch_size,
                },
            )
            .await;
        }
        command => command,
    };

    let cfg: Config = config::load_config(&cli.config)?;
    init_logging(&cfg.logging)?;

    match command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
        }
        Commands::Ingest { file, mode } => {
            ingest::run_ingest(&cfg, &file, mode).await?;
        }
        Commands::Watch { action } => match action {
            WatchAction::Add { dir, auto_tag } => {
                watch_cmd::run_watch_add(&cfg, &dir, auto_tag).await?;
            }
            WatchAction::List => watch_cmd::run_watch_list(&cfg).await?,
            WatchAction::Remove { id } => watch_cmd::run_watch_remove(&cfg, &id).await?,
            WatchAction::Start { id } => watch_cmd::run_watch_set_active(&cfg, &id, true).await?,
            WatchAction::Stop { id } => watch_cmd::run_watch_set_active(&cfg, &id, false).await?,
            WatchAction::Run => watch_cmd::run_watch_run(&cfg).await?,
        },
        Commands::Jobs { limit, status } => {
            jobs::run_jobs(&cfg, limit, status).await?;
        }
        Commands::Collector { action } => match action {
            CollectorAction::Register {
                workspace,
                collector_type,
                version,
                hostname,
            } => {
                collector_cmd::run_register(
                    &cfg,
                    RegisterRequest {
                        workspace_id: workspace,
                        collector_type,
                        version,
                        hostname,
                    },
                )
                .await?;
            }
        },
        Commands::Push { .. } => {}
        Commands::Serve { no_watch } => {
            server::run_server(&cfg, !no_watch).await?;
        }
    }

    Ok(())
}
