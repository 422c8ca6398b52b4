//! # takeout-ingest
//!
//! Command-line interface for takeout-ingestor: ingest exports into the
//! local library, inspect and search it, and run the per-media query servers.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `setup` | Create the storage home, migrate, and verify the database |
//! | `list-ingestors` | Show available ingestors and their formats |
//! | `ingest <source>` | Ingest an export (auto-detected or `--type`) |
//! | `status` | Counts per media kind and recent ingestion runs |
//! | `search "<query>"` | Search the library |
//! | `get <id>` | Print a stored document and its chunks |
//! | `embed pending` | Backfill missing or stale embeddings |
//! | `serve <kind>` | Start the query server for one media kind |
//! | `mcp-config` | Print the `mcpServers` client configuration |
//! | `completions <shell>` | Generate shell completions |
//!
//! ## Examples
//!
//! ```bash
//! takeout-ingest setup
//! takeout-ingest ingest ./exports/conversations.json
//! takeout-ingest ingest ./takeout-20240501.zip --batch-size 50
//! takeout-ingest search "harbour festival" --media audio
//! takeout-ingest serve documents --port 9083
//! ```

use anyhow::bail;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use takeout_ingestor::config;
use takeout_ingestor::ingest::{self, IngestRequest};
use takeout_ingestor::models::MediaKind;
use takeout_ingestor::progress::ProgressMode;
use takeout_ingestor::search::SearchFilters;
use takeout_ingestor::{
    embed_cmd, get, ingestors, mcp_config, search, server, setup, stats,
};

/// Ingest personal data exports into a local multimedia library and serve it
/// to AI assistants.
///
/// Settings are read from `--config` when the file exists; otherwise the
/// built-in defaults apply. The storage home comes from `--home`, then
/// `$TAKEOUT_HOME` (also read from `.env`), then `[store].home`.
#[derive(Parser)]
#[command(
    name = "takeout-ingest",
    about = "Ingest personal data exports into a local multimedia library",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/takeout.toml")]
    config: PathBuf,

    /// Storage home directory (overrides the config file).
    #[arg(long, global = true, env = "TAKEOUT_HOME")]
    home: Option<PathBuf>,

    /// Progress output on stderr: `off`, `human`, or `json`.
    /// Defaults to `human` on a terminal, otherwise `off`.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the storage home, run migrations, and verify the database.
    ///
    /// Also reports whether the analysis API key and embeddings are set up.
    /// Exits non-zero when any step fails.
    Setup,

    /// List available ingestors.
    ListIngestors,

    /// Ingest an export file or directory.
    ///
    /// The ingestor is detected from the source unless `--type` is given.
    /// Re-ingesting unchanged records is a no-op.
    Ingest {
        /// Export file, archive, or directory.
        source: PathBuf,

        /// Ingestor name or alias (`claude`, `takeout`, `artifacts`).
        #[arg(short = 't', long = "type")]
        ingestor: Option<String>,

        /// Validate and parse only; report the record count and a sample.
        #[arg(long)]
        validate: bool,

        /// Records per batch (default from `[ingest].batch_size`).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show library counts per media kind and recent ingestion runs.
    Status,

    /// Search the library.
    Search {
        query: String,

        /// `keyword`, `semantic`, or `hybrid`. The latter two need embeddings.
        #[arg(long, default_value = "keyword")]
        mode: String,

        /// Restrict to one media kind (`documents`, `audio`, `video`, `images`).
        #[arg(long)]
        media: Option<String>,

        /// Restrict to one source (`claude`, `takeout`, `artifacts`, or a media kind).
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Print a document by id.
    Get { id: String },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Start the query server for one media kind.
    ///
    /// Audio, video, and image servers need the analysis API key.
    Serve {
        /// `documents`, `audio`, `video`, or `images`.
        kind: String,

        /// Port (default per kind: documents 8083, audio 8080, video 8081, images 8082).
        #[arg(long)]
        port: Option<u16>,

        /// Bind address (default from `[servers].host`).
        #[arg(long)]
        host: Option<String>,
    },

    /// Print the `mcpServers` configuration for assistant clients.
    McpConfig {
        /// Bridge command; `npx` runs `mcp-remote` through npx.
        #[arg(long)]
        bridge: Option<String>,

        /// Host the client should connect to.
        #[arg(long)]
        host: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing an embedding or whose text changed.
    Pending {
        /// Maximum number of chunks to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Texts per API call (default from `[embedding].batch_size`).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without embedding anything.
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // before parsing, so TAKEOUT_HOME from .env reaches --home
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    init_tracing(match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    });

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "takeout-ingest", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config, cli.home.as_deref())?;
    let progress = ProgressMode::parse(cli.progress.as_deref())?;

    match cli.command {
        Commands::Setup => {
            if !setup::run_setup(&cfg).await? {
                bail!("setup failed");
            }
        }
        Commands::ListIngestors => {
            ingestors::list_ingestors(&cfg);
        }
        Commands::Ingest {
            source,
            ingestor,
            validate,
            batch_size,
            json,
        } => {
            let request = IngestRequest {
                source: &source,
                ingestor: ingestor.as_deref(),
                validate_only: validate,
                batch_size,
            };
            let reporter = progress.reporter();
            ingest::run_ingest(&cfg, request, reporter.as_ref(), json).await?;
        }
        Commands::Status => {
            stats::run_status(&cfg).await?;
        }
        Commands::Search {
            query,
            mode,
            media,
            source,
            limit,
        } => {
            let filters = SearchFilters {
                media: media.as_deref().map(str::parse::<MediaKind>).transpose()?,
                source,
            };
            search::run_search(&cfg, &query, &mode, filters, limit).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
        },
        Commands::Serve { kind, port, host } => {
            let kind: MediaKind = kind.parse()?;
            server::run_server(&cfg, kind, host.as_deref(), port).await?;
        }
        Commands::McpConfig { bridge, host } => {
            mcp_config::run_mcp_config(&cfg, bridge.as_deref(), host.as_deref())?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
