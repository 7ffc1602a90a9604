//! # Ethos CLI (`ethos`)
//!
//! Operator tool for the Ethos chat-history assistant: capture a Slack
//! workspace, build the vector index, and query it.
//!
//! ## Usage
//!
//! ```bash
//! ethos --config ./config/ethos.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ethos fetch` | Capture channel history and threads into the message file |
//! | `ethos index` | Group, chunk and embed the message file into the index |
//! | `ethos search "<query>"` | Show ranked chunks without calling the LLM |
//! | `ethos ask "<question>"` | Answer a question with sources and confidence |
//! | `ethos stats` | Summarize the persisted index |
//! | `ethos channels` | List indexed channel names |
//!
//! ## Examples
//!
//! ```bash
//! # Capture two channels, at most 500 messages each
//! ethos fetch --channel general --channel dev-team --limit 500
//!
//! # Build the index with JSON progress on stderr
//! ethos index --progress json
//!
//! # Ask, restricted to channels whose name contains "dev"
//! ethos ask "when is the next deploy?" --channel dev
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use ethos::config;
use ethos::progress::ProgressMode;
use ethos::{answer, ingest, logging, search, slack, stats};

/// Ethos: answers from your team's chat history.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ethos.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ethos",
    about = "Ethos: grounded answers from your team's chat history",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ethos.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProgressArg {
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Capture messages from Slack into the configured message file.
    ///
    /// Reads the bot token from the variable named by `[slack] token_env`.
    Fetch {
        /// Channel name or id to capture (repeatable). Defaults to `[slack] channels`,
        /// or every visible channel when that is empty.
        #[arg(long = "channel")]
        channels: Vec<String>,

        /// Maximum messages per channel, not counting thread replies.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Build the vector index from the message file.
    ///
    /// Rebuilds from scratch; the previous index is replaced only when the
    /// new one has been written successfully.
    Index {
        /// Progress output on stderr.
        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressArg,
    },

    /// Search the index and print ranked chunks.
    Search {
        query: String,

        /// Only keep channels whose name contains this text (case-insensitive).
        #[arg(long)]
        channel: Option<String>,

        /// Number of results. Defaults to `[retrieval] top_k`.
        #[arg(long)]
        limit: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Answer a question from the indexed history.
    Ask {
        question: String,

        /// Only use channels whose name contains this text (case-insensitive).
        #[arg(long)]
        channel: Option<String>,

        /// Number of chunks to retrieve. Defaults to `[retrieval] top_k`.
        #[arg(long)]
        k: Option<usize>,

        /// Abandon the question after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the answer as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics.
    Stats,

    /// List channel names present in the index.
    Channels,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(cli.verbose, &cfg.log.level);

    match cli.command {
        Commands::Fetch { channels, limit } => {
            slack::run_fetch(&cfg, &channels, limit).await?;
        }
        Commands::Index { progress } => {
            let reporter = progress.mode().reporter();
            ingest::run_index(&cfg, reporter.as_ref()).await?;
        }
        Commands::Search {
            query,
            channel,
            limit,
            json,
        } => {
            search::run_search(&cfg, &query, channel.as_deref(), limit, json).await?;
        }
        Commands::Ask {
            question,
            channel,
            k,
            timeout,
            json,
        } => {
            let timeout = timeout.map(Duration::from_secs);
            answer::run_ask(&cfg, &question, k, channel.as_deref(), timeout, json).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Channels => {
            stats::run_channels(&cfg).await?;
        }
    }

    Ok(())
}
