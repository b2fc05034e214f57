//! Operator CLI: replay captured message logs into blocks, inspect stores,
//! and list scroll profiles.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use quill_chunker::{BlockBuilder, BlockBuilderConfig, FlushOptions};
use quill_core::StructuredMessage;
use quill_retrieval::ScrollProfileSet;
use quill_stream::{BlockStore, JsonlBlockStore};

#[derive(Debug, Parser)]
#[command(
    name = "quill",
    about = "Transcript collector tooling: replay captures into memory blocks",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a captured message log (one structured message per JSONL line)
    /// through the chunker and persist the resulting blocks.
    Replay {
        #[arg(long, help = "Input JSONL file of structured messages")]
        input: PathBuf,

        #[arg(
            long = "store-dir",
            default_value = ".quill/blocks",
            help = "Block store directory"
        )]
        store_dir: PathBuf,

        #[arg(long, help = "Session URL recorded on each block")]
        session: String,

        #[arg(long = "block-size", default_value_t = 5)]
        block_size: usize,

        #[arg(long, default_value_t = 2)]
        overlap: usize,

        #[arg(
            long = "exclude-narration",
            help = "Drop narration-only turns from persisted block content"
        )]
        exclude_narration: bool,

        #[arg(
            long = "skip-partial",
            help = "Do not emit a final short block from the trailing remainder"
        )]
        skip_partial: bool,
    },

    /// Print aggregate counters for a block store.
    Stats {
        #[arg(long = "store-dir", default_value = ".quill/blocks")]
        store_dir: PathBuf,
    },

    /// List the selectable scroll profiles.
    Profiles {
        #[arg(long, help = "Optional JSON override file")]
        file: Option<PathBuf>,
    },
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ReplaySummary {
    parsed_messages: usize,
    malformed_lines: usize,
    emitted_blocks: usize,
    saved_blocks: usize,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Replay {
            input,
            store_dir,
            session,
            block_size,
            overlap,
            exclude_narration,
            skip_partial,
        } => {
            let summary = run_replay(
                &input,
                &store_dir,
                &session,
                BlockBuilderConfig {
                    block_size,
                    overlap,
                    exclude_narration,
                },
                !skip_partial,
            )
            .await?;
            println!(
                "replay summary: parsed={} malformed={} emitted_blocks={} saved_blocks={}",
                summary.parsed_messages,
                summary.malformed_lines,
                summary.emitted_blocks,
                summary.saved_blocks
            );
        }
        Command::Stats { store_dir } => {
            let stats = JsonlBlockStore::new(store_dir).get_stats().await?;
            println!(
                "store stats: total_blocks={} total_messages={}",
                stats.total_blocks, stats.total_messages
            );
        }
        Command::Profiles { file } => {
            let mut profiles = ScrollProfileSet::builtin();
            if let Some(path) = file {
                let loaded = profiles.load_overrides(&path)?;
                println!("loaded {loaded} override profile(s)");
            }
            for name in profiles.names() {
                let resolved = profiles.resolve(&name)?;
                println!(
                    "{}: settle={}ms cycle_delay={}ms guard_limit={} max_stable_rounds={}",
                    resolved.profile.name,
                    resolved.profile.settle_timeout_ms,
                    resolved.profile.cycle_delay_ms,
                    resolved.profile.guard_limit,
                    resolved.profile.max_stable_rounds
                );
            }
        }
    }
    Ok(())
}

async fn run_replay(
    input: &std::path::Path,
    store_dir: &std::path::Path,
    session: &str,
    chunking: BlockBuilderConfig,
    include_partial: bool,
) -> Result<ReplaySummary> {
    let raw = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;

    let mut summary = ReplaySummary::default();
    let mut chunker = BlockBuilder::new(chunking);
    chunker.set_session_url(Some(session.to_string()));

    let mut blocks = Vec::new();
    for (line_number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StructuredMessage>(line) {
            Ok(message) => {
                summary.parsed_messages = summary.parsed_messages.saturating_add(1);
                blocks.extend(chunker.append_many(vec![message])?);
            }
            Err(error) => {
                summary.malformed_lines = summary.malformed_lines.saturating_add(1);
                tracing::warn!(
                    line = line_number.saturating_add(1),
                    error = %error,
                    "skipping malformed message line"
                );
            }
        }
    }
    blocks.extend(chunker.flush(FlushOptions { include_partial })?);
    summary.emitted_blocks = blocks.len();

    let store = JsonlBlockStore::new(store_dir);
    for block in &blocks {
        store.save(block).await?;
        summary.saved_blocks = summary.saved_blocks.saturating_add(1);
    }
    Ok(summary)
}
