mod alignment;
mod config;
mod embed;
mod llm;
mod model;
mod pipeline;
mod purify;
mod retry;
mod store;

pub const USER_AGENT: &str = concat!("kgfuse/", env!("CARGO_PKG_VERSION"));

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reqwest::Client;
use tracing::info;

use config::{
    DEFAULT_BATCH_SIZE, DEFAULT_CHECKPOINT_BATCHES, DEFAULT_CONCURRENCY,
    DEFAULT_CONSISTENCY_THRESHOLD, DEFAULT_FLUSH_THRESHOLD, DEFAULT_RETRIEVAL_THRESHOLD,
    DEFAULT_SAMPLING_TIMES, DEFAULT_SAVE_INTERVAL, DEFAULT_TOP_K, DEFAULT_VERIFY_THRESHOLD,
    EmbedConfig, PurifyConfig, RetrievalConfig, VerificationConfig,
};
use llm::{EmbeddingClient, LlmClient};
use model::{Lang, LangPair};
use retry::{DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_RETRIES, RetryPolicy};
use store::CheckpointDir;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "kgfuse", version, about = "Cross-lingual entity alignment and triple purification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Embed an extracted entity list (`[{entity, types}]`) into `[{entity, type, vector}]`.
    Embed {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,
        #[command(flatten)]
        retry: RetryArgs,
    },

    /// Retrieve cross-lingual candidates from per-language entity collections.
    Retrieve {
        #[arg(long)]
        zh: Option<PathBuf>,
        #[arg(long)]
        vi: Option<PathBuf>,
        #[arg(long)]
        th: Option<PathBuf>,
        #[arg(long, value_delimiter = ',', default_values_t = LangPair::DEFAULTS)]
        pairs: Vec<LangPair>,
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
        #[arg(long, default_value_t = DEFAULT_RETRIEVAL_THRESHOLD)]
        threshold: f32,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Verify candidates with the oracle, checkpointing into OUT_DIR, then resolve clusters.
    Align {
        candidates: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long, value_delimiter = ',', default_values_t = LangPair::DEFAULTS)]
        pairs: Vec<LangPair>,
        #[arg(long, default_value_t = DEFAULT_VERIFY_THRESHOLD)]
        threshold: f32,
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        #[arg(long, default_value_t = DEFAULT_FLUSH_THRESHOLD)]
        flush_threshold: usize,
        /// Save progress after this many completed batches even if few pairs were found.
        #[arg(long, default_value_t = DEFAULT_CHECKPOINT_BATCHES)]
        checkpoint_batches: usize,
        #[command(flatten)]
        retry: RetryArgs,
    },

    /// Rebuild clusters.json from the verified batches in OUT_DIR.
    Resolve {
        #[arg(long)]
        out_dir: PathBuf,
    },

    /// Purify extracted entities and triples by self-consistency voting.
    Purify {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_SAMPLING_TIMES)]
        sampling_times: usize,
        #[arg(long, default_value_t = DEFAULT_CONSISTENCY_THRESHOLD)]
        consistency_threshold: usize,
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,
        #[arg(long, default_value_t = DEFAULT_SAVE_INTERVAL)]
        save_interval: usize,
        #[command(flatten)]
        retry: RetryArgs,
    },
}

#[derive(Args)]
struct RetryArgs {
    /// Extra attempts after the first failed oracle call.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,
    /// Per-attempt timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_ATTEMPT_TIMEOUT.as_secs())]
    timeout_secs: u64,
}

impl RetryArgs {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            attempt_timeout: Duration::from_secs(self.timeout_secs),
            ..Default::default()
        }
    }
}

fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(HTTP_TIMEOUT)
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kgfuse=info".parse()?),
        )
        .init();

    match Cli::parse().command {
        Command::Embed {
            input,
            output,
            concurrency,
            retry,
        } => {
            let config = EmbedConfig {
                concurrency,
                retry: retry.policy(),
            };
            config.validate()?;
            let oracle = EmbeddingClient::from_env(http_client()?)?;
            pipeline::run_embed(&oracle, &config, &input, &output).await?;
        }

        Command::Retrieve {
            zh,
            vi,
            th,
            pairs,
            top_k,
            threshold,
            output,
        } => {
            let config = RetrievalConfig { top_k, threshold };
            config.validate()?;
            let collections: BTreeMap<Lang, PathBuf> = [(Lang::Zh, zh), (Lang::Vi, vi), (Lang::Th, th)]
                .into_iter()
                .filter_map(|(lang, path)| Some((lang, path?)))
                .collect();
            pipeline::run_retrieve(&collections, &pairs, &config, &output)?;
        }

        Command::Align {
            candidates,
            out_dir,
            pairs,
            threshold,
            concurrency,
            batch_size,
            flush_threshold,
            checkpoint_batches,
            retry,
        } => {
            let config = VerificationConfig {
                threshold,
                concurrency,
                batch_size,
                flush_threshold,
                checkpoint_batches,
                retry: retry.policy(),
                ..Default::default()
            };
            config.validate()?;
            let oracle = LlmClient::from_env(http_client()?)?;
            let store = CheckpointDir::open(out_dir)?;
            pipeline::run_align(&oracle, &config, &candidates, &pairs, &store).await?;
        }

        Command::Resolve { out_dir } => {
            let store = CheckpointDir::open(out_dir)?;
            pipeline::run_resolve(&store)?;
        }

        Command::Purify {
            input,
            output,
            sampling_times,
            consistency_threshold,
            concurrency,
            save_interval,
            retry,
        } => {
            let config = PurifyConfig {
                sampling_times,
                consistency_threshold,
                concurrency,
                save_interval,
                retry: retry.policy(),
                ..Default::default()
            };
            config.validate()?;
            let oracle = LlmClient::from_env(http_client()?)?;
            pipeline::run_purify(&oracle, &config, &input, &output).await?;
        }
    }

    info!("done");
    Ok(())
}
