//! Simulated-chain driver for the sync engine.
//!
//! Serves a deterministic chain (optionally forking mid-range) through the
//! `Helper` seam, checks ordering invariants in the `Handler`, and reports
//! throughput when the run completes.

use async_trait::async_trait;
use chain_syncer::concurrency::SMALL_CACHE_SIZE;
use chain_syncer::{
    Block, BlockIdentifier, FetchError, Handler, Helper, NetworkIdentifier, NetworkStatus, Syncer,
    SyncerConfig,
};
use clap::{ArgAction, Parser};
use eyre::Result;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Simulation configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "chain-syncer-harness", about = "Simulated-chain driver for the sync engine")]
struct HarnessConfig {
    /// Height of the simulated chain tip.
    #[arg(long, default_value_t = 10_000)]
    tip: i64,
    /// Index at which the simulated chain forks.
    #[arg(long)]
    fork_at: Option<i64>,
    /// Depth of the simulated reorganization.
    #[arg(long, default_value_t = 10)]
    fork_depth: i64,
    /// Omit every Nth block from the simulated chain.
    #[arg(long)]
    omit_every: Option<i64>,
    /// Bytes of opaque payload per block.
    #[arg(long, default_value_t = 256)]
    payload_bytes: usize,
    /// Simulated per-fetch latency in microseconds.
    #[arg(long, default_value_t = 200)]
    fetch_latency_us: u64,
    /// In-flight cache budget in bytes.
    #[arg(long, default_value_t = SMALL_CACHE_SIZE)]
    cache_size: usize,
    /// Fetcher pool ceiling.
    #[arg(long, default_value_t = 64)]
    max_concurrency: i64,
    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', action = ArgAction::Count)]
    verbosity: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = HarnessConfig::parse();
    init_tracing(config.verbosity);

    info!(
        tip = config.tip,
        fork_at = ?config.fork_at,
        fork_depth = config.fork_depth,
        payload_bytes = config.payload_bytes,
        max_concurrency = config.max_concurrency,
        "starting sync simulation"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("shutdown signal received; canceling sync");
                cancel.cancel();
            }
        }
    });

    let progress = if std::io::stderr().is_terminal() {
        let bar = ProgressBar::new(config.tip.max(0) as u64 + 1);
        bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        let style = ProgressStyle::with_template(
            "{bar:40.cyan/blue} {pos}/{len} | {elapsed_precise} | {msg}",
        )
        .expect("progress style");
        bar.set_style(style);
        bar.set_message("syncing");
        Some(bar)
    } else {
        None
    };

    let helper = Arc::new(SimulatedChain::new(&config));
    let handler = Arc::new(ChainVerifier::new(progress.clone()));

    let mut syncer = Syncer::new(
        NetworkIdentifier::new("simulated", "main"),
        Arc::clone(&helper),
        Arc::clone(&handler),
        cancel.clone(),
        SyncerConfig {
            cache_size: config.cache_size,
            max_concurrency: config.max_concurrency,
            ..SyncerConfig::default()
        },
    );

    let started = Instant::now();
    let result = syncer.sync(-1, config.tip).await;
    let elapsed = started.elapsed();

    if let Some(bar) = progress.as_ref() {
        bar.finish_and_clear();
    }

    if let Err(err) = result {
        warn!(error = %err, "sync failed");
        return Err(err.into());
    }

    let added = handler.added();
    info!(
        blocks = added,
        removed = handler.removed(),
        fetches = helper.fetches(),
        reorged = helper.forked(),
        elapsed_ms = elapsed.as_millis() as u64,
        blocks_per_sec = ?rate_per_sec(added, elapsed),
        "sync simulation complete"
    );

    Ok(())
}

fn init_tracing(verbosity: u8) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let (global, local) = match verbosity {
                0 => ("warn", "info"),
                1 => ("warn", "debug"),
                _ => ("info", "trace"),
            };
            EnvFilter::new(format!(
                "{global},chain_syncer={local},chain_syncer_harness={local}"
            ))
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn rate_per_sec(count: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(count as f64 / secs)
    } else {
        None
    }
}

/// Deterministic chain served through the `Helper` seam.
///
/// Until the fork boundary is first requested, every index answers from
/// chain "a". The first fetch at or past the boundary flips the node onto
/// the fork, after which indices at or above `fork_at` answer from chain
/// "b"; the syncer then unwinds into the fork through parent mismatches.
struct SimulatedChain {
    tip: i64,
    fork_at: Option<i64>,
    fork_depth: i64,
    omit_every: Option<i64>,
    payload: String,
    fetch_latency: Duration,
    forked: AtomicBool,
    fetches: AtomicU64,
}

impl SimulatedChain {
    fn new(config: &HarnessConfig) -> Self {
        Self {
            tip: config.tip,
            // Forking at genesis would leave nothing to unwind into.
            fork_at: config.fork_at.filter(|at| *at > 0),
            fork_depth: config.fork_depth.max(1),
            omit_every: config.omit_every.filter(|n| *n > 1),
            payload: "x".repeat(config.payload_bytes),
            fetch_latency: Duration::from_micros(config.fetch_latency_us),
            forked: AtomicBool::new(false),
            fetches: AtomicU64::new(0),
        }
    }

    fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn forked(&self) -> bool {
        self.forked.load(Ordering::Relaxed)
    }

    /// First index that exists only on the fork chain.
    fn fork_boundary(&self) -> Option<i64> {
        self.fork_at.map(|at| at + self.fork_depth)
    }

    fn omitted(&self, index: i64) -> bool {
        match self.omit_every {
            Some(n) => index > 0 && index < self.tip && index % n == 0,
            None => false,
        }
    }

    /// Highest non-omitted index below `index`.
    fn parent_index(&self, index: i64) -> i64 {
        let mut parent = (index - 1).max(0);
        while parent > 0 && self.omitted(parent) {
            parent -= 1;
        }
        parent
    }

    fn hash_at(&self, index: i64, forked: bool) -> String {
        let on_fork = forked && self.fork_at.is_some_and(|at| index >= at);
        if on_fork {
            format!("fork {index}")
        } else {
            format!("block {index}")
        }
    }

    fn block_at(&self, index: i64, forked: bool) -> Block {
        let parent_index = self.parent_index(index);
        Block {
            block_identifier: BlockIdentifier::new(index, self.hash_at(index, forked)),
            parent_block_identifier: BlockIdentifier::new(
                parent_index,
                self.hash_at(parent_index, forked),
            ),
            timestamp: 1_600_000_000_000 + index,
            transactions: vec![serde_json::json!({ "filler": self.payload })],
        }
    }
}

#[async_trait]
impl Helper for SimulatedChain {
    async fn network_status(&self, _network: &NetworkIdentifier) -> Result<NetworkStatus> {
        let forked = self.forked.load(Ordering::Relaxed);
        Ok(NetworkStatus {
            current_block_identifier: self.block_at(self.tip, forked).block_identifier,
            genesis_block_identifier: self.block_at(0, false).block_identifier,
        })
    }

    async fn block(
        &self,
        _network: &NetworkIdentifier,
        index: i64,
    ) -> Result<Option<Block>, FetchError> {
        if self.fetch_latency > Duration::ZERO {
            tokio::time::sleep(self.fetch_latency).await;
        }
        self.fetches.fetch_add(1, Ordering::Relaxed);

        if index < 0 || index > self.tip {
            return Err(FetchError::Fatal(eyre::eyre!(
                "block {index} out of simulated range"
            )));
        }
        if self.omitted(index) {
            return Ok(None);
        }

        if let Some(boundary) = self.fork_boundary() {
            if index >= boundary {
                self.forked.store(true, Ordering::Relaxed);
            }
        }

        let forked = self.forked.load(Ordering::Relaxed);
        Ok(Some(self.block_at(index, forked)))
    }
}

/// Handler that checks ordering invariants as the sync runs: every added
/// block must chain onto the previous one and every removal must pop the
/// current head.
struct ChainVerifier {
    chain: Mutex<Vec<BlockIdentifier>>,
    added: AtomicU64,
    removed: AtomicU64,
    progress: Option<ProgressBar>,
}

impl ChainVerifier {
    fn new(progress: Option<ProgressBar>) -> Self {
        Self {
            chain: Mutex::new(Vec::new()),
            added: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            progress,
        }
    }

    fn added(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Handler for ChainVerifier {
    async fn block_added(&self, block: &Block) -> Result<()> {
        let mut chain = self.chain.lock();
        if let Some(head) = chain.last() {
            if block.parent_block_identifier != *head {
                eyre::bail!(
                    "block {} does not chain onto head {}",
                    block.block_identifier.index,
                    head.index
                );
            }
        }
        chain.push(block.block_identifier.clone());
        drop(chain);

        self.added.fetch_add(1, Ordering::Relaxed);
        if let Some(bar) = self.progress.as_ref() {
            bar.inc(1);
        }
        Ok(())
    }

    async fn block_removed(&self, block: &BlockIdentifier) -> Result<()> {
        let mut chain = self.chain.lock();
        if chain.last() != Some(block) {
            let head_index = chain.last().map(|id| id.index);
            eyre::bail!(
                "removal of block {} does not match head {:?}",
                block.index,
                head_index
            );
        }
        chain.pop();
        drop(chain);

        self.removed.fetch_add(1, Ordering::Relaxed);
        if let Some(bar) = self.progress.as_ref() {
            bar.set_position(bar.position().saturating_sub(1));
        }
        Ok(())
    }
}
