//! Budget-driven tuning of the fetcher pool.
//!
//! Concurrency rises slowly (one worker at a time, gated on a quiet period)
//! while the projected in-flight cache stays under the byte budget, and falls
//! fast (goal recomputed straight from the budget) the moment the projection
//! breaches it. Live workers catch up to a lowered goal by retiring
//! themselves after their next delivered result.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Fetchers at range start unless configured otherwise.
pub const DEFAULT_CONCURRENCY: i64 = 4;

/// Hard ceiling for the fetcher pool.
pub const DEFAULT_MAX_CONCURRENCY: i64 = 256;

/// The pool never shrinks below this.
pub const MIN_CONCURRENCY: i64 = 1;

/// Default in-flight cache budget, roughly 2 GiB.
pub const DEFAULT_CACHE_SIZE: usize = 2000 << 20;

/// Preset aiming for roughly 5 GiB of cache.
pub const LARGE_CACHE_SIZE: usize = 5000 << 20;

/// Preset aiming for roughly 500 MiB of cache.
pub const SMALL_CACHE_SIZE: usize = 500 << 20;

/// Preset aiming for roughly 200 MiB of cache.
pub const TINY_CACHE_SIZE: usize = 200 << 20;

/// Pads the observed max block size to cover per-block processing overhead
/// (balance adjustments, handler bookkeeping, and so on).
pub const DEFAULT_SIZE_MULTIPLIER: f64 = 10.0;

/// Trailing window of observed block sizes.
const TRAILING_WINDOW: usize = 1000;

/// Results that must pass between upward adjustments.
const ADJUSTMENT_WINDOW: i64 = 10;

#[derive(Debug)]
struct TunerState {
    concurrency: i64,
    goal_concurrency: i64,
    last_adjustment: i64,
    recent_block_sizes: VecDeque<usize>,
}

/// Shared between the processor (adjustments), the fetchers (retirement
/// checks) and the emitter (backpressure reads).
#[derive(Debug)]
pub struct ConcurrencyTuner {
    cache_size: usize,
    size_multiplier: f64,
    max_concurrency: i64,
    state: Mutex<TunerState>,
    // Kept out of the state lock: the emitter parks this latch while the
    // processor may be holding the lock to decide a spawn.
    done_loading: AtomicBool,
}

impl ConcurrencyTuner {
    pub fn new(cache_size: usize, size_multiplier: f64, max_concurrency: i64) -> Self {
        Self {
            cache_size,
            size_multiplier,
            max_concurrency: max_concurrency.max(MIN_CONCURRENCY),
            state: Mutex::new(TunerState {
                concurrency: 0,
                goal_concurrency: 0,
                last_adjustment: 0,
                recent_block_sizes: VecDeque::new(),
            }),
            done_loading: AtomicBool::new(false),
        }
    }

    /// Reset for a new range with `starting` live workers.
    pub fn reset(&self, starting: i64) {
        let mut state = self.state.lock();
        state.concurrency = starting;
        state.goal_concurrency = starting;
        state.last_adjustment = 0;
        state.recent_block_sizes.clear();
        drop(state);
        self.done_loading.store(false, Ordering::SeqCst);
    }

    /// Number of currently live fetchers.
    pub fn concurrency(&self) -> i64 {
        self.state.lock().concurrency
    }

    /// Target the pool is converging toward.
    pub fn goal_concurrency(&self) -> i64 {
        self.state.lock().goal_concurrency
    }

    /// Called by a fetcher after delivering a result. When the pool is above
    /// goal the caller retires, bringing the live count down one result at a
    /// time rather than with a hard stop.
    pub fn should_retire(&self) -> bool {
        let mut state = self.state.lock();
        if state.concurrency > state.goal_concurrency {
            state.concurrency -= 1;
            true
        } else {
            false
        }
    }

    /// Record the size of a processed result and re-evaluate the goal.
    ///
    /// Returns `true` when a new worker should be spawned. The live count is
    /// bumped before the spawn so the emitter's backpressure check cannot
    /// stall the handoff.
    pub fn record(&self, size: usize) -> bool {
        let mut state = self.state.lock();
        state.recent_block_sizes.push_back(size);
        state.last_adjustment += 1;

        let max_size = state.recent_block_sizes.iter().copied().max().unwrap_or(0) as f64
            * self.size_multiplier;
        let projected = max_size * state.concurrency as f64;

        let mut should_spawn = false;
        if projected + max_size < self.cache_size as f64
            && state.concurrency < self.max_concurrency
            && state.last_adjustment > ADJUSTMENT_WINDOW
        {
            state.goal_concurrency += 1;
            state.concurrency += 1;
            state.last_adjustment = 0;
            should_spawn = true;
            info!(
                goal_concurrency = state.goal_concurrency,
                projected_cache_mb = bytes_to_mb(max_size * state.goal_concurrency as f64),
                "increasing sync concurrency"
            );
        }

        // The downward path ignores the quiet period: a budget breach is
        // corrected immediately.
        if projected > self.cache_size as f64 {
            let new_goal = ((self.cache_size as f64 / max_size) as i64).max(MIN_CONCURRENCY);
            if new_goal != state.goal_concurrency {
                state.goal_concurrency = new_goal;
                state.last_adjustment = 0;
                info!(
                    goal_concurrency = state.goal_concurrency,
                    projected_cache_mb = bytes_to_mb(max_size * state.goal_concurrency as f64),
                    "reducing sync concurrency"
                );
            }
        }

        if state.recent_block_sizes.len() > TRAILING_WINDOW {
            state.recent_block_sizes.pop_front();
        }

        should_spawn
    }

    /// Latched by the emitter once the final index is enqueued; no worker is
    /// spawned past this point.
    pub fn set_done_loading(&self) {
        self.done_loading.store(true, Ordering::SeqCst);
    }

    pub fn done_loading(&self) -> bool {
        self.done_loading.load(Ordering::SeqCst)
    }
}

fn bytes_to_mb(bytes: f64) -> f64 {
    bytes / (1024.0 * 1024.0)
}
