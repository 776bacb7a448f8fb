//! BUGGIFY - FoundationDB-Style Fault Injection
//!
//! Deterministic fault injection for the storage backends. Each backend call
//! in the simulated segment store and metadata backend is a potential fault
//! site; whether it fires is decided by a seeded RNG, so a failing DST seed
//! replays the exact same fault sequence.
//!
//! # Usage
//!
//! ```ignore
//! use stream_ledger::buggify::faults;
//!
//! // Configured probability
//! if stream_ledger::buggify!(&mut rng, faults::segment::APPEND_FAIL) {
//!     return Err(SegmentStoreError::Io("injected".into()));
//! }
//!
//! // Explicit probability
//! if stream_ledger::buggify!(&mut rng, faults::metadata::TIMEOUT, 0.05) {
//!     tokio::time::sleep(hang).await;
//! }
//! ```
//!
//! Invariant checks in the DST harness run under `suppress_buggify!()` so the
//! verification reads themselves never see injected faults.

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use std::cell::RefCell;
use std::collections::HashMap;

/// Per-fault check/trigger counters
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    pub checks: HashMap<String, u64>,
    pub triggers: HashMap<String, u64>,
}

impl BuggifyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(&mut self, fault_id: &str) {
        *self.checks.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_trigger(&mut self, fault_id: &str) {
        *self.triggers.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn total_triggers(&self) -> u64 {
        self.triggers.values().sum()
    }

    pub fn trigger_rate(&self, fault_id: &str) -> f64 {
        let checks = self.checks.get(fault_id).copied().unwrap_or(0);
        let triggers = self.triggers.get(fault_id).copied().unwrap_or(0);
        if checks == 0 {
            0.0
        } else {
            triggers as f64 / checks as f64
        }
    }

    pub fn summary(&self) -> String {
        let mut ids: Vec<_> = self.checks.keys().collect();
        ids.sort();

        let mut lines = vec!["BUGGIFY Statistics:".to_string()];
        for id in ids {
            let checks = self.checks.get(id).copied().unwrap_or(0);
            let triggers = self.triggers.get(id).copied().unwrap_or(0);
            lines.push(format!(
                "  {}: {}/{} ({:.2}%)",
                id,
                triggers,
                checks,
                self.trigger_rate(id) * 100.0
            ));
        }
        lines.join("\n")
    }
}

thread_local! {
    static BUGGIFY_CONTEXT: RefCell<BuggifyContext> = RefCell::new(BuggifyContext::default());
}

/// Per-thread buggify context
///
/// DST runs drive everything from a current-thread runtime, so one context
/// covers a whole simulation.
#[derive(Debug, Default)]
pub struct BuggifyContext {
    pub config: FaultConfig,
    pub stats: BuggifyStats,
    pub suppressed: bool,
}

/// Set the fault configuration for the current thread
pub fn set_config(config: FaultConfig) {
    BUGGIFY_CONTEXT.with(|ctx| {
        ctx.borrow_mut().config = config;
    });
}

pub fn get_stats() -> BuggifyStats {
    BUGGIFY_CONTEXT.with(|ctx| ctx.borrow().stats.clone())
}

pub fn reset_stats() {
    BUGGIFY_CONTEXT.with(|ctx| {
        ctx.borrow_mut().stats = BuggifyStats::new();
    });
}

/// Scope guard that disables fault injection until dropped
///
/// Restores the previous suppression state, so guards nest.
pub struct BuggifySuppressor {
    previous: bool,
}

impl BuggifySuppressor {
    pub fn new() -> Self {
        let previous = BUGGIFY_CONTEXT.with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            std::mem::replace(&mut ctx.suppressed, true)
        });
        BuggifySuppressor { previous }
    }
}

impl Default for BuggifySuppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BuggifySuppressor {
    fn drop(&mut self) {
        let previous = self.previous;
        BUGGIFY_CONTEXT.with(|ctx| {
            ctx.borrow_mut().suppressed = previous;
        });
    }
}

fn roll<R: crate::io::Rng>(rng: &mut R, probability: f64) -> bool {
    let random_value = rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0;
    random_value < probability
}

/// Decide a fault using the probability configured for `fault_id`
#[inline]
pub fn should_buggify<R: crate::io::Rng>(rng: &mut R, fault_id: &str) -> bool {
    BUGGIFY_CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.stats.record_check(fault_id);

        if ctx.suppressed {
            return false;
        }
        let prob = ctx.config.get(fault_id);
        if prob <= 0.0 {
            return false;
        }

        let triggered = roll(rng, prob);
        if triggered {
            ctx.stats.record_trigger(fault_id);
        }
        triggered
    })
}

/// Decide a fault with an explicit probability
///
/// Still honors suppression and the global `enabled` switch.
#[inline]
pub fn should_buggify_with_prob<R: crate::io::Rng>(
    rng: &mut R,
    fault_id: &str,
    probability: f64,
) -> bool {
    BUGGIFY_CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.stats.record_check(fault_id);

        if ctx.suppressed || !ctx.config.enabled {
            return false;
        }

        let triggered = roll(rng, probability.clamp(0.0, 1.0));
        if triggered {
            ctx.stats.record_trigger(fault_id);
        }
        triggered
    })
}

/// Main fault injection entry point
#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr) => {
        $crate::buggify::should_buggify($rng, $fault_id)
    };
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $fault_id, $prob)
    };
}

/// Suppress all buggify calls until the returned guard drops
#[macro_export]
macro_rules! suppress_buggify {
    () => {
        $crate::buggify::BuggifySuppressor::new()
    };
}
