//! Stream Log DST Tests
//!
//! Deterministic simulation tests (FoundationDB-style, seed-based) for the
//! segmented stream log. Every run checks the final log against a shadow copy
//! of the acknowledged appends.
//!
//! ## Test Categories
//!
//! - **Calm tests**: No faults, restarts only
//! - **Moderate tests**: Occasional backend failures, hangs and session loss
//! - **Chaos tests**: Frequent faults, short segments, many restarts

use stream_ledger::storage::{
    run_dst_batch, summarize_batch, OperationOutcome, StreamDSTConfig, StreamDSTHarness,
};

fn failed_seeds(results: &[stream_ledger::storage::StreamDSTResult]) -> Vec<u64> {
    results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect()
}

// =============================================================================
// Single Seed Tests
// =============================================================================

#[tokio::test]
async fn test_stream_dst_single_calm() {
    let mut harness = StreamDSTHarness::new(StreamDSTConfig::calm(12345)).await;
    harness.run(500).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());
    assert!(
        result.is_success(),
        "calm run violated invariants: {:?}",
        result.invariant_violations
    );
    assert!(result.acknowledged_appends > 200);
    assert!(result.segments > 10);
}

#[tokio::test]
async fn test_stream_dst_single_moderate() {
    let mut harness = StreamDSTHarness::new(StreamDSTConfig::moderate(54321)).await;
    harness.run(300).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());
    assert!(
        result.is_success(),
        "seed 54321: {:?}",
        result.invariant_violations
    );
}

#[tokio::test]
async fn test_stream_dst_single_chaos() {
    let mut harness = StreamDSTHarness::new(StreamDSTConfig::chaos(99999)).await;
    harness.run(200).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());
    println!("Segment store: {:?}", result.segment_stats);
    println!("Metadata backend: {:?}", result.metadata_stats);
    println!("{}", result.fault_summary);

    assert!(result.total_operations >= 200);
    assert!(result.failed_operations > 0, "chaos should inject failures");
    assert!(
        result.is_success(),
        "seed 99999: {:?}",
        result.invariant_violations
    );
}

// =============================================================================
// Multi-Seed Batch Tests
// =============================================================================

#[tokio::test]
async fn test_stream_dst_100_seeds_calm() {
    let results = run_dst_batch(0, 100, 100, StreamDSTConfig::calm).await;
    println!("100 Seeds Calm:\n{}", summarize_batch(&results));
    assert!(failed_seeds(&results).is_empty(), "failed seeds: {:?}", failed_seeds(&results));
}

#[tokio::test]
async fn test_stream_dst_50_seeds_moderate() {
    let results = run_dst_batch(1000, 50, 100, StreamDSTConfig::moderate).await;
    println!("50 Seeds Moderate:\n{}", summarize_batch(&results));
    assert!(failed_seeds(&results).is_empty(), "failed seeds: {:?}", failed_seeds(&results));
}

#[tokio::test]
async fn test_stream_dst_20_seeds_chaos() {
    let results = run_dst_batch(2000, 20, 100, StreamDSTConfig::chaos).await;
    println!("20 Seeds Chaos:\n{}", summarize_batch(&results));
    assert!(failed_seeds(&results).is_empty(), "failed seeds: {:?}", failed_seeds(&results));
}

// =============================================================================
// Restart Stress
// =============================================================================

#[tokio::test]
async fn test_stream_dst_rapid_restarts() {
    let mut config = StreamDSTConfig::moderate(8888);
    config.restart_probability = 0.25;

    let mut harness = StreamDSTHarness::new(config).await;
    harness.run(300).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("Rapid restarts:\n{}", result.summary());
    assert!(result.restarts > 20);
    assert!(result.is_success(), "{:?}", result.invariant_violations);
}

#[tokio::test]
async fn test_stream_dst_concurrent_bursts() {
    let mut config = StreamDSTConfig::calm(31337);
    config.concurrent_probability = 0.5;

    let mut harness = StreamDSTHarness::new(config).await;
    harness.run(200).await;
    harness.check_invariants().await;

    let result = harness.result();
    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert!(result
        .history
        .iter()
        .all(|op| op.outcome == OperationOutcome::Success));
}

// =============================================================================
// Determinism Verification
// =============================================================================

#[tokio::test]
async fn test_stream_dst_determinism() {
    async fn run_seed(seed: u64) -> (u64, u64, u64, usize) {
        let mut harness = StreamDSTHarness::new(StreamDSTConfig::moderate(seed)).await;
        harness.run(150).await;
        harness.check_invariants().await;
        let result = harness.result();
        (
            result.successful_operations,
            result.failed_operations,
            result.acknowledged_appends,
            result.segments,
        )
    }

    let seed = 42424242;
    assert_eq!(run_seed(seed).await, run_seed(seed).await);
}

// =============================================================================
// Large Scale Tests (run with --release for reasonable times)
// =============================================================================

#[tokio::test]
#[ignore] // Run with: cargo test --release -- --ignored
async fn test_stream_dst_1000_seeds_calm() {
    let results = run_dst_batch(10000, 1000, 100, StreamDSTConfig::calm).await;
    println!("1000 Seeds Calm:\n{}", summarize_batch(&results));
    assert!(failed_seeds(&results).is_empty());
}

#[tokio::test]
#[ignore] // Run with: cargo test --release -- --ignored
async fn test_stream_dst_500_seeds_chaos() {
    let results = run_dst_batch(20000, 500, 200, StreamDSTConfig::chaos).await;
    println!("500 Seeds Chaos:\n{}", summarize_batch(&results));
    assert!(failed_seeds(&results).is_empty(), "failed seeds: {:?}", failed_seeds(&results));
}
