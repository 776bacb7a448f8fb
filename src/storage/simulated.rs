//! Simulated backends with fault injection
//!
//! DST wrappers around any `SegmentStore` / `MetadataBackend`. Faults are
//! decided by buggify with a seeded RNG and are injected only before the
//! wrapped call runs: a failed or hung call never reached the inner backend.
//! That keeps the harness's shadow model exact (every acknowledged append is
//! stored, every failed one is not).

use super::metadata_backend::{BackendError, BackendResult, MetadataBackend, Version};
use super::segment_store::{
    SegmentHandle, SegmentResult, SegmentStats, SegmentStore, SegmentStoreError, StoreFuture,
};
use crate::buggify::faults;
use crate::io::Rng;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Per-operation fault probabilities
#[derive(Debug, Clone)]
pub struct SimulatedFaultConfig {
    pub create_fail_prob: f64,
    pub open_fail_prob: f64,
    pub append_fail_prob: f64,
    pub read_fail_prob: f64,
    pub seal_fail_prob: f64,
    pub metadata_read_fail_prob: f64,
    pub metadata_write_fail_prob: f64,
    pub metadata_delete_fail_prob: f64,
    /// Probability that a metadata call starts a session-loss window
    pub session_loss_prob: f64,
    /// Metadata calls failed per session-loss window, including the first
    pub session_loss_ops: u32,
    /// Probability that a call hangs for `hang_duration` and then fails
    pub hang_prob: f64,
    pub hang_duration: Duration,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedFaultConfig {
    fn default() -> Self {
        SimulatedFaultConfig {
            create_fail_prob: 0.01,
            open_fail_prob: 0.01,
            append_fail_prob: 0.01,
            read_fail_prob: 0.01,
            seal_fail_prob: 0.01,
            metadata_read_fail_prob: 0.01,
            metadata_write_fail_prob: 0.01,
            metadata_delete_fail_prob: 0.01,
            session_loss_prob: 0.002,
            session_loss_ops: 3,
            hang_prob: 0.002,
            hang_duration: Duration::from_secs(1),
            latency_range_us: (0, 0),
        }
    }
}

impl SimulatedFaultConfig {
    pub fn no_faults() -> Self {
        SimulatedFaultConfig {
            create_fail_prob: 0.0,
            open_fail_prob: 0.0,
            append_fail_prob: 0.0,
            read_fail_prob: 0.0,
            seal_fail_prob: 0.0,
            metadata_read_fail_prob: 0.0,
            metadata_write_fail_prob: 0.0,
            metadata_delete_fail_prob: 0.0,
            session_loss_prob: 0.0,
            session_loss_ops: 0,
            hang_prob: 0.0,
            hang_duration: Duration::ZERO,
            latency_range_us: (0, 0),
        }
    }

    pub fn high_chaos() -> Self {
        SimulatedFaultConfig {
            create_fail_prob: 0.05,
            open_fail_prob: 0.05,
            append_fail_prob: 0.05,
            read_fail_prob: 0.05,
            seal_fail_prob: 0.05,
            metadata_read_fail_prob: 0.05,
            metadata_write_fail_prob: 0.05,
            metadata_delete_fail_prob: 0.05,
            session_loss_prob: 0.01,
            session_loss_ops: 5,
            hang_prob: 0.01,
            hang_duration: Duration::from_secs(1),
            latency_range_us: (0, 500),
        }
    }

    /// Hang length; set above the operation timeout to exercise timeouts
    pub fn with_hang_duration(mut self, hang_duration: Duration) -> Self {
        self.hang_duration = hang_duration;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedStats {
    pub calls: u64,
    pub injected_failures: u64,
    pub hangs: u64,
    pub session_losses: u64,
}

struct FaultState<R: Rng> {
    rng: R,
    stats: SimulatedStats,
    session_loss_remaining: u32,
}

/// Outcome of the pre-call fault roll
enum Injected {
    None,
    Fail,
    Hang,
    SessionLoss,
}

struct Faults<R: Rng> {
    config: SimulatedFaultConfig,
    state: Arc<Mutex<FaultState<R>>>,
}

impl<R: Rng> Faults<R> {
    fn new(rng: R, config: SimulatedFaultConfig) -> Self {
        Faults {
            config,
            state: Arc::new(Mutex::new(FaultState {
                rng,
                stats: SimulatedStats::default(),
                session_loss_remaining: 0,
            })),
        }
    }

    /// Roll latency and faults for one call; the lock is released before any sleep
    fn roll(
        &self,
        hang_id: &'static str,
        fail_id: &'static str,
        fail_prob: f64,
        session_id: Option<&'static str>,
    ) -> (Duration, Injected) {
        let mut s = self.state.lock();
        s.stats.calls += 1;

        let (min, max) = self.config.latency_range_us;
        let latency = Duration::from_micros(s.rng.gen_range(min, max.max(min)));

        if let Some(session_id) = session_id {
            if s.session_loss_remaining > 0 {
                s.session_loss_remaining -= 1;
                s.stats.injected_failures += 1;
                return (latency, Injected::SessionLoss);
            }
            if crate::buggify!(&mut s.rng, session_id, self.config.session_loss_prob) {
                s.session_loss_remaining = self.config.session_loss_ops.saturating_sub(1);
                s.stats.session_losses += 1;
                s.stats.injected_failures += 1;
                return (latency, Injected::SessionLoss);
            }
        }

        if crate::buggify!(&mut s.rng, hang_id, self.config.hang_prob) {
            s.stats.hangs += 1;
            return (latency, Injected::Hang);
        }
        if crate::buggify!(&mut s.rng, fail_id, fail_prob) {
            s.stats.injected_failures += 1;
            return (latency, Injected::Fail);
        }
        (latency, Injected::None)
    }

    async fn delay(&self, latency: Duration, injected: &Injected) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if matches!(injected, Injected::Hang) {
            tokio::time::sleep(self.config.hang_duration).await;
        }
    }

    fn stats(&self) -> SimulatedStats {
        self.state.lock().stats.clone()
    }
}

// ============================================================================
// SimulatedSegmentStore
// ============================================================================

pub struct SimulatedSegmentStore<S: SegmentStore, R: Rng> {
    inner: S,
    faults: Faults<R>,
}

impl<S: SegmentStore, R: Rng> SimulatedSegmentStore<S, R> {
    pub fn new(inner: S, rng: R, config: SimulatedFaultConfig) -> Self {
        SimulatedSegmentStore {
            inner,
            faults: Faults::new(rng, config),
        }
    }

    pub fn stats(&self) -> SimulatedStats {
        self.faults.stats()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn before(&self, fail_id: &'static str, fail_prob: f64, op: &str) -> SegmentResult<()> {
        let (latency, injected) = self.faults.roll(faults::segment::HANG, fail_id, fail_prob, None);
        self.faults.delay(latency, &injected).await;
        match injected {
            Injected::None => Ok(()),
            Injected::Hang => Err(SegmentStoreError::Io(format!("simulated {} hang", op))),
            Injected::Fail | Injected::SessionLoss => {
                Err(SegmentStoreError::Io(format!("simulated {} failure", op)))
            }
        }
    }
}

impl<S: SegmentStore, R: Rng> SegmentStore for SimulatedSegmentStore<S, R> {
    fn create_segment<'a>(
        &'a self,
        stream: &'a str,
        segment_id: u64,
    ) -> StoreFuture<'a, SegmentResult<SegmentHandle>> {
        Box::pin(async move {
            let prob = self.faults.config.create_fail_prob;
            self.before(faults::segment::CREATE_FAIL, prob, "create").await?;
            self.inner.create_segment(stream, segment_id).await
        })
    }

    fn open_segment<'a>(
        &'a self,
        stream: &'a str,
        segment_id: u64,
    ) -> StoreFuture<'a, SegmentResult<SegmentHandle>> {
        Box::pin(async move {
            let prob = self.faults.config.open_fail_prob;
            self.before(faults::segment::OPEN_FAIL, prob, "open").await?;
            self.inner.open_segment(stream, segment_id).await
        })
    }

    fn append<'a>(
        &'a self,
        handle: &'a SegmentHandle,
        payload: &'a [u8],
    ) -> StoreFuture<'a, SegmentResult<u64>> {
        Box::pin(async move {
            let prob = self.faults.config.append_fail_prob;
            self.before(faults::segment::APPEND_FAIL, prob, "append").await?;
            self.inner.append(handle, payload).await
        })
    }

    fn read_range<'a>(
        &'a self,
        handle: &'a SegmentHandle,
        start: u64,
        max_count: usize,
    ) -> StoreFuture<'a, SegmentResult<Vec<Bytes>>> {
        Box::pin(async move {
            let prob = self.faults.config.read_fail_prob;
            self.before(faults::segment::READ_FAIL, prob, "read").await?;
            self.inner.read_range(handle, start, max_count).await
        })
    }

    fn seal<'a>(&'a self, handle: &'a SegmentHandle) -> StoreFuture<'a, SegmentResult<()>> {
        Box::pin(async move {
            let prob = self.faults.config.seal_fail_prob;
            self.before(faults::segment::SEAL_FAIL, prob, "seal").await?;
            self.inner.seal(handle).await
        })
    }

    fn close<'a>(&'a self, handle: &'a SegmentHandle) -> StoreFuture<'a, SegmentResult<()>> {
        self.inner.close(handle)
    }

    fn delete<'a>(&'a self, stream: &'a str, segment_id: u64) -> StoreFuture<'a, SegmentResult<()>> {
        self.inner.delete(stream, segment_id)
    }

    fn segment_stats<'a>(
        &'a self,
        handle: &'a SegmentHandle,
    ) -> StoreFuture<'a, SegmentResult<SegmentStats>> {
        Box::pin(async move {
            let prob = self.faults.config.read_fail_prob;
            self.before(faults::segment::READ_FAIL, prob, "stats").await?;
            self.inner.segment_stats(handle).await
        })
    }

    fn list_segments<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, SegmentResult<Vec<u64>>> {
        self.inner.list_segments(stream)
    }
}

// ============================================================================
// SimulatedMetadataBackend
// ============================================================================

pub struct SimulatedMetadataBackend<B: MetadataBackend, R: Rng> {
    inner: B,
    faults: Faults<R>,
}

impl<B: MetadataBackend, R: Rng> SimulatedMetadataBackend<B, R> {
    pub fn new(inner: B, rng: R, config: SimulatedFaultConfig) -> Self {
        SimulatedMetadataBackend {
            inner,
            faults: Faults::new(rng, config),
        }
    }

    pub fn stats(&self) -> SimulatedStats {
        self.faults.stats()
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn before(&self, fail_id: &'static str, fail_prob: f64, op: &str) -> BackendResult<()> {
        let (latency, injected) = self.faults.roll(
            faults::metadata::HANG,
            fail_id,
            fail_prob,
            Some(faults::metadata::SESSION_LOSS),
        );
        self.faults.delay(latency, &injected).await;
        match injected {
            Injected::None => Ok(()),
            Injected::SessionLoss => Err(BackendError::Unavailable(format!(
                "simulated session loss during {}",
                op
            ))),
            Injected::Hang => Err(BackendError::Unavailable(format!("simulated {} hang", op))),
            Injected::Fail => Err(BackendError::Io(format!("simulated {} failure", op))),
        }
    }
}

impl<B: MetadataBackend, R: Rng> MetadataBackend for SimulatedMetadataBackend<B, R> {
    fn read<'a>(&'a self, key: &'a str) -> StoreFuture<'a, BackendResult<(Vec<u8>, Version)>> {
        Box::pin(async move {
            let prob = self.faults.config.metadata_read_fail_prob;
            self.before(faults::metadata::READ_FAIL, prob, "read").await?;
            self.inner.read(key).await
        })
    }

    fn write<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        expected: Version,
    ) -> StoreFuture<'a, BackendResult<Version>> {
        Box::pin(async move {
            let prob = self.faults.config.metadata_write_fail_prob;
            self.before(faults::metadata::WRITE_FAIL, prob, "write").await?;
            self.inner.write(key, data, expected).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str, expected: Version) -> StoreFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let prob = self.faults.config.metadata_delete_fail_prob;
            self.before(faults::metadata::DELETE_FAIL, prob, "delete").await?;
            self.inner.delete(key, expected).await
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, BackendResult<Vec<String>>> {
        Box::pin(async move {
            let prob = self.faults.config.metadata_read_fail_prob;
            self.before(faults::metadata::READ_FAIL, prob, "list").await?;
            self.inner.list(prefix).await
        })
    }
}
