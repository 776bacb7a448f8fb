//! I/O Abstractions for Deterministic Simulation
//!
//! Randomness used by fault injection and workload generation goes through the
//! `Rng` trait so that a simulation run is fully determined by its seed.
//!
//! `simulation::SimulatedRng` is the seeded ChaCha8 implementation used by DST.

pub mod simulation;

/// Source of randomness for fault injection and workload generation
pub trait Rng: Send + 'static {
    /// Next raw 64-bit value
    fn next_u64(&mut self) -> u64;

    /// Returns true with the given probability (clamped to [0, 1])
    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `[min, max)`; returns `min` when the range is empty
    fn gen_range(&mut self, min: u64, max: u64) -> u64;
}
