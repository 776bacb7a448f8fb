//! Stateright Model Checking for stream-ledger
//!
//! Exhaustive state-space exploration of the rollover protocol, one level
//! above the DST harness: DST samples seeded runs of the real code, the model
//! enumerates every interleaving of a small abstraction of it.
//!
//! ## Running Model Checks
//!
//! ```bash
//! # Model checks are marked #[ignore] for CI speed
//! cargo test stateright -- --ignored --nocapture
//! ```
//!
//! ## Models
//!
//! | Model | Key Invariants |
//! |-------|----------------|
//! | `RolloverModel` | single_active, no_lost_acks, sealed_counts_exact |

pub mod rollover;
