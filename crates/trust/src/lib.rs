//! Bayesian rule-trust tracking
//!
//! This crate implements the trust side of retrodiction:
//! - TrustState: per-rule Beta(α, β) posterior with CI and lazy decay
//! - TrustTracker: lock-sharded concurrent tracker with batched,
//!   commutative updates and snapshot/restore
//! - TrustBuffer: write-many aggregation buffer with a background flusher
//!
//! Updates over a single rule are associative and commutative, so flush
//! ordering is irrelevant to the final posteriors, the property the
//! coordinator's worker-count-independence rests on.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod state;
pub mod tracker;

pub use buffer::{TrustBuffer, TrustBufferConfig};
pub use state::TrustState;
pub use tracker::{TrustDelta, TrustSnapshot, TrustTracker};
