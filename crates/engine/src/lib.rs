//! Deterministic causal simulation engine
//!
//! This crate implements the simulation side of the retrodiction system:
//! - WorldState: the typed container (variables, capital, overlays)
//! - Rule / RuleRegistry: declarative causal rules with a two-phase
//!   (mutable, then frozen) registry and write-write conflict detection
//! - TurnRunner: atomic per-turn advancement with rollback and audit records
//!
//! Determinism contract: given the same frozen rule set and the same world,
//! `run_turn` produces bit-identical records. The coordinator relies on this
//! for replay fidelity and for worker-count-independent aggregation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod overlay;
pub mod registry;
pub mod rule;
pub mod turn;
pub mod world;

pub use overlay::{OverlayMeta, Overlays, CORE_OVERLAYS};
pub use registry::{global_registry, AppliedRule, FrozenRules, RuleRegistry};
pub use rule::{Effect, Rule, RuleSource, Trigger};
pub use turn::{TurnConfig, TurnRecord, TurnRunner};
pub use world::{Capital, WorldDelta, WorldEvent, WorldSnapshot, WorldState};
