//! accelgrid-placement — workload-to-cluster matching.
//!
//! This crate decides *where* a workload should go. It does NOT mutate
//! the inventory (that's `accelgrid-orchestrator`). Instead, it scores
//! candidates and produces a `ScalingDecision` the orchestrator applies.
//!
//! # Components
//!
//! - **`scorer`** — Candidate scoring (capacity fit, idle, cost, power headroom)
//! - **`matcher`** — Selection policy (reuse → create → scale out) and capacity errors

pub mod matcher;
pub mod scorer;

pub use matcher::{MatchResult, Matcher};
pub use scorer::{
    CandidateInput, CandidateKind, CandidateScore, ScoreBreakdown, compare_candidates, rank,
    score_candidate,
};
