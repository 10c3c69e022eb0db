//! Deterministic deal-health scoring: notes analysis, stage taxonomies and
//! the rule-driven scoring engine.

pub mod engine;
pub mod notes;
pub mod rules;
pub mod taxonomy;

pub use engine::{DealScoringEngine, ScoringResult, MAX_MOMENTUM_SIGNALS};
pub use notes::{split_sentences, NotesAnalyzer};
pub use rules::{RuleBook, RuleError, BUILTIN_RULES_YAML};
pub use taxonomy::{StageProfile, StageTaxonomy};

pub const CRATE_NAME: &str = "dio-scoring";
