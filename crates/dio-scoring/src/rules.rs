//! Data-driven rule tables. Parsed from YAML once, regexes compiled once.

use std::path::Path;

use dio_core::{RiskCategory, RiskSeverity};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;

use crate::taxonomy::StageTaxonomy;

pub const BUILTIN_RULES_YAML: &str = include_str!("../rules/scoring.yaml");

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("reading rule file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rule yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unknown stage taxonomy `{0}`")]
    UnknownTaxonomy(String),
    #[error("taxonomy `{name}` has no profile for stage {missing}")]
    IncompleteTaxonomy { name: String, missing: String },
    #[error("risk rule `{0}` must have a negative impact")]
    NonNegativeImpact(String),
}

fn compile(pattern: &str) -> Result<Regex, RuleError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| RuleError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DayBand {
    pub within_days: i64,
    pub points: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OverDayBand {
    pub over_days: i64,
    pub points: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LengthBand {
    pub min_chars: usize,
    pub points: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CappedPoints {
    pub points: f64,
    pub cap: usize,
}

/// First band (in file order) the value falls into.
pub fn within_band(bands: &[DayBand], days: i64) -> f64 {
    bands
        .iter()
        .find(|b| days <= b.within_days)
        .map(|b| b.points)
        .unwrap_or(0.0)
}

pub fn over_band(bands: &[OverDayBand], days: i64) -> f64 {
    bands
        .iter()
        .find(|b| days > b.over_days)
        .map(|b| b.points)
        .unwrap_or(0.0)
}

pub fn length_band(bands: &[LengthBand], chars: usize) -> f64 {
    bands
        .iter()
        .find(|b| chars >= b.min_chars)
        .map(|b| b.points)
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct NoteCaps {
    pub questions: usize,
    pub requirements: usize,
    pub decision_points: usize,
    pub upcoming_events: usize,
    pub key_topics: usize,
    pub urgency_indicators: usize,
}

#[derive(Debug, Clone)]
pub struct TopicRule {
    pub topic: String,
    pub pattern: Regex,
}

#[derive(Debug, Clone)]
pub struct NotesRules {
    pub caps: NoteCaps,
    pub question: Regex,
    pub requirement: Regex,
    pub decision: Regex,
    pub event: Regex,
    pub urgency: Regex,
    pub positive_words: Vec<String>,
    pub negative_words: Vec<String>,
    pub topics: Vec<TopicRule>,
}

#[derive(Debug, Clone)]
pub struct SignalRule {
    pub label: String,
    pub pattern: Regex,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MomentumThresholds {
    pub accelerating: f64,
    pub steady: f64,
    pub stalling: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MomentumMultipliers {
    pub accelerating: f64,
    pub steady: f64,
    pub stalling: f64,
    pub declining: f64,
}

#[derive(Debug, Clone)]
pub struct MomentumRules {
    pub thresholds: MomentumThresholds,
    pub multipliers: MomentumMultipliers,
    pub recency_bonus: Vec<DayBand>,
    pub stagnation_penalty: Vec<OverDayBand>,
    pub signals: Vec<SignalRule>,
    pub research_cap: f64,
    pub research_signals: Vec<SignalRule>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EngagementThresholds {
    pub high: f64,
    pub medium: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EngagementMultipliers {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngagementRules {
    pub thresholds: EngagementThresholds,
    pub multipliers: EngagementMultipliers,
    pub notes_length: Vec<LengthBand>,
    pub questions: CappedPoints,
    pub requirements: CappedPoints,
    pub decisions: CappedPoints,
    pub contact_bonus: Vec<DayBand>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StagnationRule {
    pub medium_impact: i32,
    pub high_impact: i32,
    pub recommendation: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixedRiskRule {
    pub severity: RiskSeverity,
    pub impact: i32,
    pub description: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContactRiskRule {
    pub over_days: i64,
    pub severity: RiskSeverity,
    pub impact: i32,
    pub description: String,
    pub recommendation: String,
}

#[derive(Debug, Clone)]
pub struct RiskPatternRule {
    pub category: RiskCategory,
    pub pattern: Regex,
    pub severity: RiskSeverity,
    pub impact: i32,
    pub description: String,
    pub recommendation: String,
}

#[derive(Debug, Clone)]
pub struct RiskRules {
    pub max_factors: usize,
    pub stagnation: StagnationRule,
    pub contact: Vec<ContactRiskRule>,
    pub no_contact: FixedRiskRule,
    pub overdue_close: FixedRiskRule,
    pub patterns: Vec<RiskPatternRule>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RichnessRule {
    pub points_per_signal: f64,
    pub cap: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RiskPenaltyRule {
    pub per_factor: u32,
    pub cap: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfidenceRules {
    pub base: f64,
    pub notes_depth: Vec<LengthBand>,
    pub contact_recorded: f64,
    pub recent_contact: DayBand,
    pub deal_present: f64,
    pub deal_valued: f64,
    pub analysis_richness: RichnessRule,
    pub research_coverage: f64,
    pub risk_penalty: RiskPenaltyRule,
    pub floor: u8,
    pub ceiling: u8,
}

/// Everything the analyzer and the scoring engine read.
#[derive(Debug, Clone)]
pub struct RuleBook {
    pub notes: NotesRules,
    pub momentum: MomentumRules,
    pub engagement: EngagementRules,
    pub risk: RiskRules,
    pub confidence: ConfidenceRules,
    taxonomies: Vec<StageTaxonomy>,
}

impl RuleBook {
    pub fn builtin() -> Result<Self, RuleError> {
        Self::from_yaml(BUILTIN_RULES_YAML)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let book = Self::from_yaml(&text)?;
        tracing::debug!(path = %path.display(), taxonomies = book.taxonomies.len(), "loaded rule book");
        Ok(book)
    }

    pub fn from_yaml(text: &str) -> Result<Self, RuleError> {
        let file: RuleFile = serde_yaml::from_str(text)?;
        file.compile()
    }

    pub fn taxonomy(&self, name: &str) -> Result<&StageTaxonomy, RuleError> {
        self.taxonomies
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| RuleError::UnknownTaxonomy(name.to_string()))
    }

    pub fn taxonomy_names(&self) -> Vec<&str> {
        self.taxonomies.iter().map(|t| t.name.as_str()).collect()
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[allow(dead_code)]
    version: u32,
    notes: NotesFile,
    momentum: MomentumFile,
    engagement: EngagementRules,
    risk: RiskFile,
    confidence: ConfidenceRules,
    taxonomies: Vec<StageTaxonomy>,
}

#[derive(Debug, Deserialize)]
struct NotesFile {
    caps: NoteCaps,
    question_pattern: String,
    requirement_pattern: String,
    decision_pattern: String,
    event_pattern: String,
    urgency_pattern: String,
    positive_words: Vec<String>,
    negative_words: Vec<String>,
    #[serde(default)]
    topics: Vec<TopicFile>,
}

#[derive(Debug, Deserialize)]
struct TopicFile {
    topic: String,
    pattern: String,
}

#[derive(Debug, Deserialize)]
struct SignalFile {
    label: String,
    pattern: String,
    weight: f64,
}

#[derive(Debug, Deserialize)]
struct MomentumFile {
    thresholds: MomentumThresholds,
    multipliers: MomentumMultipliers,
    recency_bonus: Vec<DayBand>,
    stagnation_penalty: Vec<OverDayBand>,
    signals: Vec<SignalFile>,
    #[serde(default)]
    research_cap: f64,
    #[serde(default)]
    research_signals: Vec<SignalFile>,
}

#[derive(Debug, Deserialize)]
struct RiskPatternFile {
    category: RiskCategory,
    pattern: String,
    severity: RiskSeverity,
    impact: i32,
    description: String,
    recommendation: String,
}

#[derive(Debug, Deserialize)]
struct RiskFile {
    max_factors: usize,
    stagnation: StagnationRule,
    contact: Vec<ContactRiskRule>,
    no_contact: FixedRiskRule,
    overdue_close: FixedRiskRule,
    patterns: Vec<RiskPatternFile>,
}

fn compile_signals(signals: Vec<SignalFile>) -> Result<Vec<SignalRule>, RuleError> {
    signals
        .into_iter()
        .map(|s| {
            Ok(SignalRule {
                pattern: compile(&s.pattern)?,
                label: s.label,
                weight: s.weight,
            })
        })
        .collect()
}

fn ensure_negative(label: &str, impact: i32) -> Result<(), RuleError> {
    if impact < 0 {
        Ok(())
    } else {
        Err(RuleError::NonNegativeImpact(label.to_string()))
    }
}

impl RuleFile {
    fn compile(self) -> Result<RuleBook, RuleError> {
        let notes = NotesRules {
            caps: self.notes.caps,
            question: compile(&self.notes.question_pattern)?,
            requirement: compile(&self.notes.requirement_pattern)?,
            decision: compile(&self.notes.decision_pattern)?,
            event: compile(&self.notes.event_pattern)?,
            urgency: compile(&self.notes.urgency_pattern)?,
            positive_words: lowercase_all(self.notes.positive_words),
            negative_words: lowercase_all(self.notes.negative_words),
            topics: self
                .notes
                .topics
                .into_iter()
                .map(|t| {
                    Ok(TopicRule {
                        pattern: compile(&t.pattern)?,
                        topic: t.topic,
                    })
                })
                .collect::<Result<_, RuleError>>()?,
        };

        let momentum = MomentumRules {
            thresholds: self.momentum.thresholds,
            multipliers: self.momentum.multipliers,
            recency_bonus: self.momentum.recency_bonus,
            stagnation_penalty: self.momentum.stagnation_penalty,
            signals: compile_signals(self.momentum.signals)?,
            research_cap: self.momentum.research_cap.abs(),
            research_signals: compile_signals(self.momentum.research_signals)?,
        };

        ensure_negative("stagnation.medium_impact", self.risk.stagnation.medium_impact)?;
        ensure_negative("stagnation.high_impact", self.risk.stagnation.high_impact)?;
        ensure_negative("no_contact", self.risk.no_contact.impact)?;
        ensure_negative("overdue_close", self.risk.overdue_close.impact)?;
        for rule in &self.risk.contact {
            ensure_negative(&rule.description, rule.impact)?;
        }
        let mut contact = self.risk.contact;
        contact.sort_by(|a, b| b.over_days.cmp(&a.over_days));

        let patterns = self
            .risk
            .patterns
            .into_iter()
            .map(|p| {
                ensure_negative(&p.description, p.impact)?;
                Ok(RiskPatternRule {
                    category: p.category,
                    pattern: compile(&p.pattern)?,
                    severity: p.severity,
                    impact: p.impact,
                    description: p.description,
                    recommendation: p.recommendation,
                })
            })
            .collect::<Result<_, RuleError>>()?;

        let risk = RiskRules {
            max_factors: self.risk.max_factors,
            stagnation: self.risk.stagnation,
            contact,
            no_contact: self.risk.no_contact,
            overdue_close: self.risk.overdue_close,
            patterns,
        };

        for taxonomy in &self.taxonomies {
            taxonomy.validate()?;
        }

        Ok(RuleBook {
            notes,
            momentum,
            engagement: self.engagement,
            risk,
            confidence: self.confidence,
            taxonomies: self.taxonomies,
        })
    }
}

fn lowercase_all(words: Vec<String>) -> Vec<String> {
    words.into_iter().map(|w| w.to_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rule_book_compiles() {
        let rules = RuleBook::builtin().expect("builtin rules");
        assert_eq!(rules.taxonomy_names(), vec!["default", "enterprise"]);
        assert!(rules.momentum.signals.iter().any(|s| s.weight < 0.0));
        assert!(rules.risk.patterns.iter().all(|p| p.impact < 0));
        assert_eq!(rules.risk.contact[0].over_days, 30);
        assert!(matches!(
            rules.taxonomy("nope"),
            Err(RuleError::UnknownTaxonomy(_))
        ));
        assert_eq!(rules.taxonomy("ENTERPRISE").unwrap().name, "enterprise");
    }

    #[test]
    fn bands_pick_first_matching_entry() {
        let recency = [
            DayBand { within_days: 7, points: 8.0 },
            DayBand { within_days: 14, points: 4.0 },
        ];
        assert_eq!(within_band(&recency, 3), 8.0);
        assert_eq!(within_band(&recency, 10), 4.0);
        assert_eq!(within_band(&recency, 30), 0.0);

        let stagnation = [
            OverDayBand { over_days: 45, points: -15.0 },
            OverDayBand { over_days: 30, points: -8.0 },
        ];
        assert_eq!(over_band(&stagnation, 50), -15.0);
        assert_eq!(over_band(&stagnation, 31), -8.0);
        assert_eq!(over_band(&stagnation, 30), 0.0);
    }

    #[test]
    fn positive_risk_impacts_are_rejected() {
        let yaml = BUILTIN_RULES_YAML.replace("impact: -10\n      description: Budget", "impact: 10\n      description: Budget");
        assert!(matches!(
            RuleBook::from_yaml(&yaml),
            Err(RuleError::NonNegativeImpact(_))
        ));
    }

    #[test]
    fn rule_book_loads_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, BUILTIN_RULES_YAML.replace("name: enterprise", "name: midmarket")).unwrap();
        let rules = RuleBook::from_path(&path).unwrap();
        assert_eq!(rules.taxonomy_names(), vec!["default", "midmarket"]);

        assert!(matches!(
            RuleBook::from_path(dir.path().join("missing.yaml")),
            Err(RuleError::Io { .. })
        ));
    }

    #[test]
    fn bad_patterns_surface_as_errors() {
        let yaml = BUILTIN_RULES_YAML.replacen(
            r"question_pattern: '^(what",
            r"question_pattern: '^((what",
            1,
        );
        assert!(matches!(RuleBook::from_yaml(&yaml), Err(RuleError::Pattern { .. })));
    }
}
