use std::sync::Arc;

use chrono::{DateTime, Utc};
use dio_core::{
    Deal, EngagementLevel, Entity, MomentumCategory, MomentumSummary, NotesAnalysis, ResearchRecord,
    RiskCategory, RiskFactor, RiskSeverity, StageBenchmark, StageProgress,
};
use rand::Rng;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::notes::NotesAnalyzer;
use crate::rules::{length_band, over_band, within_band, CappedPoints, RuleBook, RuleError, SignalRule};
use crate::taxonomy::{StageProfile, StageTaxonomy};

pub const MAX_MOMENTUM_SIGNALS: usize = 5;

/// Deterministic deal health for one entity, plus the intermediate tallies
/// that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringResult {
    pub score: u8,
    pub confidence: u8,
    pub momentum: MomentumSummary,
    pub momentum_tally: f64,
    pub engagement: EngagementLevel,
    pub engagement_points: f64,
    pub risk_factors: Vec<RiskFactor>,
    pub stage_progress: Option<StageProgress>,
    pub benchmark: Option<StageBenchmark>,
    pub base_score: f64,
    pub days_in_stage: Option<i64>,
    pub confidence_risk_penalty: u32,
}

#[derive(Debug, Clone)]
struct Signal {
    label: String,
    weight: f64,
}

pub struct DealScoringEngine {
    rules: Arc<RuleBook>,
    taxonomy: StageTaxonomy,
}

impl DealScoringEngine {
    pub fn new(rules: Arc<RuleBook>, taxonomy: &str) -> Result<Self, RuleError> {
        let taxonomy = rules.taxonomy(taxonomy)?.clone();
        Ok(Self { rules, taxonomy })
    }

    pub fn rules(&self) -> &RuleBook {
        &self.rules
    }

    pub fn taxonomy(&self) -> &StageTaxonomy {
        &self.taxonomy
    }

    pub fn analyze_notes(&self, notes: &str) -> NotesAnalysis {
        NotesAnalyzer::new(&self.rules.notes).analyze(notes)
    }

    pub fn score(
        &self,
        entity: &Entity,
        analysis: &NotesAnalysis,
        research: Option<&ResearchRecord>,
        now: DateTime<Utc>,
    ) -> ScoringResult {
        self.score_with_rng(entity, analysis, research, now, &mut rand::thread_rng())
    }

    pub fn score_with_rng<R: Rng>(
        &self,
        entity: &Entity,
        analysis: &NotesAnalysis,
        research: Option<&ResearchRecord>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> ScoringResult {
        let deal = entity.primary_deal();
        let profile = match deal {
            Some(deal) => self.taxonomy.profile(deal.status),
            None => self.taxonomy.open_stages().next(),
        };
        let days_in_stage = deal.map(|d| d.days_in_stage(now));
        let days_since_contact = entity.days_since_contact(now);

        // Momentum is settled before any randomness is drawn.
        let (momentum_tally, signals) =
            self.momentum_tally(entity, research, days_since_contact, days_in_stage);
        let momentum_category = self.momentum_category(momentum_tally);

        let engagement_points = self.engagement_points(entity, analysis, days_since_contact);
        let engagement = self.engagement_level(engagement_points);

        let base_score = profile.map(|p| jittered_base(p, rng)).unwrap_or(0.0);
        let stage_factor = match (profile, days_in_stage) {
            (Some(profile), Some(days)) => profile.time_in_stage_factor(days),
            _ => 1.0,
        };

        let risk_factors = self.risk_factors(entity, deal, profile, days_since_contact, days_in_stage, now);
        let impact_total: i32 = risk_factors.iter().map(|r| r.impact).sum();

        let raw = base_score
            * self.momentum_multiplier(momentum_category)
            * self.engagement_multiplier(engagement)
            * stage_factor
            + f64::from(impact_total);
        let score = raw.clamp(0.0, 100.0).round() as u8;

        let (confidence, confidence_risk_penalty) =
            self.confidence(entity, deal, analysis, research, days_since_contact, risk_factors.len());

        ScoringResult {
            score,
            confidence,
            momentum: MomentumSummary {
                category: momentum_category,
                signals: top_signals(signals),
            },
            momentum_tally,
            engagement,
            engagement_points,
            risk_factors,
            stage_progress: deal.and_then(|d| self.taxonomy.progress(d.status)),
            benchmark: deal.and_then(|d| self.taxonomy.benchmark(d.status, d.days_in_stage(now))),
            base_score,
            days_in_stage,
            confidence_risk_penalty,
        }
    }

    fn momentum_tally(
        &self,
        entity: &Entity,
        research: Option<&ResearchRecord>,
        days_since_contact: Option<i64>,
        days_in_stage: Option<i64>,
    ) -> (f64, Vec<Signal>) {
        let rules = &self.rules.momentum;
        let mut signals = matching_signals(&rules.signals, std::iter::once(entity.notes.as_str()));

        if let Some(record) = research {
            let headlines: Vec<&str> = record
                .data
                .values()
                .flatten()
                .flat_map(|item| ["title", "description"].into_iter().filter_map(move |f| item.get(f)))
                .filter_map(JsonValue::as_str)
                .collect();
            let research_hits = matching_signals(&rules.research_signals, headlines.iter().copied());
            let research_total: f64 = research_hits.iter().map(|s| s.weight).sum();
            let capped = research_total.clamp(-rules.research_cap, rules.research_cap);
            if capped != 0.0 {
                signals.push(Signal {
                    label: research_label(&research_hits),
                    weight: capped,
                });
            }
        }

        if let Some(days) = days_since_contact {
            let bonus = within_band(&rules.recency_bonus, days);
            if bonus != 0.0 {
                signals.push(Signal {
                    label: format!("contacted {days} days ago"),
                    weight: bonus,
                });
            }
        }
        if let Some(days) = days_in_stage {
            let penalty = over_band(&rules.stagnation_penalty, days);
            if penalty != 0.0 {
                signals.push(Signal {
                    label: format!("{days} days without stage movement"),
                    weight: penalty,
                });
            }
        }

        let tally = signals.iter().map(|s| s.weight).sum();
        (tally, signals)
    }

    pub fn momentum_category(&self, tally: f64) -> MomentumCategory {
        let thresholds = self.rules.momentum.thresholds;
        if tally >= thresholds.accelerating {
            MomentumCategory::Accelerating
        } else if tally >= thresholds.steady {
            MomentumCategory::Steady
        } else if tally >= thresholds.stalling {
            MomentumCategory::Stalling
        } else {
            MomentumCategory::Declining
        }
    }

    fn momentum_multiplier(&self, category: MomentumCategory) -> f64 {
        let m = self.rules.momentum.multipliers;
        match category {
            MomentumCategory::Accelerating => m.accelerating,
            MomentumCategory::Steady => m.steady,
            MomentumCategory::Stalling => m.stalling,
            MomentumCategory::Declining => m.declining,
        }
    }

    fn engagement_points(
        &self,
        entity: &Entity,
        analysis: &NotesAnalysis,
        days_since_contact: Option<i64>,
    ) -> f64 {
        let rules = &self.rules.engagement;
        let capped = |count: usize, rule: CappedPoints| count.min(rule.cap) as f64 * rule.points;

        length_band(&rules.notes_length, entity.notes.trim().chars().count())
            + capped(analysis.questions.len(), rules.questions)
            + capped(analysis.requirements.len(), rules.requirements)
            + capped(analysis.decision_points.len(), rules.decisions)
            + days_since_contact
                .map(|days| within_band(&rules.contact_bonus, days))
                .unwrap_or(0.0)
    }

    pub fn engagement_level(&self, points: f64) -> EngagementLevel {
        let thresholds = self.rules.engagement.thresholds;
        if points >= thresholds.high {
            EngagementLevel::High
        } else if points >= thresholds.medium {
            EngagementLevel::Medium
        } else {
            EngagementLevel::Low
        }
    }

    fn engagement_multiplier(&self, level: EngagementLevel) -> f64 {
        let m = self.rules.engagement.multipliers;
        match level {
            EngagementLevel::High => m.high,
            EngagementLevel::Medium => m.medium,
            EngagementLevel::Low => m.low,
        }
    }

    fn risk_factors(
        &self,
        entity: &Entity,
        deal: Option<&Deal>,
        profile: Option<&StageProfile>,
        days_since_contact: Option<i64>,
        days_in_stage: Option<i64>,
        now: DateTime<Utc>,
    ) -> Vec<RiskFactor> {
        let rules = &self.rules.risk;
        let mut factors = Vec::new();

        if let (Some(profile), Some(days)) = (profile.filter(|_| deal.is_some()), days_in_stage) {
            if let Some(threshold) = profile.stall_threshold_days.filter(|t| days > *t) {
                let (severity, impact) = if days > threshold * 2 {
                    (RiskSeverity::High, rules.stagnation.high_impact)
                } else {
                    (RiskSeverity::Medium, rules.stagnation.medium_impact)
                };
                factors.push(RiskFactor {
                    category: RiskCategory::Stagnation,
                    severity,
                    description: format!(
                        "Deal has been in {} for {days} days (expected under {threshold})",
                        profile.label
                    ),
                    impact,
                    recommendation: rules.stagnation.recommendation.clone(),
                });
            }
        }

        match days_since_contact {
            Some(days) => {
                if let Some(rule) = rules.contact.iter().find(|r| days > r.over_days) {
                    factors.push(RiskFactor {
                        category: RiskCategory::Communication,
                        severity: rule.severity,
                        description: rule.description.clone(),
                        impact: rule.impact,
                        recommendation: rule.recommendation.clone(),
                    });
                }
            }
            None => factors.push(RiskFactor {
                category: RiskCategory::Communication,
                severity: rules.no_contact.severity,
                description: rules.no_contact.description.clone(),
                impact: rules.no_contact.impact,
                recommendation: rules.no_contact.recommendation.clone(),
            }),
        }

        if deal.map(|d| d.is_past_expected_close(now)).unwrap_or(false) {
            let rule = &rules.overdue_close;
            factors.push(RiskFactor {
                category: RiskCategory::Timeline,
                severity: rule.severity,
                description: rule.description.clone(),
                impact: rule.impact,
                recommendation: rule.recommendation.clone(),
            });
        }

        for rule in &rules.patterns {
            if rule.pattern.is_match(&entity.notes) {
                factors.push(RiskFactor {
                    category: rule.category,
                    severity: rule.severity,
                    description: rule.description.clone(),
                    impact: rule.impact,
                    recommendation: rule.recommendation.clone(),
                });
            }
        }

        factors.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.impact.cmp(&b.impact)));
        factors.truncate(rules.max_factors);
        factors
    }

    fn confidence(
        &self,
        entity: &Entity,
        deal: Option<&Deal>,
        analysis: &NotesAnalysis,
        research: Option<&ResearchRecord>,
        days_since_contact: Option<i64>,
        risk_count: usize,
    ) -> (u8, u32) {
        let rules = &self.rules.confidence;
        let mut total = rules.base + length_band(&rules.notes_depth, entity.notes.trim().chars().count());

        if let Some(days) = days_since_contact {
            total += rules.contact_recorded;
            if days <= rules.recent_contact.within_days {
                total += rules.recent_contact.points;
            }
        }
        if let Some(deal) = deal {
            total += rules.deal_present;
            if deal.value > 0.0 {
                total += rules.deal_valued;
            }
        }
        total += (analysis.signal_count() as f64 * rules.analysis_richness.points_per_signal)
            .min(rules.analysis_richness.cap);
        if research.map(|r| r.data.values().any(|p| !p.is_empty())).unwrap_or(false) {
            total += rules.research_coverage;
        }

        let penalty = (rules.risk_penalty.per_factor * risk_count as u32).min(rules.risk_penalty.cap);
        total -= f64::from(penalty);

        let confidence = total
            .round()
            .clamp(f64::from(rules.floor), f64::from(rules.ceiling)) as u8;
        (confidence, penalty)
    }
}

fn jittered_base<R: Rng>(profile: &StageProfile, rng: &mut R) -> f64 {
    if profile.variance > 0.0 {
        profile.base_score + rng.gen_range(-profile.variance..=profile.variance)
    } else {
        profile.base_score
    }
}

/// Each rule counts at most once, however many texts it matches.
fn matching_signals<'t>(rules: &[SignalRule], texts: impl Iterator<Item = &'t str> + Clone) -> Vec<Signal> {
    rules
        .iter()
        .filter(|rule| texts.clone().any(|text| rule.pattern.is_match(text)))
        .map(|rule| Signal {
            label: rule.label.clone(),
            weight: rule.weight,
        })
        .collect()
}

fn research_label(hits: &[Signal]) -> String {
    let labels: Vec<&str> = hits.iter().map(|s| s.label.as_str()).collect();
    format!("research: {}", labels.join(", "))
}

fn top_signals(mut signals: Vec<Signal>) -> Vec<String> {
    signals.sort_by(|a, b| b.weight.abs().total_cmp(&a.weight.abs()));
    signals
        .into_iter()
        .take(MAX_MOMENTUM_SIGNALS)
        .map(|s| format!("{} ({:+})", s.label, s.weight))
        .collect()
}
