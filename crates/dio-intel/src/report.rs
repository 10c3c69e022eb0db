//! Turning a parsed model reply or the deterministic score into a report.

use chrono::{DateTime, Utc};
use dio_core::{
    ActionPriority, DealIntelligence, Entity, GenerationMetadata, MomentumCategory, NextAction,
    NotesAnalysis, OpportunityInsight, ReportOrigin, ResearchRecord, RiskSeverity,
    INTELLIGENCE_SCHEMA_VERSION,
};
use dio_scoring::ScoringResult;
use serde_json::Value as JsonValue;

use crate::industry::IndustryStrategy;
use crate::parse::{JsonObject, ParseError};

pub const MAX_OPPORTUNITIES: usize = 5;
pub const MAX_NEXT_ACTIONS: usize = 6;
pub const MAX_CONVERSATION_STARTERS: usize = 5;

/// Narrative fields the model is allowed to supply.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelNarrative {
    pub executive_summary: String,
    pub opportunities: Vec<OpportunityInsight>,
    pub next_actions: Vec<NextAction>,
    pub conversation_starters: Vec<String>,
}

impl ModelNarrative {
    /// Coerces loosely-shaped model output. Only a summary is mandatory;
    /// list entries may be objects or bare strings, and unknown keys are ignored.
    pub fn from_object(object: &JsonObject) -> Result<Self, ParseError> {
        let executive_summary = first_str(object, &["executive_summary", "executiveSummary", "summary"])
            .ok_or(ParseError::MissingField("executive_summary"))?;

        let opportunities = list(object, &["opportunities", "opportunity_insights"])
            .filter_map(coerce_opportunity)
            .take(MAX_OPPORTUNITIES)
            .collect();

        let mut next_actions: Vec<NextAction> = list(object, &["next_actions", "nextActions", "actions"])
            .filter_map(coerce_action)
            .take(MAX_NEXT_ACTIONS)
            .collect();
        next_actions.sort_by_key(|a| a.priority);

        let conversation_starters = list(object, &["conversation_starters", "conversationStarters"])
            .filter_map(|v| match v {
                JsonValue::String(s) => non_empty(s),
                JsonValue::Object(o) => first_str(o, &["text", "question", "starter"]),
                _ => None,
            })
            .take(MAX_CONVERSATION_STARTERS)
            .collect();

        Ok(Self {
            executive_summary,
            opportunities,
            next_actions,
            conversation_starters,
        })
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn first_str(object: &JsonObject, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| object.get(*k).and_then(JsonValue::as_str))
        .find_map(non_empty)
}

fn list<'a>(object: &'a JsonObject, keys: &[&str]) -> impl Iterator<Item = &'a JsonValue> {
    keys.iter()
        .find_map(|k| object.get(*k).and_then(JsonValue::as_array))
        .map(|items| items.iter())
        .into_iter()
        .flatten()
}

fn coerce_opportunity(value: &JsonValue) -> Option<OpportunityInsight> {
    match value {
        JsonValue::String(s) => non_empty(s).map(|text| OpportunityInsight {
            title: text.clone(),
            description: text,
            potential_impact: String::new(),
        }),
        JsonValue::Object(o) => {
            let title = first_str(o, &["title", "name", "opportunity"]);
            let description = first_str(o, &["description", "details", "detail"]);
            let (title, description) = match (title, description) {
                (Some(t), Some(d)) => (t, d),
                (Some(t), None) => (t.clone(), t),
                (None, Some(d)) => (d.clone(), d),
                (None, None) => return None,
            };
            Some(OpportunityInsight {
                title,
                description,
                potential_impact: first_str(o, &["potential_impact", "potentialImpact", "impact"])
                    .unwrap_or_default(),
            })
        }
        _ => None,
    }
}

fn coerce_action(value: &JsonValue) -> Option<NextAction> {
    match value {
        JsonValue::String(s) => non_empty(s).map(|action| NextAction {
            action,
            priority: ActionPriority::Medium,
            timeframe: String::new(),
            rationale: String::new(),
        }),
        JsonValue::Object(o) => Some(NextAction {
            action: first_str(o, &["action", "title", "step"])?,
            priority: first_str(o, &["priority"])
                .map(|p| parse_priority(&p))
                .unwrap_or(ActionPriority::Medium),
            timeframe: first_str(o, &["timeframe", "timeline", "when"]).unwrap_or_default(),
            rationale: first_str(o, &["rationale", "reason", "why"]).unwrap_or_default(),
        }),
        _ => None,
    }
}

pub fn parse_priority(raw: &str) -> ActionPriority {
    match raw.trim().to_lowercase().as_str() {
        "high" | "urgent" | "critical" | "p0" | "p1" => ActionPriority::High,
        "low" | "p3" | "nice to have" => ActionPriority::Low,
        _ => ActionPriority::Medium,
    }
}

/// Report from model narrative; every scored field comes from the engine.
pub fn assemble_report(
    scoring: &ScoringResult,
    narrative: ModelNarrative,
    metadata: GenerationMetadata,
) -> DealIntelligence {
    DealIntelligence {
        score: scoring.score,
        confidence: scoring.confidence,
        momentum: scoring.momentum.clone(),
        engagement: scoring.engagement,
        risk_factors: scoring.risk_factors.clone(),
        stage_progress: scoring.stage_progress.clone(),
        executive_summary: narrative.executive_summary,
        opportunities: narrative.opportunities,
        next_actions: narrative.next_actions,
        conversation_starters: narrative.conversation_starters,
        industry_benchmark: scoring.benchmark.clone(),
        metadata,
    }
}

pub fn metadata(
    now: DateTime<Utc>,
    data_quality_score: u8,
    origin: ReportOrigin,
    model: Option<String>,
    fallback_reason: Option<String>,
) -> GenerationMetadata {
    GenerationMetadata {
        generated_at: now,
        schema_version: INTELLIGENCE_SCHEMA_VERSION.to_string(),
        data_quality_score,
        origin,
        model,
        fallback_reason,
    }
}

/// Inputs to the deterministic report.
pub struct FallbackInput<'a> {
    pub entity: &'a Entity,
    pub analysis: &'a NotesAnalysis,
    pub scoring: &'a ScoringResult,
    pub industry: &'a IndustryStrategy,
}

pub fn fallback_narrative(input: &FallbackInput<'_>) -> ModelNarrative {
    ModelNarrative {
        executive_summary: fallback_summary(input),
        opportunities: fallback_opportunities(input),
        next_actions: fallback_actions(input),
        conversation_starters: fallback_starters(input),
    }
}

fn fallback_summary(input: &FallbackInput<'_>) -> String {
    let scoring = input.scoring;
    let stage = scoring
        .stage_progress
        .as_ref()
        .map(|p| p.stage_label.clone())
        .unwrap_or_else(|| "an early stage".to_string());
    let mut summary = format!(
        "{} is in {} with a deal health score of {}/100, {} momentum and {} engagement.",
        input.entity.company,
        stage,
        scoring.score,
        scoring.momentum.category.as_str(),
        scoring.engagement.as_str()
    );
    match scoring.risk_factors.first() {
        Some(risk) => summary.push_str(&format!(" Top risk: {}.", risk.description)),
        None => summary.push_str(" No material risks were detected."),
    }
    if let Some(benchmark) = &scoring.benchmark {
        summary.push_str(&format!(
            " It has spent {} days in stage against a typical {}.",
            benchmark.days_in_stage, benchmark.typical_stage_days
        ));
    }
    summary
}

fn fallback_opportunities(input: &FallbackInput<'_>) -> Vec<OpportunityInsight> {
    let analysis = input.analysis;
    let mut out = Vec::new();
    if let Some(requirement) = analysis.requirements.first() {
        out.push(OpportunityInsight {
            title: "Map the solution to stated requirements".into(),
            description: format!("The client said: \"{requirement}\". Show exactly how this is met."),
            potential_impact: "high".into(),
        });
    }
    if !analysis.questions.is_empty() {
        out.push(OpportunityInsight {
            title: "Close out open questions".into(),
            description: format!(
                "{} open question(s) are on record; answering them in writing removes friction.",
                analysis.questions.len()
            ),
            potential_impact: "medium".into(),
        });
    }
    if input.scoring.momentum.category == MomentumCategory::Accelerating {
        out.push(OpportunityInsight {
            title: "Use the momentum".into(),
            description: "Buying signals are strong; propose a dated close plan now.".into(),
            potential_impact: "high".into(),
        });
    }
    let shared_topic = analysis.key_topics.iter().find(|topic| {
        input
            .industry
            .key_topics
            .iter()
            .any(|k| k.to_lowercase().contains(topic.as_str()))
    });
    let topic = shared_topic
        .cloned()
        .or_else(|| input.industry.key_topics.first().cloned());
    if let Some(topic) = topic {
        out.push(OpportunityInsight {
            title: format!("Lead with {topic}"),
            description: format!(
                "{} buyers weigh {topic} heavily; anchor the next conversation on it.",
                input.industry.name
            ),
            potential_impact: "medium".into(),
        });
    }
    out.truncate(MAX_OPPORTUNITIES);
    out
}

fn fallback_actions(input: &FallbackInput<'_>) -> Vec<NextAction> {
    let mut actions: Vec<NextAction> = input
        .scoring
        .risk_factors
        .iter()
        .map(|risk| {
            let (priority, timeframe) = match risk.severity {
                RiskSeverity::High => (ActionPriority::High, "this week"),
                RiskSeverity::Medium => (ActionPriority::Medium, "within two weeks"),
                RiskSeverity::Low => (ActionPriority::Low, "this month"),
            };
            NextAction {
                action: risk.recommendation.clone(),
                priority,
                timeframe: timeframe.into(),
                rationale: risk.description.clone(),
            }
        })
        .collect();

    if let Some(date) = input.entity.follow_up_date {
        actions.push(NextAction {
            action: "Prepare for the scheduled follow-up".into(),
            priority: ActionPriority::Medium,
            timeframe: format!("before {date}"),
            rationale: "A follow-up is already on the calendar.".into(),
        });
    }
    if actions.is_empty() {
        actions.push(NextAction {
            action: "Confirm next steps and a decision date with the buyer".into(),
            priority: ActionPriority::Medium,
            timeframe: "within two weeks".into(),
            rationale: "Keeps the deal moving while no risks are flagged.".into(),
        });
    }
    actions.sort_by_key(|a| a.priority);
    actions.truncate(MAX_NEXT_ACTIONS);
    actions
}

fn fallback_starters(input: &FallbackInput<'_>) -> Vec<String> {
    input
        .analysis
        .questions
        .iter()
        .take(2)
        .map(|q| format!("Following up on your question, \"{q}\", here is what we found."))
        .chain(input.industry.conversation_angles.iter().cloned())
        .take(MAX_CONVERSATION_STARTERS)
        .collect()
}

/// 0-100 measure of how much evidence the report stands on.
pub fn data_quality_score(entity: &Entity, research: Option<&ResearchRecord>) -> u8 {
    let notes_len = entity.notes.trim().chars().count();
    let notes = match notes_len {
        n if n >= 500 => 30,
        n if n >= 200 => 20,
        n if n >= 50 => 10,
        _ => 0,
    };
    let covered_sources = research
        .map(|r| r.data.values().filter(|p| !p.is_empty()).count())
        .unwrap_or(0);
    let research_points = (covered_sources * 10).min(30);

    let points = |present: bool, value: usize| if present { value } else { 0 };
    let deal = entity.primary_deal().map_or(0, |d| {
        10 + points(d.value > 0.0, 5) + points(d.expected_close_date.is_some(), 5)
    });
    let contact =
        points(entity.last_contact.is_some(), 10) + points(entity.follow_up_date.is_some(), 10);

    (notes + research_points + deal + contact).min(100) as u8
}
