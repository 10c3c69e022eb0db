
use chrono::{DateTime, Utc};
use dio_core::{Entity, NotesAnalysis, ResearchRecord};
use dio_scoring::ScoringResult;
use serde_json::Value as JsonValue;

use crate::industry::IndustryStrategy;

pub const MAX_NOTES_CHARS: usize = 1500;
pub const MAX_HEADLINES_PER_SOURCE: usize = 3;

/// Everything one intelligence prompt is built from.
pub struct PromptContext<'a> {
    pub entity: &'a Entity,
    pub analysis: &'a NotesAnalysis,
    pub scoring: &'a ScoringResult,
    pub research: Option<&'a ResearchRecord>,
    pub industry: &'a IndustryStrategy,
    pub now: DateTime<Utc>,
}

const RESPONSE_SCHEMA: &str = r#"{
  "executive_summary": "2-3 sentences on deal health and the single most important next move",
  "opportunities": [
    {"title": "short label", "description": "what to pursue and why", "potential_impact": "high|medium|low"}
  ],
  "next_actions": [
    {"action": "specific step", "priority": "high|medium|low", "timeframe": "e.g. this week", "rationale": "why now"}
  ],
  "conversation_starters": ["question or opener tailored to this client"]
}"#;

pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let mut out = String::new();
    let entity = ctx.entity;

    line(&mut out, "Analyze this B2B opportunity and return deal intelligence as JSON.");
    out.push('\n');
    line(&mut out, "## Client");
    line(&mut out, &format!("Company: {}", entity.company));
    line(&mut out, &format!("Industry: {}", ctx.industry.name));
    match entity.days_since_contact(ctx.now) {
        Some(days) => line(&mut out, &format!("Last contact: {days} days ago")),
        None => line(&mut out, "Last contact: never recorded"),
    }
    if let Some(date) = entity.follow_up_date {
        line(&mut out, &format!("Follow-up scheduled: {date}"));
    }

    if let Some(deal) = entity.primary_deal() {
        out.push('\n');
        line(&mut out, "## Primary deal");
        line(&mut out, &format!("Title: {}", deal.title));
        line(&mut out, &format!("Stage: {}", deal.status));
        line(&mut out, &format!("Value: {:.0}", deal.value));
        line(&mut out, &format!("Days in stage: {}", deal.days_in_stage(ctx.now)));
        if let Some(close) = deal.expected_close_date {
            line(&mut out, &format!("Expected close: {close}"));
        }
        if entity.deals.len() > 1 {
            line(&mut out, &format!("Other deals: {}", entity.deals.len() - 1));
        }
    }

    write_baseline(&mut out, ctx.scoring);
    write_notes(&mut out, entity, ctx.analysis);
    write_research(&mut out, ctx.research);

    out.push('\n');
    line(&mut out, &format!("## Industry playbook ({})", ctx.industry.name));
    line(&mut out, &format!("Key topics: {}", ctx.industry.key_topics.join(", ")));
    line(&mut out, &format!("Common objections: {}", ctx.industry.common_objections.join(", ")));
    line(&mut out, &format!("Terminology: {}", ctx.industry.terminology.join(", ")));

    out.push('\n');
    line(&mut out, "## Response format");
    line(
        &mut out,
        "The baseline score, confidence, momentum, engagement and risks above are final; do not restate or change them.",
    );
    line(&mut out, "Return only one JSON object with this shape:");
    line(&mut out, RESPONSE_SCHEMA);
    out
}

fn write_baseline(out: &mut String, scoring: &ScoringResult) {
    out.push('\n');
    line(out, "## Baseline assessment (authoritative)");
    line(out, &format!("Score: {}/100", scoring.score));
    line(out, &format!("Confidence: {}/100", scoring.confidence));
    line(out, &format!("Momentum: {}", scoring.momentum.category.as_str()));
    for signal in &scoring.momentum.signals {
        line(out, &format!("  - {signal}"));
    }
    line(out, &format!("Engagement: {}", scoring.engagement.as_str()));
    if let Some(progress) = &scoring.stage_progress {
        line(
            out,
            &format!("Stage progress: {} ({}% of open stages)", progress.stage_label, progress.percent),
        );
    }
    if let Some(benchmark) = &scoring.benchmark {
        line(
            out,
            &format!(
                "Benchmark: typical {} days in {}, win probability {:.0}%, average cycle {} days",
                benchmark.typical_stage_days,
                benchmark.stage_label,
                benchmark.success_probability * 100.0,
                benchmark.average_cycle_days
            ),
        );
    }
    if scoring.risk_factors.is_empty() {
        line(out, "Risks: none detected");
    } else {
        line(out, "Risks:");
        for risk in &scoring.risk_factors {
            line(
                out,
                &format!(
                    "  - [{:?}/{}] {} ({})",
                    risk.severity,
                    risk.category.as_str(),
                    risk.description,
                    risk.impact
                ),
            );
        }
    }
}

fn write_notes(out: &mut String, entity: &Entity, analysis: &NotesAnalysis) {
    out.push('\n');
    line(out, "## Relationship notes");
    let notes = entity.notes.trim();
    if notes.is_empty() {
        line(out, "(no notes)");
        return;
    }
    line(out, &truncate_chars(notes, MAX_NOTES_CHARS));
    let sections: [(&str, &[String]); 6] = [
        ("Open questions", analysis.questions.as_slice()),
        ("Requirements", analysis.requirements.as_slice()),
        ("Decision points", analysis.decision_points.as_slice()),
        ("Upcoming events", analysis.upcoming_events.as_slice()),
        ("Urgency", analysis.urgency_indicators.as_slice()),
        ("Topics", analysis.key_topics.as_slice()),
    ];
    for (label, items) in sections {
        if !items.is_empty() {
            line(out, &format!("{label}: {}", items.join(" | ")));
        }
    }
    line(out, &format!("Sentiment: {:?}", analysis.sentiment));
}

fn write_research(out: &mut String, research: Option<&ResearchRecord>) {
    out.push('\n');
    line(out, "## External research");
    let Some(record) = research else {
        line(out, "(none collected yet)");
        return;
    };
    if !record.narrative_summary.trim().is_empty() {
        line(out, &format!("Summary: {}", record.narrative_summary.trim()));
    }
    for (source, items) in &record.data {
        line(out, &format!("{source}: {} items", items.len()));
        for title in items
            .iter()
            .filter_map(|item| item.get("title").and_then(JsonValue::as_str))
            .take(MAX_HEADLINES_PER_SOURCE)
        {
            line(out, &format!("  - {title}"));
        }
    }
}

fn line(out: &mut String, text: &str) {
    out.push_str(text);
    out.push('\n');
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
