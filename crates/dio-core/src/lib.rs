//! Core domain model for deal research and intelligence documents.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "dio-core";

/// Version stamped into every generated intelligence document.
pub const INTELLIGENCE_SCHEMA_VERSION: &str = "2.1";

pub const NO_DEALS_MESSAGE: &str =
    "No deals are associated with this client yet. Add a deal to start tracking deal health.";
pub const ALL_DEALS_CLOSED_MESSAGE: &str =
    "All deals for this client are closed. Open a new deal to resume deal intelligence.";

/// Raw items returned by one connector for one entity.
pub type SourcePayload = Vec<JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Prospecting,
    Qualified,
    Proposal,
    Negotiation,
    ClosedWon,
    ClosedLost,
}

impl DealStatus {
    pub const ALL: [DealStatus; 6] = [
        DealStatus::Prospecting,
        DealStatus::Qualified,
        DealStatus::Proposal,
        DealStatus::Negotiation,
        DealStatus::ClosedWon,
        DealStatus::ClosedLost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::Prospecting => "prospecting",
            DealStatus::Qualified => "qualified",
            DealStatus::Proposal => "proposal",
            DealStatus::Negotiation => "negotiation",
            DealStatus::ClosedWon => "closed_won",
            DealStatus::ClosedLost => "closed_lost",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, DealStatus::ClosedWon | DealStatus::ClosedLost)
    }

    /// Ranking used to pick the deal an entity is scored on. Later open stages win.
    pub fn priority(&self) -> u8 {
        match self {
            DealStatus::Negotiation => 4,
            DealStatus::Proposal => 3,
            DealStatus::Qualified => 2,
            DealStatus::Prospecting => 1,
            DealStatus::ClosedWon | DealStatus::ClosedLost => 0,
        }
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub title: String,
    #[serde(default)]
    pub value: f64,
    pub status: DealStatus,
    #[serde(default)]
    pub expected_close_date: Option<NaiveDate>,
    pub last_updated: DateTime<Utc>,
}

impl Deal {
    /// Whole days since the deal last moved. Never negative, even with clock skew.
    pub fn days_in_stage(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_updated).num_days().max(0)
    }

    pub fn is_past_expected_close(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_closed()
            && self
                .expected_close_date
                .map(|date| date < now.date_naive())
                .unwrap_or(false)
    }
}

/// A tracked client/opportunity as supplied by the surrounding CRM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub user_id: String,
    pub company: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub last_contact: Option<DateTime<Utc>>,
    #[serde(default)]
    pub follow_up_date: Option<NaiveDate>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub deals: Vec<Deal>,
}

fn default_active() -> bool {
    true
}

impl Entity {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.id, &self.user_id)
    }

    pub fn has_identifiers(&self) -> bool {
        !self.id.trim().is_empty() && !self.user_id.trim().is_empty()
    }

    pub fn days_since_contact(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_contact
            .map(|contact| (now - contact).num_days().max(0))
    }

    pub fn all_deals_closed(&self) -> bool {
        !self.deals.is_empty() && self.deals.iter().all(|d| d.status.is_closed())
    }

    /// Highest stage priority wins; ties go to the larger value, then the most
    /// recently updated deal, then the alphabetically first title.
    pub fn primary_deal(&self) -> Option<&Deal> {
        self.deals.iter().max_by(|a, b| {
            a.status
                .priority()
                .cmp(&b.status.priority())
                .then(a.value.total_cmp(&b.value))
                .then(a.last_updated.cmp(&b.last_updated))
                .then(b.title.cmp(&a.title))
        })
    }

    /// Entities the batch runner scores: active, with a deal or some notes.
    pub fn is_batch_eligible(&self) -> bool {
        self.is_active && (!self.deals.is_empty() || !self.notes.trim().is_empty())
    }
}

/// Composite key that owns one research record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub entity_id: String,
    pub user_id: String,
}

impl RecordKey {
    pub fn new(entity_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_id, self.user_id)
    }
}

/// Output of one research run, merged into the stored record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchUpdate {
    pub payloads: BTreeMap<String, SourcePayload>,
    pub payload_hashes: BTreeMap<String, String>,
    /// Sources whose fetch failed: re-stamped, previous payload kept.
    #[serde(default)]
    pub failed_sources: BTreeSet<String>,
    pub narrative_summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchRecord {
    pub entity_id: String,
    pub user_id: String,
    #[serde(default)]
    pub data: BTreeMap<String, SourcePayload>,
    #[serde(default)]
    pub last_fetched: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub payload_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub narrative_summary: String,
    #[serde(default)]
    pub deal_intelligence: Option<IntelligenceDocument>,
    pub timestamp: DateTime<Utc>,
}

impl ResearchRecord {
    pub fn new(key: &RecordKey, now: DateTime<Utc>) -> Self {
        Self {
            entity_id: key.entity_id.clone(),
            user_id: key.user_id.clone(),
            data: BTreeMap::new(),
            last_fetched: BTreeMap::new(),
            payload_hashes: BTreeMap::new(),
            narrative_summary: String::new(),
            deal_intelligence: None,
            timestamp: now,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.entity_id, &self.user_id)
    }

    /// Per-source merge: fetched sources are replaced and re-stamped, failed
    /// sources are only re-stamped, others are kept. A replaced payload loses
    /// its archive hash unless the update carries a new one.
    pub fn merge_research(&mut self, update: ResearchUpdate, fetched_at: DateTime<Utc>) {
        for (source, payload) in update.payloads {
            self.payload_hashes.remove(&source);
            self.last_fetched.insert(source.clone(), fetched_at);
            self.data.insert(source, payload);
        }
        for source in update.failed_sources {
            self.last_fetched.insert(source, fetched_at);
        }
        self.payload_hashes.extend(update.payload_hashes);
        if !update.narrative_summary.trim().is_empty() {
            self.narrative_summary = update.narrative_summary;
        }
        self.timestamp = fetched_at;
    }

    pub fn source_items(&self, source: &str) -> &[JsonValue] {
        self.data.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn intelligence_state(&self) -> IntelligenceState<'_> {
        match &self.deal_intelligence {
            None => IntelligenceState::Pending,
            Some(IntelligenceDocument::Advisory(notice)) => IntelligenceState::Advisory(notice),
            Some(IntelligenceDocument::Report(report)) => IntelligenceState::Ready(report),
        }
    }
}

/// What a consumer sees for an entity; a missing document is pending, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntelligenceState<'a> {
    Pending,
    Advisory(&'a AdvisoryNotice),
    Ready(&'a DealIntelligence),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntelligenceDocument {
    Report(DealIntelligence),
    Advisory(AdvisoryNotice),
}

impl IntelligenceDocument {
    pub fn as_report(&self) -> Option<&DealIntelligence> {
        match self {
            IntelligenceDocument::Report(report) => Some(report),
            IntelligenceDocument::Advisory(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryReason {
    NoDeals,
    AllDealsClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryNotice {
    pub reason: AdvisoryReason,
    pub message: String,
    pub generated_at: DateTime<Utc>,
}

impl AdvisoryNotice {
    pub fn new(reason: AdvisoryReason, generated_at: DateTime<Utc>) -> Self {
        let message = match reason {
            AdvisoryReason::NoDeals => NO_DEALS_MESSAGE,
            AdvisoryReason::AllDealsClosed => ALL_DEALS_CLOSED_MESSAGE,
        };
        Self {
            reason,
            message: message.to_string(),
            generated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentumCategory {
    Declining,
    Stalling,
    Steady,
    Accelerating,
}

impl MomentumCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MomentumCategory::Declining => "declining",
            MomentumCategory::Stalling => "stalling",
            MomentumCategory::Steady => "steady",
            MomentumCategory::Accelerating => "accelerating",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementLevel {
    Low,
    Medium,
    High,
}

impl EngagementLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementLevel::Low => "low",
            EngagementLevel::Medium => "medium",
            EngagementLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Budget,
    Timeline,
    Competition,
    Authority,
    Engagement,
    Communication,
    Stagnation,
}

impl RiskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCategory::Budget => "budget",
            RiskCategory::Timeline => "timeline",
            RiskCategory::Competition => "competition",
            RiskCategory::Authority => "authority",
            RiskCategory::Engagement => "engagement",
            RiskCategory::Communication => "communication",
            RiskCategory::Stagnation => "stagnation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    #[serde(rename = "type")]
    pub category: RiskCategory,
    pub severity: RiskSeverity,
    pub description: String,
    /// Always negative; only ever lowers the score.
    pub impact: i32,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentumSummary {
    pub category: MomentumCategory,
    pub signals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: DealStatus,
    pub stage_label: String,
    pub stage_index: usize,
    pub total_stages: usize,
    pub percent: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePace {
    Ahead,
    OnTrack,
    Behind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageBenchmark {
    pub taxonomy: String,
    pub stage_label: String,
    pub typical_stage_days: u32,
    pub days_in_stage: i64,
    pub success_probability: f64,
    pub average_cycle_days: u32,
    pub pace: StagePace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityInsight {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub potential_impact: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    pub action: String,
    pub priority: ActionPriority,
    #[serde(default)]
    pub timeframe: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOrigin {
    Model,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub generated_at: DateTime<Utc>,
    pub schema_version: String,
    pub data_quality_score: u8,
    pub origin: ReportOrigin,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub fallback_reason: Option<String>,
}

/// Full deal-health report. Score fields always come from the deterministic engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealIntelligence {
    pub score: u8,
    pub confidence: u8,
    pub momentum: MomentumSummary,
    pub engagement: EngagementLevel,
    pub risk_factors: Vec<RiskFactor>,
    pub stage_progress: Option<StageProgress>,
    pub executive_summary: String,
    pub opportunities: Vec<OpportunityInsight>,
    pub next_actions: Vec<NextAction>,
    pub conversation_starters: Vec<String>,
    pub industry_benchmark: Option<StageBenchmark>,
    pub metadata: GenerationMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    #[default]
    Neutral,
}

/// Signals extracted from free-text notes. Recomputed every cycle, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotesAnalysis {
    pub questions: Vec<String>,
    pub requirements: Vec<String>,
    pub decision_points: Vec<String>,
    pub upcoming_events: Vec<String>,
    pub sentiment: Sentiment,
    pub key_topics: Vec<String>,
    pub urgency_indicators: Vec<String>,
}

impl NotesAnalysis {
    pub fn signal_count(&self) -> usize {
        self.questions.len()
            + self.requirements.len()
            + self.decision_points.len()
            + self.upcoming_events.len()
            + self.urgency_indicators.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDetail {
    pub entity_id: String,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
    pub details: Vec<BatchDetail>,
}

impl BatchSummary {
    pub fn record(&mut self, entity_id: impl Into<String>, status: BatchStatus, error: Option<String>) {
        match status {
            BatchStatus::Processed => self.processed += 1,
            BatchStatus::Failed => self.failed += 1,
            BatchStatus::Skipped => self.skipped += 1,
        }
        self.total += 1;
        self.details.push(BatchDetail {
            entity_id: entity_id.into(),
            status,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn deal(title: &str, status: DealStatus, value: f64, days_ago: i64) -> Deal {
        Deal {
            title: title.to_string(),
            value,
            status,
            expected_close_date: None,
            last_updated: now() - Duration::days(days_ago),
        }
    }

    fn entity(deals: Vec<Deal>) -> Entity {
        Entity {
            id: "c1".into(),
            user_id: "u1".into(),
            company: "Acme".into(),
            notes: String::new(),
            is_active: true,
            last_contact: None,
            follow_up_date: None,
            industry: None,
            deals,
        }
    }

    #[test]
    fn primary_deal_prefers_stage_then_value() {
        let e = entity(vec![
            deal("small-neg", DealStatus::Negotiation, 1_000.0, 3),
            deal("big-prop", DealStatus::Proposal, 90_000.0, 3),
            deal("big-neg", DealStatus::Negotiation, 5_000.0, 3),
        ]);
        assert_eq!(e.primary_deal().unwrap().title, "big-neg");
    }

    #[test]
    fn primary_deal_tie_break_is_deterministic() {
        let e = entity(vec![
            deal("beta", DealStatus::Qualified, 10.0, 5),
            deal("alpha", DealStatus::Qualified, 10.0, 5),
            deal("older", DealStatus::Qualified, 10.0, 9),
        ]);
        assert_eq!(e.primary_deal().unwrap().title, "alpha");
    }

    #[test]
    fn days_in_stage_never_negative() {
        let future = deal("f", DealStatus::Proposal, 0.0, -3);
        assert_eq!(future.days_in_stage(now()), 0);
        assert_eq!(deal("d", DealStatus::Proposal, 0.0, 12).days_in_stage(now()), 12);
    }

    #[test]
    fn closed_and_eligibility_rules() {
        let closed = entity(vec![
            deal("w", DealStatus::ClosedWon, 1.0, 1),
            deal("l", DealStatus::ClosedLost, 1.0, 1),
        ]);
        assert!(closed.all_deals_closed());
        assert!(!entity(vec![]).all_deals_closed());

        let mut bare = entity(vec![]);
        assert!(!bare.is_batch_eligible());
        bare.notes = "Met at conference".into();
        assert!(bare.is_batch_eligible());
        bare.is_active = false;
        assert!(!bare.is_batch_eligible());
    }

    #[test]
    fn merge_replaces_only_fetched_sources() {
        let key = RecordKey::new("c1", "u1");
        let mut record = ResearchRecord::new(&key, now());
        let mut first = ResearchUpdate::default();
        first.payloads.insert("news".into(), vec![serde_json::json!({"title": "a"})]);
        first.payloads.insert("discussion".into(), vec![]);
        first.narrative_summary = "first".into();
        record.merge_research(first, now());

        let later = now() + Duration::hours(13);
        let mut second = ResearchUpdate::default();
        second.payloads.insert("news".into(), vec![serde_json::json!({"title": "b"})]);
        record.merge_research(second, later);

        assert_eq!(record.source_items("news")[0]["title"], "b");
        assert_eq!(record.last_fetched["news"], later);
        assert_eq!(record.last_fetched["discussion"], now());
        assert_eq!(record.narrative_summary, "first");
        assert_eq!(record.intelligence_state(), IntelligenceState::Pending);
    }

    #[test]
    fn failed_source_keeps_last_good_payload() {
        let key = RecordKey::new("c1", "u1");
        let mut record = ResearchRecord::new(&key, now());
        let mut first = ResearchUpdate::default();
        first.payloads.insert("news".into(), vec![serde_json::json!({"title": "a"})]);
        first.payloads.insert("forum".into(), vec![serde_json::json!({"title": "f"})]);
        first.payload_hashes.insert("news".into(), "aa".repeat(32));
        first.payload_hashes.insert("forum".into(), "bb".repeat(32));
        record.merge_research(first, now());

        let later = now() + Duration::hours(13);
        let mut second = ResearchUpdate::default();
        second.failed_sources.insert("news".into());
        second.payloads.insert("forum".into(), vec![]);
        record.merge_research(second, later);

        assert_eq!(record.source_items("news")[0]["title"], "a");
        assert_eq!(record.last_fetched["news"], later);
        assert_eq!(record.payload_hashes["news"], "aa".repeat(32));
        assert!(record.source_items("forum").is_empty());
        assert!(!record.payload_hashes.contains_key("forum"));
    }

    #[test]
    fn roster_json_uses_camel_case() {
        let raw = r#"{
            "id": "c9", "userId": "u2", "company": "Globex",
            "lastContact": "2026-02-20T09:00:00Z",
            "deals": [{"title": "Pilot", "value": 1200, "status": "closed_won",
                       "expectedCloseDate": "2026-04-01", "lastUpdated": "2026-02-01T00:00:00Z"}]
        }"#;
        let parsed: Entity = serde_json::from_str(raw).unwrap();
        assert!(parsed.is_active);
        assert_eq!(parsed.deals[0].status, DealStatus::ClosedWon);
        assert_eq!(parsed.days_since_contact(now()), Some(9));
    }

    #[test]
    fn advisory_document_round_trips_with_kind_tag() {
        let doc = IntelligenceDocument::Advisory(AdvisoryNotice::new(AdvisoryReason::NoDeals, now()));
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["kind"], "advisory");
        assert_eq!(json["message"], NO_DEALS_MESSAGE);
        let back: IntelligenceDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }
}
