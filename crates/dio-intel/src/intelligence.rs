use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dio_core::{
    AdvisoryNotice, AdvisoryReason, Entity, IntelligenceDocument, ReportOrigin, ResearchRecord,
};
use dio_scoring::DealScoringEngine;
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, warn, Instrument};

use crate::generator::{generate_within, GenerationError, GenerationRequest, TextGenerator};
use crate::industry::IndustryTable;
use crate::parse::ResponseParser;
use crate::prompt::{build_prompt, PromptContext};
use crate::report::{
    assemble_report, data_quality_score, fallback_narrative, metadata, FallbackInput, ModelNarrative,
};

pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Scores an entity, asks the model for narrative, and always hands back a document.
pub struct IntelligenceGenerator {
    engine: Arc<DealScoringEngine>,
    industries: Arc<IndustryTable>,
    generator: Option<Arc<dyn TextGenerator>>,
    parser: ResponseParser,
    timeout: Duration,
}

impl IntelligenceGenerator {
    pub fn new(
        engine: Arc<DealScoringEngine>,
        industries: Arc<IndustryTable>,
        generator: Option<Arc<dyn TextGenerator>>,
    ) -> Self {
        Self {
            engine,
            industries,
            generator,
            parser: ResponseParser::default(),
            timeout: DEFAULT_GENERATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_parser(mut self, parser: ResponseParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn engine(&self) -> &DealScoringEngine {
        &self.engine
    }

    /// Entities with no deals, or only closed ones, get a fixed advisory instead of a score.
    pub fn advisory_for(entity: &Entity, now: DateTime<Utc>) -> Option<AdvisoryNotice> {
        if entity.deals.is_empty() {
            Some(AdvisoryNotice::new(AdvisoryReason::NoDeals, now))
        } else if entity.all_deals_closed() {
            Some(AdvisoryNotice::new(AdvisoryReason::AllDealsClosed, now))
        } else {
            None
        }
    }

    pub async fn generate(
        &self,
        entity: &Entity,
        research: Option<&ResearchRecord>,
        now: DateTime<Utc>,
    ) -> IntelligenceDocument {
        if let Some(notice) = Self::advisory_for(entity, now) {
            debug!(entity_id = %entity.id, reason = ?notice.reason, "advisory instead of score");
            return IntelligenceDocument::Advisory(notice);
        }

        let analysis = self.engine.analyze_notes(&entity.notes);
        let scoring = self.engine.score(entity, &analysis, research, now);
        let industry = self.industries.lookup(industry_name(entity, research));
        let quality = data_quality_score(entity, research);

        let prompt = build_prompt(&PromptContext {
            entity,
            analysis: &analysis,
            scoring: &scoring,
            research,
            industry,
            now,
        });

        let span = info_span!("generate_intelligence", entity_id = %entity.id);
        let report = match self.narrate(prompt).instrument(span).await {
            Ok((narrative, model)) => assemble_report(
                &scoring,
                narrative,
                metadata(now, quality, ReportOrigin::Model, Some(model), None),
            ),
            Err(err) => {
                warn!(entity_id = %entity.id, error = %err, "generation failed, using fallback report");
                let narrative = fallback_narrative(&FallbackInput {
                    entity,
                    analysis: &analysis,
                    scoring: &scoring,
                    industry,
                });
                assemble_report(
                    &scoring,
                    narrative,
                    metadata(now, quality, ReportOrigin::Fallback, None, Some(err.to_string())),
                )
            }
        };
        IntelligenceDocument::Report(report)
    }

    async fn narrate(&self, prompt: String) -> Result<(ModelNarrative, String), GenerationError> {
        let generator = self.generator.as_ref().ok_or(GenerationError::MissingCredential)?;
        let raw = generate_within(generator.as_ref(), &GenerationRequest::new(prompt), self.timeout).await?;
        let parsed = self.parser.parse(&raw)?;
        debug!(strategy = parsed.strategy, "parsed generation response");
        let narrative = ModelNarrative::from_object(&parsed.object)?;
        Ok((narrative, generator.model().to_string()))
    }
}

/// Entity industry, else the first `industry` field in any research payload.
pub fn industry_name<'a>(entity: &'a Entity, research: Option<&'a ResearchRecord>) -> Option<&'a str> {
    entity
        .industry
        .as_deref()
        .filter(|i| !i.trim().is_empty())
        .or_else(|| {
            research?
                .data
                .values()
                .flatten()
                .find_map(|item| item.get("industry").and_then(JsonValue::as_str))
        })
}
