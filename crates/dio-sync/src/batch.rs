use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dio_core::{BatchStatus, BatchSummary, Entity, IntelligenceDocument};
use dio_intel::IntelligenceGenerator;
use dio_storage::{EntityRoster, ResearchStore, StoreError};
use futures::future::join_all;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::coordinator::EntityError;

/// Regenerates intelligence for the roster in fixed-size concurrent chunks.
pub struct BatchRunner {
    roster: Arc<dyn EntityRoster>,
    store: Arc<dyn ResearchStore>,
    generator: Arc<IntelligenceGenerator>,
    batch_size: usize,
    delay: Duration,
}

impl BatchRunner {
    pub fn new(
        roster: Arc<dyn EntityRoster>,
        store: Arc<dyn ResearchStore>,
        generator: Arc<IntelligenceGenerator>,
    ) -> Self {
        Self {
            roster,
            store,
            generator,
            batch_size: 5,
            delay: Duration::from_secs(1),
        }
    }

    pub fn with_chunking(mut self, batch_size: usize, delay: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.delay = delay;
        self
    }

    /// Active entities without deals or notes are reported as skipped.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<BatchSummary, StoreError> {
        let (eligible, ineligible): (Vec<Entity>, Vec<Entity>) = self
            .roster
            .active_entities()
            .await?
            .into_iter()
            .partition(Entity::is_batch_eligible);

        let mut summary = BatchSummary::default();
        for entity in &ineligible {
            debug!(entity_id = %entity.id, "no deals or notes, skipping");
            summary.record(&entity.id, BatchStatus::Skipped, None);
        }

        for (index, chunk) in eligible.chunks(self.batch_size).enumerate() {
            if index > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let results = join_all(chunk.iter().map(|entity| {
                let span = info_span!("score_entity", entity_id = %entity.id);
                self.process(entity, now).instrument(span)
            }))
            .await;
            for (entity, result) in chunk.iter().zip(results) {
                match result {
                    Ok(()) => summary.record(&entity.id, BatchStatus::Processed, None),
                    Err(err) => {
                        warn!(entity_id = %entity.id, error = %err, "intelligence update failed");
                        summary.record(&entity.id, BatchStatus::Failed, Some(err.to_string()));
                    }
                }
            }
        }

        info!(
            processed = summary.processed,
            failed = summary.failed,
            skipped = summary.skipped,
            total = summary.total,
            "scoring batch finished"
        );
        Ok(summary)
    }

    pub async fn process(&self, entity: &Entity, now: DateTime<Utc>) -> Result<(), EntityError> {
        if !entity.has_identifiers() {
            return Err(EntityError::MissingIdentifiers);
        }
        let key = entity.key();
        let research = self.store.load(&key).await?;
        let document = self.generator.generate(entity, research.as_ref(), now).await;
        if let IntelligenceDocument::Report(report) = &document {
            debug!(
                score = report.score,
                confidence = report.confidence,
                origin = ?report.metadata.origin,
                "intelligence generated"
            );
        }
        self.store.upsert_intelligence(&key, document, now).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use dio_core::{IntelligenceState, RecordKey, ResearchRecord, ResearchUpdate};
    use dio_intel::IndustryTable;
    use dio_scoring::{DealScoringEngine, RuleBook};
    use dio_storage::{MemoryResearchStore, MemoryRoster};
    use serde_json::json;

    use super::*;

    /// Fails intelligence writes for the listed entity ids.
    struct Flaky {
        inner: MemoryResearchStore,
        broken: HashSet<String>,
    }

    #[async_trait]
    impl ResearchStore for Flaky {
        async fn load(&self, key: &RecordKey) -> Result<Option<ResearchRecord>, StoreError> {
            self.inner.load(key).await
        }

        async fn upsert_research(
            &self,
            key: &RecordKey,
            update: ResearchUpdate,
            fetched_at: DateTime<Utc>,
        ) -> Result<ResearchRecord, StoreError> {
            self.inner.upsert_research(key, update, fetched_at).await
        }

        async fn upsert_intelligence(
            &self,
            key: &RecordKey,
            document: IntelligenceDocument,
            generated_at: DateTime<Utc>,
        ) -> Result<ResearchRecord, StoreError> {
            if self.broken.contains(&key.entity_id) {
                return Err(StoreError::Io {
                    path: "research/broken.json".into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.upsert_intelligence(key, document, generated_at).await
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn roster() -> Vec<Entity> {
        let open_deal = json!([{"title": "Pilot", "value": 12000, "status": "proposal", "lastUpdated": "2026-05-20T00:00:00Z"}]);
        let closed_deal = json!([{"title": "Old", "value": 5000, "status": "closed_won", "lastUpdated": "2026-01-10T00:00:00Z"}]);
        [
            json!({"id": "a", "userId": "u", "company": "Acme", "deals": open_deal.clone()}),
            json!({"id": "b", "userId": "u", "company": "Beta", "notes": "Intro call went well."}),
            json!({"id": "c", "userId": "u", "company": "Cyan", "deals": closed_deal}),
            json!({"id": "d", "userId": "u", "company": "Delta"}),
            json!({"id": "e", "userId": "u", "company": "Echo", "deals": open_deal.clone(), "isActive": false}),
            json!({"id": "f", "userId": "u", "company": "Fox", "deals": open_deal.clone()}),
        ]
        .into_iter()
        .map(|v| serde_json::from_value(v).unwrap())
        .collect()
    }

    fn runner(store: Arc<dyn ResearchStore>) -> BatchRunner {
        let engine = DealScoringEngine::new(Arc::new(RuleBook::builtin().unwrap()), "default").unwrap();
        let generator = IntelligenceGenerator::new(
            Arc::new(engine),
            Arc::new(IndustryTable::builtin().unwrap()),
            None,
        );
        BatchRunner::new(Arc::new(MemoryRoster::new(roster())), store, Arc::new(generator))
            .with_chunking(2, Duration::ZERO)
    }

    #[tokio::test]
    async fn one_failing_entity_does_not_abort_the_batch() {
        let store = Arc::new(Flaky {
            inner: MemoryResearchStore::new(),
            broken: HashSet::from(["f".to_string()]),
        });
        let summary = runner(store.clone()).run(now()).await.unwrap();

        assert_eq!(summary.total, 5);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        let failed = summary.details.iter().find(|d| d.status == BatchStatus::Failed).unwrap();
        assert_eq!(failed.entity_id, "f");
        assert!(failed.error.as_deref().unwrap().contains("disk full"));
        let skipped = summary.details.iter().find(|d| d.status == BatchStatus::Skipped).unwrap();
        assert_eq!(skipped.entity_id, "d");

        let acme = store.load(&RecordKey::new("a", "u")).await.unwrap().unwrap();
        assert!(matches!(acme.intelligence_state(), IntelligenceState::Ready(_)));
    }

    /// Records the virtual time each entity's record is first read.
    struct Clocked {
        inner: MemoryResearchStore,
        started: parking_lot::Mutex<Vec<(String, tokio::time::Instant)>>,
    }

    #[async_trait]
    impl ResearchStore for Clocked {
        async fn load(&self, key: &RecordKey) -> Result<Option<ResearchRecord>, StoreError> {
            self.started
                .lock()
                .push((key.entity_id.clone(), tokio::time::Instant::now()));
            self.inner.load(key).await
        }

        async fn upsert_research(
            &self,
            key: &RecordKey,
            update: ResearchUpdate,
            fetched_at: DateTime<Utc>,
        ) -> Result<ResearchRecord, StoreError> {
            self.inner.upsert_research(key, update, fetched_at).await
        }

        async fn upsert_intelligence(
            &self,
            key: &RecordKey,
            document: IntelligenceDocument,
            generated_at: DateTime<Utc>,
        ) -> Result<ResearchRecord, StoreError> {
            self.inner.upsert_intelligence(key, document, generated_at).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_start_together_and_wait_between() {
        let store = Arc::new(Clocked {
            inner: MemoryResearchStore::new(),
            started: parking_lot::Mutex::new(Vec::new()),
        });
        let entities: Vec<Entity> = (0..5)
            .map(|i| serde_json::from_value(json!({"id": format!("n-{i}"), "userId": "u", "company": "Co", "notes": "Call back next week."})).unwrap())
            .collect();
        let engine = DealScoringEngine::new(Arc::new(RuleBook::builtin().unwrap()), "default").unwrap();
        let generator = IntelligenceGenerator::new(Arc::new(engine), Arc::new(IndustryTable::builtin().unwrap()), None);
        let runner = BatchRunner::new(Arc::new(MemoryRoster::new(entities)), store.clone(), Arc::new(generator))
            .with_chunking(2, Duration::from_secs(1));

        let begin = tokio::time::Instant::now();
        let summary = runner.run(now()).await.unwrap();
        assert_eq!(summary.processed, 5);
        assert!(begin.elapsed() >= Duration::from_secs(2));

        let started = store.started.lock().clone();
        let at = |id: &str| started.iter().find(|(e, _)| e == id).map(|(_, t)| *t - begin).unwrap();
        assert_eq!(at("n-0"), at("n-1"));
        assert_eq!(at("n-2"), at("n-3"));
        assert!(at("n-0") < Duration::from_secs(1));
        assert!(at("n-2") >= Duration::from_secs(1) && at("n-2") < Duration::from_secs(2));
        assert!(at("n-4") >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn deal_less_and_closed_entities_get_advisories() {
        let store = Arc::new(MemoryResearchStore::new());
        runner(store.clone()).run(now()).await.unwrap();

        for id in ["b", "c"] {
            let record = store.load(&RecordKey::new(id, "u")).await.unwrap().unwrap();
            assert!(
                matches!(record.intelligence_state(), IntelligenceState::Advisory(_)),
                "{id} should carry an advisory"
            );
        }
        assert!(store.load(&RecordKey::new("e", "u")).await.unwrap().is_none());
    }
}
