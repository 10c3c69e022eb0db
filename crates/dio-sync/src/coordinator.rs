use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dio_connectors::{FetchContext, SourceConnector};
use dio_core::{Entity, RecordKey, ResearchRecord, ResearchUpdate, SourcePayload};
use dio_intel::NarrativeSummarizer;
use dio_storage::{ArtifactStore, EntityRoster, ResearchStore, StoreError};
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::inflight::InFlightRegistry;

/// Failures at the entity boundary. They abort one entity, never a cycle.
#[derive(Debug, Error)]
pub enum EntityError {
    #[error("entity {0} not found")]
    NotFound(String),
    #[error("entity is missing its id or user id")]
    MissingIdentifiers,
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResearchOutcome {
    Completed {
        record: ResearchRecord,
        sources: Vec<String>,
        archived: usize,
    },
    /// Another run already holds this entity.
    Skipped,
}

/// Fans one entity out to every connector and upserts the merged result.
pub struct ResearchCoordinator {
    connectors: Vec<Arc<dyn SourceConnector>>,
    store: Arc<dyn ResearchStore>,
    summarizer: NarrativeSummarizer,
    artifacts: Option<ArtifactStore>,
    in_flight: Arc<InFlightRegistry>,
    connector_timeout: Duration,
}

impl ResearchCoordinator {
    pub fn new(
        connectors: Vec<Arc<dyn SourceConnector>>,
        store: Arc<dyn ResearchStore>,
        summarizer: NarrativeSummarizer,
    ) -> Self {
        Self {
            connectors,
            store,
            summarizer,
            artifacts: None,
            in_flight: InFlightRegistry::new(),
            connector_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_connector_timeout(mut self, timeout: Duration) -> Self {
        self.connector_timeout = timeout;
        self
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.connectors.iter().map(|c| c.source_id().to_string()).collect()
    }

    pub fn in_flight(&self) -> &Arc<InFlightRegistry> {
        &self.in_flight
    }

    /// Researches `entity` across `sources` (all connectors when `None`).
    pub async fn research(
        &self,
        entity: &Entity,
        sources: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<ResearchOutcome, EntityError> {
        if !entity.has_identifiers() {
            return Err(EntityError::MissingIdentifiers);
        }
        let key = entity.key();
        let Some(_guard) = self.in_flight.try_acquire(key.clone()) else {
            debug!(%key, "research already running, skipping");
            return Ok(ResearchOutcome::Skipped);
        };

        let span = info_span!("research_entity", entity_id = %entity.id, user_id = %entity.user_id);
        self.run(entity, &key, sources, now).instrument(span).await
    }

    pub async fn research_entity_by_id(
        &self,
        roster: &dyn EntityRoster,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ResearchOutcome, EntityError> {
        let entity = roster
            .entity(entity_id)
            .await?
            .ok_or_else(|| EntityError::NotFound(entity_id.to_string()))?;
        self.research(&entity, None, now).await
    }

    async fn run(
        &self,
        entity: &Entity,
        key: &RecordKey,
        sources: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<ResearchOutcome, EntityError> {
        let selected: Vec<&dyn SourceConnector> = self
            .connectors
            .iter()
            .map(|c| c.as_ref())
            .filter(|c| sources.map_or(true, |wanted| wanted.iter().any(|s| s == c.source_id())))
            .collect();

        let ctx = FetchContext::new(&entity.company, &entity.id, &entity.user_id);
        let fetched = join_all(selected.iter().map(|connector| self.fetch_one(*connector, &ctx))).await;
        let mut payloads = BTreeMap::new();
        let mut failed_sources = BTreeSet::new();
        for (source_id, payload) in fetched {
            match payload {
                Some(payload) => {
                    payloads.insert(source_id, payload);
                }
                None => {
                    failed_sources.insert(source_id);
                }
            }
        }

        let payload_hashes = self.archive(key, &payloads, now).await;
        let attempted: Vec<String> = payloads
            .keys()
            .chain(failed_sources.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let item_count: usize = payloads.values().map(Vec::len).sum();
        let failed = failed_sources.len();
        let archived = payload_hashes.len();
        let mut update = ResearchUpdate {
            payloads,
            payload_hashes,
            failed_sources,
            narrative_summary: String::new(),
        };

        // Summarize what the record will hold after the merge, not just this run.
        let mut merged = self
            .store
            .load(key)
            .await?
            .unwrap_or_else(|| ResearchRecord::new(key, now));
        merged.merge_research(update.clone(), now);
        update.narrative_summary = self.summarizer.summarize(entity, &merged.data).await;

        let record = self.store.upsert_research(key, update, now).await?;

        info!(
            sources = attempted.len(),
            failed,
            items = item_count,
            archived,
            "research stored"
        );
        Ok(ResearchOutcome::Completed {
            record,
            sources: attempted,
            archived,
        })
    }

    /// `None` when the connector failed or timed out.
    async fn fetch_one(
        &self,
        connector: &dyn SourceConnector,
        ctx: &FetchContext,
    ) -> (String, Option<SourcePayload>) {
        let source_id = connector.source_id().to_string();
        match tokio::time::timeout(self.connector_timeout, connector.fetch(ctx)).await {
            Ok(payload) => (source_id, payload),
            Err(_) => {
                warn!(
                    source_id = %source_id,
                    kind = ?connector.kind(),
                    timeout = ?self.connector_timeout,
                    "connector timed out; keeping previous payload"
                );
                (source_id, None)
            }
        }
    }

    /// Archives non-empty payloads; a failed write only loses the hash.
    async fn archive(
        &self,
        key: &RecordKey,
        payloads: &BTreeMap<String, SourcePayload>,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        let mut hashes = BTreeMap::new();
        let Some(artifacts) = &self.artifacts else {
            return hashes;
        };
        for (source_id, payload) in payloads.iter().filter(|(_, p)| !p.is_empty()) {
            match artifacts.store_payload(now, source_id, key, payload).await {
                Ok(stored) => {
                    hashes.insert(source_id.clone(), stored.content_hash);
                }
                Err(err) => warn!(source_id = %source_id, error = %err, "payload archive failed"),
            }
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use dio_connectors::{ConnectorError, ConnectorKind};
    use dio_storage::{MemoryResearchStore, MemoryRoster};
    use serde_json::json;

    use super::*;

    struct Scripted {
        id: &'static str,
        delay: Duration,
        fail: AtomicBool,
        empty: bool,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(id: &'static str) -> Self {
            Self {
                id,
                delay: Duration::ZERO,
                fail: AtomicBool::new(false),
                empty: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceConnector for Scripted {
        fn source_id(&self) -> &str {
            self.id
        }

        fn kind(&self) -> ConnectorKind {
            ConnectorKind::Fixture
        }

        async fn fetch_raw(&self, ctx: &FetchContext) -> Result<SourcePayload, ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(ConnectorError::Payload("scripted failure".into()));
            }
            if self.empty {
                return Ok(Vec::new());
            }
            Ok(vec![json!({"title": format!("{} update from {}", ctx.company, self.id)})])
        }
    }

    fn shared(connector: Scripted) -> Arc<dyn SourceConnector> {
        Arc::new(connector)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap()
    }

    fn entity() -> Entity {
        serde_json::from_value(json!({"id": "e-1", "userId": "u-1", "company": "Umbrella"})).unwrap()
    }

    fn coordinator(connectors: Vec<Arc<dyn SourceConnector>>) -> (ResearchCoordinator, Arc<MemoryResearchStore>) {
        let store = Arc::new(MemoryResearchStore::new());
        let coordinator = ResearchCoordinator::new(connectors, store.clone(), NarrativeSummarizer::deterministic());
        (coordinator, store)
    }

    #[tokio::test]
    async fn failing_and_slow_connectors_do_not_block_the_run() {
        let slow = Scripted {
            delay: Duration::from_secs(5),
            ..Scripted::new("slow")
        };
        let broken = Scripted {
            fail: AtomicBool::new(true),
            ..Scripted::new("broken")
        };
        let (coordinator, store) = coordinator(vec![shared(Scripted::new("news")), shared(slow), shared(broken)]);
        let coordinator = coordinator.with_connector_timeout(Duration::from_millis(50));

        let outcome = coordinator.research(&entity(), None, now()).await.unwrap();
        let ResearchOutcome::Completed { record, sources, .. } = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(sources, vec!["broken", "news", "slow"]);
        assert_eq!(record.source_items("news").len(), 1);
        assert!(record.source_items("slow").is_empty());
        assert!(record.source_items("broken").is_empty());
        assert_eq!(record.last_fetched.len(), 3);
        assert!(record.narrative_summary.starts_with("Research for Umbrella:"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_runs_for_one_entity_execute_once() {
        let connector = Arc::new(Scripted {
            delay: Duration::from_millis(50),
            ..Scripted::new("news")
        });
        let (coordinator, _store) = coordinator(vec![connector.clone() as Arc<dyn SourceConnector>]);
        let entity = entity();

        let (a, b) = tokio::join!(
            coordinator.research(&entity, None, now()),
            coordinator.research(&entity, None, now())
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let skipped = outcomes.iter().filter(|o| **o == ResearchOutcome::Skipped).count();
        assert_eq!(skipped, 1);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.in_flight().is_empty());
    }

    #[tokio::test]
    async fn source_subset_only_touches_named_connectors() {
        let news = Arc::new(Scripted::new("news"));
        let forum = Arc::new(Scripted::new("forum"));
        let (coordinator, _store) = coordinator(vec![
            news.clone() as Arc<dyn SourceConnector>,
            forum.clone() as Arc<dyn SourceConnector>,
        ]);

        let only = vec!["forum".to_string()];
        coordinator.research(&entity(), Some(&only), now()).await.unwrap();
        assert_eq!(news.calls.load(Ordering::SeqCst), 0);
        assert_eq!(forum.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn payloads_are_archived_with_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let broken = Scripted {
            fail: AtomicBool::new(true),
            ..Scripted::new("broken")
        };
        let (coordinator, _store) = coordinator(vec![shared(Scripted::new("news")), shared(broken)]);
        let coordinator = coordinator.with_artifacts(ArtifactStore::new(dir.path()));

        let ResearchOutcome::Completed { record, archived, .. } =
            coordinator.research(&entity(), None, now()).await.unwrap()
        else {
            panic!("expected a completed run");
        };
        assert_eq!(archived, 1);
        let hash = record.payload_hashes.get("news").unwrap();
        assert_eq!(hash.len(), 64);
        assert!(!record.payload_hashes.contains_key("broken"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_last_good_payload_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let news = Arc::new(Scripted::new("news"));
        let (coordinator, store) = coordinator(vec![news.clone() as Arc<dyn SourceConnector>]);
        let coordinator = coordinator.with_artifacts(ArtifactStore::new(dir.path()));
        coordinator.research(&entity(), None, now()).await.unwrap();
        let key = entity().key();
        let before = store.load(&key).await.unwrap().unwrap();

        news.fail.store(true, Ordering::SeqCst);
        let later = now() + chrono::Duration::hours(13);
        coordinator.research(&entity(), None, later).await.unwrap();

        let after = store.load(&key).await.unwrap().unwrap();
        assert_eq!(after.source_items("news"), before.source_items("news"));
        assert_eq!(after.payload_hashes.get("news"), before.payload_hashes.get("news"));
        assert_eq!(after.last_fetched["news"], later);
        assert_eq!(after.narrative_summary, before.narrative_summary);
    }

    #[tokio::test]
    async fn narrative_covers_sources_not_refreshed_this_run() {
        let forum = Scripted {
            empty: true,
            ..Scripted::new("forum")
        };
        let (coordinator, _store) = coordinator(vec![shared(Scripted::new("news")), shared(forum)]);
        coordinator.research(&entity(), None, now()).await.unwrap();

        let only = vec!["forum".to_string()];
        let later = now() + chrono::Duration::hours(13);
        let ResearchOutcome::Completed { record, sources, .. } =
            coordinator.research(&entity(), Some(&only), later).await.unwrap()
        else {
            panic!("expected a completed run");
        };
        assert_eq!(sources, vec!["forum"]);
        assert_eq!(record.source_items("news").len(), 1);
        assert!(record.narrative_summary.contains("Umbrella update from news"));
        assert!(!record.narrative_summary.starts_with("No external research"));
    }

    #[tokio::test]
    async fn entity_boundary_errors() {
        let (coordinator, _store) = coordinator(vec![shared(Scripted::new("news"))]);

        let anonymous: Entity = serde_json::from_value(json!({"id": "", "userId": "u-1", "company": "X"})).unwrap();
        assert!(matches!(
            coordinator.research(&anonymous, None, now()).await,
            Err(EntityError::MissingIdentifiers)
        ));

        let roster = MemoryRoster::new(vec![entity()]);
        assert!(matches!(
            coordinator.research_entity_by_id(&roster, "missing", now()).await,
            Err(EntityError::NotFound(id)) if id == "missing"
        ));
        assert!(matches!(
            coordinator.research_entity_by_id(&roster, "e-1", now()).await,
            Ok(ResearchOutcome::Completed { .. })
        ));
    }
}
