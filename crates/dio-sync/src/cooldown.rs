use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dio_core::{Entity, ResearchRecord};
use dio_storage::{EntityRoster, ResearchStore, StoreError};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RefreshPolicy;
use crate::coordinator::{ResearchCoordinator, ResearchOutcome};

/// A source is due once `window` has fully elapsed since its last fetch.
pub fn is_due(last_fetched: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    match last_fetched {
        Some(at) => now - at >= window,
        None => true,
    }
}

pub fn stale_sources(
    record: Option<&ResearchRecord>,
    sources: &[String],
    now: DateTime<Utc>,
    window: Duration,
) -> Vec<String> {
    sources
        .iter()
        .filter(|source| {
            let last = record.and_then(|r| r.last_fetched.get(source.as_str()).copied());
            is_due(last, now, window)
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooldownDecision {
    /// Every source is inside its window.
    Skip,
    Refresh(Vec<String>),
}

pub fn plan_refresh(
    record: Option<&ResearchRecord>,
    sources: &[String],
    now: DateTime<Utc>,
    window: Duration,
    policy: RefreshPolicy,
) -> CooldownDecision {
    let stale = stale_sources(record, sources, now, window);
    if stale.is_empty() {
        return CooldownDecision::Skip;
    }
    match policy {
        RefreshPolicy::StaleOnly => CooldownDecision::Refresh(stale),
        RefreshPolicy::AllSources => CooldownDecision::Refresh(sources.to_vec()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResearchCycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub considered: usize,
    pub refreshed: usize,
    pub cooling_down: usize,
    pub already_running: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityVisit {
    Refreshed,
    CoolingDown,
    AlreadyRunning,
    Failed,
}

/// Walks the active roster and researches every entity with a due source,
/// up to `concurrency` entities at a time.
pub struct CooldownScheduler {
    roster: Arc<dyn EntityRoster>,
    store: Arc<dyn ResearchStore>,
    coordinator: Arc<ResearchCoordinator>,
    window: Duration,
    policy: RefreshPolicy,
    concurrency: usize,
}

impl CooldownScheduler {
    pub fn new(
        roster: Arc<dyn EntityRoster>,
        store: Arc<dyn ResearchStore>,
        coordinator: Arc<ResearchCoordinator>,
        window: Duration,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            roster,
            store,
            coordinator,
            window,
            policy,
            concurrency: 5,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Only a roster read failure fails the cycle; entity failures are counted and logged.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<ResearchCycleReport, StoreError> {
        let started_at = Utc::now();
        let entities = self.roster.active_entities().await?;
        let sources = self.coordinator.source_ids();
        let mut report = ResearchCycleReport {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            considered: entities.len(),
            refreshed: 0,
            cooling_down: 0,
            already_running: 0,
            failed: 0,
        };

        let pending: Vec<_> = entities
            .iter()
            .map(|entity| self.visit(entity, &sources, now))
            .collect();
        let visits: Vec<EntityVisit> = stream::iter(pending)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for visit in visits {
            match visit {
                EntityVisit::Refreshed => report.refreshed += 1,
                EntityVisit::CoolingDown => report.cooling_down += 1,
                EntityVisit::AlreadyRunning => report.already_running += 1,
                EntityVisit::Failed => report.failed += 1,
            }
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            considered = report.considered,
            refreshed = report.refreshed,
            cooling_down = report.cooling_down,
            failed = report.failed,
            "research cycle finished"
        );
        Ok(report)
    }

    async fn visit(&self, entity: &Entity, sources: &[String], now: DateTime<Utc>) -> EntityVisit {
        let record = match self.store.load(&entity.key()).await {
            Ok(record) => record,
            Err(err) => {
                warn!(entity_id = %entity.id, error = %err, "loading research record failed");
                return EntityVisit::Failed;
            }
        };
        let due = match plan_refresh(record.as_ref(), sources, now, self.window, self.policy) {
            CooldownDecision::Skip => {
                debug!(entity_id = %entity.id, "all sources inside cooldown");
                return EntityVisit::CoolingDown;
            }
            CooldownDecision::Refresh(due) => due,
        };
        debug!(entity_id = %entity.id, sources = ?due, "sources due for refresh");
        match self.coordinator.research(entity, Some(&due), now).await {
            Ok(ResearchOutcome::Completed { .. }) => EntityVisit::Refreshed,
            Ok(ResearchOutcome::Skipped) => EntityVisit::AlreadyRunning,
            Err(err) => {
                warn!(entity_id = %entity.id, error = %err, "research failed");
                EntityVisit::Failed
            }
        }
    }
}
