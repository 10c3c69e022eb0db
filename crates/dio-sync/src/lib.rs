//! Research and scoring orchestration: configuration, the cooldown-driven
//! research cycle, the chunked scoring batch and their cron schedule.

pub mod batch;
pub mod config;
pub mod cooldown;
pub mod coordinator;
pub mod inflight;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dio_connectors::{connector_for_source, SourceConnector};
use dio_core::{AdvisoryNotice, BatchSummary, NotesAnalysis};
use dio_intel::{HttpTextGenerator, IndustryTable, IntelligenceGenerator, NarrativeSummarizer, TextGenerator};
use dio_scoring::{DealScoringEngine, RuleBook, ScoringResult};
use dio_storage::{
    ArtifactStore, EntityRoster, FileRoster, HttpClientConfig, HttpFetcher, JsonFileResearchStore,
    ResearchStore,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub use batch::BatchRunner;
pub use config::{IntelConfig, RefreshPolicy, SourceConfig, DEFAULT_CONFIG_PATH};
pub use cooldown::{is_due, plan_refresh, stale_sources, CooldownDecision, CooldownScheduler, ResearchCycleReport};
pub use coordinator::{EntityError, ResearchCoordinator, ResearchOutcome};
pub use inflight::{InFlightGuard, InFlightRegistry};

pub const CRATE_NAME: &str = "dio-sync";

/// Deterministic view of one entity, no generation involved.
#[derive(Debug, Clone, Serialize)]
pub struct EntityAnalysis {
    pub entity_id: String,
    pub company: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisory: Option<AdvisoryNotice>,
    pub notes: NotesAnalysis,
    pub scoring: ScoringResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    Research,
    Scoring,
}

pub struct IntelPipeline {
    config: IntelConfig,
    roster: Arc<dyn EntityRoster>,
    store: Arc<dyn ResearchStore>,
    coordinator: Arc<ResearchCoordinator>,
    generator: Arc<IntelligenceGenerator>,
    cooldown: CooldownScheduler,
    batch: BatchRunner,
}

impl IntelPipeline {
    /// Wires the file-backed roster and store, configured connectors and the
    /// generative client (only when an API key is present).
    pub fn new(config: IntelConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: config.connector_timeout(),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);

        let connectors: Vec<Arc<dyn SourceConnector>> = config
            .enabled_sources()
            .map(|source| {
                let settings = source.connector_settings(|name| std::env::var(name).ok());
                Arc::from(connector_for_source(&settings, Arc::clone(&http)))
            })
            .collect();

        let text_generator = if config.llm.api_key.is_some() {
            let llm_http = Arc::new(HttpFetcher::new(HttpTextGenerator::client_config(
                config.generation_timeout(),
                Some(config.user_agent.clone()),
            ))?);
            let client = HttpTextGenerator::new(llm_http, config.llm.clone());
            Some(Arc::new(client) as Arc<dyn TextGenerator>)
        } else {
            warn!("DIO_LLM_API_KEY not set; reports will use the deterministic fallback");
            None
        };

        let roster: Arc<dyn EntityRoster> = Arc::new(FileRoster::new(config.roster_path.clone()));
        let store: Arc<dyn ResearchStore> = Arc::new(JsonFileResearchStore::new(config.store_dir.clone()));
        Self::with_components(config, roster, store, connectors, text_generator)
    }

    pub fn with_components(
        config: IntelConfig,
        roster: Arc<dyn EntityRoster>,
        store: Arc<dyn ResearchStore>,
        connectors: Vec<Arc<dyn SourceConnector>>,
        text_generator: Option<Arc<dyn TextGenerator>>,
    ) -> Result<Self> {
        let rules = match &config.rules_path {
            Some(path) => RuleBook::from_path(path).with_context(|| format!("loading rules {}", path.display()))?,
            None => RuleBook::builtin().context("loading built-in rules")?,
        };
        let engine = DealScoringEngine::new(Arc::new(rules), &config.taxonomy)
            .with_context(|| format!("selecting taxonomy {}", config.taxonomy))?;
        let industries = match &config.industries_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                IndustryTable::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => IndustryTable::builtin().context("loading built-in industries")?,
        };

        let summarizer = NarrativeSummarizer::new(text_generator.clone(), config.generation_timeout());
        let mut coordinator = ResearchCoordinator::new(connectors, Arc::clone(&store), summarizer)
            .with_connector_timeout(config.connector_timeout());
        if let Some(dir) = &config.artifacts_dir {
            coordinator = coordinator.with_artifacts(ArtifactStore::new(dir.clone()));
        }
        let coordinator = Arc::new(coordinator);

        let generator = Arc::new(
            IntelligenceGenerator::new(Arc::new(engine), Arc::new(industries), text_generator)
                .with_timeout(config.generation_timeout()),
        );

        let cooldown = CooldownScheduler::new(
            Arc::clone(&roster),
            Arc::clone(&store),
            Arc::clone(&coordinator),
            config.cooldown(),
            config.refresh_policy,
        )
        .with_concurrency(config.research_concurrency());
        let batch = BatchRunner::new(Arc::clone(&roster), Arc::clone(&store), Arc::clone(&generator))
            .with_chunking(config.batch_size, config.batch_delay());

        info!(
            sources = ?coordinator.source_ids(),
            taxonomy = %config.taxonomy,
            refresh_policy = ?config.refresh_policy,
            "pipeline ready"
        );
        Ok(Self {
            config,
            roster,
            store,
            coordinator,
            generator,
            cooldown,
            batch,
        })
    }

    pub fn config(&self) -> &IntelConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ResearchStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<ResearchCoordinator> {
        &self.coordinator
    }

    pub async fn run_research_cycle(&self) -> Result<ResearchCycleReport> {
        self.cooldown
            .run_cycle(Utc::now())
            .await
            .context("running research cycle")
    }

    pub async fn run_scoring_cycle(&self) -> Result<BatchSummary> {
        self.batch.run(Utc::now()).await.context("running scoring batch")
    }

    /// Researches one entity now, ignoring its cooldown.
    pub async fn research_entity(&self, entity_id: &str) -> Result<ResearchOutcome, EntityError> {
        self.coordinator
            .research_entity_by_id(self.roster.as_ref(), entity_id, Utc::now())
            .await
    }

    pub async fn analyze_entity(&self, entity_id: &str) -> Result<EntityAnalysis, EntityError> {
        let now = Utc::now();
        let entity = self
            .roster
            .entity(entity_id)
            .await?
            .ok_or_else(|| EntityError::NotFound(entity_id.to_string()))?;
        let research = self.store.load(&entity.key()).await?;
        let engine = self.generator.engine();
        let notes = engine.analyze_notes(&entity.notes);
        let scoring = engine.score(&entity, &notes, research.as_ref(), now);
        Ok(EntityAnalysis {
            entity_id: entity.id.clone(),
            company: entity.company.clone(),
            advisory: IntelligenceGenerator::advisory_for(&entity, now),
            notes,
            scoring,
        })
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for (cron, cycle) in [
            (self.config.research_cron.as_str(), Cycle::Research),
            (self.config.scoring_cron.as_str(), Cycle::Scoring),
        ] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron, move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move { pipeline.run_logged(cycle).await })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(cron, cycle = ?cycle, "scheduled cycle");
        }
        Ok(Some(sched))
    }

    /// Scheduler entry point: a failed cycle is logged and the next tick runs as usual.
    async fn run_logged(&self, cycle: Cycle) {
        let result = match cycle {
            Cycle::Research => self.run_research_cycle().await.map(|_| ()),
            Cycle::Scoring => self.run_scoring_cycle().await.map(|_| ()),
        };
        if let Err(err) = result {
            warn!(cycle = ?cycle, error = %format!("{err:#}"), "scheduled cycle failed");
        }
    }
}
