use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dio_core::{IntelligenceDocument, RecordKey, ResearchRecord, ResearchUpdate};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::artifacts::write_all_atomic;
use crate::{ArtifactStore, StoreError};

/// Upsert-by-composite-key document store for research records.
///
/// Both writes are upserts: a missing record is created, an existing one is
/// merged in place, so a retried write leaves the same document behind.
#[async_trait]
pub trait ResearchStore: Send + Sync {
    async fn load(&self, key: &RecordKey) -> Result<Option<ResearchRecord>, StoreError>;

    async fn upsert_research(
        &self,
        key: &RecordKey,
        update: ResearchUpdate,
        fetched_at: DateTime<Utc>,
    ) -> Result<ResearchRecord, StoreError>;

    async fn upsert_intelligence(
        &self,
        key: &RecordKey,
        document: IntelligenceDocument,
        generated_at: DateTime<Utc>,
    ) -> Result<ResearchRecord, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryResearchStore {
    records: Mutex<HashMap<RecordKey, ResearchRecord>>,
}

impl MemoryResearchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn insert(&self, record: ResearchRecord) {
        self.records.lock().await.insert(record.key(), record);
    }
}

#[async_trait]
impl ResearchStore for MemoryResearchStore {
    async fn load(&self, key: &RecordKey) -> Result<Option<ResearchRecord>, StoreError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn upsert_research(
        &self,
        key: &RecordKey,
        update: ResearchUpdate,
        fetched_at: DateTime<Utc>,
    ) -> Result<ResearchRecord, StoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(key.clone())
            .or_insert_with(|| ResearchRecord::new(key, fetched_at));
        record.merge_research(update, fetched_at);
        Ok(record.clone())
    }

    async fn upsert_intelligence(
        &self,
        key: &RecordKey,
        document: IntelligenceDocument,
        generated_at: DateTime<Utc>,
    ) -> Result<ResearchRecord, StoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(key.clone())
            .or_insert_with(|| ResearchRecord::new(key, generated_at));
        record.deal_intelligence = Some(document);
        Ok(record.clone())
    }
}

/// One JSON document per key under `root`, replaced atomically on every write.
#[derive(Debug)]
pub struct JsonFileResearchStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileResearchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, key: &RecordKey) -> PathBuf {
        let digest = ArtifactStore::sha256_hex(key.to_string().as_bytes());
        self.root.join(format!("{}.json", &digest[..24]))
    }

    async fn read_record(&self, key: &RecordKey) -> Result<Option<ResearchRecord>, StoreError> {
        let path = self.record_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(&path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Json {
                context: path.display().to_string(),
                source,
            })
    }

    async fn write_record(&self, record: &ResearchRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;
        let path = self.record_path(&record.key());
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Json {
            context: record.key().to_string(),
            source,
        })?;
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        write_all_atomic(&temp_path, &path, &bytes).await
    }

    async fn modify<F>(
        &self,
        key: &RecordKey,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<ResearchRecord, StoreError>
    where
        F: FnOnce(&mut ResearchRecord) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .read_record(key)
            .await?
            .unwrap_or_else(|| ResearchRecord::new(key, now));
        apply(&mut record);
        self.write_record(&record).await?;
        Ok(record)
    }
}

#[async_trait]
impl ResearchStore for JsonFileResearchStore {
    async fn load(&self, key: &RecordKey) -> Result<Option<ResearchRecord>, StoreError> {
        self.read_record(key).await
    }

    async fn upsert_research(
        &self,
        key: &RecordKey,
        update: ResearchUpdate,
        fetched_at: DateTime<Utc>,
    ) -> Result<ResearchRecord, StoreError> {
        self.modify(key, fetched_at, move |record| {
            record.merge_research(update, fetched_at)
        })
        .await
    }

    async fn upsert_intelligence(
        &self,
        key: &RecordKey,
        document: IntelligenceDocument,
        generated_at: DateTime<Utc>,
    ) -> Result<ResearchRecord, StoreError> {
        self.modify(key, generated_at, move |record| {
            record.deal_intelligence = Some(document)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dio_core::{AdvisoryNotice, AdvisoryReason};
    use serde_json::json;
    use tempfile::tempdir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().unwrap()
    }

    fn news_update(title: &str) -> ResearchUpdate {
        let mut update = ResearchUpdate::default();
        update
            .payloads
            .insert("news".to_string(), vec![json!({ "title": title })]);
        update.narrative_summary = format!("summary for {title}");
        update
    }

    #[tokio::test]
    async fn file_store_upserts_one_document_per_key() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileResearchStore::new(dir.path());
        let key = RecordKey::new("c1", "u1");

        assert!(store.load(&key).await.unwrap().is_none());
        store.upsert_research(&key, news_update("first"), at(1)).await.unwrap();
        store.upsert_research(&key, news_update("second"), at(2)).await.unwrap();
        let doc = IntelligenceDocument::Advisory(AdvisoryNotice::new(AdvisoryReason::NoDeals, at(3)));
        store.upsert_intelligence(&key, doc.clone(), at(3)).await.unwrap();

        let loaded = store.load(&key).await.unwrap().expect("record");
        assert_eq!(loaded.source_items("news")[0]["title"], "second");
        assert_eq!(loaded.last_fetched["news"], at(2));
        assert_eq!(loaded.deal_intelligence, Some(doc));

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn repeated_identical_writes_are_idempotent() {
        let store = MemoryResearchStore::new();
        let key = RecordKey::new("c2", "u1");
        let a = store.upsert_research(&key, news_update("same"), at(4)).await.unwrap();
        let b = store.upsert_research(&key, news_update("same"), at(4)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn intelligence_upsert_creates_missing_record() {
        let store = MemoryResearchStore::new();
        let key = RecordKey::new("c3", "u9");
        let doc = IntelligenceDocument::Advisory(AdvisoryNotice::new(
            AdvisoryReason::AllDealsClosed,
            at(5),
        ));
        let record = store.upsert_intelligence(&key, doc, at(5)).await.unwrap();
        assert!(record.data.is_empty());
        assert_eq!(record.user_id, "u9");
    }
}
