use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dio_core::{RecordKey, SourcePayload};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::StoreError;

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once archive of raw connector payloads.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<yyyymmdd>/<source>/<entity>/<hash>.json`
    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        key: &RecordKey,
        content_hash: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        PathBuf::from(day)
            .join(path_segment(source_id))
            .join(path_segment(&key.entity_id))
            .join(format!("{content_hash}.json"))
    }

    pub async fn store_payload(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        key: &RecordKey,
        payload: &SourcePayload,
    ) -> Result<StoredArtifact, StoreError> {
        let bytes = serde_json::to_vec(payload).map_err(|source| StoreError::Json {
            context: format!("{source_id} payload for {key}"),
            source,
        })?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.payload_relative_path(fetched_at, source_id, key, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StoreError::io(&parent, e))?;

        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .map_err(|e| StoreError::io(&absolute_path, e))?
        {
            return Ok(artifact(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        write_all_atomic(&temp_path, &absolute_path, &bytes).await?;
        Ok(artifact(false))
    }
}

/// Write to a temp file in the target directory, then rename into place.
pub(crate) async fn write_all_atomic(
    temp_path: &Path,
    final_path: &Path,
    bytes: &[u8],
) -> Result<(), StoreError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(|e| StoreError::io(temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(temp_path, e))?;
    file.flush().await.map_err(|e| StoreError::io(temp_path, e))?;
    drop(file);

    if let Err(err) = fs::rename(temp_path, final_path).await {
        let _ = fs::remove_file(temp_path).await;
        return Err(StoreError::io(final_path, err));
    }
    Ok(())
}

fn path_segment(input: &str) -> String {
    let cleaned = input
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn payload_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_payloads_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let key = RecordKey::new("client/42", "u1");
        let payload = vec![json!({"title": "Acme raises Series B"})];

        let first = store
            .store_payload(fetched_at, "news", &key, &payload)
            .await
            .expect("first store");
        let second = store
            .store_payload(fetched_at, "news", &key, &payload)
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
        assert!(first.relative_path.starts_with("20260224/news/client_42"));
    }
}
