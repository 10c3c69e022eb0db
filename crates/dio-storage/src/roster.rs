use std::path::PathBuf;

use async_trait::async_trait;
use dio_core::Entity;
use tokio::fs;

use crate::StoreError;

/// Read side of the surrounding CRM: the entities research and scoring run over.
#[async_trait]
pub trait EntityRoster: Send + Sync {
    async fn entities(&self) -> Result<Vec<Entity>, StoreError>;

    async fn active_entities(&self) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .entities()
            .await?
            .into_iter()
            .filter(|e| e.is_active)
            .collect())
    }

    async fn entity(&self, entity_id: &str) -> Result<Option<Entity>, StoreError> {
        Ok(self
            .entities()
            .await?
            .into_iter()
            .find(|e| e.id == entity_id))
    }
}

/// Roster exported by the CRM as a JSON array or YAML list. Re-read on every call.
#[derive(Debug, Clone)]
pub struct FileRoster {
    path: PathBuf,
}

impl FileRoster {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn is_yaml(&self) -> bool {
        matches!(
            self.path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        )
    }
}

#[async_trait]
impl EntityRoster for FileRoster {
    async fn entities(&self) -> Result<Vec<Entity>, StoreError> {
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        let context = self.path.display().to_string();
        if self.is_yaml() {
            serde_yaml::from_str(&text).map_err(|source| StoreError::Yaml { context, source })
        } else {
            serde_json::from_str(&text).map_err(|source| StoreError::Json { context, source })
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRoster {
    entities: Vec<Entity>,
}

impl MemoryRoster {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl EntityRoster for MemoryRoster {
    async fn entities(&self) -> Result<Vec<Entity>, StoreError> {
        Ok(self.entities.clone())
    }
}
