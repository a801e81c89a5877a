use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// A database connection registered at runtime under a unique alias.
#[derive(Debug, Clone, Serialize)]
pub struct SavedConnection {
    pub alias: String,
    /// Never serialized into responses; callers decide what to expose.
    #[serde(skip_serializing)]
    pub url: String,
    pub maintenance_db: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SavedConnectionError {
    #[error("connection alias already exists")]
    Duplicate,

    #[error("connection alias not found")]
    NotFound,
}

/// In-process registry of saved connections, used by the
/// database-management tools. Aliases are unique.
#[derive(Default)]
pub struct SavedConnectionRegistry {
    inner: RwLock<HashMap<String, SavedConnection>>,
}

impl SavedConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        alias: &str,
        url: &str,
        maintenance_db: &str,
        description: &str,
    ) -> Result<SavedConnection, SavedConnectionError> {
        let mut inner = self.inner.write().unwrap();
        if inner.contains_key(alias) {
            return Err(SavedConnectionError::Duplicate);
        }
        let now = Utc::now();
        let conn = SavedConnection {
            alias: alias.to_string(),
            url: url.to_string(),
            maintenance_db: maintenance_db.to_string(),
            description: description.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.insert(alias.to_string(), conn.clone());
        Ok(conn)
    }

    pub fn update(
        &self,
        alias: &str,
        url: Option<&str>,
        description: Option<&str>,
    ) -> Result<SavedConnection, SavedConnectionError> {
        let mut inner = self.inner.write().unwrap();
        let conn = inner.get_mut(alias).ok_or(SavedConnectionError::NotFound)?;
        if let Some(url) = url {
            conn.url = url.to_string();
        }
        if let Some(description) = description {
            conn.description = description.to_string();
        }
        conn.updated_at = Utc::now();
        Ok(conn.clone())
    }

    pub fn get(&self, alias: &str) -> Option<SavedConnection> {
        self.inner.read().unwrap().get(alias).cloned()
    }

    pub fn remove(&self, alias: &str) -> Result<SavedConnection, SavedConnectionError> {
        self.inner
            .write()
            .unwrap()
            .remove(alias)
            .ok_or(SavedConnectionError::NotFound)
    }

    pub fn list(&self) -> Vec<SavedConnection> {
        let mut out: Vec<SavedConnection> = self.inner.read().unwrap().values().cloned().collect();
        out.sort_by(|a, b| a.alias.cmp(&b.alias));
        out
    }
}
