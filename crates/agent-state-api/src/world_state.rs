use agent_state_core::{new_record_id, Filter, Record, ID_FIELD, WORLD_STATES_TABLE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{decode, require_non_blank, text_or_null, SharedStorage, StateResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldStateCreate {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldStateUpdate {
    pub value: Option<String>,
}

impl WorldStateUpdate {
    fn into_patch(self) -> Record {
        let mut patch = Record::new();
        if let Some(value) = self.value {
            patch.insert("value".to_string(), Value::String(value));
        }
        patch
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldState {
    pub id: String,
    pub key: String,
    pub value: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Global key/value state stored in `world_states`.
#[derive(Clone)]
pub struct WorldStateManager {
    storage: SharedStorage,
}

impl WorldStateManager {
    pub const TABLE: &'static str = WORLD_STATES_TABLE;

    #[must_use]
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }

    /// Insert a new world state. No lookup by key happens first; relational
    /// backends refuse a duplicate key with a storage error.
    ///
    /// # Errors
    /// Returns [`crate::StateError::Validation`] for a blank `key`, or a storage
    /// error when the insert fails.
    pub fn create(&self, input: WorldStateCreate) -> StateResult<WorldState> {
        require_non_blank("key", &input.key)?;

        let mut data = Record::new();
        data.insert(ID_FIELD.to_string(), Value::String(new_record_id()));
        data.insert("key".to_string(), Value::String(input.key));
        data.insert("value".to_string(), text_or_null(input.value));

        let created = self.storage.lock().create(Self::TABLE, data)?;
        let state: WorldState = decode(Self::TABLE, created)?;
        tracing::info!(id = %state.id, key = %state.key, "world state created");
        Ok(state)
    }

    /// # Errors
    /// Returns an error when the storage read fails or the record is malformed.
    pub fn get(&self, id: &str) -> StateResult<Option<WorldState>> {
        let record = self.storage.lock().get(Self::TABLE, id)?;
        record.map(|record| decode(Self::TABLE, record)).transpose()
    }

    /// # Errors
    /// Returns an error when the storage read fails or the record is malformed.
    pub fn get_by_key(&self, key: &str) -> StateResult<Option<WorldState>> {
        let filter = Filter::new().with("key", key);
        let first = self.storage.lock().list(Self::TABLE, &filter)?.into_iter().next();
        first.map(|record| decode(Self::TABLE, record)).transpose()
    }

    /// # Errors
    /// Returns an error when the storage read fails or a record is malformed.
    pub fn list_all(&self) -> StateResult<Vec<WorldState>> {
        let records = self.storage.lock().list(Self::TABLE, &Filter::new())?;
        records.into_iter().map(|record| decode(Self::TABLE, record)).collect()
    }

    /// Same no-op rule as [`crate::UserStateManager::update`].
    ///
    /// # Errors
    /// Returns an error when the storage call fails or the record is malformed.
    pub fn update(&self, id: &str, update: WorldStateUpdate) -> StateResult<Option<WorldState>> {
        let patch = update.into_patch();
        if patch.is_empty() {
            return self.get(id);
        }

        let updated = self.storage.lock().update(Self::TABLE, id, patch)?;
        let Some(record) = updated else {
            return Ok(None);
        };
        tracing::info!(id, "world state updated");
        decode(Self::TABLE, record).map(Some)
    }

    /// # Errors
    /// Returns an error when the storage call fails or the record is malformed.
    pub fn update_by_key(
        &self,
        key: &str,
        update: WorldStateUpdate,
    ) -> StateResult<Option<WorldState>> {
        match self.get_by_key(key)? {
            Some(existing) => self.update(&existing.id, update),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when the storage call fails.
    pub fn delete(&self, id: &str) -> StateResult<bool> {
        let removed = self.storage.lock().delete(Self::TABLE, id)?;
        if removed {
            tracing::info!(id, "world state deleted");
        }
        Ok(removed)
    }
}
