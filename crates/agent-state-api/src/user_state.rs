use agent_state_core::{new_record_id, Filter, Record, ID_FIELD, USER_STATES_TABLE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{decode, require_non_blank, text_or_null, SharedStorage, StateResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStateCreate {
    pub user_id: String,
    pub key: String,
    pub value: Option<String>,
}

/// Partial update. Fields left as `None` are not written.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStateUpdate {
    pub value: Option<String>,
}

impl UserStateUpdate {
    fn into_patch(self) -> Record {
        let mut patch = Record::new();
        if let Some(value) = self.value {
            patch.insert("value".to_string(), Value::String(value));
        }
        patch
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserState {
    pub id: String,
    pub user_id: String,
    pub key: String,
    pub value: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Per-user key/value state stored in `user_states`.
///
/// `(user_id, key)` is not unique at this level: [`UserStateManager::create`]
/// always inserts, and lookups by key return the first match in list order.
#[derive(Clone)]
pub struct UserStateManager {
    storage: SharedStorage,
}

impl UserStateManager {
    pub const TABLE: &'static str = USER_STATES_TABLE;

    #[must_use]
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }

    /// # Errors
    /// Returns [`crate::StateError::Validation`] for a blank `user_id` or `key`,
    /// or a storage error when the insert fails.
    pub fn create(&self, input: UserStateCreate) -> StateResult<UserState> {
        require_non_blank("user_id", &input.user_id)?;
        require_non_blank("key", &input.key)?;

        let mut data = Record::new();
        data.insert(ID_FIELD.to_string(), Value::String(new_record_id()));
        data.insert("user_id".to_string(), Value::String(input.user_id));
        data.insert("key".to_string(), Value::String(input.key));
        data.insert("value".to_string(), text_or_null(input.value));

        let created = self.storage.lock().create(Self::TABLE, data)?;
        let state: UserState = decode(Self::TABLE, created)?;
        tracing::info!(
            id = %state.id,
            user_id = %state.user_id,
            key = %state.key,
            "user state created"
        );
        Ok(state)
    }

    /// # Errors
    /// Returns an error when the storage read fails or the record is malformed.
    pub fn get(&self, id: &str) -> StateResult<Option<UserState>> {
        let record = self.storage.lock().get(Self::TABLE, id)?;
        record.map(|record| decode(Self::TABLE, record)).transpose()
    }

    /// # Errors
    /// Returns an error when the storage read fails or a record is malformed.
    pub fn get_by_user_and_key(&self, user_id: &str, key: &str) -> StateResult<Option<UserState>> {
        let filter = Filter::new().with("user_id", user_id).with("key", key);
        let first = self.storage.lock().list(Self::TABLE, &filter)?.into_iter().next();
        first.map(|record| decode(Self::TABLE, record)).transpose()
    }

    /// # Errors
    /// Returns an error when the storage read fails or a record is malformed.
    pub fn list_by_user(&self, user_id: &str) -> StateResult<Vec<UserState>> {
        self.list(&Filter::new().with("user_id", user_id))
    }

    /// # Errors
    /// Returns an error when the storage read fails or a record is malformed.
    pub fn list_all(&self) -> StateResult<Vec<UserState>> {
        self.list(&Filter::new())
    }

    fn list(&self, filter: &Filter) -> StateResult<Vec<UserState>> {
        let records = self.storage.lock().list(Self::TABLE, filter)?;
        records.into_iter().map(|record| decode(Self::TABLE, record)).collect()
    }

    /// Apply the present fields of `update`. With nothing to apply this only
    /// reads, returning the current record.
    ///
    /// # Errors
    /// Returns an error when the storage call fails or the record is malformed.
    pub fn update(&self, id: &str, update: UserStateUpdate) -> StateResult<Option<UserState>> {
        let patch = update.into_patch();
        if patch.is_empty() {
            return self.get(id);
        }

        let updated = self.storage.lock().update(Self::TABLE, id, patch)?;
        let Some(record) = updated else {
            return Ok(None);
        };
        tracing::info!(id, "user state updated");
        decode(Self::TABLE, record).map(Some)
    }

    /// # Errors
    /// Returns an error when the storage call fails.
    pub fn delete(&self, id: &str) -> StateResult<bool> {
        let removed = self.storage.lock().delete(Self::TABLE, id)?;
        if removed {
            tracing::info!(id, "user state deleted");
        }
        Ok(removed)
    }
}
