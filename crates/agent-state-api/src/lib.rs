//! Typed access to per-user and global agent state on top of a [`StorageInterface`] backend.

use std::sync::Arc;

use agent_state_core::{Record, StorageError, StorageInterface};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

mod accessor;
mod config;
mod user_state;
mod world_state;

pub use accessor::StateAccessor;
pub use config::{
    open_storage, ConfigError, SqliteTarget, StorageConfig, StorageKind, DEFAULT_DATABASE_URL,
};
pub use user_state::{UserState, UserStateCreate, UserStateManager, UserStateUpdate};
pub use world_state::{WorldState, WorldStateCreate, WorldStateManager, WorldStateUpdate};

/// One backend shared by every manager. The lock is held for a single storage call.
pub type SharedStorage = Arc<Mutex<dyn StorageInterface + Send>>;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[must_use]
pub fn shared<S>(storage: S) -> SharedStorage
where
    S: StorageInterface + Send + 'static,
{
    Arc::new(Mutex::new(storage))
}

fn require_non_blank(field: &str, value: &str) -> StateResult<()> {
    if value.trim().is_empty() {
        return Err(StateError::Validation(format!("`{field}` must not be blank")));
    }
    Ok(())
}

fn text_or_null(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::String)
}

fn decode<T: DeserializeOwned>(table: &str, record: Record) -> StateResult<T> {
    serde_json::from_value(Value::Object(record))
        .map_err(|err| StateError::Validation(format!("malformed {table} record: {err}")))
}

fn project<T: Serialize>(state: &T) -> StateResult<Record> {
    match serde_json::to_value(state) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => {
            Err(StateError::Validation(format!("state did not serialize to an object: {other}")))
        }
        Err(err) => Err(StateError::Validation(format!("state could not be serialized: {err}"))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use agent_state_core::MemoryStorage;
    use agent_state_store_sqlite::SqliteStorage;

    use super::{shared, SharedStorage};

    /// Every backend that needs no external service, each freshly opened.
    pub fn local_backends() -> anyhow::Result<Vec<(&'static str, SharedStorage)>> {
        Ok(vec![
            ("memory", shared(MemoryStorage::new())),
            ("sqlite", shared(SqliteStorage::open_in_memory()?)),
        ])
    }
}
