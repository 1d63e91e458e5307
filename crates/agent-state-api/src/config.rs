use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use agent_state_core::{MemoryStorage, StorageError};
use agent_state_store_postgres::PostgresStorage;
use agent_state_store_sqlite::SqliteStorage;

use crate::{shared, SharedStorage};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://./agent_state.sqlite3";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported storage type `{0}` (expected memory, sqlite or postgresql)")]
    UnknownStorageKind(String),
    #[error("invalid database url `{url}`: {reason}")]
    InvalidDatabaseUrl { url: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    Sqlite,
    Postgresql,
}

impl StorageKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Postgresql => "postgresql",
        }
    }

    /// Pick a backend from the URL scheme; unrecognised schemes fall back to memory.
    #[must_use]
    pub fn infer(database_url: &str) -> Self {
        let scheme = database_url.split(':').next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "sqlite" => Self::Sqlite,
            "postgres" | "postgresql" => Self::Postgresql,
            _ => Self::Memory,
        }
    }
}

impl FromStr for StorageKind {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgresql),
            _ => Err(ConfigError::UnknownStorageKind(raw.to_string())),
        }
    }
}

impl Display for StorageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a `sqlite:` URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    InMemory,
    File(PathBuf),
}

impl SqliteTarget {
    /// Accepts `sqlite::memory:`, `sqlite://./relative.db`, `sqlite:///relative.db`
    /// and `sqlite:////absolute.db`.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidDatabaseUrl`] for other schemes or an empty path.
    pub fn from_url(database_url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDatabaseUrl {
            url: database_url.to_string(),
            reason: reason.to_string(),
        };

        let rest = database_url
            .strip_prefix("sqlite:")
            .ok_or_else(|| invalid("expected a sqlite: url"))?;
        let path = match rest.strip_prefix("//") {
            Some(authority) => authority.strip_prefix('/').unwrap_or(authority),
            None => rest,
        };
        match path {
            ":memory:" => Ok(Self::InMemory),
            "" => Err(invalid("missing database path")),
            path => Ok(Self::File(PathBuf::from(path))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub database_url: String,
}

impl StorageConfig {
    /// An explicit `kind` wins; otherwise it is inferred from `database_url`.
    #[must_use]
    pub fn new(kind: Option<StorageKind>, database_url: Option<String>) -> Self {
        let database_url = database_url.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let kind = kind.unwrap_or_else(|| StorageKind::infer(&database_url));
        Self { kind, database_url }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Open the configured backend once and bootstrap its schema.
///
/// # Errors
/// Returns an error when the URL does not fit the backend or the backend cannot be opened.
pub fn open_storage(config: &StorageConfig) -> Result<SharedStorage, ConfigError> {
    let storage = match config.kind {
        StorageKind::Memory => shared(MemoryStorage::new()),
        StorageKind::Sqlite => match SqliteTarget::from_url(&config.database_url)? {
            SqliteTarget::InMemory => shared(SqliteStorage::open_in_memory()?),
            SqliteTarget::File(path) => shared(SqliteStorage::open(&path)?),
        },
        StorageKind::Postgresql => shared(PostgresStorage::connect(&config.database_url)?),
    };
    tracing::info!(kind = %config.kind, "storage backend ready");
    Ok(storage)
}
