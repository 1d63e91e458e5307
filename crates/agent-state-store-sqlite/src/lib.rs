use std::path::Path;

use agent_state_core::{
    ensure_id, format_timestamp, next_timestamp, now_utc_micros, parse_timestamp, BackendContext,
    EntityTable, Filter, Record, StorageError, StorageInterface, StorageResult, CREATED_AT_FIELD,
    ID_FIELD, UPDATED_AT_FIELD,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;

const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS user_states (
  "id" TEXT PRIMARY KEY,
  "user_id" TEXT NOT NULL,
  "key" TEXT NOT NULL,
  "value" TEXT,
  "created_at" TEXT NOT NULL,
  "updated_at" TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS world_states (
  "id" TEXT PRIMARY KEY,
  "key" TEXT NOT NULL UNIQUE,
  "value" TEXT,
  "created_at" TEXT NOT NULL,
  "updated_at" TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_user_states_user_id ON user_states("user_id");
CREATE INDEX IF NOT EXISTS idx_user_states_key ON user_states("key");
"#;

/// `SQLite` backend. Timestamps are stored as fixed-width RFC 3339 text.
pub struct SqliteStorage {
    conn: Connection,
}

struct RawRow {
    id: String,
    data: Vec<Option<String>>,
    created_at: String,
    updated_at: String,
}

impl SqliteStorage {
    /// Open a `SQLite` database file, configure runtime pragmas and create missing tables.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or initialized.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path).with_backend_context(|| {
            format!("failed to open sqlite database at {}", path.display())
        })?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database; it disappears when the value is dropped.
    ///
    /// # Errors
    /// Returns an error when the database cannot be initialized.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()
            .backend_context("failed to open in-memory sqlite database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .backend_context("failed to configure sqlite pragmas")?;

        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create the entity tables and indexes when they do not exist yet. Idempotent.
    ///
    /// # Errors
    /// Returns an error when the DDL cannot be applied.
    pub fn ensure_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(CREATE_SCHEMA_SQL).backend_context("failed to apply sqlite schema")
    }
}

impl StorageInterface for SqliteStorage {
    fn create(&mut self, table: &str, mut data: Record) -> StorageResult<Record> {
        let entity = EntityTable::resolve(table)?;
        let id = ensure_id(&mut data)?;
        let values = entity.insert_values(&data)?;
        let stamp = format_timestamp(now_utc_micros())?;

        let mut bound = Vec::with_capacity(values.len() + 3);
        bound.push(Some(id.clone()));
        bound.extend(values);
        bound.push(Some(stamp.clone()));
        bound.push(Some(stamp));

        let placeholders = (1..=bound.len()).map(|index| format!("?{index}")).collect::<Vec<_>>();
        let sql = format!(
            "INSERT INTO {entity} ({}) VALUES ({})",
            column_list(entity),
            placeholders.join(", ")
        );

        let tx = self.conn.transaction().backend_context("failed to start transaction")?;
        tx.execute(&sql, params_from_iter(bound.iter()))
            .with_backend_context(|| format!("failed to insert into {entity}"))?;
        let record = fetch(&tx, entity, &id)?.ok_or_else(|| {
            StorageError::backend(
                "failed to reload inserted row",
                format!("{entity} id {id} is missing"),
            )
        })?;
        tx.commit().backend_context("failed to commit insert transaction")?;

        tracing::debug!(table = %entity, id = %id, "sqlite create");
        Ok(record)
    }

    fn get(&mut self, table: &str, id: &str) -> StorageResult<Option<Record>> {
        let entity = EntityTable::resolve(table)?;
        fetch(&self.conn, entity, id)
    }

    fn update(&mut self, table: &str, id: &str, data: Record) -> StorageResult<Option<Record>> {
        let entity = EntityTable::resolve(table)?;
        let assignments = entity.patch_values(&data)?;

        let tx = self.conn.transaction().backend_context("failed to start transaction")?;
        let Some(existing) = fetch(&tx, entity, id)? else {
            return Ok(None);
        };
        let previous = match existing.get(UPDATED_AT_FIELD).and_then(Value::as_str) {
            Some(raw) => Some(parse_timestamp(UPDATED_AT_FIELD, raw)?),
            None => None,
        };
        let stamp = format_timestamp(next_timestamp(previous))?;

        let mut sets = Vec::with_capacity(assignments.len() + 1);
        let mut bound = Vec::with_capacity(assignments.len() + 2);
        for (column, value) in assignments {
            bound.push(value);
            sets.push(format!("{} = ?{}", quoted(column), bound.len()));
        }
        bound.push(Some(stamp));
        sets.push(format!("{} = ?{}", quoted(UPDATED_AT_FIELD), bound.len()));
        bound.push(Some(id.to_string()));
        let sql = format!(
            "UPDATE {entity} SET {} WHERE {} = ?{}",
            sets.join(", "),
            quoted(ID_FIELD),
            bound.len()
        );

        tx.execute(&sql, params_from_iter(bound.iter()))
            .with_backend_context(|| format!("failed to update {entity} row {id}"))?;
        let record = fetch(&tx, entity, id)?;
        tx.commit().backend_context("failed to commit update transaction")?;

        tracing::debug!(table = %entity, id, fields = data.len(), "sqlite update");
        Ok(record)
    }

    fn delete(&mut self, table: &str, id: &str) -> StorageResult<bool> {
        let entity = EntityTable::resolve(table)?;
        let sql = format!("DELETE FROM {entity} WHERE {} = ?1", quoted(ID_FIELD));
        let removed = self
            .conn
            .execute(&sql, params![id])
            .with_backend_context(|| format!("failed to delete {entity} row {id}"))?;

        tracing::debug!(table = %entity, id, removed, "sqlite delete");
        Ok(removed > 0)
    }

    fn list(&mut self, table: &str, filter: &Filter) -> StorageResult<Vec<Record>> {
        let entity = EntityTable::resolve(table)?;
        let clauses = entity.filter_values(filter)?;

        let mut predicates = Vec::with_capacity(clauses.len());
        let mut bound = Vec::with_capacity(clauses.len());
        for (column, value) in clauses {
            match value {
                Some(value) => {
                    bound.push(value);
                    predicates.push(format!("{} = ?{}", quoted(column), bound.len()));
                }
                None => predicates.push(format!("{} IS NULL", quoted(column))),
            }
        }
        let where_clause = if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM {entity}{where_clause} ORDER BY rowid ASC",
            column_list(entity)
        );

        let mut stmt = self.conn.prepare(&sql).backend_context("failed to prepare list query")?;
        let rows = stmt
            .query_map(params_from_iter(bound.iter()), |row| read_row(entity, row))
            .with_backend_context(|| format!("failed to list {entity}"))?;

        let mut records = Vec::new();
        for row in rows {
            let raw = row.with_backend_context(|| format!("failed to read {entity} row"))?;
            records.push(into_record(entity, raw)?);
        }

        tracing::debug!(table = %entity, filter = %filter, count = records.len(), "sqlite list");
        Ok(records)
    }
}

fn quoted(column: &str) -> String {
    format!("\"{column}\"")
}

fn column_list(entity: EntityTable) -> String {
    std::iter::once(ID_FIELD)
        .chain(entity.data_columns().iter().copied())
        .chain([CREATED_AT_FIELD, UPDATED_AT_FIELD])
        .map(quoted)
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_row(entity: EntityTable, row: &Row<'_>) -> rusqlite::Result<RawRow> {
    let width = entity.data_columns().len();
    let mut data: Vec<Option<String>> = Vec::with_capacity(width);
    for index in 1..=width {
        data.push(row.get(index)?);
    }
    Ok(RawRow {
        id: row.get(0)?,
        data,
        created_at: row.get(width + 1)?,
        updated_at: row.get(width + 2)?,
    })
}

fn into_record(entity: EntityTable, raw: RawRow) -> StorageResult<Record> {
    entity.record_from_row(
        raw.id,
        raw.data,
        parse_timestamp(CREATED_AT_FIELD, &raw.created_at)?,
        parse_timestamp(UPDATED_AT_FIELD, &raw.updated_at)?,
    )
}

fn fetch(conn: &Connection, entity: EntityTable, id: &str) -> StorageResult<Option<Record>> {
    let sql =
        format!("SELECT {} FROM {entity} WHERE {} = ?1", column_list(entity), quoted(ID_FIELD));
    let raw = conn
        .query_row(&sql, params![id], |row| read_row(entity, row))
        .optional()
        .with_backend_context(|| format!("failed to load {entity} row {id}"))?;
    raw.map(|raw| into_record(entity, raw)).transpose()
}
