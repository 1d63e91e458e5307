use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod memory;

#[cfg(any(test, feature = "conformance"))]
pub mod conformance;

pub use memory::MemoryStorage;

/// A string-keyed attribute bag. Key order is preserved as written.
pub type Record = serde_json::Map<String, Value>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type StorageResult<T> = Result<T, StorageError>;

/// A known column paired with its text value; `None` is SQL `NULL`.
pub type ColumnValue = (&'static str, Option<String>);

pub const ID_FIELD: &str = "id";
pub const CREATED_AT_FIELD: &str = "created_at";
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Fields owned by the storage layer. Callers may supply `id` on create only.
pub const MANAGED_FIELDS: [&str; 3] = [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD];

pub const USER_STATES_TABLE: &str = "user_states";
pub const WORLD_STATES_TABLE: &str = "world_states";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column `{column}` for table {table}")]
    UnknownColumn { table: String, column: String },
    #[error("column `{column}` is required for table {table}")]
    MissingField { table: String, column: String },
    #[error("invalid value for `{column}`: {reason}")]
    InvalidValue { column: String, reason: String },
    #[error("field `{0}` is managed by storage and cannot be updated")]
    ImmutableField(String),
    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl StorageError {
    pub fn backend(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Backend { context: context.into(), source: source.into() }
    }

    fn invalid_value(column: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue { column: column.to_string(), reason: reason.into() }
    }
}

/// Attach a human-readable context to an engine error, keeping it as the source.
pub trait BackendContext<T> {
    /// # Errors
    /// Returns [`StorageError::Backend`] wrapping the original error.
    fn backend_context(self, context: &str) -> StorageResult<T>;

    /// # Errors
    /// Returns [`StorageError::Backend`] wrapping the original error.
    fn with_backend_context<F>(self, context: F) -> StorageResult<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> BackendContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn backend_context(self, context: &str) -> StorageResult<T> {
        self.map_err(|err| StorageError::backend(context, err))
    }

    fn with_backend_context<F>(self, context: F) -> StorageResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| StorageError::backend(context(), err))
    }
}

/// The storage contract shared by every backend.
///
/// Every operation takes `&mut self`: one backend value is one session, and
/// callers that share it across threads wrap it in a mutex.
pub trait StorageInterface {
    /// Insert `data` into `table`, generating an `id` when none is supplied and
    /// stamping `created_at`/`updated_at`. Duplicate domain keys are not rejected here.
    ///
    /// # Errors
    /// Returns an error when the payload does not fit the table or the engine fails.
    fn create(&mut self, table: &str, data: Record) -> StorageResult<Record>;

    /// # Errors
    /// Returns an error when the table is unknown to the backend or the engine fails.
    fn get(&mut self, table: &str, id: &str) -> StorageResult<Option<Record>>;

    /// Merge `data` into the record stored under `id`. Keys missing from `data`
    /// keep their current value. Returns `None` when no such record exists.
    ///
    /// # Errors
    /// Returns [`StorageError::ImmutableField`] when `data` names a managed field,
    /// or an error when the payload does not fit the table or the engine fails.
    fn update(&mut self, table: &str, id: &str, data: Record) -> StorageResult<Option<Record>>;

    /// Returns `true` only when a record existed and was removed.
    ///
    /// # Errors
    /// Returns an error when the table is unknown to the backend or the engine fails.
    fn delete(&mut self, table: &str, id: &str) -> StorageResult<bool>;

    /// Return every record matching all clauses of `filter`.
    ///
    /// # Errors
    /// Returns an error when the filter names a field the backend cannot match on,
    /// or the engine fails.
    fn list(&mut self, table: &str, filter: &Filter) -> StorageResult<Vec<Record>>;
}

/// Equality predicates joined with AND. A `null` clause matches a null or missing field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: BTreeMap<String, Value>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.insert(field.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.clauses.iter().map(|(field, value)| (field.as_str(), value))
    }

    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.clauses
            .iter()
            .all(|(field, expected)| record.get(field).unwrap_or(&Value::Null) == expected)
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, value) in &self.clauses {
            if !first {
                write!(f, " AND ")?;
            }
            write!(f, "{field} = {value}")?;
            first = false;
        }
        Ok(())
    }
}

#[must_use]
pub fn new_record_id() -> String {
    Ulid::new().to_string()
}

/// Return the record's `id`, inserting a freshly generated one when absent or null.
///
/// # Errors
/// Returns [`StorageError::InvalidValue`] when `id` is present but not a non-empty string.
pub fn ensure_id(record: &mut Record) -> StorageResult<String> {
    match record.get(ID_FIELD) {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        None | Some(Value::Null) => {
            let id = new_record_id();
            record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            Ok(id)
        }
        Some(other) => Err(StorageError::invalid_value(
            ID_FIELD,
            format!("expected a non-empty string, got {other}"),
        )),
    }
}

/// Reject partial updates that try to write storage-managed fields.
///
/// # Errors
/// Returns [`StorageError::ImmutableField`] naming the first managed field found.
pub fn check_patch(patch: &Record) -> StorageResult<()> {
    match MANAGED_FIELDS.iter().find(|field| patch.contains_key(**field)) {
        Some(field) => Err(StorageError::ImmutableField((*field).to_string())),
        None => Ok(()),
    }
}

/// Current UTC time truncated to microseconds, the precision every backend can hold.
#[must_use]
pub fn now_utc_micros() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now - Duration::nanoseconds(i64::from(now.nanosecond() % 1_000))
}

/// Timestamp for a write that follows `previous`; always strictly later than it.
#[must_use]
pub fn next_timestamp(previous: Option<OffsetDateTime>) -> OffsetDateTime {
    let now = now_utc_micros();
    match previous {
        Some(previous) if now <= previous => previous + Duration::microseconds(1),
        _ => now,
    }
}

/// Render a timestamp as RFC 3339 UTC with exactly six fractional digits, so text
/// order equals time order.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn format_timestamp(value: OffsetDateTime) -> StorageResult<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .backend_context("failed to format timestamp")
}

/// # Errors
/// Returns [`StorageError::InvalidValue`] when `value` is not RFC 3339.
pub fn parse_timestamp(field: &str, value: &str) -> StorageResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|err| {
        StorageError::invalid_value(field, format!("invalid RFC3339 timestamp {value}: {err}"))
    })
}

/// Stamp `created_at` and `updated_at` on a record about to be inserted.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn stamp_created(record: &mut Record) -> StorageResult<OffsetDateTime> {
    let now = now_utc_micros();
    let formatted = format_timestamp(now)?;
    record.insert(CREATED_AT_FIELD.to_string(), Value::String(formatted.clone()));
    record.insert(UPDATED_AT_FIELD.to_string(), Value::String(formatted));
    Ok(now)
}

/// Move `updated_at` forward, strictly past its stored value.
///
/// # Errors
/// Returns an error when the stored `updated_at` is not a valid timestamp.
pub fn stamp_updated(record: &mut Record) -> StorageResult<OffsetDateTime> {
    let previous = match record.get(UPDATED_AT_FIELD) {
        Some(Value::String(raw)) => Some(parse_timestamp(UPDATED_AT_FIELD, raw)?),
        _ => None,
    };
    let next = next_timestamp(previous);
    record.insert(UPDATED_AT_FIELD.to_string(), Value::String(format_timestamp(next)?));
    Ok(next)
}

/// The closed set of tables the relational backends know how to persist.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum EntityTable {
    UserStates,
    WorldStates,
}

impl EntityTable {
    pub const ALL: [Self; 2] = [Self::UserStates, Self::WorldStates];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserStates => USER_STATES_TABLE,
            Self::WorldStates => WORLD_STATES_TABLE,
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            USER_STATES_TABLE => Some(Self::UserStates),
            WORLD_STATES_TABLE => Some(Self::WorldStates),
            _ => None,
        }
    }

    /// # Errors
    /// Returns [`StorageError::UnknownTable`] for any name outside the entity map.
    pub fn resolve(table: &str) -> StorageResult<Self> {
        Self::parse(table).ok_or_else(|| StorageError::UnknownTable(table.to_string()))
    }

    /// Entity-specific columns, in persisted order, between `id` and the timestamps.
    #[must_use]
    pub fn data_columns(self) -> &'static [&'static str] {
        match self {
            Self::UserStates => &["user_id", "key", "value"],
            Self::WorldStates => &["key", "value"],
        }
    }

    #[must_use]
    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            Self::UserStates => &["user_id", "key"],
            Self::WorldStates => &["key"],
        }
    }

    #[must_use]
    pub fn has_column(self, column: &str) -> bool {
        MANAGED_FIELDS.contains(&column) || self.data_columns().contains(&column)
    }

    #[must_use]
    pub fn is_timestamp_column(column: &str) -> bool {
        column == CREATED_AT_FIELD || column == UPDATED_AT_FIELD
    }

    fn unknown_column(self, column: &str) -> StorageError {
        StorageError::UnknownColumn { table: self.as_str().to_string(), column: column.to_string() }
    }

    /// Validate a create payload and return its data column values in persisted order.
    ///
    /// # Errors
    /// Returns an error for unknown columns, non-text values, or missing required columns.
    pub fn insert_values(self, record: &Record) -> StorageResult<Vec<Option<String>>> {
        if let Some(column) = record.keys().find(|column| !self.has_column(column)) {
            return Err(self.unknown_column(column));
        }

        self.data_columns()
            .iter()
            .map(|column| {
                let value = match record.get(*column) {
                    Some(value) => text_value(column, value)?,
                    None => None,
                };
                if value.is_none() && self.required_columns().contains(column) {
                    return Err(StorageError::MissingField {
                        table: self.as_str().to_string(),
                        column: (*column).to_string(),
                    });
                }
                Ok(value)
            })
            .collect()
    }

    /// Validate a partial update and return the columns it assigns.
    ///
    /// # Errors
    /// Returns an error for managed or unknown columns, non-text values, or nulls
    /// written into required columns.
    pub fn patch_values(self, patch: &Record) -> StorageResult<Vec<ColumnValue>> {
        check_patch(patch)?;
        let mut assignments = Vec::with_capacity(patch.len());
        for (column, value) in patch {
            let Some(known) = self.data_columns().iter().find(|known| **known == column.as_str())
            else {
                return Err(self.unknown_column(column));
            };
            let value = text_value(column, value)?;
            if value.is_none() && self.required_columns().contains(known) {
                return Err(StorageError::invalid_value(column, "required column cannot be null"));
            }
            assignments.push((*known, value));
        }
        Ok(assignments)
    }

    /// Validate a list filter against the row type.
    ///
    /// # Errors
    /// Returns [`StorageError::UnknownColumn`] or [`StorageError::InvalidValue`].
    pub fn filter_values(self, filter: &Filter) -> StorageResult<Vec<ColumnValue>> {
        filter
            .iter()
            .map(|(column, value)| {
                let known = MANAGED_FIELDS
                    .iter()
                    .chain(self.data_columns())
                    .copied()
                    .find(|known| *known == column)
                    .ok_or_else(|| self.unknown_column(column))?;
                Ok((known, text_value(column, value)?))
            })
            .collect()
    }

    /// Assemble a storage record from one decoded row.
    ///
    /// # Errors
    /// Returns an error when `data` does not line up with the data columns or a
    /// timestamp cannot be formatted.
    pub fn record_from_row(
        self,
        id: String,
        data: Vec<Option<String>>,
        created_at: OffsetDateTime,
        updated_at: OffsetDateTime,
    ) -> StorageResult<Record> {
        if data.len() != self.data_columns().len() {
            return Err(StorageError::invalid_value(
                self.as_str(),
                format!("expected {} data columns, got {}", self.data_columns().len(), data.len()),
            ));
        }

        let mut record = Record::new();
        record.insert(ID_FIELD.to_string(), Value::String(id));
        for (column, value) in self.data_columns().iter().zip(data) {
            record.insert((*column).to_string(), value.map_or(Value::Null, Value::String));
        }
        record.insert(CREATED_AT_FIELD.to_string(), Value::String(format_timestamp(created_at)?));
        record.insert(UPDATED_AT_FIELD.to_string(), Value::String(format_timestamp(updated_at)?));
        Ok(record)
    }
}

impl Display for EntityTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn text_value(column: &str, value: &Value) -> StorageResult<Option<String>> {
    match value {
        Value::String(text) => Ok(Some(text.clone())),
        Value::Null => Ok(None),
        other => Err(StorageError::invalid_value(
            column,
            format!("expected a string or null, got {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture is not an object: {other}"),
        }
    }

    #[test]
    fn filter_requires_every_clause_to_match() {
        let filter = Filter::new().with("a", 1).with("b", 1);

        assert!(filter.matches(&record(json!({"a": 1, "b": 1}))));
        assert!(!filter.matches(&record(json!({"a": 1, "b": 2}))));
        assert!(!filter.matches(&record(json!({"a": 2, "b": 1}))));
        assert!(!filter.matches(&record(json!({"a": 1}))));
    }

    #[test]
    fn null_clause_matches_missing_and_null_fields() {
        let filter = Filter::new().with("value", Value::Null);

        assert!(filter.matches(&record(json!({"value": null}))));
        assert!(filter.matches(&record(json!({"key": "k"}))));
        assert!(!filter.matches(&record(json!({"value": "x"}))));
    }

    #[test]
    fn ensure_id_generates_only_when_missing() -> Result<(), StorageError> {
        let mut fresh = record(json!({"key": "k"}));
        let generated = ensure_id(&mut fresh)?;
        assert_eq!(fresh.get(ID_FIELD).and_then(Value::as_str), Some(generated.as_str()));

        let mut supplied = record(json!({"id": "given"}));
        assert_eq!(ensure_id(&mut supplied)?, "given");

        let mut invalid = record(json!({"id": 42}));
        assert!(matches!(ensure_id(&mut invalid), Err(StorageError::InvalidValue { .. })));
        Ok(())
    }

    #[test]
    fn check_patch_rejects_managed_fields() {
        for field in MANAGED_FIELDS {
            let mut patch = Record::new();
            patch.insert(field.to_string(), json!("x"));
            let result = check_patch(&patch);
            assert!(
                matches!(result, Err(StorageError::ImmutableField(ref name)) if name == field),
                "{result:?}"
            );
        }
        assert!(check_patch(&record(json!({"value": "x"}))).is_ok());
    }

    #[test]
    fn timestamps_use_fixed_width_microseconds() -> Result<(), StorageError> {
        let value = time::macros::datetime!(2026-01-02 03:04:05.5 UTC);
        let formatted = format_timestamp(value)?;
        assert_eq!(formatted, "2026-01-02T03:04:05.500000Z");
        assert_eq!(parse_timestamp(CREATED_AT_FIELD, &formatted)?, value);
        Ok(())
    }

    #[test]
    fn next_timestamp_is_strictly_after_previous() {
        let future = now_utc_micros() + Duration::hours(1);
        assert_eq!(next_timestamp(Some(future)), future + Duration::microseconds(1));

        let past = now_utc_micros() - Duration::hours(1);
        assert!(next_timestamp(Some(past)) > past);
    }

    #[test]
    fn stamp_updated_moves_forward() -> Result<(), StorageError> {
        let mut row = Record::new();
        let created = stamp_created(&mut row)?;
        let updated = stamp_updated(&mut row)?;
        assert!(updated > created);
        assert_ne!(row.get(CREATED_AT_FIELD), row.get(UPDATED_AT_FIELD));
        Ok(())
    }

    #[test]
    fn entity_tables_resolve_only_known_names() {
        assert_eq!(EntityTable::resolve("user_states").ok(), Some(EntityTable::UserStates));
        assert_eq!(EntityTable::resolve("world_states").ok(), Some(EntityTable::WorldStates));
        assert!(matches!(
            EntityTable::resolve("sessions"),
            Err(StorageError::UnknownTable(name)) if name == "sessions"
        ));
    }

    #[test]
    fn insert_values_validates_shape() -> Result<(), StorageError> {
        let values = EntityTable::UserStates
            .insert_values(&record(json!({"id": "1", "user_id": "u", "key": "k"})))?;
        assert_eq!(values, vec![Some("u".to_string()), Some("k".to_string()), None]);

        assert!(matches!(
            EntityTable::WorldStates.insert_values(&record(json!({"key": "k", "user_id": "u"}))),
            Err(StorageError::UnknownColumn { column, .. }) if column == "user_id"
        ));
        assert!(matches!(
            EntityTable::WorldStates.insert_values(&record(json!({"value": "v"}))),
            Err(StorageError::MissingField { column, .. }) if column == "key"
        ));
        assert!(matches!(
            EntityTable::WorldStates.insert_values(&record(json!({"key": "k", "value": 3}))),
            Err(StorageError::InvalidValue { .. })
        ));
        Ok(())
    }

    #[test]
    fn patch_values_refuses_nulling_required_columns() {
        assert!(matches!(
            EntityTable::UserStates.patch_values(&record(json!({"key": null}))),
            Err(StorageError::InvalidValue { .. })
        ));
        assert!(matches!(
            EntityTable::UserStates.patch_values(&record(json!({"id": "other"}))),
            Err(StorageError::ImmutableField(_))
        ));
    }

    #[test]
    fn filter_values_reject_unknown_columns() {
        let filter = Filter::new().with("owner", "u1");
        assert!(matches!(
            EntityTable::UserStates.filter_values(&filter),
            Err(StorageError::UnknownColumn { column, .. }) if column == "owner"
        ));
    }

    proptest! {
        #[test]
        fn filter_matches_exactly_when_all_fields_equal(
            a in 0_u8..3, b in 0_u8..3, want_a in 0_u8..3, want_b in 0_u8..3
        ) {
            let row = record(json!({"a": a, "b": b}));
            let filter = Filter::new().with("a", want_a).with("b", want_b);
            prop_assert_eq!(filter.matches(&row), a == want_a && b == want_b);
        }
    }
}
