//! Behavioural checks shared by every [`StorageInterface`] backend.
//!
//! Each check scopes its rows with a freshly generated marker so it can run
//! against a database that already holds data. Checks only touch the
//! `user_states` and `world_states` tables, which every backend supports.

use std::collections::BTreeSet;

use anyhow::{anyhow, ensure, Context, Result};
use serde_json::Value;
use ulid::Ulid;

use crate::{
    parse_timestamp, Filter, Record, StorageError, StorageInterface, CREATED_AT_FIELD, ID_FIELD,
    UPDATED_AT_FIELD, USER_STATES_TABLE, WORLD_STATES_TABLE,
};

#[must_use]
pub fn unique_marker(prefix: &str) -> String {
    format!("{prefix}-{}", Ulid::new())
}

#[must_use]
pub fn user_state(user_id: &str, key: &str, value: Option<&str>) -> Record {
    let mut record = Record::new();
    record.insert("user_id".to_string(), Value::String(user_id.to_string()));
    record.insert("key".to_string(), Value::String(key.to_string()));
    record.insert("value".to_string(), value.map_or(Value::Null, |v| Value::String(v.to_string())));
    record
}

#[must_use]
pub fn world_state(key: &str, value: Option<&str>) -> Record {
    let mut record = Record::new();
    record.insert("key".to_string(), Value::String(key.to_string()));
    record.insert("value".to_string(), value.map_or(Value::Null, |v| Value::String(v.to_string())));
    record
}

fn patch(field: &str, value: &str) -> Record {
    let mut record = Record::new();
    record.insert(field.to_string(), Value::String(value.to_string()));
    record
}

/// # Errors
/// Returns an error when `field` is missing or not a string.
pub fn text<'a>(record: &'a Record, field: &str) -> Result<&'a str> {
    record
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("record is missing string field `{field}`: {record:?}"))
}

/// Drop storage-assigned fields so records from different backends compare equal.
#[must_use]
pub fn without_storage_fields(record: &Record) -> Record {
    record
        .iter()
        .filter(|(field, _)| {
            ![ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD].contains(&field.as_str())
        })
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

/// Run every check in this module against one backend.
///
/// # Errors
/// Returns the first failing check.
pub fn run_all(storage: &mut dyn StorageInterface) -> Result<()> {
    create_generates_unique_ids(storage, 1000).context("create_generates_unique_ids")?;
    create_keeps_supplied_id(storage).context("create_keeps_supplied_id")?;
    create_stamps_timestamps(storage).context("create_stamps_timestamps")?;
    create_allows_duplicate_user_keys(storage).context("create_allows_duplicate_user_keys")?;
    get_unknown_id_is_none(storage).context("get_unknown_id_is_none")?;
    update_is_partial(storage).context("update_is_partial")?;
    update_refreshes_only_updated_at(storage).context("update_refreshes_only_updated_at")?;
    update_unknown_id_does_not_create(storage).context("update_unknown_id_does_not_create")?;
    update_rejects_storage_fields(storage).context("update_rejects_storage_fields")?;
    delete_is_idempotent(storage).context("delete_is_idempotent")?;
    list_filter_is_and_exact_match(storage).context("list_filter_is_and_exact_match")?;
    list_null_filter_matches_null_values(storage)
        .context("list_null_filter_matches_null_values")?;
    list_without_filter_returns_every_record(storage)
        .context("list_without_filter_returns_every_record")?;
    tables_are_isolated(storage).context("tables_are_isolated")?;
    Ok(())
}

/// # Errors
/// Returns an error when two creates share an id or a create goes missing.
pub fn create_generates_unique_ids(storage: &mut dyn StorageInterface, count: usize) -> Result<()> {
    let marker = unique_marker("bulk");
    let mut ids = BTreeSet::new();
    for index in 0..count {
        let created =
            storage.create(USER_STATES_TABLE, user_state(&marker, &format!("k{index}"), None))?;
        ids.insert(text(&created, ID_FIELD)?.to_string());
    }
    ensure!(ids.len() == count, "expected {count} distinct ids, got {}", ids.len());

    let listed = storage.list(USER_STATES_TABLE, &Filter::new().with("user_id", marker.as_str()))?;
    ensure!(listed.len() == count, "expected {count} stored records, got {}", listed.len());
    Ok(())
}

/// # Errors
/// Returns an error when a caller-supplied id is replaced.
pub fn create_keeps_supplied_id(storage: &mut dyn StorageInterface) -> Result<()> {
    let id = unique_marker("given");
    let mut data = world_state(&unique_marker("key"), Some("v"));
    data.insert(ID_FIELD.to_string(), Value::String(id.clone()));

    let created = storage.create(WORLD_STATES_TABLE, data)?;
    ensure!(text(&created, ID_FIELD)? == id, "supplied id was not kept: {created:?}");
    ensure!(storage.get(WORLD_STATES_TABLE, &id)?.is_some(), "record not retrievable by id");
    Ok(())
}

/// # Errors
/// Returns an error when timestamps are missing, unparsable or unequal on create.
pub fn create_stamps_timestamps(storage: &mut dyn StorageInterface) -> Result<()> {
    let created = storage.create(WORLD_STATES_TABLE, world_state(&unique_marker("key"), None))?;
    let created_at = parse_timestamp(CREATED_AT_FIELD, text(&created, CREATED_AT_FIELD)?)?;
    let updated_at = parse_timestamp(UPDATED_AT_FIELD, text(&created, UPDATED_AT_FIELD)?)?;
    ensure!(created_at == updated_at, "fresh record has created_at != updated_at");
    ensure!(created.get("value") == Some(&Value::Null), "null value not preserved: {created:?}");
    Ok(())
}

/// # Errors
/// Returns an error when the backend refuses a second `(user_id, key)` record.
pub fn create_allows_duplicate_user_keys(storage: &mut dyn StorageInterface) -> Result<()> {
    let user = unique_marker("dup");
    let first = storage.create(USER_STATES_TABLE, user_state(&user, "pref", Some("a")))?;
    let second = storage.create(USER_STATES_TABLE, user_state(&user, "pref", Some("b")))?;
    ensure!(text(&first, ID_FIELD)? != text(&second, ID_FIELD)?, "duplicate ids");

    let filter = Filter::new().with("user_id", user.as_str()).with("key", "pref");
    let listed = storage.list(USER_STATES_TABLE, &filter)?;
    ensure!(listed.len() == 2, "expected both duplicate records, got {}", listed.len());
    Ok(())
}

/// # Errors
/// Returns an error when an unknown id yields a record.
pub fn get_unknown_id_is_none(storage: &mut dyn StorageInterface) -> Result<()> {
    let missing = unique_marker("missing");
    ensure!(storage.get(USER_STATES_TABLE, &missing)?.is_none(), "unknown id returned a record");
    Ok(())
}

/// # Errors
/// Returns an error when fields absent from the patch change.
pub fn update_is_partial(storage: &mut dyn StorageInterface) -> Result<()> {
    let user = unique_marker("partial");
    let created = storage.create(USER_STATES_TABLE, user_state(&user, "theme", Some("a")))?;
    let id = text(&created, ID_FIELD)?.to_string();

    let updated = storage
        .update(USER_STATES_TABLE, &id, patch("value", "b"))?
        .ok_or_else(|| anyhow!("existing record reported missing on update"))?;
    ensure!(text(&updated, "value")? == "b", "value not updated: {updated:?}");
    ensure!(text(&updated, "user_id")? == user, "user_id changed: {updated:?}");
    ensure!(text(&updated, "key")? == "theme", "key changed: {updated:?}");
    ensure!(text(&updated, ID_FIELD)? == id, "id changed: {updated:?}");

    let reloaded = storage
        .get(USER_STATES_TABLE, &id)?
        .ok_or_else(|| anyhow!("updated record disappeared"))?;
    ensure!(reloaded == updated, "update result differs from stored record");
    Ok(())
}

/// # Errors
/// Returns an error when `created_at` moves or `updated_at` does not advance.
pub fn update_refreshes_only_updated_at(storage: &mut dyn StorageInterface) -> Result<()> {
    let created =
        storage.create(WORLD_STATES_TABLE, world_state(&unique_marker("key"), Some("x")))?;
    let id = text(&created, ID_FIELD)?.to_string();

    let first = storage
        .update(WORLD_STATES_TABLE, &id, patch("value", "y"))?
        .ok_or_else(|| anyhow!("record missing on first update"))?;
    let second = storage
        .update(WORLD_STATES_TABLE, &id, patch("value", "z"))?
        .ok_or_else(|| anyhow!("record missing on second update"))?;

    ensure!(
        text(&second, CREATED_AT_FIELD)? == text(&created, CREATED_AT_FIELD)?,
        "created_at changed on update"
    );
    let created_at = parse_timestamp(CREATED_AT_FIELD, text(&created, CREATED_AT_FIELD)?)?;
    let first_at = parse_timestamp(UPDATED_AT_FIELD, text(&first, UPDATED_AT_FIELD)?)?;
    let second_at = parse_timestamp(UPDATED_AT_FIELD, text(&second, UPDATED_AT_FIELD)?)?;
    ensure!(first_at > created_at, "updated_at did not advance past created_at");
    ensure!(second_at > first_at, "updated_at did not advance on the second update");
    Ok(())
}

/// # Errors
/// Returns an error when updating an unknown id reports or creates a record.
pub fn update_unknown_id_does_not_create(storage: &mut dyn StorageInterface) -> Result<()> {
    let missing = unique_marker("missing");
    let result = storage.update(USER_STATES_TABLE, &missing, patch("value", "v"))?;
    ensure!(result.is_none(), "update of unknown id returned a record");
    ensure!(storage.get(USER_STATES_TABLE, &missing)?.is_none(), "update created a record");
    Ok(())
}

/// # Errors
/// Returns an error when a patch writing `id` or a timestamp is accepted.
pub fn update_rejects_storage_fields(storage: &mut dyn StorageInterface) -> Result<()> {
    let created = storage.create(WORLD_STATES_TABLE, world_state(&unique_marker("key"), None))?;
    let id = text(&created, ID_FIELD)?.to_string();

    for field in [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD] {
        let result = storage.update(WORLD_STATES_TABLE, &id, patch(field, "2026-01-01T00:00:00Z"));
        ensure!(
            matches!(result, Err(StorageError::ImmutableField(ref name)) if name == field),
            "patch writing `{field}` was not rejected: {result:?}"
        );
    }
    ensure!(storage.get(WORLD_STATES_TABLE, &id)? == Some(created), "rejected patch changed data");
    Ok(())
}

/// # Errors
/// Returns an error when a second delete of the same id reports success.
pub fn delete_is_idempotent(storage: &mut dyn StorageInterface) -> Result<()> {
    let created = storage.create(WORLD_STATES_TABLE, world_state(&unique_marker("key"), None))?;
    let id = text(&created, ID_FIELD)?.to_string();

    ensure!(storage.delete(WORLD_STATES_TABLE, &id)?, "first delete reported false");
    ensure!(!storage.delete(WORLD_STATES_TABLE, &id)?, "second delete reported true");
    ensure!(storage.get(WORLD_STATES_TABLE, &id)?.is_none(), "deleted record still readable");
    Ok(())
}

/// # Errors
/// Returns an error when the filter returns anything but the single full match.
pub fn list_filter_is_and_exact_match(storage: &mut dyn StorageInterface) -> Result<()> {
    let user_one = unique_marker("u1");
    let user_two = unique_marker("u2");
    let expected = storage.create(USER_STATES_TABLE, user_state(&user_one, "k1", Some("a")))?;
    storage.create(USER_STATES_TABLE, user_state(&user_one, "k2", Some("b")))?;
    storage.create(USER_STATES_TABLE, user_state(&user_two, "k1", Some("c")))?;

    let found = storage.list(
        USER_STATES_TABLE,
        &Filter::new().with("user_id", user_one.as_str()).with("key", "k1"),
    )?;
    ensure!(found == vec![expected], "AND filter returned {found:?}");
    Ok(())
}

/// # Errors
/// Returns an error when a null clause misses null values or matches non-null ones.
pub fn list_null_filter_matches_null_values(storage: &mut dyn StorageInterface) -> Result<()> {
    let user = unique_marker("nulls");
    let expected = storage.create(USER_STATES_TABLE, user_state(&user, "empty", None))?;
    storage.create(USER_STATES_TABLE, user_state(&user, "full", Some("v")))?;

    let found = storage.list(
        USER_STATES_TABLE,
        &Filter::new().with("user_id", user.as_str()).with("value", Value::Null),
    )?;
    ensure!(found == vec![expected], "null filter returned {found:?}");
    Ok(())
}

/// # Errors
/// Returns an error when an unfiltered list misses freshly created records.
pub fn list_without_filter_returns_every_record(storage: &mut dyn StorageInterface) -> Result<()> {
    let before = storage.list(WORLD_STATES_TABLE, &Filter::new())?.len();
    storage.create(WORLD_STATES_TABLE, world_state(&unique_marker("key"), Some("a")))?;
    storage.create(WORLD_STATES_TABLE, world_state(&unique_marker("key"), Some("b")))?;
    let after = storage.list(WORLD_STATES_TABLE, &Filter::new())?.len();
    ensure!(after == before + 2, "expected {} records, got {after}", before + 2);
    Ok(())
}

/// # Errors
/// Returns an error when a record leaks into another table.
pub fn tables_are_isolated(storage: &mut dyn StorageInterface) -> Result<()> {
    let key = unique_marker("isolated");
    let created = storage.create(WORLD_STATES_TABLE, world_state(&key, Some("v")))?;
    let id = text(&created, ID_FIELD)?.to_string();

    ensure!(storage.get(USER_STATES_TABLE, &id)?.is_none(), "world record visible as user record");
    let leaked = storage.list(USER_STATES_TABLE, &Filter::new().with("key", key.as_str()))?;
    ensure!(leaked.is_empty(), "world record listed in user_states");
    Ok(())
}

/// Drive a fixed call sequence scoped to `user` and return the surviving rows
/// without storage-assigned fields, sorted by `key`. Two backends agree on the
/// contract when they return equal vectors for the same `user`.
///
/// # Errors
/// Returns an error when any call in the sequence fails.
pub fn scripted_session(storage: &mut dyn StorageInterface, user: &str) -> Result<Vec<Record>> {
    let theme = storage.create(USER_STATES_TABLE, user_state(user, "theme", Some("dark")))?;
    let lang = storage.create(USER_STATES_TABLE, user_state(user, "lang", None))?;
    let scratch = storage.create(USER_STATES_TABLE, user_state(user, "scratch", Some("tmp")))?;

    storage.update(USER_STATES_TABLE, text(&theme, ID_FIELD)?, patch("value", "light"))?;
    storage.update(USER_STATES_TABLE, text(&lang, ID_FIELD)?, patch("value", "fr"))?;
    storage.delete(USER_STATES_TABLE, text(&scratch, ID_FIELD)?)?;
    storage.delete(USER_STATES_TABLE, text(&scratch, ID_FIELD)?)?;
    storage.create(USER_STATES_TABLE, user_state(user, "tz", Some("UTC")))?;

    let mut rows = storage
        .list(USER_STATES_TABLE, &Filter::new().with("user_id", user))?
        .iter()
        .map(without_storage_fields)
        .collect::<Vec<_>>();
    rows.sort_by(|left, right| {
        left.get("key").and_then(Value::as_str).cmp(&right.get("key").and_then(Value::as_str))
    });
    Ok(rows)
}
