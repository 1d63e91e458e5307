use agent_state_core::Record;

use crate::{
    project, SharedStorage, StateResult, UserStateCreate, UserStateManager, UserStateUpdate,
    WorldStateCreate, WorldStateManager, WorldStateUpdate,
};

/// The agent-facing view over both managers. Results are plain records
/// (`id`, `user_id` for user state, `key`, `value`, `created_at`, `updated_at`).
///
/// The `set_*` calls look up by key and then update or create. The two steps
/// run under separate locks, so concurrent writers of one key can both take
/// the create branch: memory and `user_states` then hold two records, while a
/// relational `world_states` refuses the second insert with a storage error.
#[derive(Clone)]
pub struct StateAccessor {
    users: UserStateManager,
    worlds: WorldStateManager,
}

impl StateAccessor {
    #[must_use]
    pub fn new(users: UserStateManager, worlds: WorldStateManager) -> Self {
        Self { users, worlds }
    }

    #[must_use]
    pub fn from_storage(storage: &SharedStorage) -> Self {
        Self::new(UserStateManager::new(storage.clone()), WorldStateManager::new(storage.clone()))
    }

    #[must_use]
    pub fn user_states(&self) -> &UserStateManager {
        &self.users
    }

    #[must_use]
    pub fn world_states(&self) -> &WorldStateManager {
        &self.worlds
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_user_state(&self, user_id: &str, key: &str) -> StateResult<Option<Record>> {
        self.users.get_by_user_and_key(user_id, key)?.as_ref().map(project).transpose()
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_user_states(&self, user_id: &str) -> StateResult<Vec<Record>> {
        self.users.list_by_user(user_id)?.iter().map(project).collect()
    }

    /// Create or update the `(user_id, key)` state. Returns an empty record when
    /// the state is deleted between the lookup and the update.
    ///
    /// # Errors
    /// Returns an error when validation or a storage call fails.
    pub fn set_user_state(&self, user_id: &str, key: &str, value: &str) -> StateResult<Record> {
        match self.users.get_by_user_and_key(user_id, key)? {
            Some(existing) => {
                let update = UserStateUpdate { value: Some(value.to_string()) };
                match self.users.update(&existing.id, update)? {
                    Some(updated) => project(&updated),
                    None => Ok(Record::new()),
                }
            }
            None => project(&self.users.create(UserStateCreate {
                user_id: user_id.to_string(),
                key: key.to_string(),
                value: Some(value.to_string()),
            })?),
        }
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_world_state(&self, key: &str) -> StateResult<Option<Record>> {
        self.worlds.get_by_key(key)?.as_ref().map(project).transpose()
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_world_states(&self) -> StateResult<Vec<Record>> {
        self.worlds.list_all()?.iter().map(project).collect()
    }

    /// Create or update the world state under `key`, with the same vanished
    /// record rule as [`StateAccessor::set_user_state`].
    ///
    /// # Errors
    /// Returns an error when validation or a storage call fails.
    pub fn set_world_state(&self, key: &str, value: &str) -> StateResult<Record> {
        match self.worlds.get_by_key(key)? {
            Some(existing) => {
                let update = WorldStateUpdate { value: Some(value.to_string()) };
                match self.worlds.update(&existing.id, update)? {
                    Some(updated) => project(&updated),
                    None => Ok(Record::new()),
                }
            }
            None => project(&self.worlds.create(WorldStateCreate {
                key: key.to_string(),
                value: Some(value.to_string()),
            })?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::local_backends;
    use crate::StateError;
    use agent_state_core::{parse_timestamp, CREATED_AT_FIELD, UPDATED_AT_FIELD};
    use anyhow::{anyhow, Result};
    use serde_json::{json, Value};

    fn field<'a>(record: &'a Record, name: &str) -> Result<&'a str> {
        record
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing `{name}` in {record:?}"))
    }

    #[test]
    fn world_state_set_twice_keeps_one_record_per_key() -> Result<()> {
        for (backend, storage) in local_backends()? {
            let accessor = StateAccessor::from_storage(&storage);
            let first = accessor.set_world_state("weather", "sunny")?;
            let second = accessor.set_world_state("weather", "rain")?;

            assert_eq!(field(&first, "id")?, field(&second, "id")?, "{backend}");
            let all = accessor.get_world_states()?;
            assert_eq!(all.len(), 1, "{backend}");
            assert_eq!(all[0].get("value"), Some(&json!("rain")), "{backend}");
        }
        Ok(())
    }

    #[test]
    fn user_state_is_scoped_per_user() -> Result<()> {
        for (backend, storage) in local_backends()? {
            let accessor = StateAccessor::from_storage(&storage);
            accessor.set_user_state("alice", "lang", "en")?;
            accessor.set_user_state("bob", "lang", "de")?;
            accessor.set_user_state("alice", "lang", "fr")?;

            let alice = accessor
                .get_user_state("alice", "lang")?
                .ok_or_else(|| anyhow!("{backend}: alice lang missing"))?;
            assert_eq!(field(&alice, "value")?, "fr", "{backend}");
            assert_eq!(field(&alice, "user_id")?, "alice", "{backend}");

            let bob = accessor.get_user_states("bob")?;
            assert_eq!(bob.len(), 1, "{backend}");
            assert_eq!(bob[0].get("value"), Some(&json!("de")), "{backend}");
            assert_eq!(accessor.get_user_state("carol", "lang")?, None, "{backend}");
        }
        Ok(())
    }

    #[test]
    fn update_by_key_is_visible_through_the_accessor() -> Result<()> {
        for (backend, storage) in local_backends()? {
            let accessor = StateAccessor::from_storage(&storage);
            accessor.world_states().create(WorldStateCreate {
                key: "lang".to_string(),
                value: Some("en".to_string()),
            })?;
            accessor
                .world_states()
                .update_by_key("lang", WorldStateUpdate { value: Some("fr".to_string()) })?;

            let lang = accessor
                .get_world_state("lang")?
                .ok_or_else(|| anyhow!("{backend}: lang missing"))?;
            assert_eq!(field(&lang, "value")?, "fr", "{backend}");
            let created_at = parse_timestamp(CREATED_AT_FIELD, field(&lang, CREATED_AT_FIELD)?)?;
            let updated_at = parse_timestamp(UPDATED_AT_FIELD, field(&lang, UPDATED_AT_FIELD)?)?;
            assert!(updated_at > created_at, "{backend}");
        }
        Ok(())
    }

    #[test]
    fn projected_records_carry_the_entity_fields() -> Result<()> {
        for (backend, storage) in local_backends()? {
            let accessor = StateAccessor::from_storage(&storage);
            let user = accessor.set_user_state("u1", "theme", "dark")?;
            let world = accessor.set_world_state("mode", "night")?;

            let user_fields = user.keys().map(String::as_str).collect::<Vec<_>>();
            assert_eq!(
                user_fields,
                vec!["id", "user_id", "key", "value", "created_at", "updated_at"],
                "{backend}"
            );
            assert!(!world.contains_key("user_id"), "{backend}");
        }
        Ok(())
    }

    #[test]
    fn set_with_blank_key_is_rejected() -> Result<()> {
        for (backend, storage) in local_backends()? {
            let accessor = StateAccessor::from_storage(&storage);
            let result = accessor.set_world_state("", "v");
            assert!(matches!(result, Err(StateError::Validation(_))), "{backend}: {result:?}");
        }
        Ok(())
    }
}
