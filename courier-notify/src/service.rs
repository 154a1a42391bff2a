use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, NaiveDateTime, Utc};
use courier_core::store::{CatalogRepository, PreferenceRepository, QueueRepository, UserDirectory};
use courier_core::{
    CourierError, EventRole, NewQueuedNotification, Result, UserId, UserPreference,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::audience::{admits, derive_role};
use crate::matrix::find_bindings;
use crate::preferences::{default_preference, resolve_channels};
use crate::render::render;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub trigger_id: Uuid,
    pub queued: usize,
}

/// Turns domain events into pending queue rows.
pub struct NotificationProducer {
    catalog: Arc<dyn CatalogRepository>,
    preferences: Arc<dyn PreferenceRepository>,
    queue: Arc<dyn QueueRepository>,
    directory: Arc<dyn UserDirectory>,
}

impl NotificationProducer {
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        preferences: Arc<dyn PreferenceRepository>,
        queue: Arc<dyn QueueRepository>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            catalog,
            preferences,
            queue,
            directory,
        }
    }

    /// Builds a producer whose every repository is the same store.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: CatalogRepository + PreferenceRepository + QueueRepository + UserDirectory + 'static,
    {
        Self::new(store.clone(), store.clone(), store.clone(), store)
    }

    pub async fn trigger_event(
        &self,
        event_type: &str,
        event_action: &str,
        event_data: &Value,
        target_user_ids: &[UserId],
    ) -> Result<TriggerOutcome> {
        let now = Utc::now();
        let local = now.with_timezone(&Local).naive_local();
        self.trigger_event_at(event_type, event_action, event_data, target_user_ids, now, local)
            .await
    }

    /// Same as [`trigger_event`](Self::trigger_event) with an explicit clock:
    /// `now` schedules the rows, `local_now` is checked against quiet hours.
    pub async fn trigger_event_at(
        &self,
        event_type: &str,
        event_action: &str,
        event_data: &Value,
        target_user_ids: &[UserId],
        now: DateTime<Utc>,
        local_now: NaiveDateTime,
    ) -> Result<TriggerOutcome> {
        validate(event_type, event_action, event_data)?;
        let trigger_id = Uuid::new_v4();

        if target_user_ids.is_empty() {
            tracing::debug!("Trigger {} for {}.{} has no target users", trigger_id, event_type, event_action);
            return Ok(TriggerOutcome { trigger_id, queued: 0 });
        }

        let bindings = find_bindings(self.catalog.as_ref(), event_type, event_action, event_data).await?;
        if bindings.is_empty() {
            tracing::info!("No bindings for {}.{}, nothing queued", event_type, event_action);
            return Ok(TriggerOutcome { trigger_id, queued: 0 });
        }

        let related_id = related_id(event_data);
        let action_data = action_data(event_type, event_action, related_id, event_data);

        let mut roles: HashMap<UserId, EventRole> = HashMap::new();
        let mut preferences: HashMap<UserId, UserPreference> = HashMap::new();
        let mut rows = Vec::new();

        for (binding, template) in &bindings {
            let scheduled_at = now + Duration::minutes(i64::from(binding.delay_minutes.max(0)));

            for &user_id in target_user_ids {
                let role = match roles.entry(user_id) {
                    Entry::Occupied(e) => *e.get(),
                    Entry::Vacant(e) => *e.insert(derive_role(self.directory.as_ref(), user_id, event_data).await?),
                };
                if !admits(&binding.target_roles, role) {
                    tracing::debug!(
                        "Binding {} skips user {} with role {}",
                        binding.id,
                        user_id,
                        role.as_str()
                    );
                    continue;
                }

                let preference = match preferences.entry(user_id) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => {
                        let (pref, created) = self
                            .preferences
                            .get_or_create(user_id, &default_preference(user_id))
                            .await?;
                        if created {
                            tracing::debug!("Created default preferences for user {}", user_id);
                        }
                        e.insert(pref)
                    }
                };

                for channel in resolve_channels(binding, template, preference, local_now) {
                    let (title, body) = template.variant_for(channel);
                    rows.push(NewQueuedNotification {
                        user_id,
                        template_key: template.template_key.clone(),
                        channel,
                        title: render(title, event_data),
                        body: render(body, event_data),
                        priority: template.priority,
                        scheduled_at,
                        max_retries: binding.max_retries,
                        related_type: Some(event_type.to_string()),
                        related_id,
                        action_data: Some(action_data.clone()),
                    });
                }
            }
        }

        let queued = if rows.is_empty() {
            0
        } else {
            self.queue.enqueue(rows).await?
        };

        tracing::info!(
            "Trigger {} for {}.{}: {} bindings, {} users, {} queued",
            trigger_id,
            event_type,
            event_action,
            bindings.len(),
            target_user_ids.len(),
            queued
        );
        Ok(TriggerOutcome { trigger_id, queued })
    }
}

fn validate(event_type: &str, event_action: &str, event_data: &Value) -> Result<()> {
    if event_type.trim().is_empty() {
        return Err(CourierError::Validation("event_type must not be empty".to_string()));
    }
    if event_action.trim().is_empty() {
        return Err(CourierError::Validation("event_action must not be empty".to_string()));
    }
    if !event_data.is_object() {
        return Err(CourierError::Validation("event_data must be a JSON object".to_string()));
    }
    Ok(())
}

/// `event_data.id` as a number or a numeric string.
fn related_id(event_data: &Value) -> Option<i64> {
    match event_data.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Navigation payload stored on every row of this trigger. Fields from
/// `event_data.action_data` are merged in without overriding the base keys.
fn action_data(event_type: &str, event_action: &str, related_id: Option<i64>, event_data: &Value) -> Value {
    let mut data = Map::new();
    data.insert("event_type".to_string(), json!(event_type));
    data.insert("event_action".to_string(), json!(event_action));
    data.insert("related_id".to_string(), json!(related_id));

    match event_data.get("action_data") {
        Some(Value::Object(extra)) => {
            for (key, value) in extra {
                data.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Some(Value::Null) | None => {}
        Some(other) => {
            data.insert("payload".to_string(), other.clone());
        }
    }
    Value::Object(data)
}
