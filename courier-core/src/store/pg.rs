use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Timestamptz};
use diesel::upsert::excluded;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde_json::Value;

use super::{
    CatalogRepository, DeviceTokenRepository, InAppRepository, PreferenceRepository,
    QueueRepository, QueueTransition, StatsRepository, UserDirectory,
};
use crate::db::{DbConnection, DbPool};
use crate::error::{CourierError, Result};
use crate::schema::{
    device_tokens, inapp_notifications, notification_event_bindings, notification_queue,
    notification_stats, notification_templates, notification_user_preferences, users,
};
use crate::types::{
    ChannelSupport, DeviceToken, EventBinding, EventChannelPreferences, InAppNotification,
    NewInAppNotification, NewQueuedNotification, NotificationTemplate, Priority, QueueStatus,
    QueuedNotification, StatCounter, TargetRoles, UserContact, UserId, UserPreference,
};

/// Upper bound of rows per INSERT statement, well below the bind limit.
const INSERT_CHUNK: usize = 500;

const CLAIM_DUE_SQL: &str = r#"
UPDATE notification_queue
SET status = 'processing', claimed_at = $1
WHERE status = 'pending'
  AND id IN (
    SELECT id FROM notification_queue
    WHERE status = 'pending'
      AND scheduled_at <= $1
      AND retry_count < max_retries
    ORDER BY CASE priority
               WHEN 'urgent' THEN 3
               WHEN 'high' THEN 2
               WHEN 'low' THEN 0
               ELSE 1
             END DESC,
             created_at ASC,
             id ASC
    LIMIT $2
    FOR UPDATE SKIP LOCKED
  )
RETURNING *
"#;

/// Postgres implementation of every repository trait.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<DbPool>,
}

impl PgStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .await
            .map_err(|e| CourierError::Pool(e.to_string()))
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = notification_templates)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct TemplateRow {
    template_key: String,
    push_enabled: bool,
    inapp_enabled: bool,
    email_enabled: bool,
    sms_enabled: bool,
    title_template: String,
    body_template: String,
    email_subject_template: Option<String>,
    email_body_template: Option<String>,
    priority: String,
    is_active: bool,
}

impl From<TemplateRow> for NotificationTemplate {
    fn from(row: TemplateRow) -> Self {
        NotificationTemplate {
            template_key: row.template_key,
            channels: ChannelSupport {
                push: row.push_enabled,
                in_app: row.inapp_enabled,
                email: row.email_enabled,
                sms: row.sms_enabled,
            },
            title_template: row.title_template,
            body_template: row.body_template,
            email_subject_template: row.email_subject_template,
            email_body_template: row.email_body_template,
            priority: Priority::from_db(&row.priority),
            is_active: row.is_active,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = notification_event_bindings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct BindingRow {
    id: i64,
    event_type: String,
    event_action: String,
    template_key: String,
    target_roles: Value,
    trigger_conditions: Value,
    delay_minutes: i32,
    max_retries: i32,
    is_active: bool,
}

impl From<BindingRow> for EventBinding {
    fn from(row: BindingRow) -> Self {
        let tags: Vec<String> = row
            .target_roles
            .as_array()
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let trigger_conditions = match row.trigger_conditions {
            Value::Object(map) => map,
            _ => Default::default(),
        };

        EventBinding {
            id: row.id,
            event_type: row.event_type,
            event_action: row.event_action,
            template_key: row.template_key,
            target_roles: TargetRoles::from_tags(tags.as_slice()),
            trigger_conditions,
            delay_minutes: row.delay_minutes,
            max_retries: row.max_retries,
            is_active: row.is_active,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = notification_user_preferences)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct PreferenceRow {
    user_id: i64,
    push_enabled: bool,
    inapp_enabled: bool,
    email_enabled: bool,
    sms_enabled: bool,
    quiet_hours_start: Option<NaiveTime>,
    quiet_hours_end: Option<NaiveTime>,
    quiet_days: Value,
    event_preferences: Value,
}

impl From<PreferenceRow> for UserPreference {
    fn from(row: PreferenceRow) -> Self {
        let quiet_days: BTreeSet<u8> = row
            .quiet_days
            .as_array()
            .map(|days| {
                days.iter()
                    .filter_map(|d| d.as_u64())
                    .filter(|d| *d <= 6)
                    .map(|d| d as u8)
                    .collect()
            })
            .unwrap_or_default();

        UserPreference {
            user_id: row.user_id,
            push_enabled: row.push_enabled,
            in_app_enabled: row.inapp_enabled,
            email_enabled: row.email_enabled,
            sms_enabled: row.sms_enabled,
            quiet_hours_start: row.quiet_hours_start,
            quiet_hours_end: row.quiet_hours_end,
            quiet_days,
            event_preferences: EventChannelPreferences::from_json(&row.event_preferences),
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = notification_user_preferences)]
struct NewPreferenceRow {
    user_id: i64,
    push_enabled: bool,
    inapp_enabled: bool,
    email_enabled: bool,
    sms_enabled: bool,
    quiet_hours_start: Option<NaiveTime>,
    quiet_hours_end: Option<NaiveTime>,
    quiet_days: Value,
    event_preferences: Value,
}

impl From<&UserPreference> for NewPreferenceRow {
    fn from(pref: &UserPreference) -> Self {
        NewPreferenceRow {
            user_id: pref.user_id,
            push_enabled: pref.push_enabled,
            inapp_enabled: pref.in_app_enabled,
            email_enabled: pref.email_enabled,
            sms_enabled: pref.sms_enabled,
            quiet_hours_start: pref.quiet_hours_start,
            quiet_hours_end: pref.quiet_hours_end,
            quiet_days: Value::from(pref.quiet_days.iter().map(|d| *d as u64).collect::<Vec<_>>()),
            event_preferences: pref.event_preferences.to_json(),
        }
    }
}

#[derive(Queryable, QueryableByName, Selectable)]
#[diesel(table_name = notification_queue)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct QueueRow {
    id: i64,
    user_id: i64,
    template_key: String,
    channel: String,
    title: String,
    body: String,
    priority: String,
    status: String,
    scheduled_at: DateTime<Utc>,
    retry_count: i32,
    max_retries: i32,
    related_type: Option<String>,
    related_id: Option<i64>,
    action_data: Option<Value>,
    result_code: Option<String>,
    result_message: Option<String>,
    external_id: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<QueueRow> for QueuedNotification {
    type Error = CourierError;

    fn try_from(row: QueueRow) -> Result<Self> {
        Ok(QueuedNotification {
            id: row.id,
            user_id: row.user_id,
            template_key: row.template_key,
            channel: row.channel,
            title: row.title,
            body: row.body,
            priority: Priority::from_db(&row.priority),
            status: row.status.parse::<QueueStatus>()?,
            scheduled_at: row.scheduled_at,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            related_type: row.related_type,
            related_id: row.related_id,
            action_data: row.action_data,
            result_code: row.result_code,
            result_message: row.result_message,
            external_id: row.external_id,
            claimed_at: row.claimed_at,
            created_at: row.created_at,
            sent_at: row.sent_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = notification_queue)]
struct NewQueueRow {
    user_id: i64,
    template_key: String,
    channel: String,
    title: String,
    body: String,
    priority: String,
    status: String,
    scheduled_at: DateTime<Utc>,
    retry_count: i32,
    max_retries: i32,
    related_type: Option<String>,
    related_id: Option<i64>,
    action_data: Option<Value>,
}

impl From<NewQueuedNotification> for NewQueueRow {
    fn from(n: NewQueuedNotification) -> Self {
        NewQueueRow {
            user_id: n.user_id,
            template_key: n.template_key,
            channel: n.channel.as_str().to_string(),
            title: n.title,
            body: n.body,
            priority: n.priority.as_str().to_string(),
            status: QueueStatus::Pending.as_str().to_string(),
            scheduled_at: n.scheduled_at,
            retry_count: 0,
            max_retries: n.max_retries,
            related_type: n.related_type,
            related_id: n.related_id,
            action_data: n.action_data,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = inapp_notifications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct InAppRow {
    id: i64,
    queue_id: Option<i64>,
    user_id: i64,
    title: String,
    body: String,
    related_type: Option<String>,
    related_id: Option<i64>,
    template_key: String,
    action_data: Option<Value>,
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
}

impl From<InAppRow> for InAppNotification {
    fn from(row: InAppRow) -> Self {
        InAppNotification {
            id: row.id,
            queue_id: row.queue_id,
            user_id: row.user_id,
            title: row.title,
            body: row.body,
            related_type: row.related_type,
            related_id: row.related_id,
            template_key: row.template_key,
            action_data: row.action_data,
            created_at: row.created_at,
            read_at: row.read_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = inapp_notifications)]
struct NewInAppRow {
    queue_id: Option<i64>,
    user_id: i64,
    title: String,
    body: String,
    related_type: Option<String>,
    related_id: Option<i64>,
    template_key: String,
    action_data: Option<Value>,
}

#[derive(Insertable)]
#[diesel(table_name = notification_stats)]
struct StatIncrementRow<'a> {
    stat_date: NaiveDate,
    template_key: &'a str,
    channel: &'a str,
    sent_count: i32,
    delivered_count: i32,
    opened_count: i32,
    clicked_count: i32,
    failed_count: i32,
}

#[async_trait]
impl CatalogRepository for PgStore {
    async fn active_bindings(
        &self,
        event_type: &str,
        event_action: &str,
    ) -> Result<Vec<(EventBinding, NotificationTemplate)>> {
        let mut conn = self.conn().await?;

        let rows: Vec<(BindingRow, TemplateRow)> = notification_event_bindings::table
            .inner_join(notification_templates::table)
            .filter(notification_event_bindings::event_type.eq(event_type))
            .filter(notification_event_bindings::event_action.eq(event_action))
            .filter(notification_event_bindings::is_active.eq(true))
            .filter(notification_templates::is_active.eq(true))
            .order(notification_event_bindings::id.asc())
            .select((BindingRow::as_select(), TemplateRow::as_select()))
            .load(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(binding, template)| (binding.into(), template.into()))
            .collect())
    }
}

#[async_trait]
impl PreferenceRepository for PgStore {
    async fn get_or_create(
        &self,
        user_id: UserId,
        defaults: &UserPreference,
    ) -> Result<(UserPreference, bool)> {
        let mut conn = self.conn().await?;

        let mut new_row = NewPreferenceRow::from(defaults);
        new_row.user_id = user_id;

        let inserted = diesel::insert_into(notification_user_preferences::table)
            .values(&new_row)
            .on_conflict(notification_user_preferences::user_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        let row: PreferenceRow = notification_user_preferences::table
            .find(user_id)
            .select(PreferenceRow::as_select())
            .first(&mut conn)
            .await?;

        if inserted == 1 {
            tracing::debug!(user_id, "Created default notification preferences");
        }

        Ok((row.into(), inserted == 1))
    }
}

#[async_trait]
impl QueueRepository for PgStore {
    async fn enqueue(&self, rows: Vec<NewQueuedNotification>) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let rows: Vec<NewQueueRow> = rows.into_iter().map(NewQueueRow::from).collect();
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction(|conn| {
            async move {
                let mut inserted = 0;
                for chunk in rows.chunks(INSERT_CHUNK) {
                    inserted += diesel::insert_into(notification_queue::table)
                        .values(chunk)
                        .execute(conn)
                        .await?;
                }
                Ok::<_, CourierError>(inserted)
            }
            .scope_boxed()
        })
        .await
    }

    async fn claim_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<QueuedNotification>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let rows: Vec<QueueRow> = diesel::sql_query(CLAIM_DUE_SQL)
            .bind::<Timestamptz, _>(now)
            .bind::<BigInt, _>(limit as i64)
            .load(&mut conn)
            .await?;

        let mut claimed = rows
            .into_iter()
            .map(QueuedNotification::try_from)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING does not preserve the subquery order
        claimed.sort_by(QueuedNotification::dispatch_order);
        Ok(claimed)
    }

    async fn complete(&self, id: i64, claimed_at: DateTime<Utc>, transition: QueueTransition) -> Result<bool> {
        use crate::schema::notification_queue::dsl;

        let mut conn = self.conn().await?;
        let target = dsl::notification_queue
            .filter(dsl::id.eq(id))
            .filter(dsl::status.eq(QueueStatus::Processing.as_str()))
            .filter(dsl::claimed_at.eq(claimed_at));

        let updated = match transition {
            QueueTransition::Sent {
                at,
                external_id,
                result_code,
                result_message,
            } => {
                diesel::update(target)
                    .set((
                        dsl::status.eq(QueueStatus::Sent.as_str()),
                        dsl::sent_at.eq(Some(at)),
                        dsl::external_id.eq(external_id),
                        dsl::result_code.eq(Some(result_code)),
                        dsl::result_message.eq(result_message),
                    ))
                    .execute(&mut conn)
                    .await?
            }
            QueueTransition::Retry {
                retry_count,
                next_attempt_at,
                result_code,
                result_message,
            } => {
                diesel::update(target)
                    .set((
                        dsl::status.eq(QueueStatus::Pending.as_str()),
                        dsl::retry_count.eq(retry_count),
                        dsl::scheduled_at.eq(next_attempt_at),
                        dsl::claimed_at.eq(None::<DateTime<Utc>>),
                        dsl::result_code.eq(Some(result_code)),
                        dsl::result_message.eq(result_message),
                    ))
                    .execute(&mut conn)
                    .await?
            }
            QueueTransition::Failed {
                retry_count,
                result_code,
                result_message,
            } => {
                diesel::update(target)
                    .set((
                        dsl::status.eq(QueueStatus::Failed.as_str()),
                        dsl::retry_count.eq(retry_count),
                        dsl::result_code.eq(Some(result_code)),
                        dsl::result_message.eq(result_message),
                    ))
                    .execute(&mut conn)
                    .await?
            }
        };

        Ok(updated == 1)
    }

    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize> {
        use crate::schema::notification_queue::dsl;

        let mut conn = self.conn().await?;
        let released = diesel::update(
            dsl::notification_queue
                .filter(dsl::status.eq(QueueStatus::Processing.as_str()))
                .filter(dsl::claimed_at.lt(claimed_before)),
        )
        .set((
            dsl::status.eq(QueueStatus::Pending.as_str()),
            dsl::claimed_at.eq(None::<DateTime<Utc>>),
        ))
        .execute(&mut conn)
        .await?;

        Ok(released)
    }

    async fn get(&self, id: i64) -> Result<Option<QueuedNotification>> {
        let mut conn = self.conn().await?;
        let row: Option<QueueRow> = notification_queue::table
            .find(id)
            .select(QueueRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        row.map(QueuedNotification::try_from).transpose()
    }
}

#[async_trait]
impl InAppRepository for PgStore {
    async fn insert(&self, notification: NewInAppNotification) -> Result<InAppNotification> {
        let mut conn = self.conn().await?;
        let queue_id = notification.queue_id;
        let row = NewInAppRow {
            queue_id,
            user_id: notification.user_id,
            title: notification.title,
            body: notification.body,
            related_type: notification.related_type,
            related_id: notification.related_id,
            template_key: notification.template_key,
            action_data: notification.action_data,
        };

        let Some(queue_id) = queue_id else {
            let stored: InAppRow = diesel::insert_into(inapp_notifications::table)
                .values(&row)
                .returning(InAppRow::as_returning())
                .get_result(&mut conn)
                .await?;
            return Ok(stored.into());
        };

        let inserted: Option<InAppRow> = diesel::insert_into(inapp_notifications::table)
            .values(&row)
            .on_conflict(inapp_notifications::queue_id)
            .do_nothing()
            .returning(InAppRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?;

        let stored = match inserted {
            Some(stored) => stored,
            None => {
                tracing::debug!(queue_id, "Inbox entry already exists for queue row");
                inapp_notifications::table
                    .filter(inapp_notifications::queue_id.eq(queue_id))
                    .select(InAppRow::as_select())
                    .first(&mut conn)
                    .await?
            }
        };

        Ok(stored.into())
    }

    async fn list_for_user(&self, user_id: UserId, limit: i64, offset: i64) -> Result<Vec<InAppNotification>> {
        let mut conn = self.conn().await?;
        let rows: Vec<InAppRow> = inapp_notifications::table
            .filter(inapp_notifications::user_id.eq(user_id))
            .order((inapp_notifications::created_at.desc(), inapp_notifications::id.desc()))
            .limit(limit)
            .offset(offset)
            .select(InAppRow::as_select())
            .load(&mut conn)
            .await?;

        Ok(rows.into_iter().map(InAppNotification::from).collect())
    }

    async fn mark_read(&self, id: i64, user_id: UserId) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            inapp_notifications::table
                .filter(inapp_notifications::id.eq(id))
                .filter(inapp_notifications::user_id.eq(user_id))
                .filter(inapp_notifications::read_at.is_null()),
        )
        .set(inapp_notifications::read_at.eq(Some(Utc::now())))
        .execute(&mut conn)
        .await?;

        Ok(updated == 1)
    }

    async fn unread_count(&self, user_id: UserId) -> Result<i64> {
        let mut conn = self.conn().await?;
        let count = inapp_notifications::table
            .filter(inapp_notifications::user_id.eq(user_id))
            .filter(inapp_notifications::read_at.is_null())
            .count()
            .get_result(&mut conn)
            .await?;

        Ok(count)
    }
}

#[async_trait]
impl StatsRepository for PgStore {
    async fn increment(
        &self,
        stat_date: NaiveDate,
        template_key: &str,
        channel: &str,
        counter: StatCounter,
    ) -> Result<()> {
        use crate::schema::notification_stats::dsl;

        let one = |c: StatCounter| i32::from(c == counter);
        let row = StatIncrementRow {
            stat_date,
            template_key,
            channel,
            sent_count: one(StatCounter::Sent),
            delivered_count: one(StatCounter::Delivered),
            opened_count: one(StatCounter::Opened),
            clicked_count: one(StatCounter::Clicked),
            failed_count: one(StatCounter::Failed),
        };

        let mut conn = self.conn().await?;
        diesel::insert_into(dsl::notification_stats)
            .values(&row)
            .on_conflict((dsl::stat_date, dsl::template_key, dsl::channel))
            .do_update()
            .set((
                dsl::sent_count.eq(dsl::sent_count + excluded(dsl::sent_count)),
                dsl::delivered_count.eq(dsl::delivered_count + excluded(dsl::delivered_count)),
                dsl::opened_count.eq(dsl::opened_count + excluded(dsl::opened_count)),
                dsl::clicked_count.eq(dsl::clicked_count + excluded(dsl::clicked_count)),
                dsl::failed_count.eq(dsl::failed_count + excluded(dsl::failed_count)),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl DeviceTokenRepository for PgStore {
    async fn tokens_for_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
        let mut conn = self.conn().await?;
        let rows: Vec<(i64, String, String)> = device_tokens::table
            .filter(device_tokens::user_id.eq(user_id))
            .order(device_tokens::id.asc())
            .select((device_tokens::user_id, device_tokens::device_token, device_tokens::platform))
            .load(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, device_token, platform)| DeviceToken {
                user_id,
                device_token,
                platform,
            })
            .collect())
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn is_admin(&self, user_id: UserId) -> Result<bool> {
        let mut conn = self.conn().await?;
        let is_admin: Option<bool> = users::table
            .find(user_id)
            .select(users::is_admin)
            .first(&mut conn)
            .await
            .optional()?;

        Ok(is_admin.unwrap_or(false))
    }

    async fn contact(&self, user_id: UserId) -> Result<Option<UserContact>> {
        let mut conn = self.conn().await?;
        let row: Option<(Option<String>, Option<String>)> = users::table
            .find(user_id)
            .select((users::email, users::phone))
            .first(&mut conn)
            .await
            .optional()?;

        Ok(row.map(|(email, phone)| UserContact { email, phone }))
    }
}
