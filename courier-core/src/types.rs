use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CourierError;

pub type UserId = i64;

/// Delivery mechanism of a single queued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    InApp,
    Email,
    Sms,
}

impl Channel {
    /// Evaluation order used when resolving a user's channels.
    pub const ALL: [Channel; 4] = [Channel::Push, Channel::InApp, Channel::Email, Channel::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::InApp => "in_app",
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Channel::Push),
            "in_app" | "inapp" | "in-app" => Ok(Channel::InApp),
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            other => Err(CourierError::Validation(format!("unknown channel: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Lenient parse for stored values; anything unrecognised is `normal`.
    pub fn from_db(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::warn!("Unknown priority '{}' in storage, using normal", value);
            Priority::Normal
        })
    }
}

impl FromStr for Priority {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(CourierError::Validation(format!("unknown priority: {}", other))),
        }
    }
}

/// Lifecycle of a queue row: `pending -> processing -> {sent | failed | pending}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "sent" => Ok(QueueStatus::Sent),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(CourierError::InvalidRow(format!("unknown queue status: {}", other))),
        }
    }
}

/// A user's relation to the event being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventRole {
    Poster,
    Acceptor,
    User,
    Admin,
}

impl EventRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventRole::Poster => "poster",
            EventRole::Acceptor => "acceptor",
            EventRole::User => "user",
            EventRole::Admin => "admin",
        }
    }
}

impl FromStr for EventRole {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poster" => Ok(EventRole::Poster),
            "acceptor" => Ok(EventRole::Acceptor),
            "user" => Ok(EventRole::User),
            "admin" => Ok(EventRole::Admin),
            other => Err(CourierError::Validation(format!("unknown role: {}", other))),
        }
    }
}

/// Audience of a binding: every user, or only users holding one of the roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRoles {
    All,
    Only(BTreeSet<EventRole>),
}

impl TargetRoles {
    pub const ALL_SENTINEL: &'static str = "all";

    /// Builds the audience from stored role tags. Unknown tags are ignored.
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Self {
        let mut roles = BTreeSet::new();
        for tag in tags {
            let tag = tag.as_ref().trim();
            if tag == Self::ALL_SENTINEL {
                return TargetRoles::All;
            }
            match tag.parse::<EventRole>() {
                Ok(role) => {
                    roles.insert(role);
                }
                Err(_) => tracing::warn!("Ignoring unknown target role '{}'", tag),
            }
        }
        TargetRoles::Only(roles)
    }

    pub fn to_tags(&self) -> Vec<String> {
        match self {
            TargetRoles::All => vec![Self::ALL_SENTINEL.to_string()],
            TargetRoles::Only(roles) => roles.iter().map(|r| r.as_str().to_string()).collect(),
        }
    }

    pub fn admits(&self, role: EventRole) -> bool {
        match self {
            TargetRoles::All => true,
            TargetRoles::Only(roles) => roles.contains(&role),
        }
    }
}

/// Channels a template can be rendered for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSupport {
    pub push: bool,
    pub in_app: bool,
    pub email: bool,
    pub sms: bool,
}

impl ChannelSupport {
    pub fn supports(&self, channel: Channel) -> bool {
        match channel {
            Channel::Push => self.push,
            Channel::InApp => self.in_app,
            Channel::Email => self.email,
            Channel::Sms => self.sms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub template_key: String,
    pub channels: ChannelSupport,
    pub title_template: String,
    pub body_template: String,
    pub email_subject_template: Option<String>,
    pub email_body_template: Option<String>,
    pub priority: Priority,
    pub is_active: bool,
}

impl NotificationTemplate {
    /// Title and body templates for `channel`. Email prefers its own variants
    /// and falls back to the generic pair field by field.
    pub fn variant_for(&self, channel: Channel) -> (&str, &str) {
        match channel {
            Channel::Email => (
                self.email_subject_template
                    .as_deref()
                    .unwrap_or(&self.title_template),
                self.email_body_template
                    .as_deref()
                    .unwrap_or(&self.body_template),
            ),
            _ => (&self.title_template, &self.body_template),
        }
    }
}

/// One row of the event matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBinding {
    pub id: i64,
    pub event_type: String,
    pub event_action: String,
    pub template_key: String,
    pub target_roles: TargetRoles,
    /// field -> expected scalar; empty matches every event
    pub trigger_conditions: Map<String, Value>,
    pub delay_minutes: i32,
    pub max_retries: i32,
    pub is_active: bool,
}

/// Per-action channel overrides, `event_type -> event_action -> channel -> allowed`.
///
/// A missing entry at any level means "allowed".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventChannelPreferences(BTreeMap<String, BTreeMap<String, BTreeMap<Channel, bool>>>);

impl EventChannelPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event_type: &str, event_action: &str, channel: Channel) -> Option<bool> {
        self.0
            .get(event_type)
            .and_then(|actions| actions.get(event_action))
            .and_then(|channels| channels.get(&channel))
            .copied()
    }

    pub fn set(&mut self, event_type: &str, event_action: &str, channel: Channel, allowed: bool) {
        self.0
            .entry(event_type.to_string())
            .or_default()
            .entry(event_action.to_string())
            .or_default()
            .insert(channel, allowed);
    }

    pub fn allows(&self, event_type: &str, event_action: &str, channel: Channel) -> bool {
        self.get(event_type, event_action, channel).unwrap_or(true)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Parses the stored JSON form. Entries that are not booleans, or name an
    /// unknown channel, are skipped.
    pub fn from_json(value: &Value) -> Self {
        let mut prefs = Self::new();
        let Some(types) = value.as_object() else {
            return prefs;
        };
        for (event_type, actions) in types {
            let Some(actions) = actions.as_object() else {
                continue;
            };
            for (event_action, channels) in actions {
                let Some(channels) = channels.as_object() else {
                    continue;
                };
                for (channel, allowed) in channels {
                    if let (Ok(channel), Some(allowed)) = (channel.parse::<Channel>(), allowed.as_bool()) {
                        prefs.set(event_type, event_action, channel, allowed);
                    }
                }
            }
        }
        prefs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreference {
    pub user_id: UserId,
    pub push_enabled: bool,
    pub in_app_enabled: bool,
    pub email_enabled: bool,
    pub sms_enabled: bool,
    pub quiet_hours_start: Option<NaiveTime>,
    pub quiet_hours_end: Option<NaiveTime>,
    /// 0 = Sunday .. 6 = Saturday
    pub quiet_days: BTreeSet<u8>,
    pub event_preferences: EventChannelPreferences,
}

impl UserPreference {
    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Push => self.push_enabled,
            Channel::InApp => self.in_app_enabled,
            Channel::Email => self.email_enabled,
            Channel::Sms => self.sms_enabled,
        }
    }
}

/// A row the producer is about to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueuedNotification {
    pub user_id: UserId,
    pub template_key: String,
    pub channel: Channel,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
    pub max_retries: i32,
    pub related_type: Option<String>,
    pub related_id: Option<i64>,
    pub action_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedNotification {
    pub id: i64,
    pub user_id: UserId,
    pub template_key: String,
    /// Kept as stored so that an unrecognised value can be failed explicitly.
    pub channel: String,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub status: QueueStatus,
    pub scheduled_at: DateTime<Utc>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub related_type: Option<String>,
    pub related_id: Option<i64>,
    pub action_data: Option<Value>,
    pub result_code: Option<String>,
    pub result_message: Option<String>,
    pub external_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl QueuedNotification {
    pub fn parsed_channel(&self) -> Result<Channel, CourierError> {
        self.channel.parse()
    }

    /// Dispatch order: priority descending, then oldest first, then id.
    pub fn dispatch_order(a: &Self, b: &Self) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewInAppNotification {
    /// Queue row this entry delivers. At most one inbox entry exists per queue row.
    pub queue_id: Option<i64>,
    pub user_id: UserId,
    pub title: String,
    pub body: String,
    pub related_type: Option<String>,
    pub related_id: Option<i64>,
    pub template_key: String,
    pub action_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InAppNotification {
    pub id: i64,
    pub queue_id: Option<i64>,
    pub user_id: UserId,
    pub title: String,
    pub body: String,
    pub related_type: Option<String>,
    pub related_id: Option<i64>,
    pub template_key: String,
    pub action_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatCounter {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationStat {
    pub stat_date: NaiveDate,
    pub template_key: String,
    pub channel: String,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub opened_count: i32,
    pub clicked_count: i32,
    pub failed_count: i32,
}

impl NotificationStat {
    pub fn bump(&mut self, counter: StatCounter) {
        match counter {
            StatCounter::Sent => self.sent_count += 1,
            StatCounter::Delivered => self.delivered_count += 1,
            StatCounter::Opened => self.opened_count += 1,
            StatCounter::Clicked => self.clicked_count += 1,
            StatCounter::Failed => self.failed_count += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub user_id: UserId,
    pub device_token: String,
    /// `ios` or `android`
    pub platform: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContact {
    pub email: Option<String>,
    pub phone: Option<String>,
}
