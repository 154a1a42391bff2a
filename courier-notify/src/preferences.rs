use chrono::{Datelike, NaiveDateTime, NaiveTime};
use courier_core::{Channel, EventBinding, EventChannelPreferences, NotificationTemplate, UserId, UserPreference};

/// Actions whose default map turns email on; every other known action has
/// email off. Push and in-app are on for all of them.
const DEFAULT_ACTIONS: &[(&str, &[(&str, bool)])] = &[
    (
        "task",
        &[
            ("created", false),
            ("accepted", false),
            ("completed", true),
            ("cancelled", false),
            ("dispute_created", true),
        ],
    ),
    ("chat", &[("new_message", false)]),
    (
        "support",
        &[("created", true), ("updated", false), ("resolved", true)],
    ),
    (
        "admin",
        &[
            ("alert", true),
            ("dispute_created", true),
            ("support_created", true),
        ],
    ),
];

/// Preference row created for a user who has none.
pub fn default_preference(user_id: UserId) -> UserPreference {
    let mut event_preferences = EventChannelPreferences::new();
    for (event_type, actions) in DEFAULT_ACTIONS {
        for (action, email) in actions.iter() {
            event_preferences.set(event_type, action, Channel::Push, true);
            event_preferences.set(event_type, action, Channel::InApp, true);
            event_preferences.set(event_type, action, Channel::Email, *email);
        }
    }

    UserPreference {
        user_id,
        push_enabled: true,
        in_app_enabled: true,
        email_enabled: true,
        sms_enabled: false,
        quiet_hours_start: None,
        quiet_hours_end: None,
        quiet_days: Default::default(),
        event_preferences,
    }
}

/// Whether `now` (user-local wall clock) falls in the user's quiet period.
pub fn is_quiet(preference: &UserPreference, now: NaiveDateTime) -> bool {
    let weekday = now.weekday().num_days_from_sunday() as u8;
    if preference.quiet_days.contains(&weekday) {
        return true;
    }

    match (preference.quiet_hours_start, preference.quiet_hours_end) {
        (Some(start), Some(end)) => in_window(now.time(), start, end),
        _ => false,
    }
}

/// Inclusive window; `start > end` wraps past midnight.
fn in_window(time: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        start <= time && time <= end
    } else {
        time >= start || time <= end
    }
}

/// Channels to enqueue for this user, in push, in-app, email, sms order.
pub fn resolve_channels(
    binding: &EventBinding,
    template: &NotificationTemplate,
    preference: &UserPreference,
    now: NaiveDateTime,
) -> Vec<Channel> {
    if is_quiet(preference, now) {
        // only in-app survives a quiet period
        if template.channels.supports(Channel::InApp) && preference.in_app_enabled {
            return vec![Channel::InApp];
        }
        return Vec::new();
    }

    Channel::ALL
        .into_iter()
        .filter(|&channel| {
            template.channels.supports(channel)
                && preference.channel_enabled(channel)
                && preference
                    .event_preferences
                    .allows(&binding.event_type, &binding.event_action, channel)
        })
        .collect()
}
