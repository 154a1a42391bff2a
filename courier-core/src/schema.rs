use diesel::{allow_tables_to_appear_in_same_query, joinable, table};

table! {
    notification_templates (template_key) {
        template_key -> Text,
        push_enabled -> Bool,
        inapp_enabled -> Bool,
        email_enabled -> Bool,
        sms_enabled -> Bool,
        title_template -> Text,
        body_template -> Text,
        email_subject_template -> Nullable<Text>,
        email_body_template -> Nullable<Text>,
        priority -> Text,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    notification_event_bindings (id) {
        id -> BigInt,
        event_type -> Text,
        event_action -> Text,
        template_key -> Text,
        target_roles -> Jsonb,
        trigger_conditions -> Jsonb,
        delay_minutes -> Integer,
        max_retries -> Integer,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

table! {
    notification_user_preferences (user_id) {
        user_id -> BigInt,
        push_enabled -> Bool,
        inapp_enabled -> Bool,
        email_enabled -> Bool,
        sms_enabled -> Bool,
        quiet_hours_start -> Nullable<Time>,
        quiet_hours_end -> Nullable<Time>,
        quiet_days -> Jsonb,
        event_preferences -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    notification_queue (id) {
        id -> BigInt,
        user_id -> BigInt,
        template_key -> Text,
        channel -> Text,
        title -> Text,
        body -> Text,
        priority -> Text,
        status -> Text,
        scheduled_at -> Timestamptz,
        retry_count -> Integer,
        max_retries -> Integer,
        related_type -> Nullable<Text>,
        related_id -> Nullable<BigInt>,
        action_data -> Nullable<Jsonb>,
        result_code -> Nullable<Text>,
        result_message -> Nullable<Text>,
        external_id -> Nullable<Text>,
        claimed_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        sent_at -> Nullable<Timestamptz>,
    }
}

table! {
    inapp_notifications (id) {
        id -> BigInt,
        // UNIQUE (queue_id)
        queue_id -> Nullable<BigInt>,
        user_id -> BigInt,
        title -> Text,
        body -> Text,
        related_type -> Nullable<Text>,
        related_id -> Nullable<BigInt>,
        template_key -> Text,
        action_data -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        read_at -> Nullable<Timestamptz>,
    }
}

table! {
    notification_stats (stat_date, template_key, channel) {
        stat_date -> Date,
        template_key -> Text,
        channel -> Text,
        sent_count -> Integer,
        delivered_count -> Integer,
        opened_count -> Integer,
        clicked_count -> Integer,
        failed_count -> Integer,
    }
}

table! {
    device_tokens (id) {
        id -> BigInt,
        user_id -> BigInt,
        device_token -> Text,
        platform -> Text,
        created_at -> Timestamptz,
        last_used_at -> Timestamptz,
    }
}

table! {
    users (id) {
        id -> BigInt,
        email -> Nullable<Text>,
        phone -> Nullable<Text>,
        is_admin -> Bool,
    }
}

joinable!(notification_event_bindings -> notification_templates (template_key));

allow_tables_to_appear_in_same_query!(
    notification_templates,
    notification_event_bindings,
    notification_user_preferences,
    notification_queue,
    inapp_notifications,
    notification_stats,
    device_tokens,
    users,
);
