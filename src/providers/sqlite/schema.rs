diesel::table! {
    usage_counters (user_id) {
        user_id -> Text,
        day -> Text,
        messages_sent -> BigInt,
        tokens_consumed -> BigInt,
        personas_owned -> BigInt,
        storage_bytes_used -> BigInt,
        reset_at -> Nullable<BigInt>,
        updated_at -> BigInt,
    }
}

diesel::table! {
    usage_archive (user_id, day) {
        user_id -> Text,
        day -> Text,
        messages_sent -> BigInt,
        tokens_consumed -> BigInt,
        archived_at -> BigInt,
    }
}

diesel::table! {
    token_reservations (id) {
        id -> Text,
        user_id -> Text,
        amount -> BigInt,
        day -> Text,
        created_at -> BigInt,
        actual_tokens -> Nullable<BigInt>,
        reconciled_at -> Nullable<BigInt>,
    }
}

diesel::table! {
    subscriptions (user_id) {
        user_id -> Text,
        tier -> Text,
        status -> Text,
        expires_at -> Nullable<BigInt>,
        grace_until -> Nullable<BigInt>,
        auto_renew -> Bool,
        last_verified_event_id -> Nullable<Text>,
        last_event_at -> Nullable<BigInt>,
        version -> BigInt,
        updated_at -> BigInt,
    }
}

diesel::table! {
    subscription_events (event_id) {
        event_id -> Text,
        user_id -> Text,
        kind -> Text,
        tier -> Nullable<Text>,
        expires_at -> Nullable<BigInt>,
        issued_at -> BigInt,
        outcome -> Text,
        recorded_at -> BigInt,
    }
}

diesel::table! {
    job_runs (job_name, scheduled_for) {
        job_name -> Text,
        scheduled_for -> Text,
        status -> Text,
        affected_rows -> BigInt,
        attempts -> Integer,
        started_at -> BigInt,
        finished_at -> Nullable<BigInt>,
        error -> Nullable<Text>,
    }
}

diesel::table! {
    chat_messages (id) {
        id -> Integer,
        user_id -> Text,
        persona_id -> Text,
        role -> Text,
        content -> Text,
        created_at -> BigInt,
    }
}
