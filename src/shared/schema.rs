diesel::table! {
    users (id) {
        id -> Uuid,
        username -> Text,
        email -> Text,
        avatar_url -> Nullable<Text>,
        is_admin -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    login_history (id) {
        id -> Uuid,
        user_id -> Uuid,
        succeeded -> Bool,
        ip -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tricks (id) {
        id -> Uuid,
        name -> Text,
        category -> Text,
        difficulty -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    trick_progress (id) {
        id -> Uuid,
        user_id -> Uuid,
        trick_id -> Uuid,
        status -> Text,
        stance -> Text,
        like_count -> Int4,
        comment_count -> Int4,
        created_at -> Timestamptz,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    articles (id) {
        id -> Uuid,
        title -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    article_reads (id) {
        id -> Uuid,
        user_id -> Uuid,
        article_id -> Uuid,
        known -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    events (id) {
        id -> Uuid,
        title -> Text,
        location -> Nullable<Text>,
        starts_at -> Timestamptz,
        capacity -> Nullable<Int4>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    event_attendance (id) {
        id -> Uuid,
        event_id -> Uuid,
        user_id -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        user_id -> Uuid,
        status -> Text,
        total_cents -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    posts (id) {
        id -> Uuid,
        user_id -> Uuid,
        content -> Text,
        like_count -> Int4,
        comment_count -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    likes (id) {
        id -> Uuid,
        user_id -> Uuid,
        item_kind -> Text,
        item_id -> Text,
        owner_id -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    comments (id) {
        id -> Uuid,
        user_id -> Uuid,
        item_kind -> Text,
        item_id -> Text,
        owner_id -> Uuid,
        content -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    favorites (id) {
        id -> Uuid,
        user_id -> Uuid,
        fav_kind -> Text,
        fav_id -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    user_achievements (id) {
        id -> Uuid,
        user_id -> Uuid,
        achievement_id -> Text,
        tier -> Text,
        achieved_at -> Timestamptz,
    }
}

diesel::table! {
    manual_achievements (id) {
        id -> Uuid,
        user_id -> Uuid,
        achievement_id -> Text,
        awarded_by -> Uuid,
        note -> Nullable<Text>,
        awarded_at -> Timestamptz,
    }
}
