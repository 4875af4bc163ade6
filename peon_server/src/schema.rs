//! Diesel table definitions for the build status store.
//!
//! Tables: repos, builds, steps.

diesel::table! {
    repos (id) {
        id -> Int8,
        name -> Varchar,
        url -> Varchar,
    }
}

diesel::table! {
    builds (id) {
        id -> Int8,
        repo_id -> Int8,
        ref_type -> Varchar,
        ref_name -> Varchar,
        sha -> Varchar,
        status -> Varchar,
        enqueued_at -> Timestamptz,
        updated_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        ended_at -> Nullable<Timestamptz>,
        extra -> Nullable<Jsonb>,
    }
}

diesel::table! {
    steps (id) {
        id -> Int8,
        build_id -> Int8,
        description -> Varchar,
        status -> Varchar,
        output -> Nullable<Text>,
        started_at -> Timestamptz,
        ended_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(builds -> repos (repo_id));
diesel::joinable!(steps -> builds (build_id));

diesel::allow_tables_to_appear_in_same_query!(repos, builds, steps);
