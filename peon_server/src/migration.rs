//! Embedded schema migration, applied on every startup.
//!
//! Statements are idempotent so an existing database is left untouched.

use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};

pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS repos (
    id              BIGSERIAL PRIMARY KEY,
    name            VARCHAR(255) NOT NULL UNIQUE,
    url             VARCHAR(1024) NOT NULL
);

CREATE TABLE IF NOT EXISTS builds (
    id              BIGSERIAL PRIMARY KEY,
    repo_id         BIGINT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
    ref_type        VARCHAR(16) NOT NULL,
    ref_name        VARCHAR(255) NOT NULL,
    sha             VARCHAR(64) NOT NULL,
    status          VARCHAR(16) NOT NULL DEFAULT 'pending',
    enqueued_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at      TIMESTAMPTZ,
    ended_at        TIMESTAMPTZ,
    extra           JSONB
);

CREATE INDEX IF NOT EXISTS idx_builds_repo ON builds (repo_id);
CREATE INDEX IF NOT EXISTS idx_builds_ref ON builds (repo_id, ref_type, ref_name);
CREATE INDEX IF NOT EXISTS idx_builds_status ON builds (status);
CREATE INDEX IF NOT EXISTS idx_builds_updated ON builds (updated_at DESC);

CREATE TABLE IF NOT EXISTS steps (
    id              BIGSERIAL PRIMARY KEY,
    build_id        BIGINT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    description     VARCHAR(1024) NOT NULL,
    status          VARCHAR(16) NOT NULL,
    output          TEXT,
    started_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    ended_at        TIMESTAMPTZ,
    UNIQUE (build_id, description)
);

CREATE INDEX IF NOT EXISTS idx_steps_build ON steps (build_id);
"#;

/// Create the peon tables if they do not exist yet.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("peon migration failed: {e}"))?;
    Ok(())
}
