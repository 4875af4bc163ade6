//! PostgreSQL datastore — diesel-async over a deadpool connection pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use super::{build_changes, Datastore, StoreError};
use crate::models::build::{BuildRow, ImportedBuild, NewBuild, NewImportedBuild};
use crate::models::repo::NewRepo;
use crate::models::step::{NewImportedStep, NewStep, StepChanges, StepRow};
use crate::models::{Build, BuildStatus, RefMode, Repo, Step, StepStatus};
use crate::schema::{builds, repos, steps};

const ACTIVE_STATUSES: [&str; 2] = ["pending", "running"];

pub struct PgDatastore {
    pool: Pool<AsyncPgConnection>,
}

impl PgDatastore {
    /// Open a pool and bring the schema up to date.
    pub async fn connect(database_url: &str, max_size: usize) -> anyhow::Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .max_size(max_size)
            .build()
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;

        let store = Self { pool };
        {
            let mut conn = store.conn().await?;
            tracing::info!("Running database migration...");
            crate::migration::run_migration(&mut conn).await?;
            tracing::info!("Database migration completed.");
        }
        Ok(store)
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

type BuildWithRepo = (BuildRow, String, String);

fn into_builds(rows: Vec<BuildWithRepo>) -> Result<Vec<Build>, StoreError> {
    rows.into_iter()
        .map(|(row, name, url)| Ok(row.into_build(name, url)?))
        .collect()
}

async fn transition_build(
    conn: &mut AsyncPgConnection,
    id: i64,
    next: BuildStatus,
    extra: Option<serde_json::Value>,
    only_if_accepted: bool,
) -> Result<(), StoreError> {
    let current: Option<(String, Option<DateTime<Utc>>)> = builds::table
        .find(id)
        .select((builds::status, builds::started_at))
        .first(conn)
        .await
        .optional()?;
    let (status, started_at) = current.ok_or(StoreError::BuildNotFound(id))?;
    let status: BuildStatus = status.parse()?;

    if only_if_accepted && !status.accepts(next) {
        return Ok(());
    }

    let changes = build_changes(id, status, started_at, next, extra, Utc::now())?;
    diesel::update(builds::table.find(id))
        .set(&changes)
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl Datastore for PgDatastore {
    async fn get_or_create_repo(&self, name: &str, url: &str) -> Result<Repo, StoreError> {
        let mut conn = self.conn().await?;

        diesel::insert_into(repos::table)
            .values(&NewRepo { name, url })
            .on_conflict(repos::name)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        let repo = repos::table
            .filter(repos::name.eq(name))
            .select(Repo::as_select())
            .first(&mut conn)
            .await?;
        Ok(repo)
    }

    async fn get_repos(&self) -> Result<Vec<Repo>, StoreError> {
        let mut conn = self.conn().await?;
        let result = repos::table
            .order(repos::name.asc())
            .select(Repo::as_select())
            .load(&mut conn)
            .await?;
        Ok(result)
    }

    async fn create_build(
        &self,
        repo_id: i64,
        ref_mode: RefMode,
        ref_name: &str,
        sha: &str,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let id = diesel::insert_into(builds::table)
            .values(&NewBuild {
                repo_id,
                ref_type: ref_mode.as_str(),
                ref_name,
                sha,
                status: BuildStatus::Pending.as_str(),
            })
            .returning(builds::id)
            .get_result(&mut conn)
            .await?;
        Ok(id)
    }

    async fn update_build(
        &self,
        id: i64,
        status: BuildStatus,
        extra: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        transition_build(&mut conn, id, status, extra, false).await
    }

    async fn get_build(&self, id: i64) -> Result<Option<Build>, StoreError> {
        let mut conn = self.conn().await?;
        let row: Option<BuildWithRepo> = builds::table
            .inner_join(repos::table)
            .filter(builds::id.eq(id))
            .select((BuildRow::as_select(), repos::name, repos::url))
            .first(&mut conn)
            .await
            .optional()?;
        Ok(into_builds(row.into_iter().collect())?.pop())
    }

    async fn get_builds(&self, repo_id: i64) -> Result<Vec<Build>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<BuildWithRepo> = builds::table
            .inner_join(repos::table)
            .filter(builds::repo_id.eq(repo_id))
            .order(builds::id.desc())
            .select((BuildRow::as_select(), repos::name, repos::url))
            .load(&mut conn)
            .await?;
        into_builds(rows)
    }

    async fn get_builds_for(
        &self,
        repo_name: &str,
        ref_mode: RefMode,
        ref_name: &str,
    ) -> Result<Vec<Build>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<BuildWithRepo> = builds::table
            .inner_join(repos::table)
            .filter(repos::name.eq(repo_name))
            .filter(builds::ref_type.eq(ref_mode.as_str()))
            .filter(builds::ref_name.eq(ref_name))
            .order(builds::id.desc())
            .select((BuildRow::as_select(), repos::name, repos::url))
            .load(&mut conn)
            .await?;
        into_builds(rows)
    }

    async fn get_last_updated_builds(&self, limit: usize) -> Result<Vec<Build>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<BuildWithRepo> = builds::table
            .inner_join(repos::table)
            .order((builds::updated_at.desc(), builds::id.desc()))
            .limit(limit as i64)
            .select((BuildRow::as_select(), repos::name, repos::url))
            .load(&mut conn)
            .await?;
        into_builds(rows)
    }

    async fn get_stale_builds(&self) -> Result<Vec<Build>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<BuildWithRepo> = builds::table
            .inner_join(repos::table)
            .filter(builds::status.eq_any(ACTIVE_STATUSES))
            .order(builds::id.asc())
            .select((BuildRow::as_select(), repos::name, repos::url))
            .load(&mut conn)
            .await?;
        into_builds(rows)
    }

    async fn update_step(
        &self,
        build_id: i64,
        description: &str,
        status: StepStatus,
        output: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let ended_at = status.is_terminal().then(Utc::now);

        let existing: Option<i64> = steps::table
            .filter(steps::build_id.eq(build_id))
            .filter(steps::description.eq(description))
            .select(steps::id)
            .first(&mut conn)
            .await
            .optional()?;

        match existing {
            Some(step_id) => {
                diesel::update(steps::table.find(step_id))
                    .set(&StepChanges {
                        status: status.as_str(),
                        output,
                        ended_at,
                    })
                    .execute(&mut conn)
                    .await?;
            }
            None => {
                diesel::insert_into(steps::table)
                    .values(&NewStep {
                        build_id,
                        description,
                        status: status.as_str(),
                        output,
                        ended_at,
                    })
                    .execute(&mut conn)
                    .await?;
            }
        }

        transition_build(&mut conn, build_id, BuildStatus::Running, None, true).await
    }

    async fn get_steps(&self, build_id: i64) -> Result<Vec<Step>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<StepRow> = steps::table
            .filter(steps::build_id.eq(build_id))
            .order(steps::id.asc())
            .select(StepRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter()
            .map(|row| Ok(Step::try_from(row)?))
            .collect()
    }

    async fn import_build(&self, repo_id: i64, build: &ImportedBuild) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let id: i64 = diesel::insert_into(builds::table)
            .values(&NewImportedBuild {
                repo_id,
                ref_type: build.ref_mode.as_str(),
                ref_name: &build.ref_name,
                sha: &build.sha,
                status: build.status.as_str(),
                enqueued_at: build.enqueued_at,
                updated_at: build.updated_at,
                started_at: build.started_at,
                ended_at: build.ended_at,
                extra: Some(build.extra.clone()),
            })
            .returning(builds::id)
            .get_result(&mut conn)
            .await?;

        let steps: Vec<NewImportedStep<'_>> = build
            .steps
            .iter()
            .map(|step| NewImportedStep {
                build_id: id,
                description: &step.description,
                status: step.status.as_str(),
                output: step.output.as_deref(),
                started_at: step.started_at,
                ended_at: step.ended_at,
            })
            .collect();
        if !steps.is_empty() {
            diesel::insert_into(steps::table)
                .values(&steps)
                .execute(&mut conn)
                .await?;
        }
        Ok(id)
    }
}
