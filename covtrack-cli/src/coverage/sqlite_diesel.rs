// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use diesel::{
    connection::{Instrumentation, SimpleConnection as _},
    prelude::*,
    upsert::excluded,
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::trace;
use std::{
    env::{self, VarError},
    fs, io,
    path::Path,
};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, MutexGuard, OnceCell};

use crate::schema::coverage;

use super::{
    BranchKey, CommitKey, CoverageRecord, CoverageStore, CoverageStoreDetailedError,
    CoverageStoreError, FoundOrNotFound as _, HistoryOrder, NewCoverage, ResultWithContext as _,
    to_sql_bound, to_unix_nanos,
};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("../db/sqlite/migrations");

struct DbLogger;

impl Instrumentation for DbLogger {
    fn on_connection_event(&mut self, event: diesel::connection::InstrumentationEvent<'_>) {
        trace!("DB event: {:?}", event);
    }
}

#[derive(Error, Debug)]
pub enum DefaultDatabaseError {
    #[error("unset environment variable: `{0}`")]
    EnvironmentVariableError(#[from] VarError),
    #[error("i/o error: `{0}`")]
    IoError(#[from] io::Error),
}

impl From<diesel::result::Error> for CoverageStoreError {
    fn from(value: diesel::result::Error) -> Self {
        CoverageStoreError::DatabaseError(value.to_string())
    }
}

impl From<diesel::result::Error> for CoverageStoreDetailedError {
    fn from(value: diesel::result::Error) -> Self {
        CoverageStoreDetailedError {
            error: CoverageStoreError::DatabaseError(value.to_string()),
            context: None,
        }
    }
}

impl From<diesel::ConnectionError> for CoverageStoreError {
    fn from(value: diesel::ConnectionError) -> Self {
        CoverageStoreError::DatabaseError(value.to_string())
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = crate::schema::coverage)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct CoverageRow {
    id: i64,
    repo_name: String,
    project_name: String,
    branch_name: String,
    commit: String,
    coverage_percent: f64,
    coverage_date: i64,
    raw_data: Vec<u8>,
}

impl TryFrom<CoverageRow> for CoverageRecord {
    type Error = CoverageStoreError;

    fn try_from(row: CoverageRow) -> Result<Self, Self::Error> {
        Ok(CoverageRecord {
            id: row.id,
            repo_name: row.repo_name,
            project_name: row.project_name,
            branch_name: row.branch_name,
            commit: row.commit,
            coverage: row.coverage_percent,
            coverage_date: OffsetDateTime::from_unix_timestamp_nanos(i128::from(row.coverage_date))?,
            raw_data: row.raw_data,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::coverage)]
struct NewCoverageRow<'a> {
    repo_name: &'a str,
    project_name: &'a str,
    branch_name: &'a str,
    commit: &'a str,
    coverage_percent: f64,
    coverage_date: i64,
    raw_data: &'a [u8],
}

pub struct DieselCoverageStore {
    database_url: String,
    connection: OnceCell<Mutex<SqliteConnection>>,
}

impl DieselCoverageStore {
    pub fn new_sqlite_from_default_url() -> Result<DieselCoverageStore, DefaultDatabaseError> {
        let target = match (env::var("XDG_CACHE_HOME"), env::var("LOCALAPPDATA")) {
            (Ok(xdg), _) => Path::new(&xdg).join("covtrack").join("covtrack.db"),
            (Err(_), Ok(localappdata)) => Path::new(&localappdata)
                .join("covtrack")
                .join("covtrack.db"),
            (Err(_), Err(_)) => Path::new(&env::var("HOME")?)
                .join(".cache")
                .join("covtrack")
                .join("covtrack.db"),
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).or_else(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
        }

        Ok(DieselCoverageStore::new_sqlite(String::from(
            target.to_string_lossy(),
        )))
    }

    pub fn new_sqlite(database_url: String) -> DieselCoverageStore {
        DieselCoverageStore {
            database_url,
            connection: OnceCell::new(),
        }
    }

    /// The single shared connection; all access is serialized through its mutex, which also makes the upsert atomic
    /// with respect to other callers of this store.
    async fn get_connection(
        &self,
    ) -> Result<MutexGuard<'_, SqliteConnection>, CoverageStoreDetailedError> {
        Ok(self
            .connection
            .get_or_try_init(async || {
                let mut connection = SqliteConnection::establish(&self.database_url)
                    .context("connecting to the database")?;
                connection.set_instrumentation(DbLogger {});

                connection
                    .batch_execute(
                        "
                PRAGMA journal_mode = WAL;
                PRAGMA busy_timeout = 5000;
                ",
                    )
                    .context("configuring connection")?;

                connection.run_pending_migrations(MIGRATIONS).map_err(|e| {
                    CoverageStoreError::DatabaseError(format!(
                        "failed to run pending migrations: {e}"
                    ))
                })?;

                Ok::<_, CoverageStoreDetailedError>(Mutex::new(connection))
            })
            .await?
            .lock()
            .await)
    }

    fn branch_filter(
        key: &BranchKey,
    ) -> coverage::BoxedQuery<'_, diesel::sqlite::Sqlite, coverage::SqlType> {
        coverage::table
            .filter(coverage::repo_name.eq(&key.repo_name))
            .filter(coverage::project_name.eq(&key.project_name))
            .filter(coverage::branch_name.eq(&key.branch_name))
            .into_boxed()
    }
}

impl CoverageStore for DieselCoverageStore {
    async fn upsert_coverage(
        &self,
        new_coverage: &NewCoverage,
    ) -> Result<CoverageRecord, CoverageStoreDetailedError> {
        let mut conn_guard = self.get_connection().await?;
        let conn = &mut *conn_guard;

        let row = NewCoverageRow {
            repo_name: &new_coverage.key.repo_name,
            project_name: &new_coverage.key.project_name,
            branch_name: &new_coverage.key.branch_name,
            commit: &new_coverage.key.commit,
            coverage_percent: new_coverage.coverage,
            coverage_date: to_unix_nanos(new_coverage.coverage_date)?,
            raw_data: &new_coverage.raw_data,
        };

        let stored = diesel::insert_into(coverage::table)
            .values(&row)
            .on_conflict((
                coverage::repo_name,
                coverage::project_name,
                coverage::branch_name,
                coverage::commit,
            ))
            .do_update()
            .set((
                coverage::coverage_percent.eq(excluded(coverage::coverage_percent)),
                coverage::coverage_date.eq(excluded(coverage::coverage_date)),
                coverage::raw_data.eq(excluded(coverage::raw_data)),
            ))
            .returning(CoverageRow::as_returning())
            .get_result(conn)
            .context("upsert into coverage")?;

        Ok(stored.try_into()?)
    }

    async fn get_most_recent_coverage(
        &self,
        key: &BranchKey,
    ) -> Result<CoverageRecord, CoverageStoreDetailedError> {
        let mut conn_guard = self.get_connection().await?;
        let conn = &mut *conn_guard;

        let row = Self::branch_filter(key)
            .select(CoverageRow::as_select())
            .order_by((coverage::coverage_date.desc(), coverage::id.desc()))
            .first::<CoverageRow>(conn)
            .optional()
            .context("loading most recent coverage")?
            .found("loading most recent coverage")?;

        Ok(row.try_into()?)
    }

    async fn get_coverage_payload(
        &self,
        key: &CommitKey,
    ) -> Result<Vec<u8>, CoverageStoreDetailedError> {
        let mut conn_guard = self.get_connection().await?;
        let conn = &mut *conn_guard;

        coverage::table
            .filter(coverage::repo_name.eq(&key.repo_name))
            .filter(coverage::project_name.eq(&key.project_name))
            .filter(coverage::branch_name.eq(&key.branch_name))
            .filter(coverage::commit.eq(&key.commit))
            .select(coverage::raw_data)
            .first::<Vec<u8>>(conn)
            .optional()
            .context("loading coverage payload")?
            .found("loading coverage payload")
    }

    async fn list_coverage_history(
        &self,
        key: &BranchKey,
        order: HistoryOrder,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<CoverageRecord>, CoverageStoreDetailedError> {
        let limit = to_sql_bound(limit, "limit")?;
        let offset = to_sql_bound(offset, "offset")?;

        let mut conn_guard = self.get_connection().await?;
        let conn = &mut *conn_guard;

        let query = Self::branch_filter(key).select(CoverageRow::as_select());
        let query = match order {
            HistoryOrder::Asc => query.order_by((coverage::coverage_date.asc(), coverage::id.asc())),
            HistoryOrder::Desc => {
                query.order_by((coverage::coverage_date.desc(), coverage::id.desc()))
            }
        };
        let rows = query
            .limit(limit)
            .offset(offset)
            .load::<CoverageRow>(conn)
            .context("loading coverage history")?;

        rows.into_iter()
            .map(|row| CoverageRecord::try_from(row).map_err(CoverageStoreDetailedError::from))
            .collect()
    }

    async fn list_repositories(&self) -> Result<Vec<String>, CoverageStoreDetailedError> {
        let mut conn_guard = self.get_connection().await?;
        let conn = &mut *conn_guard;

        coverage::table
            .select(coverage::repo_name)
            .distinct()
            .order_by(coverage::repo_name.asc())
            .load::<String>(conn)
            .context("loading repositories")
    }

    async fn list_projects(
        &self,
        repo_name: &str,
    ) -> Result<Vec<String>, CoverageStoreDetailedError> {
        let mut conn_guard = self.get_connection().await?;
        let conn = &mut *conn_guard;

        coverage::table
            .filter(coverage::repo_name.eq(repo_name))
            .select(coverage::project_name)
            .distinct()
            .order_by(coverage::project_name.asc())
            .load::<String>(conn)
            .context("loading projects")
    }

    async fn list_branches(
        &self,
        repo_name: &str,
        project_name: &str,
    ) -> Result<Vec<String>, CoverageStoreDetailedError> {
        let mut conn_guard = self.get_connection().await?;
        let conn = &mut *conn_guard;

        coverage::table
            .filter(coverage::repo_name.eq(repo_name))
            .filter(coverage::project_name.eq(project_name))
            .select(coverage::branch_name)
            .distinct()
            .order_by(coverage::branch_name.asc())
            .load::<String>(conn)
            .context("loading branches")
    }

    async fn ping(&self) -> Result<(), CoverageStoreDetailedError> {
        let mut conn_guard = self.get_connection().await?;
        let conn = &mut *conn_guard;
        conn.batch_execute("SELECT 1").context("ping")
    }
}
