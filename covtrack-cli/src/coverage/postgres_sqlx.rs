// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use log::debug;
use sqlx::{FromRow, Pool, Postgres, postgres::PgPoolOptions};
use time::OffsetDateTime;
use tokio::sync::OnceCell;

use super::{
    BranchKey, CommitKey, CoverageRecord, CoverageStore, CoverageStoreDetailedError,
    CoverageStoreError, FoundOrNotFound as _, HistoryOrder, NewCoverage, ResultWithContext as _,
    to_sql_bound, to_unix_nanos,
};

pub struct PostgresCoverageStore {
    database_url: String,
    connection: OnceCell<Pool<Postgres>>,
}

impl From<sqlx::Error> for CoverageStoreError {
    fn from(value: sqlx::Error) -> Self {
        CoverageStoreError::DatabaseError(value.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for CoverageStoreError {
    fn from(value: sqlx::migrate::MigrateError) -> Self {
        CoverageStoreError::DatabaseError(value.to_string())
    }
}

impl From<sqlx::Error> for CoverageStoreDetailedError {
    fn from(value: sqlx::Error) -> Self {
        CoverageStoreDetailedError {
            error: CoverageStoreError::DatabaseError(value.to_string()),
            context: None,
        }
    }
}

#[derive(FromRow)]
struct CoverageRow {
    id: i64,
    repo_name: String,
    project_name: String,
    branch_name: String,
    commit: String,
    coverage: f64,
    coverage_date: OffsetDateTime,
    raw_data: Vec<u8>,
}

impl From<CoverageRow> for CoverageRecord {
    fn from(row: CoverageRow) -> Self {
        CoverageRecord {
            id: row.id,
            repo_name: row.repo_name,
            project_name: row.project_name,
            branch_name: row.branch_name,
            commit: row.commit,
            coverage: row.coverage,
            coverage_date: row.coverage_date,
            raw_data: row.raw_data,
        }
    }
}

const COVERAGE_COLUMNS: &str = r#"id, repo_name, project_name, branch_name, "commit", coverage, coverage_date, raw_data"#;

impl PostgresCoverageStore {
    pub fn new(database_url: String) -> PostgresCoverageStore {
        PostgresCoverageStore {
            database_url,
            connection: OnceCell::new(),
        }
    }

    async fn get_pool(&self) -> Result<&Pool<Postgres>, CoverageStoreError> {
        self.connection
            .get_or_try_init(|| async {
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(&self.database_url)
                    .await?;
                debug!("connected to PostgreSQL; running migrations");
                sqlx::migrate!("../db/postgres/migrations")
                    .run(&pool)
                    .await?;
                Ok(pool)
            })
            .await
    }
}

impl CoverageStore for PostgresCoverageStore {
    async fn upsert_coverage(
        &self,
        new_coverage: &NewCoverage,
    ) -> Result<CoverageRecord, CoverageStoreDetailedError> {
        // timestamptz reaches much further, but both backends accept the same dates
        to_unix_nanos(new_coverage.coverage_date)?;
        let pool = self.get_pool().await?;

        // A single statement, so concurrent uploads for one key resolve to one row.
        let row = sqlx::query_as::<_, CoverageRow>(&format!(
            r#"
            INSERT INTO coverage
                (repo_name, project_name, branch_name, "commit", coverage, coverage_date, raw_data)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (repo_name, project_name, branch_name, "commit")
                DO UPDATE SET
                    coverage = EXCLUDED.coverage,
                    coverage_date = EXCLUDED.coverage_date,
                    raw_data = EXCLUDED.raw_data
            RETURNING {COVERAGE_COLUMNS}
            "#
        ))
        .bind(&new_coverage.key.repo_name)
        .bind(&new_coverage.key.project_name)
        .bind(&new_coverage.key.branch_name)
        .bind(&new_coverage.key.commit)
        .bind(new_coverage.coverage)
        .bind(new_coverage.coverage_date)
        .bind(&new_coverage.raw_data)
        .fetch_one(pool)
        .await
        .context("upsert into coverage")?;

        Ok(row.into())
    }

    async fn get_most_recent_coverage(
        &self,
        key: &BranchKey,
    ) -> Result<CoverageRecord, CoverageStoreDetailedError> {
        let pool = self.get_pool().await?;

        let row = sqlx::query_as::<_, CoverageRow>(&format!(
            r"
            SELECT {COVERAGE_COLUMNS}
            FROM coverage
            WHERE
                repo_name = $1 AND
                project_name = $2 AND
                branch_name = $3
            ORDER BY coverage_date DESC, id DESC
            LIMIT 1
            "
        ))
        .bind(&key.repo_name)
        .bind(&key.project_name)
        .bind(&key.branch_name)
        .fetch_optional(pool)
        .await
        .context("loading most recent coverage")?
        .found("loading most recent coverage")?;

        Ok(row.into())
    }

    async fn get_coverage_payload(
        &self,
        key: &CommitKey,
    ) -> Result<Vec<u8>, CoverageStoreDetailedError> {
        let pool = self.get_pool().await?;

        sqlx::query_scalar::<_, Vec<u8>>(
            r#"
            SELECT raw_data
            FROM coverage
            WHERE
                repo_name = $1 AND
                project_name = $2 AND
                branch_name = $3 AND
                "commit" = $4
            "#,
        )
        .bind(&key.repo_name)
        .bind(&key.project_name)
        .bind(&key.branch_name)
        .bind(&key.commit)
        .fetch_optional(pool)
        .await
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
        let pool = self.get_pool().await?;

        let direction = match order {
            HistoryOrder::Asc => "ASC",
            HistoryOrder::Desc => "DESC",
        };
        let rows = sqlx::query_as::<_, CoverageRow>(&format!(
            r"
            SELECT {COVERAGE_COLUMNS}
            FROM coverage
            WHERE
                repo_name = $1 AND
                project_name = $2 AND
                branch_name = $3
            ORDER BY coverage_date {direction}, id {direction}
            LIMIT $4
            OFFSET $5
            "
        ))
        .bind(&key.repo_name)
        .bind(&key.project_name)
        .bind(&key.branch_name)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("loading coverage history")?;

        Ok(rows.into_iter().map(CoverageRecord::from).collect())
    }

    async fn list_repositories(&self) -> Result<Vec<String>, CoverageStoreDetailedError> {
        let pool = self.get_pool().await?;
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT repo_name FROM coverage ORDER BY repo_name",
        )
        .fetch_all(pool)
        .await
        .context("loading repositories")
    }

    async fn list_projects(
        &self,
        repo_name: &str,
    ) -> Result<Vec<String>, CoverageStoreDetailedError> {
        let pool = self.get_pool().await?;
        sqlx::query_scalar::<_, String>(
            r"
            SELECT DISTINCT project_name
            FROM coverage
            WHERE repo_name = $1
            ORDER BY project_name
            ",
        )
        .bind(repo_name)
        .fetch_all(pool)
        .await
        .context("loading projects")
    }

    async fn list_branches(
        &self,
        repo_name: &str,
        project_name: &str,
    ) -> Result<Vec<String>, CoverageStoreDetailedError> {
        let pool = self.get_pool().await?;
        sqlx::query_scalar::<_, String>(
            r"
            SELECT DISTINCT branch_name
            FROM coverage
            WHERE repo_name = $1 AND project_name = $2
            ORDER BY branch_name
            ",
        )
        .bind(repo_name)
        .bind(project_name)
        .fetch_all(pool)
        .await
        .context("loading branches")
    }

    async fn ping(&self) -> Result<(), CoverageStoreDetailedError> {
        let pool = self.get_pool().await?;
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .context("ping")?;
        Ok(())
    }
}
