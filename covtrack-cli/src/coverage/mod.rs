// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

use enum_dispatch::enum_dispatch;
use postgres_sqlx::PostgresCoverageStore;
use sqlite_diesel::DieselCoverageStore;
use thiserror::Error;
use time::OffsetDateTime;

pub use record::{
    BranchKey, CommitKey, CoverageRecord, HistoryOrder, InvalidHistoryOrder, NewCoverage,
};

mod postgres_sqlx;
mod record;
mod sqlite_diesel;

/// Persistence for coverage records, keyed by (repo, project, branch, commit).
///
/// Implementations never retry internally; a failed operation is reported to the caller as-is.
#[enum_dispatch]
#[allow(async_fn_in_trait)] // should be fine to the extent that this is only used internally to this project
pub trait CoverageStore {
    /// Insert a record for `coverage.key`, or replace the coverage, date, and raw data of the existing record with that
    /// key.  The returned record keeps the original `id` when an existing record was replaced.
    async fn upsert_coverage(
        &self,
        coverage: &NewCoverage,
    ) -> Result<CoverageRecord, CoverageStoreDetailedError>;

    /// The branch's record with the greatest `coverage_date`; ties go to the greatest `id`.
    async fn get_most_recent_coverage(
        &self,
        key: &BranchKey,
    ) -> Result<CoverageRecord, CoverageStoreDetailedError>;

    async fn get_coverage_payload(
        &self,
        key: &CommitKey,
    ) -> Result<Vec<u8>, CoverageStoreDetailedError>;

    /// Records of a branch ordered by `coverage_date` (then `id`) in the requested direction, skipping `offset` records
    /// and returning at most `limit`.
    async fn list_coverage_history(
        &self,
        key: &BranchKey,
        order: HistoryOrder,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<CoverageRecord>, CoverageStoreDetailedError>;

    async fn list_repositories(&self) -> Result<Vec<String>, CoverageStoreDetailedError>;

    async fn list_projects(
        &self,
        repo_name: &str,
    ) -> Result<Vec<String>, CoverageStoreDetailedError>;

    async fn list_branches(
        &self,
        repo_name: &str,
        project_name: &str,
    ) -> Result<Vec<String>, CoverageStoreDetailedError>;

    /// Round-trip to the storage engine; used for readiness checks.
    async fn ping(&self) -> Result<(), CoverageStoreDetailedError>;
}

#[derive(Error, Debug)]
pub enum CreateStoreError {
    #[error("unsupported database url: `{0}`")]
    UnsupportedDatabaseUrl(String),
    #[error("error managing default SQLite DB: `{0}`")]
    SqliteDefaultDatabaseError(#[from] sqlite_diesel::DefaultDatabaseError),
}

#[derive(Error, Debug)]
pub struct CoverageStoreDetailedError {
    pub error: CoverageStoreError,
    pub context: Option<String>,
}

impl fmt::Display for CoverageStoreDetailedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{} ({})", self.error, context),
            None => write!(f, "{}", self.error),
        }
    }
}

impl CoverageStoreDetailedError {
    fn context(self, context: &str) -> CoverageStoreDetailedError {
        CoverageStoreDetailedError {
            error: self.error,
            context: Some(String::from(context)),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.error, CoverageStoreError::NotFound)
    }

    /// The request itself can't be stored, as opposed to the store failing.
    #[must_use]
    pub fn is_invalid_input(&self) -> bool {
        matches!(self.error, CoverageStoreError::InvalidInput(_))
    }
}

trait ResultWithContext<T> {
    fn context(self, context: &str) -> Result<T, CoverageStoreDetailedError>;
}

impl<T> ResultWithContext<T> for Result<T, CoverageStoreDetailedError> {
    fn context(self, context: &str) -> Result<T, CoverageStoreDetailedError> {
        self.map_err(|e| e.context(context))
    }
}

impl<Res, Err> ResultWithContext<Res> for Result<Res, Err>
where
    Err: Into<CoverageStoreError>,
{
    fn context(self, context: &str) -> Result<Res, CoverageStoreDetailedError> {
        self.map_err(|e| CoverageStoreDetailedError {
            error: e.into(),
            context: Some(String::from(context)),
        })
    }
}

/// Turns an absent row into [`CoverageStoreError::NotFound`].
trait FoundOrNotFound<T> {
    fn found(self, context: &str) -> Result<T, CoverageStoreDetailedError>;
}

impl<T> FoundOrNotFound<T> for Option<T> {
    fn found(self, context: &str) -> Result<T, CoverageStoreDetailedError> {
        self.ok_or_else(|| CoverageStoreDetailedError {
            error: CoverageStoreError::NotFound,
            context: Some(String::from(context)),
        })
    }
}

#[derive(Error, Debug)]
pub enum CoverageStoreError {
    #[error("no coverage record matches the requested key")]
    NotFound,
    #[error("invalid input: `{0}`")]
    InvalidInput(String),
    #[error("database error: `{0}`")]
    DatabaseError(String),
    #[error("data parsing error: `{0}`")]
    ParsingError(String),
}

impl From<CoverageStoreError> for CoverageStoreDetailedError {
    fn from(value: CoverageStoreError) -> Self {
        CoverageStoreDetailedError {
            error: value,
            context: None,
        }
    }
}

impl From<time::error::ComponentRange> for CoverageStoreError {
    fn from(value: time::error::ComponentRange) -> Self {
        CoverageStoreError::ParsingError(value.to_string())
    }
}

/// Storage engines take signed 64-bit limits and offsets.
fn to_sql_bound<T>(value: T, name: &str) -> Result<i64, CoverageStoreDetailedError>
where
    i64: TryFrom<T>,
    T: Copy + fmt::Display,
{
    i64::try_from(value).map_err(|_| {
        CoverageStoreError::InvalidInput(format!("{name} {value} is out of range")).into()
    })
}

/// Nanoseconds since the Unix epoch.  Every backend accepts exactly the coverage dates that fit in an `i64` here
/// (1677-09-21 through 2262-04-11), which is how SQLite stores them.
fn to_unix_nanos(date: OffsetDateTime) -> Result<i64, CoverageStoreError> {
    i64::try_from(date.unix_timestamp_nanos()).map_err(|_| {
        CoverageStoreError::InvalidInput(format!("coverage date {date} is out of range"))
    })
}

#[enum_dispatch(CoverageStore)]
pub enum CoverageStoreDispatch {
    Postgres(PostgresCoverageStore),
    Sqlite(DieselCoverageStore),
}

/// Create a store for a database URL; `None` selects a SQLite database in the user's cache directory.
pub fn create_store(database_url: Option<&str>) -> Result<CoverageStoreDispatch, CreateStoreError> {
    match database_url {
        Some(db_url) if db_url.starts_with("postgres") => {
            Ok(PostgresCoverageStore::new(String::from(db_url)).into())
        }
        Some(db_url) if db_url.starts_with("file://") || db_url.starts_with(":memory:") => {
            Ok(DieselCoverageStore::new_sqlite(String::from(db_url)).into())
        }
        Some(db_url) => Err(CreateStoreError::UnsupportedDatabaseUrl(String::from(db_url))),
        None => Ok(DieselCoverageStore::new_sqlite_from_default_url()?.into()),
    }
}

/// An empty, private, in-memory store.
#[must_use]
pub fn create_test_store() -> CoverageStoreDispatch {
    DieselCoverageStore::new_sqlite(String::from(":memory:")).into()
}
