// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Identifies one branch of one project within a repository; the scope of "latest" and "history" queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchKey {
    pub repo_name: String,
    pub project_name: String,
    pub branch_name: String,
}

impl BranchKey {
    pub fn new(
        repo_name: impl Into<String>,
        project_name: impl Into<String>,
        branch_name: impl Into<String>,
    ) -> Self {
        BranchKey {
            repo_name: repo_name.into(),
            project_name: project_name.into(),
            branch_name: branch_name.into(),
        }
    }

    #[must_use]
    pub fn commit(&self, commit: impl Into<String>) -> CommitKey {
        CommitKey {
            repo_name: self.repo_name.clone(),
            project_name: self.project_name.clone(),
            branch_name: self.branch_name.clone(),
            commit: commit.into(),
        }
    }
}

/// The natural key of a coverage record.  At most one record exists for any `CommitKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitKey {
    pub repo_name: String,
    pub project_name: String,
    pub branch_name: String,
    /// Expected to already be normalized by the caller; see [`crate::report::normalize_commit`].
    pub commit: String,
}

impl CommitKey {
    #[must_use]
    pub fn branch(&self) -> BranchKey {
        BranchKey::new(
            self.repo_name.as_str(),
            self.project_name.as_str(),
            self.branch_name.as_str(),
        )
    }
}

/// Content of an upload, as supplied by the caller to [`super::CoverageStore::upsert_coverage`].
#[derive(Debug, Clone)]
pub struct NewCoverage {
    pub key: CommitKey,
    pub coverage: f64,
    pub coverage_date: OffsetDateTime,
    pub raw_data: Vec<u8>,
}

/// One stored coverage snapshot.
///
/// `id` is assigned by the store when the natural key is first seen and never changes afterwards, even when the
/// record's content is replaced by a later upload.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageRecord {
    pub id: i64,
    pub repo_name: String,
    pub project_name: String,
    pub branch_name: String,
    pub commit: String,
    pub coverage: f64,
    pub coverage_date: OffsetDateTime,
    pub raw_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Error, Debug)]
#[error("order must be one of: asc, desc")]
pub struct InvalidHistoryOrder;

impl FromStr for HistoryOrder {
    type Err = InvalidHistoryOrder;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(HistoryOrder::Asc),
            "desc" => Ok(HistoryOrder::Desc),
            _ => Err(InvalidHistoryOrder),
        }
    }
}

impl fmt::Display for HistoryOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryOrder::Asc => write!(f, "asc"),
            HistoryOrder::Desc => write!(f, "desc"),
        }
    }
}
