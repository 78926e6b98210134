// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Caller-side handling of uploaded coverage reports: parsing the `coverage.json` format written by Python's
//! `coverage json`, and normalizing the commit and branch identifiers that accompany an upload.

use serde::Deserialize;
use thiserror::Error;
use time::{
    OffsetDateTime, PrimitiveDateTime, format_description::well_known::Rfc3339,
    macros::format_description,
};

/// Number of characters of a commit identifier that are stored.
pub const COMMIT_LENGTH: usize = 8;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to decode coverage file")]
    Decode(#[from] serde_json::Error),
    #[error("failed to parse coverage timestamp")]
    Timestamp(String),
    #[error("Commit must be at least {COMMIT_LENGTH} characters long")]
    CommitTooShort,
}

#[derive(Deserialize)]
struct PythonCoverageJson {
    meta: PythonCoverageMeta,
    totals: PythonCoverageTotals,
}

#[derive(Deserialize)]
struct PythonCoverageMeta {
    timestamp: String,
}

#[derive(Deserialize)]
struct PythonCoverageTotals {
    percent_covered: f64,
}

/// The parts of an uploaded coverage report that are indexed; the report itself is stored verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageReport {
    pub coverage_date: OffsetDateTime,
    pub percent_covered: f64,
}

pub fn parse_report(raw_data: &[u8]) -> Result<CoverageReport, ReportError> {
    let report: PythonCoverageJson = serde_json::from_slice(raw_data)?;
    Ok(CoverageReport {
        coverage_date: parse_timestamp(&report.meta.timestamp)?,
        percent_covered: report.totals.percent_covered,
    })
}

/// Timestamps without an offset (the usual `coverage json` output, eg. `2024-06-01T12:30:00.123456`) are taken as UTC.
fn parse_timestamp(timestamp: &str) -> Result<OffsetDateTime, ReportError> {
    if let Ok(parsed) = OffsetDateTime::parse(timestamp, &Rfc3339) {
        return Ok(parsed);
    }

    let with_subsecond =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    let without_subsecond = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    PrimitiveDateTime::parse(timestamp, with_subsecond)
        .or_else(|_| PrimitiveDateTime::parse(timestamp, without_subsecond))
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|e| ReportError::Timestamp(format!("{timestamp:?}: {e}")))
}

/// Validate a commit identifier and truncate it to the stored length.
pub fn normalize_commit(commit: &str) -> Result<String, ReportError> {
    if commit.chars().count() < COMMIT_LENGTH {
        return Err(ReportError::CommitTooShort);
    }
    Ok(commit.chars().take(COMMIT_LENGTH).collect())
}

/// Reduce a git ref (`refs/heads/main`, `refs/tags/v1.0`) to its short name; other values are returned unchanged.
#[must_use]
pub fn branch_from_ref(git_ref: &str) -> &str {
    git_ref
        .strip_prefix("refs/heads/")
        .or_else(|| git_ref.strip_prefix("refs/tags/"))
        .unwrap_or(git_ref)
}
