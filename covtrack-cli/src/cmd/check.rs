// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{fmt, fs, process::ExitCode};

use anyhow::{Context as _, Result};
use log::{error, info, warn};

use crate::{
    coverage::BranchKey,
    report::{branch_from_ref, parse_report},
};

use super::cli::CheckOptions;

/// Inputs of a coverage gate; `base` is the base branch's latest coverage, when it has any.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageCheck {
    pub current: f64,
    pub threshold: f64,
    pub base: Option<f64>,
    pub diff_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CheckFailure {
    BelowThreshold { current: f64, threshold: f64 },
    DecreasedTooMuch { change: f64, diff_threshold: f64 },
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckFailure::BelowThreshold { current, threshold } => {
                write!(f, "coverage of {current:.2}% is below threshold of {threshold}%")
            }
            CheckFailure::DecreasedTooMuch {
                change,
                diff_threshold,
            } => write!(
                f,
                "coverage decreased by {:.2}% compared to the base branch, more than the allowed {diff_threshold}%",
                -change
            ),
        }
    }
}

impl CoverageCheck {
    /// Change from the base branch, in percentage points.
    #[must_use]
    pub fn change(&self) -> Option<f64> {
        self.base.map(|base| self.current - base)
    }

    #[must_use]
    pub fn evaluate(&self) -> Vec<CheckFailure> {
        let mut failures = Vec::new();
        if self.current < self.threshold {
            failures.push(CheckFailure::BelowThreshold {
                current: self.current,
                threshold: self.threshold,
            });
        }
        if let Some((base, diff_threshold)) = self
            .base
            .zip(self.diff_threshold)
            .filter(|(base, diff_threshold)| self.current < base - diff_threshold)
        {
            failures.push(CheckFailure::DecreasedTooMuch {
                change: self.current - base,
                diff_threshold,
            });
        }
        failures
    }
}

pub async fn cli(options: &CheckOptions) -> ExitCode {
    match check(options).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("error occurred in check: {err:?}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::print_stdout)]
async fn check(options: &CheckOptions) -> Result<bool> {
    let raw_data = fs::read(&options.file)
        .with_context(|| format!("reading coverage report {:?}", options.file))?;
    let report = parse_report(&raw_data).context("parsing coverage report")?;

    let base = match &options.base_branch {
        None => None,
        Some(base_ref) => {
            let key = BranchKey::new(
                options.repo.as_str(),
                options.project.as_str(),
                branch_from_ref(base_ref),
            );
            let latest = options
                .remote
                .client()?
                .latest_coverage(&key)
                .await
                .context("fetching base branch coverage")?;
            if latest.is_none() {
                warn!(
                    "coverage not found for {} on {}; skipping comparison",
                    key.project_name, key.branch_name
                );
            }
            latest.map(|c| c.coverage)
        }
    };

    let coverage_check = CoverageCheck {
        current: report.percent_covered,
        threshold: options.threshold,
        base,
        diff_threshold: options.diff_threshold,
    };
    if let Some(change) = coverage_check.change() {
        info!("coverage changed by {change:.2}% compared to the base branch");
    }

    let failures = coverage_check.evaluate();
    for failure in &failures {
        println!("FAIL: {failure}");
    }
    if failures.is_empty() {
        println!(
            "OK: coverage of {:.2}% meets threshold of {}%",
            coverage_check.current, coverage_check.threshold
        );
    }
    Ok(failures.is_empty())
}
