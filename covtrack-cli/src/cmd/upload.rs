// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{fs, process::ExitCode};

use anyhow::{Context as _, Result};
use log::{error, info};

use crate::{
    coverage::BranchKey,
    report::{branch_from_ref, normalize_commit, parse_report},
};

use super::cli::UploadOptions;

pub async fn cli(options: &UploadOptions) -> ExitCode {
    match upload(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("error occurred in upload: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn upload(options: &UploadOptions) -> Result<()> {
    let raw_data = fs::read(&options.file)
        .with_context(|| format!("reading coverage report {:?}", options.file))?;

    // Reject locally what the server would reject.
    let report = parse_report(&raw_data).context("parsing coverage report")?;
    let commit = normalize_commit(&options.commit)?;
    let key = BranchKey::new(
        options.repo.as_str(),
        options.project.as_str(),
        branch_from_ref(&options.branch),
    )
    .commit(commit);

    let client = options.remote.client()?;
    client
        .upload_coverage(&key, raw_data)
        .await
        .context("uploading coverage report")?;

    info!(
        "uploaded {:.2}% coverage for {}/{} {} @ {}",
        report.percent_covered, key.repo_name, key.project_name, key.branch_name, key.commit
    );
    Ok(())
}
