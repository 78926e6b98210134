// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use log::debug;
use reqwest::{
    Client, StatusCode,
    multipart::{Form, Part},
};
use thiserror::Error;
use url::Url;

use crate::{
    coverage::{BranchKey, CommitKey},
    server::{
        API_KEY_HEADER,
        api_v1::{COVERAGE_FORM_FIELD, CoverageSchema},
    },
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid client configuration: {0}")]
    InvalidConfiguration(String),
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned unexpected status {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
}

/// Client for a covtrack server's `/api/v1`.
pub struct CovtrackClient {
    api_url: Url,
    api_key: String,
    client: Client,
}

impl CovtrackClient {
    pub fn new(server_url: &str, api_key: impl Into<String>) -> Result<CovtrackClient, ClientError> {
        let mut api_url = Url::parse(server_url).map_err(|e| {
            ClientError::InvalidConfiguration(format!("covtrack URL parse error: {e}"))
        })?;
        api_url
            .path_segments_mut()
            .map_err(|()| {
                ClientError::InvalidConfiguration(String::from(
                    "covtrack URL is bad; cannot append segments",
                ))
            })?
            .pop_if_empty()
            .push("api")
            .push("v1");

        let client = reqwest::ClientBuilder::new()
            .zstd(true)
            .gzip(true)
            .user_agent(format!("covtrack ({})", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(CovtrackClient {
            api_url,
            api_key: api_key.into(),
            client,
        })
    }

    /// `…/repos/{repo}/projects/{project}/branches/{branch}`, with each name percent-encoded as one path segment.
    fn branch_url(&self, key: &BranchKey) -> Url {
        let mut url = self.api_url.clone();
        // A URL that accepted segments in `new` still accepts them.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .push("repos")
                .push(&key.repo_name)
                .push("projects")
                .push(&key.project_name)
                .push("branches")
                .push(&key.branch_name);
        }
        url
    }

    /// Upload a report as the `coverage` file of a `multipart/form-data` form.
    pub async fn upload_coverage(
        &self,
        key: &CommitKey,
        raw_data: Vec<u8>,
    ) -> Result<(), ClientError> {
        let mut url = self.branch_url(&key.branch());
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push("commits").push(&key.commit).push("coverage");
        }

        let coverage_file = Part::bytes(raw_data)
            .file_name("coverage.json")
            .mime_str("application/json")?;
        let form = Form::new().part(COVERAGE_FORM_FIELD, coverage_file);

        debug!("HTTP request POST {url}");
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .multipart(form)
            .send()
            .await?;
        debug!("HTTP response: {response:?}");

        if response.status() != StatusCode::CREATED {
            return Err(unexpected_status(response).await);
        }
        Ok(())
    }

    /// The branch's latest coverage, or `None` when the server has none.
    pub async fn latest_coverage(
        &self,
        key: &BranchKey,
    ) -> Result<Option<CoverageSchema>, ClientError> {
        let mut url = self.branch_url(key);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push("coverage");
        }

        debug!("HTTP request GET {url}");
        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        debug!("HTTP response: {response:?}");

        match response.status() {
            StatusCode::OK => Ok(Some(response.json::<CoverageSchema>().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(unexpected_status(response).await),
        }
    }
}

async fn unexpected_status(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ClientError::UnexpectedStatus { status, body }
}
