// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{collections::BTreeMap, fmt};

use actix_multipart::Multipart;
use actix_web::{
    HttpRequest, HttpResponse, Responder, ResponseError, Scope,
    body::BoxBody,
    http::{StatusCode, header::CONTENT_TYPE},
    web,
};
use futures::{Stream, StreamExt as _};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    coverage::{
        BranchKey, CoverageRecord, CoverageStore as _, CoverageStoreDetailedError,
        CoverageStoreDispatch, HistoryOrder, NewCoverage,
    },
    report::{self, ReportError},
};

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 100;
/// Coverage reports for large projects easily exceed actix's default 256kB payload limit.
pub const MAX_UPLOAD_SIZE: usize = 1 << 26;
/// Form field holding the report in a `multipart/form-data` upload.
pub const COVERAGE_FORM_FIELD: &str = "coverage";

pub trait InstallApiV1Handlers {
    fn api_v1_handlers(self) -> Self;
}

impl InstallApiV1Handlers for Scope {
    fn api_v1_handlers(self) -> Self {
        self.route("/repos", web::get().to(list_repositories))
            .route("/repos/{repo}/projects", web::get().to(list_projects))
            .route(
                "/repos/{repo}/projects/{project}/branches",
                web::get().to(list_branches),
            )
            .route(
                "/repos/{repo}/projects/{project}/branches/{branch}/commits/{commit}/coverage",
                web::post().to(post_coverage),
            )
            .route(
                "/repos/{repo}/projects/{project}/branches/{branch}/coverage",
                web::get().to(get_latest_branch_coverage),
            )
            .route(
                "/repos/{repo}/projects/{project}/branches/{branch}/commits/{commit}/coverage_data",
                web::get().to(get_coverage_data),
            )
            .route(
                "/repos/{repo}/projects/{project}/branches/{branch}/coverage_history",
                web::get().to(list_coverage_history),
            )
    }
}

/// Public representation of a stored coverage record; the raw report is served separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSchema {
    pub repo_name: String,
    pub project_name: String,
    pub branch_name: String,
    pub commit: String,
    pub coverage: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub coverage_date: OffsetDateTime,
}

impl From<CoverageRecord> for CoverageSchema {
    fn from(record: CoverageRecord) -> Self {
        CoverageSchema {
            repo_name: record.repo_name,
            project_name: record.project_name,
            branch_name: record.branch_name,
            commit: record.commit,
            coverage: record.coverage,
            coverage_date: record.coverage_date,
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid or missing API key")]
    Unauthorized,
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("validation failed")]
    Validation(BTreeMap<&'static str, String>),
    #[error("coverage file is too large")]
    PayloadTooLarge,
    // Details of `source` are logged but never sent to the client.
    #[error("{message}")]
    Internal {
        message: &'static str,
        source: anyhow::Error,
    },
}

impl ApiError {
    fn store(
        message: &'static str,
    ) -> impl FnOnce(CoverageStoreDetailedError) -> ApiError {
        move |e| {
            if e.is_not_found() {
                ApiError::NotFound(message)
            } else if e.is_invalid_input() {
                ApiError::BadRequest(format!("{message}: {}", e.error))
            } else {
                ApiError::Internal {
                    message,
                    source: e.into(),
                }
            }
        }
    }

    fn invalid_field(field: &'static str, message: impl Into<String>) -> ApiError {
        ApiError::Validation(BTreeMap::from([(field, message.into())]))
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse<BoxBody> {
        let body = match self {
            ApiError::Validation(errors) => json!({"message": self.to_string(), "errors": errors}),
            ApiError::Internal { message, source } => {
                error!("{message}: {source:?}");
                json!({"message": message})
            }
            _ => json!({"message": self.to_string()}),
        };
        HttpResponse::build(self.status_code()).json(body)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ReportError> for ApiError {
    fn from(value: ReportError) -> Self {
        match value {
            ReportError::CommitTooShort => ApiError::invalid_field("commit", value.to_string()),
            ReportError::Decode(_) | ReportError::Timestamp(_) => {
                debug!("rejecting coverage report: {value:?}");
                ApiError::BadRequest(value.to_string())
            }
        }
    }
}

async fn list_repositories(
    store: web::Data<CoverageStoreDispatch>,
) -> Result<impl Responder, ApiError> {
    debug!("list_repositories");
    let repos = store
        .list_repositories()
        .await
        .map_err(ApiError::store("failed to get repos"))?;
    Ok(HttpResponse::Ok().json(repos))
}

async fn list_projects(
    path: web::Path<String>,
    store: web::Data<CoverageStoreDispatch>,
) -> Result<impl Responder, ApiError> {
    let repo_name = path.into_inner();
    debug!("list_projects received: {repo_name:?}");
    let projects = store
        .list_projects(&repo_name)
        .await
        .map_err(ApiError::store("failed to get projects"))?;
    Ok(HttpResponse::Ok().json(projects))
}

async fn list_branches(
    path: web::Path<(String, String)>,
    store: web::Data<CoverageStoreDispatch>,
) -> Result<impl Responder, ApiError> {
    let (repo_name, project_name) = path.into_inner();
    debug!("list_branches received: {repo_name:?} {project_name:?}");
    let branches = store
        .list_branches(&repo_name, &project_name)
        .await
        .map_err(ApiError::store("failed to get branches"))?;
    Ok(HttpResponse::Ok().json(branches))
}

async fn read_limited<S, E>(mut stream: S) -> Result<Vec<u8>, ApiError>
where
    S: Stream<Item = Result<web::Bytes, E>> + Unpin,
    E: fmt::Display,
{
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| ApiError::BadRequest(format!("failed to read coverage file: {e}")))?;
        if data.len() + chunk.len() > MAX_UPLOAD_SIZE {
            return Err(ApiError::PayloadTooLarge);
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

/// The report is the `coverage` file of a `multipart/form-data` body, or else the whole request body.
async fn read_coverage_upload(req: &HttpRequest, payload: web::Payload) -> Result<Vec<u8>, ApiError> {
    let is_multipart = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("multipart/form-data")
        });

    let raw_data = if is_multipart {
        let mut multipart = Multipart::new(req.headers(), payload);
        let mut coverage_file = None;
        while let Some(field) = multipart.next().await {
            let field = field
                .map_err(|e| ApiError::BadRequest(format!("failed to read multipart form: {e}")))?;
            // unread fields are skipped by the next poll
            if field.name() == Some(COVERAGE_FORM_FIELD) {
                coverage_file = Some(read_limited(field).await?);
                break;
            }
        }
        coverage_file.unwrap_or_default()
    } else {
        read_limited(payload).await?
    };

    if raw_data.is_empty() {
        return Err(ApiError::BadRequest(String::from(
            "coverage file is required",
        )));
    }
    Ok(raw_data)
}

// Path segments arrive percent-decoded from the router, so `feature%2Fx` is already `feature/x` here.
async fn post_coverage(
    path: web::Path<(String, String, String, String)>,
    req: HttpRequest,
    payload: web::Payload,
    store: web::Data<CoverageStoreDispatch>,
) -> Result<impl Responder, ApiError> {
    let (repo_name, project_name, branch_name, commit) = path.into_inner();
    debug!("post_coverage received: {repo_name:?} {project_name:?} {branch_name:?} {commit:?}");

    let commit = report::normalize_commit(&commit)?;
    let raw_data = read_coverage_upload(&req, payload).await?;
    debug!("post_coverage read {} bytes of coverage", raw_data.len());
    let parsed = report::parse_report(&raw_data)?;

    let new_coverage = NewCoverage {
        key: BranchKey::new(repo_name, project_name, branch_name).commit(commit),
        coverage: parsed.percent_covered,
        coverage_date: parsed.coverage_date,
        raw_data,
    };
    store
        .upsert_coverage(&new_coverage)
        .await
        .map_err(ApiError::store("failed to upsert coverage"))?;

    Ok(HttpResponse::Created().finish())
}

async fn get_latest_branch_coverage(
    path: web::Path<(String, String, String)>,
    store: web::Data<CoverageStoreDispatch>,
) -> Result<impl Responder, ApiError> {
    let (repo_name, project_name, branch_name) = path.into_inner();
    debug!("get_latest_branch_coverage received: {repo_name:?} {project_name:?} {branch_name:?}");

    let record = store
        .get_most_recent_coverage(&BranchKey::new(repo_name, project_name, branch_name))
        .await
        .map_err(ApiError::store("failed to get recent coverage"))?;
    Ok(HttpResponse::Ok().json(CoverageSchema::from(record)))
}

async fn get_coverage_data(
    path: web::Path<(String, String, String, String)>,
    store: web::Data<CoverageStoreDispatch>,
) -> Result<impl Responder, ApiError> {
    let (repo_name, project_name, branch_name, commit) = path.into_inner();
    debug!(
        "get_coverage_data received: {repo_name:?} {project_name:?} {branch_name:?} {commit:?}"
    );

    let key = BranchKey::new(repo_name, project_name, branch_name).commit(commit);
    let raw_data = store
        .get_coverage_payload(&key)
        .await
        .map_err(ApiError::store("failed to get coverage data"))?;
    let report: serde_json::Value =
        serde_json::from_slice(&raw_data).map_err(|e| ApiError::Internal {
            message: "failed to unmarshal coverage data",
            source: e.into(),
        })?;
    Ok(HttpResponse::Ok().json(report))
}

/// Query string of the history endpoint.  Values are taken as strings so that malformed numbers produce the same
/// field-level validation errors as out-of-range ones.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub order: Option<String>,
    pub limit: Option<String>,
    pub page: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct HistoryParams {
    pub order: HistoryOrder,
    pub limit: u32,
    pub offset: u64,
}

impl HistoryQuery {
    /// Apply defaults (`order=desc`, `limit=50`, `page=1`) and validate, collecting every failed field.
    pub fn validate(&self) -> Result<HistoryParams, ApiError> {
        let mut errors = BTreeMap::new();

        let order = match self.order.as_deref() {
            None => HistoryOrder::default(),
            Some(order) => order.parse().unwrap_or_else(|_| {
                errors.insert("order", String::from("Order must be one of: asc, desc"));
                HistoryOrder::default()
            }),
        };

        let limit = match self.limit.as_deref() {
            None => DEFAULT_HISTORY_LIMIT,
            Some(limit) => match limit.parse::<u32>() {
                Ok(limit) if (1..=MAX_HISTORY_LIMIT).contains(&limit) => limit,
                _ => {
                    errors.insert(
                        "limit",
                        format!("Limit must be >=1 and <={MAX_HISTORY_LIMIT}"),
                    );
                    DEFAULT_HISTORY_LIMIT
                }
            },
        };

        let page = match self.page.as_deref() {
            None => 1,
            Some(page) => match page.parse::<u64>() {
                Ok(page) if page >= 1 => page,
                _ => {
                    errors.insert("page", String::from("Page must be >=1"));
                    1
                }
            },
        };

        // Offsets are bound as signed 64-bit integers by both stores.
        let offset = (page - 1)
            .checked_mul(u64::from(limit))
            .filter(|offset| i64::try_from(*offset).is_ok());
        let Some(offset) = offset else {
            errors.insert("page", String::from("Page is too large"));
            return Err(ApiError::Validation(errors));
        };

        if errors.is_empty() {
            Ok(HistoryParams {
                order,
                limit,
                offset,
            })
        } else {
            Err(ApiError::Validation(errors))
        }
    }
}

async fn list_coverage_history(
    path: web::Path<(String, String, String)>,
    query: web::Query<HistoryQuery>,
    store: web::Data<CoverageStoreDispatch>,
) -> Result<impl Responder, ApiError> {
    let (repo_name, project_name, branch_name) = path.into_inner();
    debug!(
        "list_coverage_history received: {repo_name:?} {project_name:?} {branch_name:?} {:?}",
        query
    );

    let params = query.validate()?;
    let records = store
        .list_coverage_history(
            &BranchKey::new(repo_name, project_name, branch_name),
            params.order,
            params.limit,
            params.offset,
        )
        .await
        .map_err(ApiError::store("failed to get coverage history"))?;

    Ok(HttpResponse::Ok().json(
        records
            .into_iter()
            .map(CoverageSchema::from)
            .collect::<Vec<_>>(),
    ))
}

#[cfg(test)]
mod tests {
    use actix_web::{App, test};
    use anyhow::Result;
    use serde_json::Value;
    use time::macros::datetime;

    use crate::coverage::create_test_store;

    use super::*;

    fn report(timestamp: &str, percent_covered: f64) -> String {
        format!(
            r#"{{"meta": {{"format": 2, "version": "7.4.0", "timestamp": "{timestamp}"}}, "files": {{}}, "totals": {{"percent_covered": {percent_covered}}}}}"#
        )
    }

    fn upload_request(branch_path: &str, commit: &str, body: String) -> test::TestRequest {
        test::TestRequest::post()
            .uri(&format!(
                "/api/v1/repos/repo1/projects/project1/branches/{branch_path}/commits/{commit}/coverage"
            ))
            .set_payload(body)
    }

    #[actix_web::test]
    async fn test_upload_and_get_latest() -> Result<()> {
        let store = web::Data::new(create_test_store());
        let app = test::init_service(
            App::new()
                .app_data(store.clone())
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;

        let req = upload_request(
            "main",
            "0123456789abcdef",
            report("2024-06-01T12:00:00", 81.25),
        )
        .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::CREATED
        );

        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches/main/coverage")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: CoverageSchema = test::read_body_json(resp).await;
        assert_eq!(
            body,
            CoverageSchema {
                repo_name: String::from("repo1"),
                project_name: String::from("project1"),
                branch_name: String::from("main"),
                commit: String::from("01234567"),
                coverage: 81.25,
                coverage_date: datetime!(2024-06-01 12:00 UTC),
            }
        );

        // raw report is stored verbatim under the truncated commit
        let payload = store
            .get_coverage_payload(
                &BranchKey::new("repo1", "project1", "main").commit("01234567"),
            )
            .await?;
        assert_eq!(payload, report("2024-06-01T12:00:00", 81.25).into_bytes());

        Ok(())
    }

    fn multipart_body(parts: &[(&str, &str)]) -> String {
        let mut body = String::new();
        for (name, content) in parts {
            body.push_str(&format!(
                "--XYZ\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{name}.json\"\r\nContent-Type: application/json\r\n\r\n{content}\r\n"
            ));
        }
        body.push_str("--XYZ--\r\n");
        body
    }

    #[actix_web::test]
    async fn test_upload_multipart_form() -> Result<()> {
        let store = web::Data::new(create_test_store());
        let app = test::init_service(
            App::new()
                .app_data(store.clone())
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;
        let coverage = report("2024-06-01T12:00:00", 66.5);

        // the file is found by field name; other fields are skipped
        let req = upload_request(
            "main",
            "0123456789",
            multipart_body(&[("notes", "{}"), ("coverage", coverage.as_str())]),
        )
        .insert_header((CONTENT_TYPE, "multipart/form-data; boundary=XYZ"))
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let payload = store
            .get_coverage_payload(&BranchKey::new("repo1", "project1", "main").commit("01234567"))
            .await?;
        assert_eq!(payload, coverage.into_bytes());
        let latest = store
            .get_most_recent_coverage(&BranchKey::new("repo1", "project1", "main"))
            .await?;
        assert_eq!(latest.coverage, 66.5);

        let req = upload_request("main", "0123456789", multipart_body(&[("notes", "{}")]))
            .insert_header((CONTENT_TYPE, "multipart/form-data; boundary=XYZ"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["message"], "coverage file is required");

        Ok(())
    }

    #[actix_web::test]
    async fn test_upload_json_date_format() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(create_test_store()))
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;
        let req = upload_request(
            "main",
            "0123456789abcdef",
            report("2024-06-01T12:00:00", 50.0),
        )
        .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::CREATED
        );

        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches/main/coverage")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["coverage_date"], "2024-06-01T12:00:00Z");
        assert_eq!(body["commit"], "01234567");
        assert!(body.get("raw_data").is_none());
        assert!(body.get("id").is_none());
    }

    #[actix_web::test]
    async fn test_upload_replaces_same_commit() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(create_test_store()))
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;
        let req = upload_request(
            "main",
            "0123456789",
            report("2024-06-01T12:00:00", 50.0),
        )
        .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::CREATED
        );
        // same first 8 characters; same natural key
        let req = upload_request(
            "main",
            "01234567ff",
            report("2024-06-02T12:00:00", 60.0),
        )
        .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::CREATED
        );

        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches/main/coverage_history")
            .to_request();
        let body: Vec<CoverageSchema> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.len(), 1);
        assert_eq!(body[0].coverage, 60.0);
    }

    #[actix_web::test]
    async fn test_upload_rejects_short_commit() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(create_test_store()))
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;
        let req = test::TestRequest::post()
            .uri("/api/v1/repos/repo1/projects/project1/branches/main/commits/0123456/coverage")
            .set_payload(report("2024-06-01T12:00:00", 50.0))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(
            body["errors"]["commit"],
            "Commit must be at least 8 characters long"
        );
    }

    #[actix_web::test]
    async fn test_upload_rejects_bad_reports() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(create_test_store()))
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;

        for (body, message) in [
            (String::new(), "coverage file is required"),
            (String::from("{not json"), "failed to decode coverage file"),
            (
                report("last tuesday", 50.0),
                "failed to parse coverage timestamp",
            ),
        ] {
            let req = test::TestRequest::post()
                .uri(
                    "/api/v1/repos/repo1/projects/project1/branches/main/commits/0123456789/coverage",
                )
                .set_payload(body)
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body["message"], message);
        }

        let req = test::TestRequest::get()
            .uri("/api/v1/repos")
            .to_request();
        let body: Vec<String> = test::call_and_read_body_json(&app, req).await;
        assert!(body.is_empty(), "rejected uploads must not be stored");
    }

    #[actix_web::test]
    async fn test_upload_rejects_unstorable_date() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(create_test_store()))
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;
        let req = upload_request(
            "main",
            "0123456789",
            report("2300-06-01T12:00:00", 50.0),
        )
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        let message = body["message"].as_str().unwrap_or_default();
        assert!(
            message.starts_with("failed to upsert coverage: invalid input"),
            "{body}"
        );
    }

    #[actix_web::test]
    async fn test_latest_not_found() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(create_test_store()))
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;
        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches/main/coverage")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["message"], "failed to get recent coverage");
    }

    #[actix_web::test]
    async fn test_encoded_branch_name() {
        let store = web::Data::new(create_test_store());
        let app = test::init_service(
            App::new()
                .app_data(store.clone())
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;
        let req = upload_request(
            "feature%2Fnew-thing",
            "0123456789",
            report("2024-06-01T12:00:00", 50.0),
        )
        .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::CREATED
        );

        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches")
            .to_request();
        let body: Vec<String> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, vec!["feature/new-thing"]);

        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches/feature%2Fnew-thing/coverage")
            .to_request();
        let body: CoverageSchema = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.branch_name, "feature/new-thing");
    }

    #[actix_web::test]
    async fn test_get_coverage_data() -> Result<()> {
        let store = web::Data::new(create_test_store());
        let app = test::init_service(
            App::new()
                .app_data(store.clone())
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;
        let req = upload_request(
            "main",
            "0123456789",
            report("2024-06-01T12:00:00", 50.0),
        )
        .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::CREATED
        );

        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches/main/commits/01234567/coverage_data")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["totals"]["percent_covered"], 50.0);
        assert_eq!(body["meta"]["version"], "7.4.0");

        // lookups are exact; the untruncated commit doesn't match
        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches/main/commits/0123456789/coverage_data")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // a stored payload that isn't JSON can't be served
        store
            .upsert_coverage(&NewCoverage {
                key: BranchKey::new("repo1", "project1", "main").commit("deadbeef"),
                coverage: 1.0,
                coverage_date: datetime!(2024-06-01 12:00 UTC),
                raw_data: b"<xml/>".to_vec(),
            })
            .await?;
        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches/main/commits/deadbeef/coverage_data")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["message"], "failed to unmarshal coverage data");

        Ok(())
    }

    #[actix_web::test]
    async fn test_coverage_history() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(create_test_store()))
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;
        for day in 1..=5 {
            let req = upload_request(
                "main",
                &format!("c000000{day}xx"),
                report(&format!("2024-06-0{day}T12:00:00"), f64::from(day)),
            )
            .to_request();
            assert_eq!(
                test::call_service(&app, req).await.status(),
                StatusCode::CREATED
            );
        }

        let history = async |query: &str| -> Vec<String> {
            let req = test::TestRequest::get()
                .uri(&format!(
                    "/api/v1/repos/repo1/projects/project1/branches/main/coverage_history{query}"
                ))
                .to_request();
            let body: Vec<CoverageSchema> = test::call_and_read_body_json(&app, req).await;
            body.into_iter().map(|c| c.commit).collect()
        };

        assert_eq!(
            history("").await,
            vec!["c0000005", "c0000004", "c0000003", "c0000002", "c0000001"]
        );
        assert_eq!(
            history("?order=asc&limit=2&page=2").await,
            vec!["c0000003", "c0000004"]
        );
        assert_eq!(
            history("?order=desc&limit=2&page=3").await,
            vec!["c0000001"]
        );
        assert!(history("?limit=2&page=4").await.is_empty());
    }

    #[actix_web::test]
    async fn test_coverage_history_validation() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(create_test_store()))
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;
        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches/main/coverage_history?order=up&limit=0&page=0")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["message"], "validation failed");
        assert_eq!(body["errors"]["order"], "Order must be one of: asc, desc");
        assert_eq!(body["errors"]["limit"], "Limit must be >=1 and <=100");
        assert_eq!(body["errors"]["page"], "Page must be >=1");

        // an offset past what the store can bind is still the client's mistake
        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches/main/coverage_history?limit=1&page=18446744073709551615")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["errors"]["page"], "Page is too large");
    }

    #[actix_web::test]
    async fn history_query_defaults() {
        let params = HistoryQuery::default().validate().unwrap();
        assert_eq!(
            params,
            HistoryParams {
                order: HistoryOrder::Desc,
                limit: 50,
                offset: 0,
            }
        );
    }

    #[actix_web::test]
    async fn history_query_validation() {
        let query = |order: Option<&str>, limit: Option<&str>, page: Option<&str>| HistoryQuery {
            order: order.map(String::from),
            limit: limit.map(String::from),
            page: page.map(String::from),
        };

        assert_eq!(
            query(Some("asc"), Some("100"), Some("3")).validate().unwrap(),
            HistoryParams {
                order: HistoryOrder::Asc,
                limit: 100,
                offset: 200,
            }
        );
        assert_eq!(
            query(None, Some("1"), None).validate().unwrap(),
            HistoryParams {
                order: HistoryOrder::Desc,
                limit: 1,
                offset: 0,
            }
        );

        for (query, field) in [
            (query(Some("ASC"), None, None), "order"),
            (query(None, Some("101"), None), "limit"),
            (query(None, Some("-1"), None), "limit"),
            (query(None, Some("ten"), None), "limit"),
            (query(None, None, Some("0")), "page"),
            (query(None, None, Some("-2")), "page"),
            (query(None, Some("100"), Some("18446744073709551615")), "page"),
            (query(None, Some("1"), Some("18446744073709551615")), "page"),
            (query(None, Some("1"), Some("9223372036854775809")), "page"),
        ] {
            match query.validate() {
                Err(ApiError::Validation(errors)) => {
                    assert_eq!(errors.len(), 1, "errors = {errors:?}");
                    assert!(errors.contains_key(field), "errors = {errors:?}");
                }
                other => panic!("expected validation failure on {field}; got {other:?}"),
            }
        }
    }

    #[actix_web::test]
    async fn test_listings() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(create_test_store()))
                .service(web::scope("/api/v1").api_v1_handlers()),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/repos").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!([]), "empty listings are arrays, never null");

        let req = upload_request(
            "main",
            "0123456789",
            report("2024-06-01T12:00:00", 1.0),
        )
        .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::CREATED
        );
        let req = upload_request(
            "dev",
            "0123456789",
            report("2024-06-01T12:00:00", 1.0),
        )
        .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::CREATED
        );
        let req = upload_request(
            "dev",
            "abcdef0123",
            report("2024-06-01T12:00:00", 1.0),
        )
        .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::CREATED
        );

        let req = test::TestRequest::get().uri("/api/v1/repos").to_request();
        let body: Vec<String> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, vec!["repo1"]);

        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects")
            .to_request();
        let body: Vec<String> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, vec!["project1"]);

        let req = test::TestRequest::get()
            .uri("/api/v1/repos/repo1/projects/project1/branches")
            .to_request();
        let body: Vec<String> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, vec!["dev", "main"]);

        let req = test::TestRequest::get()
            .uri("/api/v1/repos/unknown/projects")
            .to_request();
        let body: Vec<String> = test::call_and_read_body_json(&app, req).await;
        assert!(body.is_empty());
    }
}
