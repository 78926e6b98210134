// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{net::SocketAddr, process::ExitCode};

use actix_web::{
    App, Error, HttpResponse, HttpServer, Responder, ResponseError as _,
    body::{BoxBody, MessageBody},
    dev::{ServiceRequest, ServiceResponse},
    http::header::{HeaderName, HeaderValue},
    middleware::{self, Next, from_fn},
    web,
};
use anyhow::{Result, anyhow};
use api_v1::{ApiError, InstallApiV1Handlers as _};
use log::{debug, error, info};
use serde_json::json;
use uuid::Uuid;

use crate::coverage::{CoverageStore as _, CoverageStoreDispatch, create_store};

pub mod api_v1;
pub mod badge;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// Default access log format, plus the request id so log lines can be matched with client reports.
const ACCESS_LOG_FORMAT: &str = r#"%a "%r" %s %b "%{Referer}i" "%{User-Agent}i" %T %{x-request-id}o"#;

/// Everything the server needs to start; built from CLI flags and environment by the caller.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_socket: SocketAddr,
    /// `None` selects the default SQLite database.
    pub database_url: Option<String>,
    pub api_key: String,
}

/// Key required in the `X-API-Key` header of every `/api/v1` request.
#[derive(Debug, Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Result<ApiKey> {
        let key = key.into();
        if key.is_empty() {
            return Err(anyhow!("API key must not be empty"));
        }
        Ok(ApiKey(key))
    }

    fn matches(&self, candidate: &[u8]) -> bool {
        self.0.as_bytes() == candidate
    }
}

/// Install every route; the caller provides `web::Data<CoverageStoreDispatch>` and `web::Data<ApiKey>`.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/_live", web::get().to(live))
        .route("/_ready", web::get().to(ready))
        .route(
            "/repos/{repo}/projects/{project}/branches/{branch}/badge",
            web::get().to(badge::get_branch_badge),
        )
        .service(
            web::scope("/api/v1")
                .api_v1_handlers()
                .wrap(from_fn(require_api_key)),
        );
}

pub async fn cli(config: ServerConfig) -> ExitCode {
    match run_server(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("server failed: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let api_key = web::Data::new(ApiKey::new(config.api_key)?);
    let store = web::Data::new(create_store(config.database_url.as_deref())?);

    // Connect and migrate before accepting requests, so a bad database URL ends startup rather than every request.
    store.ping().await?;

    info!("covtrack server listening on {}", config.bind_socket);
    HttpServer::new(move || {
        App::new()
            .wrap(from_fn(request_id))
            .wrap(middleware::Logger::new(ACCESS_LOG_FORMAT))
            .app_data(store.clone())
            .app_data(api_key.clone())
            .configure(routes)
    })
    .bind(config.bind_socket)?
    .run()
    .await?;
    Ok(())
}

async fn live() -> impl Responder {
    HttpResponse::NoContent().finish()
}

async fn ready(store: web::Data<CoverageStoreDispatch>) -> impl Responder {
    match store.ping().await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(err) => {
            error!("readiness check failed: {err:?}");
            HttpResponse::InternalServerError().json(json!({"message": "database unavailable"}))
        }
    }
}

/// Echo the client's `X-Request-Id`, or assign a new one, on every response.
async fn request_id(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<impl MessageBody + 'static>, Error> {
    let request_id = match req.headers().get(REQUEST_ID_HEADER) {
        Some(value) => value.clone(),
        None => HeaderValue::from_str(&Uuid::new_v4().to_string())
            .map_err(actix_web::error::ErrorInternalServerError)?,
    };
    debug!("request {request_id:?}: {} {}", req.method(), req.uri());

    let mut resp = next.call(req).await?;
    resp.headers_mut()
        .insert(HeaderName::from_static(REQUEST_ID_HEADER), request_id);
    Ok(resp)
}

async fn require_api_key(
    api_key: web::Data<ApiKey>,
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<BoxBody>, Error> {
    let authorized = req
        .headers()
        .get(API_KEY_HEADER)
        .is_some_and(|value| api_key.matches(value.as_bytes()));
    if !authorized {
        debug!("rejecting {} {}: bad API key", req.method(), req.uri());
        return Ok(req.into_response(ApiError::Unauthorized.error_response()));
    }
    Ok(next.call(req).await?.map_into_boxed_body())
}
