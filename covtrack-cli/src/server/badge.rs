// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use actix_web::{
    HttpResponse, Responder, ResponseError,
    body::BoxBody,
    http::{
        StatusCode,
        header::{CacheControl, CacheDirective, ContentType},
    },
    web,
};
use log::{debug, error};
use quick_xml::escape::escape;
use thiserror::Error;

use crate::coverage::{
    BranchKey, CoverageStore as _, CoverageStoreDetailedError, CoverageStoreDispatch,
};

const BADGE_COLOR: &str = "#007ec6";

#[derive(Error, Debug)]
pub enum BadgeError {
    #[error("no coverage for branch")]
    NotFound,
    // details are logged in `error_response`, not returned
    #[error("internal server error accessing coverage store")]
    CoverageStore(#[source] CoverageStoreDetailedError),
}

impl From<CoverageStoreDetailedError> for BadgeError {
    fn from(value: CoverageStoreDetailedError) -> Self {
        if value.is_not_found() {
            BadgeError::NotFound
        } else {
            BadgeError::CoverageStore(value)
        }
    }
}

impl ResponseError for BadgeError {
    fn error_response(&self) -> HttpResponse<BoxBody> {
        if let BadgeError::CoverageStore(e) = self {
            error!("badge lookup failed: {e:?}");
        }
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::plaintext())
            .body(self.to_string())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            BadgeError::NotFound => StatusCode::NOT_FOUND,
            BadgeError::CoverageStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub async fn get_branch_badge(
    path: web::Path<(String, String, String)>,
    store: web::Data<CoverageStoreDispatch>,
) -> Result<impl Responder, BadgeError> {
    let (repo_name, project_name, branch_name) = path.into_inner();
    debug!("get_branch_badge received: {repo_name:?} {project_name:?} {branch_name:?}");

    let record = store
        .get_most_recent_coverage(&BranchKey::new(repo_name, project_name, branch_name))
        .await?;

    let label = format!(
        "{}/{} {}",
        record.repo_name, record.project_name, record.branch_name
    );
    let message = format!("{:.0}%", record.coverage.round());

    Ok(HttpResponse::Ok()
        .content_type("image/svg+xml")
        .insert_header(CacheControl(vec![
            CacheDirective::NoCache,
            CacheDirective::MaxAge(0),
        ]))
        .body(render_badge(&label, &message, BADGE_COLOR)))
}

/// Rough rendered width of `text` in 11px Verdana, plus horizontal padding.
fn text_width(text: &str) -> usize {
    text.chars().count() * 7 + 10
}

/// A flat two-part badge: `label` on grey, `message` on `color`.
#[must_use]
pub fn render_badge(label: &str, message: &str, color: &str) -> String {
    let label_width = text_width(label);
    let message_width = text_width(message);
    let width = label_width + message_width;
    let label_x = label_width / 2;
    let message_x = label_width + message_width / 2;

    let title = format!("{label}: {message}");
    let title = escape(title.as_str());
    let label = escape(label);
    let message = escape(message);
    let color = escape(color);

    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="20" role="img" aria-label="{title}"><title>{title}</title><linearGradient id="s" x2="0" y2="100%"><stop offset="0" stop-color="#bbb" stop-opacity=".1"/><stop offset="1" stop-opacity=".1"/></linearGradient><clipPath id="r"><rect width="{width}" height="20" rx="3" fill="#fff"/></clipPath><g clip-path="url(#r)"><rect width="{label_width}" height="20" fill="#555"/><rect x="{label_width}" width="{message_width}" height="20" fill="{color}"/><rect width="{width}" height="20" fill="url(#s)"/></g><g fill="#fff" text-anchor="middle" font-family="Verdana,Geneva,DejaVu Sans,sans-serif" font-size="11"><text x="{label_x}" y="14">{label}</text><text x="{message_x}" y="14">{message}</text></g></svg>"##
    )
}
