//! HTTP front door: Read and Submit APIs over [`BookService`].
//!
//! | Method | Path | Answer |
//! |--------|------|--------|
//! | `POST` | `/books` | `{ "url": … }` → book record, or 404 when no pages are found |
//! | `GET`  | `/books/history` | books requested by the caller, newest first |
//! | `GET`  | `/books/:book_id` | book record |
//! | `GET`  | `/books/:book_id/download` | 302 to a signed link, or 404 |
//! | `GET`  | `/files/*key` | object bytes, for a valid signed link |
//!
//! The caller's identity arrives in `x-user-email` / `x-user-name`, set by
//! whatever authenticates requests upstream. Every response carries
//! `Access-Control-Allow-Origin: *`.

use crate::error::Book2PdfError;
use crate::model::Initiator;
use crate::service::BookService;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

pub const EMAIL_HEADER: &str = "x-user-email";
pub const NAME_HEADER: &str = "x-user-name";

pub struct AppState {
    pub service: Arc<BookService>,
}

pub fn router(service: Arc<BookService>) -> Router {
    Router::new()
        .route("/books", post(submit))
        .route("/books/history", get(history))
        .route("/books/:book_id", get(book_info))
        .route("/books/:book_id/download", get(download))
        .route("/files/*key", get(file))
        .layer(middleware::map_response(allow_any_origin))
        .with_state(Arc::new(AppState { service }))
}

async fn allow_any_origin(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

// ── Errors ───────────────────────────────────────────────────────────────

/// Maps library errors to HTTP answers.
#[derive(Debug)]
pub struct ApiError(Book2PdfError);

impl From<Book2PdfError> for ApiError {
    fn from(e: Book2PdfError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.is_client() {
            let status =
                StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::BAD_REQUEST);
            return (status, self.0.to_string()).into_response();
        }
        error!(error = %self.0, "Request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error occurred while processing request: {}", self.0),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Identity ─────────────────────────────────────────────────────────────

/// Initiator named by the identity headers, if any.
pub fn identity(headers: &HeaderMap) -> Option<Initiator> {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    header_str(EMAIL_HEADER).map(|email| Initiator {
        email,
        name: header_str(NAME_HEADER),
    })
}

// ── Handlers ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub url: String,
}

async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<Response> {
    let outcome = state
        .service
        .submit(&request.url, identity(&headers))
        .await?;
    Ok(Json(outcome.record).into_response())
}

async fn history(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Response> {
    let who = identity(&headers).ok_or(Book2PdfError::Unauthenticated)?;
    let books = state.service.history(&who.email).await?;
    Ok(Json(books).into_response())
}

async fn book_info(
    State(state): State<Arc<AppState>>,
    Path(book_id): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.service.info(&book_id).await?).into_response())
}

async fn download(
    State(state): State<Arc<AppState>>,
    Path(book_id): Path<String>,
) -> ApiResult<Response> {
    let link = state.service.download_link(&book_id).await?;
    info!(book_id, "Redirecting to signed download link");
    Ok((StatusCode::FOUND, [(header::LOCATION, link.download_link)]).into_response())
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub expires: i64,
    pub signature: String,
}

async fn file(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    let collab = state.service.collaborators();
    if !collab
        .signer
        .verify(&key, query.expires, &query.signature, Utc::now())
    {
        return Ok((StatusCode::FORBIDDEN, "Link is invalid or has expired").into_response());
    }
    let Some(object) = collab.store.get(&key).await? else {
        return Ok((StatusCode::NOT_FOUND, "Object not found").into_response());
    };
    Ok((
        [(header::CONTENT_TYPE, object.metadata.content_type)],
        object.bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_needs_an_email() {
        let mut headers = HeaderMap::new();
        assert!(identity(&headers).is_none());
        headers.insert(NAME_HEADER, HeaderValue::from_static("Reader"));
        assert!(identity(&headers).is_none());
        headers.insert(EMAIL_HEADER, HeaderValue::from_static(" r@example.org "));
        let who = identity(&headers).unwrap();
        assert_eq!(who.email, "r@example.org");
        assert_eq!(who.name.as_deref(), Some("Reader"));
    }

    #[test]
    fn client_errors_keep_their_status() {
        let response = ApiError(Book2PdfError::NoPagesFound { url: "u".into() }).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = ApiError(Book2PdfError::Repository("down".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
