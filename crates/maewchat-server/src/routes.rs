use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{error, warn};

use maewchat_client::{AdminClient, AdminConfig};
use maewchat_types::api::{ErrorResponse, SignedUrlQuery, SignedUrlResponse};

pub const AVATAR_BUCKET: &str = "avatars";
pub const SIGNED_URL_TTL_SECS: u64 = 60;

const SIGNING_FALLBACK: &str = "Error creating signed url";

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    /// Why the privileged client is unavailable, when it is.
    pub admin: Result<AdminClient, String>,
}

impl AppStateInner {
    pub fn from_env() -> AppState {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppState {
        let admin = AdminConfig::from_lookup(lookup)
            .map_err(|e| e.to_string())
            .and_then(|config| AdminClient::new(config).map_err(|e| e.to_string()));
        if let Err(reason) = &admin {
            warn!("Signed avatar URLs unavailable: {}", reason);
        }
        Arc::new(Self { admin })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Missing path query param")]
    MissingPath,
    #[error("{0}")]
    BadQuery(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingPath | Self::BadQuery(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse { error: self.to_string() };
        (self.status(), Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/admin/avatar-signed-url",
            get(avatar_signed_url)
                .head(method_not_allowed)
                .fallback(method_not_allowed),
        )
        .with_state(state)
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

pub async fn avatar_signed_url(
    State(state): State<AppState>,
    query: Result<Query<SignedUrlQuery>, QueryRejection>,
) -> Result<Json<SignedUrlResponse>, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::BadQuery(rejection.body_text()))?;
    let path = query.path.unwrap_or_default();
    if path.trim().trim_matches('/').is_empty() {
        return Err(ApiError::MissingPath);
    }

    let admin = state
        .admin
        .as_ref()
        .map_err(|reason| ApiError::Internal(reason.clone()))?;

    let signed_url = admin
        .create_signed_url(AVATAR_BUCKET, &path, SIGNED_URL_TTL_SECS)
        .await
        .map_err(|e| {
            error!("Signing {}/{} failed: {}", AVATAR_BUCKET, path, e);
            let message = e.to_string();
            if message.trim().is_empty() {
                ApiError::Internal(SIGNING_FALLBACK.into())
            } else {
                ApiError::Internal(message)
            }
        })?;

    Ok(Json(SignedUrlResponse { signed_url }))
}
