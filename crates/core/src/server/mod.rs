use std::sync::Arc;

use anyhow::Result;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::host::{FileActionMenuEntry, HostClient};
use crate::job::RestoreJob;
use crate::restore::Restorer;
use crate::signing::{AuthError, RequestSigner};
use crate::types::{FileActionRequest, RestoreMode, ScopeDeclaration};
use crate::worker::JobPool;

const UPSCALE_HANDLER: &str = "/gfpgan_upscale";
const RESTORE_HANDLER: &str = "/gfpgan_restore";
const MENU_MIME: &str = "image";
const UNAUTHORIZED_MESSAGE: &str = "unauthorized";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    signer: RequestSigner,
    host: HostClient,
    restorer: Arc<dyn Restorer>,
    pool: JobPool,
}

impl AppState {
    pub fn new(config: &AppConfig, restorer: Arc<dyn Restorer>) -> Result<Self> {
        let signer = RequestSigner::new(config.identity());
        let host = HostClient::new(config.nextcloud_base_url()?, signer.clone())?;
        let pool = JobPool::new(config.restore.max_concurrent_jobs);
        Ok(Self::from_parts(signer, host, restorer, pool))
    }

    pub fn from_parts(
        signer: RequestSigner,
        host: HostClient,
        restorer: Arc<dyn Restorer>,
        pool: JobPool,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                signer,
                host,
                restorer,
                pool,
            }),
        }
    }

    pub fn pool(&self) -> &JobPool {
        &self.inner.pool
    }

    pub fn host(&self) -> &HostClient {
        &self.inner.host
    }
}

#[derive(Serialize)]
pub struct HeartbeatResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Deserialize)]
pub struct EnabledQuery {
    pub enabled: String,
}

/// User named in a verified `AUTHORIZATION-APP-API` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        match state.inner.signer.verify(&parts.headers) {
            Ok(user) => Ok(Self(user)),
            Err(err) => {
                warn!(
                    method = %parts.method,
                    path = %parts.uri.path(),
                    error = %err,
                    "Rejected unauthenticated request"
                );
                Err(err.into())
            }
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route(UPSCALE_HANDLER, post(gfpgan_upscale))
        .route(RESTORE_HANDLER, post(gfpgan_restore))
        .route("/enabled", put(set_enabled))
        .route("/heartbeat", get(heartbeat))
        .route("/scopes", get(scopes))
        .route("/init", post(init))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn heartbeat() -> Json<HeartbeatResponse> {
    Json(HeartbeatResponse {
        status: "ok".to_string(),
    })
}

async fn scopes() -> Json<ScopeDeclaration> {
    Json(ScopeDeclaration::for_upscaler())
}

async fn gfpgan_upscale(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<FileActionRequest>,
) -> StatusCode {
    accept_file_action(&state, user, request, RestoreMode::Upscale)
}

async fn gfpgan_restore(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<FileActionRequest>,
) -> StatusCode {
    accept_file_action(&state, user, request, RestoreMode::Restore)
}

fn accept_file_action(
    state: &AppState,
    user: String,
    request: FileActionRequest,
    mode: RestoreMode,
) -> StatusCode {
    let job = RestoreJob::new(request.action_file, user, mode);
    let label = format!("{mode} {}", job.source_path());
    let user = job.user.clone();
    let file_id = job.file.file_id;

    let job_id = state.inner.pool.submit(
        &label,
        job.run(state.inner.host.clone(), state.inner.restorer.clone()),
    );

    info!(%job_id, %user, file_id, %mode, "File action accepted");
    StatusCode::OK
}

async fn set_enabled(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Query(query): Query<EnabledQuery>,
) -> Result<Json<ErrorResponse>, AppError> {
    let enabled = parse_enabled_flag(&query.enabled).ok_or_else(|| {
        AppError::BadRequest(format!("invalid enabled value: {}", query.enabled))
    })?;

    let result = if enabled {
        register_menu_entries(state.host(), &user).await
    } else {
        unregister_menu_entries(state.host(), &user).await
    };

    let error = match result {
        Ok(()) => {
            info!(enabled, "Application enabled state changed");
            String::new()
        }
        Err(err) => {
            let message = format!("{err:#}");
            error!(enabled, error = %message, "Failed to apply enabled state");
            message
        }
    };

    Ok(Json(ErrorResponse { error }))
}

fn menu_entries() -> [FileActionMenuEntry; 2] {
    [
        FileActionMenuEntry::new("upscale", "Upscale", UPSCALE_HANDLER).with_mime(MENU_MIME),
        FileActionMenuEntry::new("restore", "Restore", RESTORE_HANDLER).with_mime(MENU_MIME),
    ]
}

async fn register_menu_entries(host: &HostClient, user: &str) -> Result<()> {
    for entry in menu_entries() {
        host.register_file_action(user, &entry).await?;
    }
    Ok(())
}

async fn unregister_menu_entries(host: &HostClient, user: &str) -> Result<()> {
    for entry in menu_entries() {
        host.unregister_file_action(user, &entry.name).await?;
    }
    Ok(())
}

/// Accepts `true/false`, `1/0`, `yes/no`, `on/off` in any case.
fn parse_enabled_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

async fn init(
    State(state): State<AppState>,
    AuthenticatedUser(_user): AuthenticatedUser,
) -> Json<serde_json::Value> {
    let host = state.inner.host.clone();
    state.inner.pool.submit("init", async move {
        match host.set_init_status(100, None).await {
            Ok(()) => info!("Initialization reported complete"),
            Err(err) => error!(error = %format!("{err:#}"), "Failed to report initialization status"),
        }
    });
    Json(serde_json::json!({}))
}

#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

/// The cause is logged by the extractor; callers only learn that auth failed.
impl From<AuthError> for AppError {
    fn from(_err: AuthError) -> Self {
        AppError::Unauthorized(UNAUTHORIZED_MESSAGE.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}
