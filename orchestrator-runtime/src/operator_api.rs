//! Axum operator API: enrollment, login, sandbox lifecycle, network
//! policy, snapshot builds.
//!
//! Session transport is a hardened cookie (or a bearer header for
//! non-browser callers). `/api/auth/verify` is the forward-auth hook a
//! fronting reverse proxy calls per request.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::enrollment::EnrollmentStore;
use crate::error::OrchestratorError;
use crate::lifecycle::SandboxManager;
use crate::netpolicy::{NetworkConfig, NetworkConfigStore};
use crate::session::{SESSION_TTL_SECS, SessionStore};

pub const SESSION_COOKIE_NAME: &str = "sandbox_session";
/// The single operator principal.
pub const PRINCIPAL: &str = "admin";

#[derive(Clone)]
pub struct AppState {
    pub enrollment: Arc<EnrollmentStore>,
    pub sessions: Arc<SessionStore>,
    pub network: Arc<NetworkConfigStore>,
    pub manager: Arc<SandboxManager>,
    pub domain: String,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_response(err: &OrchestratorError) -> (StatusCode, Json<Value>) {
    let status = match err {
        OrchestratorError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        OrchestratorError::NotEnrolled
        | OrchestratorError::AlreadyEnrolled
        | OrchestratorError::InvalidCode
        | OrchestratorError::AlreadyRunning(_)
        | OrchestratorError::NotRunning
        | OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Provider(_)
        | OrchestratorError::SagaTimeout(_)
        | OrchestratorError::ConfigApply(_)
        | OrchestratorError::Http(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut body = json!({ "error": err.to_string() });
    if let OrchestratorError::AlreadyRunning(id) = err {
        body["droplet_id"] = json!(id);
    }
    (status, Json(body))
}

// ---------------------------------------------------------------------------
// Session extraction
// ---------------------------------------------------------------------------

/// Bearer header first (non-browser callers), then the session cookie.
fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
        {
            return Some(token.trim().to_string());
        }
    }

    headers
        .get(header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .map(str::trim)
        .find_map(|pair| {
            pair.strip_prefix(SESSION_COOKIE_NAME)
                .and_then(|rest| rest.strip_prefix('='))
        })
        .map(str::to_string)
}

/// Axum extractor yielding the authenticated principal.
pub struct SessionAuth(pub String);

impl FromRequestParts<AppState> for SessionAuth {
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers).ok_or_else(|| {
            error_response(&OrchestratorError::Unauthorized(
                "missing session credential".into(),
            ))
        })?;
        let principal = state
            .sessions
            .verify(&token)
            .map_err(|err| error_response(&err))?;
        Ok(SessionAuth(principal))
    }
}

fn session_cookie(token: &str) -> String {
    format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age={SESSION_TTL_SECS}"
    )
}

fn clear_session_cookie() -> String {
    format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=0")
}

/// 200 + session cookie, or the storage failure.
fn issue_session(state: &AppState) -> Response {
    let token = match state.sessions.create(PRINCIPAL) {
        Ok(token) => token,
        Err(err) => return error_response(&err).into_response(),
    };

    let cookie = match HeaderValue::from_str(&session_cookie(&token)) {
        Ok(value) => value,
        Err(err) => {
            return error_response(&OrchestratorError::Storage(format!(
                "session cookie encoding: {err}"
            )))
            .into_response();
        }
    };

    let mut response = Json(json!({ "status": "ok", "principal": PRINCIPAL })).into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    response
}

// ---------------------------------------------------------------------------
// Auth endpoints
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn auth_status(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let authenticated = session_token(&headers)
        .map(|token| state.sessions.verify(&token).is_ok())
        .unwrap_or(false);
    Json(json!({
        "enrolled": state.enrollment.is_enrolled(),
        "authenticated": authenticated,
    }))
}

async fn begin_enrollment(State(state): State<AppState>) -> Response {
    match state.enrollment.begin(&state.domain) {
        Ok(offer) => Json(json!({
            "secret": offer.secret,
            "provisioning_uri": offer.provisioning_uri,
        }))
        .into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

#[derive(Deserialize)]
struct CompleteEnrollmentRequest {
    secret: String,
    code: String,
}

async fn complete_enrollment(
    State(state): State<AppState>,
    Json(req): Json<CompleteEnrollmentRequest>,
) -> Response {
    if let Err(err) = state.enrollment.complete(&req.secret, &req.code) {
        return error_response(&err).into_response();
    }
    issue_session(&state)
}

#[derive(Deserialize)]
struct LoginRequest {
    code: String,
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Response {
    if let Err(err) = state.enrollment.verify_login(&req.code) {
        return error_response(&err).into_response();
    }
    issue_session(&state)
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        if let Err(err) = state.sessions.revoke(&token) {
            return error_response(&err).into_response();
        }
    }

    let mut response = Json(json!({ "status": "ok" })).into_response();
    if let Ok(cookie) = HeaderValue::from_str(&clear_session_cookie()) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    response
}

/// Forward-auth hook: 200 with the principal in `x-user`, else 401.
async fn verify_forward_auth(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = session_token(&headers).unwrap_or_default();
    match state.sessions.verify(&token) {
        Ok(principal) => {
            let mut response = StatusCode::OK.into_response();
            if let Ok(user) = HeaderValue::from_str(&principal) {
                response.headers_mut().insert("x-user", user);
            }
            response
        }
        Err(err) => error_response(&err).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Sandbox endpoints
// ---------------------------------------------------------------------------

async fn sandbox_status(_auth: SessionAuth, State(state): State<AppState>) -> Response {
    match state.manager.status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

async fn spawn_sandbox(_auth: SessionAuth, State(state): State<AppState>) -> Response {
    match state.manager.spawn().await {
        Ok(id) => Json(json!({
            "status": "creating",
            "message": "Sandbox droplet is being created",
            "droplet_id": id,
        }))
        .into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

async fn kill_sandbox(_auth: SessionAuth, State(state): State<AppState>) -> Response {
    match state.manager.kill().await {
        Ok(Some(id)) => Json(json!({
            "status": "ok",
            "message": "Sandbox droplet destroyed",
            "droplet_id": id,
        }))
        .into_response(),
        Ok(None) => Json(json!({
            "status": "ok",
            "message": "No sandbox running",
        }))
        .into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

async fn build_snapshot(_auth: SessionAuth, State(state): State<AppState>) -> Response {
    match state.manager.build_snapshot().await {
        Ok(result) => Json(json!({
            "status": "ok",
            "message": "Snapshot created successfully",
            "snapshot_id": result.snapshot_id,
            "snapshot_name": result.snapshot_name,
        }))
        .into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Network policy endpoints
// ---------------------------------------------------------------------------

async fn get_network_config(_auth: SessionAuth, State(state): State<AppState>) -> Response {
    Json(state.network.get()).into_response()
}

/// Persist the config, then push it to a live sandbox. Persistence
/// failures abort; a failed push is reported but the config stays
/// saved and is re-applied on the next successful push.
async fn put_network_config(
    _auth: SessionAuth,
    State(state): State<AppState>,
    Json(config): Json<NetworkConfig>,
) -> Response {
    if let Err(err) = state.network.set(&config) {
        return error_response(&err).into_response();
    }

    let body = match state.manager.apply_network_config(&config).await {
        Ok(agent) => json!({ "saved": true, "applied": true, "agent": agent }),
        Err(OrchestratorError::NotRunning) => json!({
            "saved": true,
            "applied": false,
            "reason": "no active sandbox",
        }),
        Err(err) => json!({
            "saved": true,
            "applied": false,
            "error": err.to_string(),
        }),
    };
    Json(body).into_response()
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the operator API router. Single tenant behind a proxy, so CORS
/// is permissive.
pub fn operator_api_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/auth/status", get(auth_status))
        .route("/api/auth/enroll", post(begin_enrollment))
        .route("/api/auth/enroll/complete", post(complete_enrollment))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/verify", get(verify_forward_auth))
        .route("/api/sandbox/status", get(sandbox_status))
        .route("/api/sandbox/spawn", post(spawn_sandbox))
        .route("/api/sandbox/kill", post(kill_sandbox))
        .route(
            "/api/network/config",
            get(get_network_config).put(put_network_config),
        )
        .route("/api/snapshot/build", post(build_snapshot))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    use crate::lifecycle::{SandboxManager, SandboxSpec};
    use crate::provider::ProviderClient;
    use std::time::Duration;

    fn test_state(dir: &tempfile::TempDir) -> AppState {
        let spec = SandboxSpec {
            region: "nyc1".into(),
            size: "s-2vcpu-2gb".into(),
            snapshot_image: Some("170226480".into()),
            vpc_uuid: "vpc-test".into(),
            builder_base_image: "ubuntu-24-04-x64".into(),
            agent_port: 9999,
            agent_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            phase_timeout: Duration::from_millis(100),
            builder_settle: Duration::ZERO,
        };
        AppState {
            enrollment: Arc::new(
                EnrollmentStore::open(dir.path().join("totp_secret.json")).unwrap(),
            ),
            sessions: Arc::new(SessionStore::open(dir.path().join("sessions.json")).unwrap()),
            network: Arc::new(
                NetworkConfigStore::open(dir.path().join("network_config.json")).unwrap(),
            ),
            // Port 9 (discard) is never reachable; auth tests stop
            // before any provider call.
            manager: Arc::new(SandboxManager::new(
                ProviderClient::new("http://127.0.0.1:9", "test-token"),
                spec,
            )),
            domain: "example.com".into(),
        }
    }

    async fn body_json(body: Body) -> Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let app = operator_api_router(test_state(&dir));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sandbox_routes_require_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let app = operator_api_router(test_state(&dir));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sandbox/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_status_reports_unenrolled() {
        let dir = tempfile::tempdir().unwrap();
        let app = operator_api_router(test_state(&dir));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/auth/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["enrolled"], json!(false));
        assert_eq!(json["authenticated"], json!(false));
    }

    #[tokio::test]
    async fn login_before_enrollment_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = operator_api_router(test_state(&dir));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"code":"123456"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response.into_body()).await;
        assert!(json["error"].as_str().unwrap().contains("not enrolled"));
    }

    #[tokio::test]
    async fn forward_auth_rejects_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let app = operator_api_router(test_state(&dir));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/auth/verify")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bearer_header_works_like_the_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let token = state.sessions.create(PRINCIPAL).unwrap();
        let app = operator_api_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/auth/verify")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-user"], PRINCIPAL);
    }

    #[test]
    fn cookie_attributes_are_hardened() {
        let cookie = session_cookie("deadbeef");
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(clear_session_cookie().contains("Max-Age=0"));
    }

    #[test]
    fn token_extraction_prefers_bearer_then_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("other=1; sandbox_session=cookie-token"),
        );
        assert_eq!(session_token(&headers).as_deref(), Some("cookie-token"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer header-token"),
        );
        assert_eq!(session_token(&headers).as_deref(), Some("header-token"));

        assert_eq!(session_token(&HeaderMap::new()), None);
    }
}
