//! Axum-based HTTP gateway in front of the session core.
//!
//! The core is synchronous and talks to the backend with blocking calls, so
//! every handler that may reach the backend hops onto the blocking pool.
//!
//! - Request body size limits (64KB max)
//! - Request timeouts (30s)
//! - Session context in `X-Session-Identity` / `X-Session-Platform` /
//!   `X-Session-Id`; the core never acts on a bare session id
//! - Forced-logout delivery over a per-session WebSocket

use crate::backend::SessionFlavor;
use crate::config::Config;
use crate::error::{Result as SessionResult, SessionError};
use crate::handoff::{Confirmer, HandoffRequest, HandoffStore, HandoffStrategy};
use crate::notify::{Notifier, NotifyEvent};
use crate::service::SessionService;
use crate::session::{ConnectionRegistry, LiveHandle, ProxyAuthenticator, SessionKey};
use crate::token::{Claims, HmacTokenIssuer};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout. A proxy login is a handful of backend round-trips.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

pub const IDENTITY_HEADER: &str = "x-session-identity";
pub const PLATFORM_HEADER: &str = "x-session-platform";
pub const SESSION_ID_HEADER: &str = "x-session-id";

type ApiResponse = (StatusCode, Json<serde_json::Value>);

#[derive(Clone)]
pub struct AppState {
    pub authenticator: Arc<ProxyAuthenticator>,
    pub registry: Arc<ConnectionRegistry>,
    pub handoff: Arc<HandoffStore>,
    pub notifier: Arc<Notifier>,
    pub tokens: Arc<HmacTokenIssuer>,
    pub default_platform: String,
    /// Target platform of delegated handoffs when the caller names none.
    pub delegate_platform: String,
}

impl AppState {
    pub fn new(service: &SessionService, config: &Config) -> Self {
        Self {
            authenticator: Arc::clone(&service.authenticator),
            registry: Arc::clone(&service.registry),
            handoff: Arc::clone(&service.handoff),
            notifier: Arc::clone(&service.notifier),
            tokens: Arc::clone(&service.tokens),
            default_platform: service.authenticator.default_platform().to_string(),
            delegate_platform: crate::session::key::normalize_platform(
                &config.handoff.delegate_platform,
            ),
        }
    }
}

/// Whether `host` would expose the gateway beyond this machine.
pub fn is_public_bind(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return false;
    }
    match host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        Ok(ip) => !ip.is_loopback(),
        Err(_) => true,
    }
}

/// Build the router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    // ── CORS: browser and mobile webviews connect from any origin ──
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static(IDENTITY_HEADER),
            header::HeaderName::from_static(PLATFORM_HEADER),
            header::HeaderName::from_static(SESSION_ID_HEADER),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/session/login", post(handle_session_login))
        .route("/api/session/ping", get(handle_session_ping))
        .route("/api/session", delete(handle_session_logout))
        .route("/api/session/events", get(handle_session_events))
        .route("/api/handoff/pairing", post(handle_handoff_pairing))
        .route("/api/handoff/delegate", post(handle_handoff_delegate))
        .route("/api/handoff/confirm", post(handle_handoff_confirm))
        .route("/api/handoff/status/{id}", get(handle_handoff_status))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    // ── Security: refuse public bind unless explicitly allowed ──
    if is_public_bind(host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "Refusing to bind to {host}: the gateway would be reachable from other machines.\n\
             Fix: use --host 127.0.0.1 (default) or set\n\
             [gateway] allow_public_bind = true in the config file."
        );
    }

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_port = listener.local_addr()?.port();

    let service = SessionService::from_config(&config)?;
    let state = AppState::new(&service, &config);

    let sweeper = (config.session.sweep_interval_secs > 0).then(|| {
        tokio::spawn(run_sweeper(
            state.clone(),
            Duration::from_secs(config.session.sweep_interval_secs),
        ))
    });

    tracing::info!(
        host,
        port = actual_port,
        backend = service.driver.name(),
        "Gateway listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

/// Periodic hygiene: drop dead backend sessions, stale handoffs and
/// notifier channels nobody listens on any more.
async fn run_sweeper(state: AppState, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;

        let registry = Arc::clone(&state.registry);
        if let Err(e) = tokio::task::spawn_blocking(move || registry.sweep_dead()).await {
            tracing::error!("Session sweep panicked: {e}");
        }
        state.handoff.sweep_expired();
        state.notifier.prune();
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ══════════════════════════════════════════════════════════════════════════════

fn error_body(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(serde_json::json!({ "error": message })))
}

/// Map a core error onto a status code. Handoff failures all read the same.
fn error_response(err: &SessionError) -> ApiResponse {
    match err {
        SessionError::MissingSessionContext(_) => {
            error_body(StatusCode::BAD_REQUEST, &err.to_string())
        }
        SessionError::SessionNotFound
        | SessionError::SessionRevoked(_)
        | SessionError::AuthenticationFailed(_) => {
            error_body(StatusCode::UNAUTHORIZED, &err.to_string())
        }
        SessionError::HandoffCodeInvalid => error_body(
            StatusCode::BAD_REQUEST,
            "Handoff code is invalid or has expired",
        ),
        SessionError::BackendUnavailable(_) => {
            error_body(StatusCode::SERVICE_UNAVAILABLE, "Backend unavailable")
        }
    }
}

/// Run a core call on the blocking pool.
async fn blocking<T, F>(op: F) -> Result<T, ApiResponse>
where
    F: FnOnce() -> SessionResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(error_response(&e)),
        Err(e) => {
            tracing::error!("Blocking session task failed: {e}");
            Err(error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
            ))
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn session_key_from_headers(headers: &HeaderMap) -> SessionResult<SessionKey> {
    SessionKey::from_parts(
        header_str(headers, IDENTITY_HEADER),
        header_str(headers, PLATFORM_HEADER),
        header_str(headers, SESSION_ID_HEADER),
    )
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Short, non-reversible tag for a token in logs.
fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..6])
}

/// Verify the bearer token and check that the session it was minted for is
/// still live on the backend.
async fn require_bearer_session(
    state: &AppState,
    token: &str,
) -> Result<(Claims, Arc<LiveHandle>), ApiResponse> {
    let claims = state.tokens.verify(token).map_err(|e| {
        tracing::debug!(token = %token_fingerprint(token), "Bearer rejected: {e}");
        error_body(
            StatusCode::UNAUTHORIZED,
            "Invalid or expired session token",
        )
    })?;

    let key = state
        .registry
        .keys_for_identity(&claims.sub)
        .into_iter()
        .find(|k| k.session_id() == claims.sid)
        .ok_or_else(|| error_response(&SessionError::SessionNotFound))?;

    let registry = Arc::clone(&state.registry);
    let handle = blocking(move || registry.checkout(&key)).await?;
    Ok((claims, handle))
}

/// Optional JSON body: empty means defaults.
fn parse_optional_body<T>(body: &Bytes) -> Result<T, ApiResponse>
where
    T: serde::de::DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| error_body(StatusCode::BAD_REQUEST, &format!("Invalid JSON body: {e}")))
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health: always public
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.len(),
        "pending_handoffs": state.handoff.len(),
    }))
}

#[derive(Deserialize)]
struct LoginBody {
    identity: String,
    password: String,
    platform: Option<String>,
    flavor: Option<SessionFlavor>,
}

/// POST /api/session/login: check the caller's credential and create the
/// proxy session, replacing any session the identity has on that platform.
async fn handle_session_login(
    State(state): State<AppState>,
    body: Result<Json<LoginBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => {
            return error_body(StatusCode::BAD_REQUEST, &format!("Invalid JSON body: {e}"));
        }
    };

    let authenticator = Arc::clone(&state.authenticator);
    let platform = body.platform.unwrap_or_default();
    let flavor = body.flavor.unwrap_or(SessionFlavor::Employee);
    match blocking(move || authenticator.login(&body.identity, &body.password, &platform, flavor))
        .await
    {
        Ok(grant) => (StatusCode::OK, Json(serde_json::json!(grant))),
        Err(resp) => resp,
    }
}

/// GET /api/session/ping: probe the caller's backend session.
async fn handle_session_ping(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let key = match session_key_from_headers(&headers) {
        Ok(k) => k,
        Err(e) => return error_response(&e),
    };

    let registry = Arc::clone(&state.registry);
    match blocking(move || registry.checkout(&key)).await {
        Ok(handle) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "alive",
                "identity": handle.identity(),
                "platform": handle.platform(),
                "session_id": handle.session_id(),
                "primary_role": handle.primary_role(),
                "roles": handle.roles(),
            })),
        ),
        Err(resp) => resp,
    }
}

/// DELETE /api/session: log the caller out. Idempotent.
async fn handle_session_logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let key = match session_key_from_headers(&headers) {
        Ok(k) => k,
        Err(e) => return error_response(&e),
    };

    let registry = Arc::clone(&state.registry);
    match blocking(move || Ok(registry.remove(&key))).await {
        Ok(removed) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "logged_out", "removed": removed})),
        ),
        Err(resp) => resp,
    }
}

#[derive(Debug, Default, Deserialize)]
struct SessionEventsQuery {
    identity: Option<String>,
    platform: Option<String>,
    session_id: Option<String>,
}

/// GET /api/session/events: WebSocket carrying the forced-logout event.
///
/// The session triple travels in the query string. The socket closes right
/// after the event is delivered.
async fn handle_session_events(
    State(state): State<AppState>,
    Query(query): Query<SessionEventsQuery>,
    ws: axum::extract::WebSocketUpgrade,
) -> axum::response::Response {
    let key = match SessionKey::from_parts(
        query.identity.as_deref(),
        query.platform.as_deref(),
        query.session_id.as_deref(),
    ) {
        Ok(k) => k,
        Err(e) => return error_response(&e).into_response(),
    };
    let events = match subscribe_session_events(&state, &key) {
        Ok(rx) => rx,
        Err(resp) => return resp.into_response(),
    };
    ws.on_upgrade(move |socket| handle_session_events_connection(socket, events, key))
}

/// Subscribe, then check the session is registered. A revocation that lands
/// in between is published to the receiver already held here.
fn subscribe_session_events(
    state: &AppState,
    key: &SessionKey,
) -> Result<broadcast::Receiver<NotifyEvent>, ApiResponse> {
    let events = state.notifier.subscribe(key.session_id());
    if state.registry.contains(key) {
        Ok(events)
    } else {
        Err(error_response(&SessionError::SessionNotFound))
    }
}

async fn handle_session_events_connection(
    socket: axum::extract::ws::WebSocket,
    mut events: broadcast::Receiver<NotifyEvent>,
    key: SessionKey,
) {
    use axum::extract::ws::Message;
    use futures_util::{SinkExt, StreamExt};

    let (mut ws_sender, mut ws_receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::error!("Failed to encode session event: {e}");
                                break;
                            }
                        };
                        if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                        if matches!(event, NotifyEvent::ForceLogout { .. }) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session = %key, skipped, "Session events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = ws_sender.send(Message::Close(None)).await;
    tracing::debug!(session = %key, "Session events socket closed");
}

#[derive(Debug, Default, Deserialize)]
struct PairingBody {
    platform: Option<String>,
}

/// POST /api/handoff/pairing: anonymous; the waiting device shows the code.
async fn handle_handoff_pairing(State(state): State<AppState>, body: Bytes) -> ApiResponse {
    let body: PairingBody = match parse_optional_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let platform = body
        .platform
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| state.default_platform.clone());

    let ticket = state.handoff.create(HandoffRequest::pairing(&platform));
    (StatusCode::OK, Json(serde_json::json!(ticket)))
}

#[derive(Debug, Default, Deserialize)]
struct DelegateBody {
    target_platform: Option<String>,
}

/// POST /api/handoff/delegate: copy the bearer's session to another device.
async fn handle_handoff_delegate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let body: DelegateBody = match parse_optional_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let Some(token) = extract_bearer_token(&headers) else {
        return error_body(StatusCode::UNAUTHORIZED, "Missing Authorization header");
    };
    let (claims, handle) = match require_bearer_session(&state, token).await {
        Ok(ok) => ok,
        Err(resp) => return resp,
    };

    let target = body
        .target_platform
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| state.delegate_platform.clone());
    let request = HandoffRequest::delegate(&claims.sub, handle.roles().to_vec(), handle.platform())
        .with_target_platform(&target);

    let ticket = state.handoff.create(request);
    (StatusCode::OK, Json(serde_json::json!(ticket)))
}

#[derive(Debug, Deserialize)]
struct ConfirmBody {
    code: String,
}

/// POST /api/handoff/confirm: redeem a code.
///
/// Pairing needs a bearer token (the confirming identity). Delegated
/// handoffs can be confirmed anonymously and return the new session here.
async fn handle_handoff_confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ConfirmBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => {
            return error_body(StatusCode::BAD_REQUEST, &format!("Invalid JSON body: {e}"));
        }
    };

    let confirmer = match extract_bearer_token(&headers) {
        Some(token) => match require_bearer_session(&state, token).await {
            Ok((claims, handle)) => Confirmer::authenticated(&claims.sub, handle.roles().to_vec()),
            Err(resp) => return resp,
        },
        None => Confirmer::anonymous(),
    };

    let handoff = Arc::clone(&state.handoff);
    let code = body.code;
    match blocking(move || handoff.confirm(&code, &confirmer)).await {
        Ok(grant) => {
            let mut response = serde_json::json!({
                "status": "confirmed",
                "handoff_id": grant.handoff_id,
                "strategy": grant.strategy,
            });
            // For pairing the session belongs to the polling device.
            if grant.strategy == HandoffStrategy::DelegatedProxy {
                response["session"] = serde_json::json!(grant.session);
            }
            (StatusCode::OK, Json(response))
        }
        Err(resp) => resp,
    }
}

/// GET /api/handoff/status/{id}: polled by the device that showed the code.
async fn handle_handoff_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse {
    match state.handoff.status(&id) {
        Some(view) => (StatusCode::OK, Json(serde_json::json!(view))),
        None => error_body(StatusCode::NOT_FOUND, "Handoff not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, SessionFlavor};
    use crate::config::SeedIdentity;
    use axum::http::HeaderValue;
    use http_body_util::BodyExt;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.token.secret = "gateway-test-secret-key".into();
        config.proxy.principal = "svc".into();
        config.proxy.credential = "pw".into();
        config.backend.identities = vec![
            SeedIdentity {
                name: "alice".into(),
                roles: vec!["ROLE_CUSTOMER".into()],
                password: None,
            },
            SeedIdentity {
                name: "bob".into(),
                roles: vec!["ROLE_TECHNICIAN".into()],
                password: Some("builder".into()),
            },
        ];
        config
    }

    fn test_state() -> (AppState, SessionService, MemoryBackend) {
        let config = test_config();
        let backend = MemoryBackend::new("svc", "pw")
            .with_identity("alice", &["ROLE_CUSTOMER"])
            .with_identity("bob", &["ROLE_TECHNICIAN"])
            .with_password("bob", "builder");
        let service = SessionService::new(&config, Arc::new(backend.clone())).unwrap();
        (AppState::new(&service, &config), service, backend)
    }

    fn session_headers(identity: &str, platform: &str, session_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(IDENTITY_HEADER, HeaderValue::from_str(identity).unwrap());
        headers.insert(PLATFORM_HEADER, HeaderValue::from_str(platform).unwrap());
        headers.insert(SESSION_ID_HEADER, HeaderValue::from_str(session_id).unwrap());
        headers
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn security_body_limit_is_64kb() {
        assert_eq!(MAX_BODY_SIZE, 65_536);
    }

    #[test]
    fn app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[test]
    fn public_bind_detection() {
        assert!(!is_public_bind("127.0.0.1"));
        assert!(!is_public_bind("localhost"));
        assert!(!is_public_bind("::1"));
        assert!(!is_public_bind("[::1]"));
        assert!(is_public_bind("0.0.0.0"));
        assert!(is_public_bind("192.168.1.10"));
        assert!(is_public_bind("example.com"));
    }

    #[test]
    fn error_mapping() {
        assert_eq!(
            error_response(&SessionError::MissingSessionContext("identity")).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(&SessionError::SessionNotFound).0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            error_response(&SessionError::SessionRevoked("killed".into())).0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            error_response(&SessionError::HandoffCodeInvalid).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(&SessionError::BackendUnavailable("down".into())).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        assert_eq!(extract_bearer_token(&bearer("abc")), Some("abc"));
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let fp = token_fingerprint("some.jwt.token");
        assert_eq!(fp.len(), 12);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(fp, token_fingerprint("other.jwt.token"));
    }

    #[test]
    fn empty_optional_body_uses_defaults() {
        let body: PairingBody = parse_optional_body(&Bytes::from_static(b"  ")).unwrap();
        assert!(body.platform.is_none());
        let body: PairingBody =
            parse_optional_body(&Bytes::from_static(br#"{"platform":"kiosk"}"#)).unwrap();
        assert_eq!(body.platform.as_deref(), Some("kiosk"));
        assert!(parse_optional_body::<PairingBody>(&Bytes::from_static(b"{")).is_err());
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let (state, _service, _backend) = test_state();
        let resp = handle_health(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    fn login_body(identity: &str, password: &str) -> LoginBody {
        LoginBody {
            identity: identity.into(),
            password: password.into(),
            platform: None,
            flavor: None,
        }
    }

    #[tokio::test]
    async fn login_mints_session_usable_by_other_routes() {
        let (state, _service, _backend) = test_state();

        let (status, grant) =
            handle_session_login(State(state.clone()), Ok(Json(login_body("bob", "builder"))))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(grant.0["identity"], "bob");
        assert_eq!(grant.0["platform"], "WEB");
        assert_eq!(grant.0["primary_role"], "ROLE_TECHNICIAN");
        let session_id = grant.0["session_id"].as_str().unwrap().to_string();
        let token = grant.0["token"].as_str().unwrap().to_string();

        let (status, _) = handle_session_ping(
            State(state.clone()),
            session_headers("bob", "WEB", &session_id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) =
            handle_handoff_delegate(State(state), bearer(&token), Bytes::new()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn login_honours_platform_and_replaces_previous() {
        let (state, _service, backend) = test_state();
        let mut body = login_body("bob", "builder");
        body.platform = Some("mobile".into());
        let (_, first) = handle_session_login(State(state.clone()), Ok(Json(body))).await;
        assert_eq!(first.0["platform"], "MOBILE");

        let mut body = login_body("bob", "builder");
        body.platform = Some("MOBILE".into());
        handle_session_login(State(state.clone()), Ok(Json(body))).await;

        assert_eq!(state.registry.keys_for_identity("bob").len(), 1);
        assert_eq!(backend.stats().kills, 1);
    }

    #[tokio::test]
    async fn login_with_wrong_password_is_unauthorized() {
        let (state, _service, backend) = test_state();
        let (status, _) =
            handle_session_login(State(state.clone()), Ok(Json(login_body("bob", "guess"))))
                .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Seeded without a password: handoff only.
        let (status, _) =
            handle_session_login(State(state.clone()), Ok(Json(login_body("alice", ""))))
                .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(state.registry.is_empty());
        assert_eq!(backend.stats().opens, 0);
    }

    #[tokio::test]
    async fn login_with_empty_identity_is_bad_request() {
        let (state, _service, _backend) = test_state();
        let (status, _) =
            handle_session_login(State(state), Ok(Json(login_body("  ", "builder")))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn event_subscription_sees_revocation_after_check() {
        let (state, service, _backend) = test_state();
        let grant = service
            .authenticator
            .create_session("bob", "WEB", SessionFlavor::Employee, None)
            .unwrap();
        let key = SessionKey::new("bob", "WEB", &grant.session_id);

        let mut events = subscribe_session_events(&state, &key).unwrap();
        assert!(state.registry.remove(&key));
        assert_eq!(
            events.recv().await.unwrap(),
            NotifyEvent::force_logout(&grant.session_id)
        );

        let (status, _) = subscribe_session_events(&state, &key).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ping_requires_full_context() {
        let (state, _service, _backend) = test_state();
        let mut headers = HeaderMap::new();
        headers.insert(IDENTITY_HEADER, HeaderValue::from_static("alice"));
        let (status, body) = handle_session_ping(State(state), headers).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.0["error"].as_str().unwrap().contains("platform"));
    }

    #[tokio::test]
    async fn ping_live_then_revoked() {
        let (state, service, backend) = test_state();
        let grant = service
            .authenticator
            .create_session("bob", "WEB", SessionFlavor::Employee, None)
            .unwrap();
        let headers = session_headers("bob", "web", &grant.session_id);

        let (status, body) = handle_session_ping(State(state.clone()), headers.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["primary_role"], "ROLE_TECHNICIAN");

        assert!(backend.kill_out_of_band(&grant.session_id));

        let (status, _) = handle_session_ping(State(state.clone()), headers).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn ping_unknown_session_is_unauthorized() {
        let (state, _service, _backend) = test_state();
        let (status, _) =
            handle_session_ping(State(state), session_headers("bob", "WEB", "nope")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let (state, service, backend) = test_state();
        let grant = service
            .authenticator
            .create_session("bob", "WEB", SessionFlavor::Employee, None)
            .unwrap();
        let headers = session_headers("bob", "WEB", &grant.session_id);

        let (status, body) = handle_session_logout(State(state.clone()), headers.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["removed"], true);

        let (status, body) = handle_session_logout(State(state), headers).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["removed"], false);
        assert_eq!(backend.stats().kills, 1);
    }

    #[tokio::test]
    async fn logout_pushes_force_logout() {
        let (state, service, _backend) = test_state();
        let grant = service
            .authenticator
            .create_session("bob", "WEB", SessionFlavor::Employee, None)
            .unwrap();
        let mut events = state.notifier.subscribe(&grant.session_id);

        handle_session_logout(
            State(state),
            session_headers("bob", "WEB", &grant.session_id),
        )
        .await;

        assert_eq!(
            events.recv().await.unwrap(),
            NotifyEvent::force_logout(&grant.session_id)
        );
    }

    #[tokio::test]
    async fn pairing_flow_delivers_credentials_to_poller() {
        let (state, service, _backend) = test_state();

        let (status, ticket) =
            handle_handoff_pairing(State(state.clone()), Bytes::new()).await;
        assert_eq!(status, StatusCode::OK);
        let id = ticket.0["id"].as_str().unwrap().to_string();
        let code = ticket.0["code"].as_str().unwrap().to_string();
        assert_eq!(code.len(), 8);

        let (status, view) =
            handle_handoff_status(State(state.clone()), Path(id.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view.0["status"], "pending");
        assert!(view.0.get("credentials").is_none());

        // Mobile device already signed in as alice confirms the code.
        let mobile = service
            .authenticator
            .create_session("alice", "MOBILE", SessionFlavor::Customer, None)
            .unwrap();
        let (status, confirmed) = handle_handoff_confirm(
            State(state.clone()),
            bearer(&mobile.token),
            Ok(Json(ConfirmBody {
                code: code.to_lowercase(),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(confirmed.0["strategy"], "same_identity");
        assert!(confirmed.0.get("session").is_none());

        let (_, view) = handle_handoff_status(State(state.clone()), Path(id)).await;
        assert_eq!(view.0["status"], "confirmed");
        assert_eq!(view.0["credentials"]["identity"], "alice");
        assert_eq!(view.0["credentials"]["platform"], "WEB");

        assert_eq!(state.registry.keys_for_identity("alice").len(), 2);
    }

    #[tokio::test]
    async fn pairing_confirm_without_bearer_is_rejected() {
        let (state, _service, _backend) = test_state();
        let (_, ticket) = handle_handoff_pairing(State(state.clone()), Bytes::new()).await;
        let code = ticket.0["code"].as_str().unwrap().to_string();

        let (status, body) = handle_handoff_confirm(
            State(state.clone()),
            HeaderMap::new(),
            Ok(Json(ConfirmBody { code })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        // Indistinguishable from a code that never existed.
        assert_eq!(body.0["error"], "Handoff code is invalid or has expired");
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn invalid_bearer_is_unauthorized() {
        let (state, _service, _backend) = test_state();
        let (status, _) = handle_handoff_confirm(
            State(state),
            bearer("not.a.token"),
            Ok(Json(ConfirmBody {
                code: "ABCDEFGH".into(),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_code_reads_generic() {
        let (state, _service, _backend) = test_state();
        let (status, body) = handle_handoff_confirm(
            State(state),
            HeaderMap::new(),
            Ok(Json(ConfirmBody {
                code: "ZZZZZZZZ".into(),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0["error"], "Handoff code is invalid or has expired");
    }

    #[tokio::test]
    async fn delegate_flow_returns_session_to_confirmer() {
        let (state, service, _backend) = test_state();
        let web = service
            .authenticator
            .create_session("bob", "WEB", SessionFlavor::Employee, None)
            .unwrap();

        let (status, ticket) =
            handle_handoff_delegate(State(state.clone()), bearer(&web.token), Bytes::new()).await;
        assert_eq!(status, StatusCode::OK);
        let id = ticket.0["id"].as_str().unwrap().to_string();
        let code = ticket.0["code"].as_str().unwrap().to_string();

        let (status, confirmed) = handle_handoff_confirm(
            State(state.clone()),
            HeaderMap::new(),
            Ok(Json(ConfirmBody { code: code.clone() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(confirmed.0["strategy"], "delegated_proxy");
        assert_eq!(confirmed.0["session"]["identity"], "bob");
        assert_eq!(confirmed.0["session"]["platform"], "MOBILE");

        // The initiating device never sees the delegated credentials.
        let (_, view) = handle_handoff_status(State(state.clone()), Path(id)).await;
        assert_eq!(view.0["status"], "confirmed");
        assert!(view.0.get("credentials").is_none());

        // Spent.
        let (status, _) = handle_handoff_confirm(
            State(state),
            HeaderMap::new(),
            Ok(Json(ConfirmBody { code })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delegate_honours_target_platform() {
        let (state, service, _backend) = test_state();
        let web = service
            .authenticator
            .create_session("bob", "WEB", SessionFlavor::Employee, None)
            .unwrap();

        let (_, ticket) = handle_handoff_delegate(
            State(state.clone()),
            bearer(&web.token),
            Bytes::from_static(br#"{"target_platform":"tablet"}"#),
        )
        .await;
        let code = ticket.0["code"].as_str().unwrap().to_string();

        let (_, confirmed) = handle_handoff_confirm(
            State(state),
            HeaderMap::new(),
            Ok(Json(ConfirmBody { code })),
        )
        .await;
        assert_eq!(confirmed.0["session"]["platform"], "TABLET");
    }

    #[tokio::test]
    async fn delegate_requires_live_session() {
        let (state, service, _backend) = test_state();
        let web = service
            .authenticator
            .create_session("bob", "WEB", SessionFlavor::Employee, None)
            .unwrap();
        state
            .registry
            .remove(&SessionKey::new("bob", "WEB", &web.session_id));

        let (status, _) =
            handle_handoff_delegate(State(state.clone()), bearer(&web.token), Bytes::new()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(state.handoff.is_empty());

        let (status, _) =
            handle_handoff_delegate(State(state), HeaderMap::new(), Bytes::new()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_of_unknown_handoff_is_not_found() {
        let (state, _service, _backend) = test_state();
        let (status, _) = handle_handoff_status(State(state), Path("missing".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
