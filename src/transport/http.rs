//! Streamable HTTP transport
//!
//! POST / carries JSON-RPC frames; responses come back as SSE when the
//! client accepts `text/event-stream`, plain JSON otherwise. `initialize`
//! issues an `Mcp-Session-Id` bound to the authenticated subject; every
//! later request must present both that id and a bearer token whose subject
//! matches the binding. The id alone never grants access.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer, AuthContext, AuthError, Authenticator, SessionStore};
use crate::dispatch::{ConnectionState, Dispatcher};
use crate::error::AlmanacError;
use crate::protocol::{methods, McpRequest, McpResponse};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
pub const PROTOCOL_HEADER: &str = "MCP-Protocol-Version";

/// Shared state behind the router
#[derive(Clone)]
pub struct HttpState {
    dispatcher: Arc<Dispatcher>,
    authenticator: Option<Arc<Authenticator>>,
    sessions: Arc<SessionStore>,
}

impl HttpState {
    pub fn new(dispatcher: Arc<Dispatcher>, authenticator: Option<Arc<Authenticator>>) -> Self {
        Self {
            dispatcher,
            authenticator,
            sessions: Arc::new(SessionStore::new()),
        }
    }
}

pub struct HttpServer {
    state: HttpState,
    addr: SocketAddr,
}

impl HttpServer {
    pub fn new(state: HttpState, addr: SocketAddr) -> Self {
        Self { state, addr }
    }

    pub fn router(state: HttpState) -> Router {
        Router::new()
            .route("/", post(post_handler).delete(delete_handler))
            .route(
                "/.well-known/oauth-authorization-server",
                get(discovery_handler),
            )
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    pub async fn serve(self) -> std::io::Result<()> {
        let app = Self::router(self.state);
        tracing::info!("http transport listening on {}", self.addr);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await
    }
}

/// Identity-provider discovery document. Unauthenticated; 401 responses
/// point callers here via the WWW-Authenticate challenge.
async fn discovery_handler(State(state): State<HttpState>) -> Response {
    match &state.authenticator {
        Some(auth) => {
            let doc = &auth.config().discovery;
            axum::Json(doc.clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let wants_sse = accepts_event_stream(&headers);
    if let Some(version) = headers.get(PROTOCOL_HEADER).and_then(|v| v.to_str().ok()) {
        tracing::debug!(version, "client protocol version");
    }

    // Authorization layer runs before the dispatcher sees anything
    let auth_ctx = match authenticate(&state, &headers).await {
        Ok(ctx) => ctx,
        Err(err) => return auth_failure(&state, err),
    };
    let subject = auth_ctx
        .as_ref()
        .map(|c| c.subject.clone())
        .unwrap_or_else(|| "anonymous".to_string());

    let request: McpRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let response =
                McpResponse::error(None, -32700, format!("Parse error: {e}"));
            return rpc_response(StatusCode::BAD_REQUEST, &response, wants_sse, None);
        }
    };
    let session_header = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // initialize opens a session; everything else must present one whose
    // binding matches the token subject
    let issued_session = if request.method == methods::INITIALIZE {
        match state.sessions.issue(&subject) {
            Ok(id) => Some(id),
            Err(err) => return auth_failure(&state, err),
        }
    } else {
        let Some(session_id) = session_header.as_deref() else {
            let response = McpResponse::from_error(
                request.id.clone(),
                &AlmanacError::Ordering("missing Mcp-Session-Id header".into()),
            );
            return rpc_response(StatusCode::BAD_REQUEST, &response, wants_sse, None);
        };
        if let Err(err) = state.sessions.validate(session_id, &subject) {
            return auth_failure(&state, err);
        }
        None
    };

    // Sessions exist only post-handshake, so the per-request state machine
    // starts Ready for non-initialize methods
    let mut conn_state = if request.method == methods::INITIALIZE {
        ConnectionState::Uninitialized
    } else {
        ConnectionState::Ready
    };

    // The session id names the connection in the dispatcher's in-flight
    // registry, so cancellation stays scoped to the session that started
    // the call
    let conn = issued_session
        .clone()
        .or_else(|| session_header.clone())
        .unwrap_or_default();

    let response = state
        .dispatcher
        .handle(&conn, &mut conn_state, request, auth_ctx.as_ref())
        .await;

    match response {
        // Notifications and cancelled calls: nothing to stream back
        None => StatusCode::ACCEPTED.into_response(),
        Some(response) => {
            let status = status_for(&response);
            let mut out = rpc_response(status, &response, wants_sse, issued_session.as_deref());
            if status == StatusCode::UNAUTHORIZED {
                attach_challenge(&state, &mut out);
            }
            out
        }
    }
}

/// Session termination. Only the bound subject may tear its session down.
async fn delete_handler(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let auth_ctx = match authenticate(&state, &headers).await {
        Ok(ctx) => ctx,
        Err(err) => return auth_failure(&state, err),
    };
    let subject = auth_ctx
        .as_ref()
        .map(|c| c.subject.clone())
        .unwrap_or_else(|| "anonymous".to_string());

    let Some(session_id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing Mcp-Session-Id header").into_response();
    };
    match state.sessions.terminate(session_id, &subject) {
        Ok(()) => {
            // The session's in-flight calls go down with it
            state.dispatcher.cancel_connection(session_id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => auth_failure(&state, err),
    }
}

/// Validate the bearer token when an authenticator is configured. Returns
/// `None` only when the server runs without an authorization layer.
async fn authenticate(
    state: &HttpState,
    headers: &HeaderMap,
) -> Result<Option<AuthContext>, AuthError> {
    let Some(authenticator) = &state.authenticator else {
        return Ok(None);
    };
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingToken)?;
    let token = extract_bearer(header_value)?;
    authenticator.authenticate(token).await.map(Some)
}

fn auth_failure(state: &HttpState, err: AuthError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::UNAUTHORIZED);
    tracing::warn!(status = %status, error = %err, "request rejected");
    let body = McpResponse::from_error(None, &AlmanacError::from(err));
    let mut response = rpc_response(status, &body, false, None);
    if status == StatusCode::UNAUTHORIZED {
        attach_challenge(state, &mut response);
    }
    response
}

fn attach_challenge(state: &HttpState, response: &mut Response) {
    if let Some(authenticator) = &state.authenticator {
        if let Ok(value) = HeaderValue::from_str(&authenticator.challenge()) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
    }
}

/// JSON-RPC errors normally ride a 200; authentication and authorization
/// failures surface as transport-level statuses so generic HTTP clients
/// handle them correctly
fn status_for(response: &McpResponse) -> StatusCode {
    match response.error.as_ref().map(|e| e.code) {
        Some(-32003) => StatusCode::UNAUTHORIZED,
        Some(-32004) => StatusCode::FORBIDDEN,
        Some(-32005) => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    }
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
}

fn rpc_response(
    status: StatusCode,
    response: &McpResponse,
    as_sse: bool,
    session_id: Option<&str>,
) -> Response {
    let payload = serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"jsonrpc":"2.0","error":{"code":-32000,"message":"Internal error"}}"#.to_string()
    });

    let (content_type, body) = if as_sse {
        let frame = format!("event: message\ndata: {payload}\n\n");
        let stream = tokio_stream::once(Ok::<_, std::convert::Infallible>(Bytes::from(frame)));
        ("text/event-stream", Body::from_stream(stream))
    } else {
        ("application/json", Body::from(payload))
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type);
    if let Some(id) = session_id {
        builder = builder.header(SESSION_HEADER, id);
    }
    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response build failed").into_response()
    })
}
