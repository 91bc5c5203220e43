//! Request dispatcher
//!
//! Consumes transport-agnostic request frames, enforces the per-connection
//! handshake ordering, routes by method, validates parameters, and invokes
//! capability providers under a bounded timeout. Every dispatch, success or
//! failure, is attributed to a capability identity in the audit trail; the
//! analytics provider and the authorization audit both read from it.

pub mod validate;

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{AbortHandle, Aborted};
use serde_json::{json, Map, Value};

use crate::auth::{authorize, AuthContext};
use crate::config::ServerConfig;
use crate::error::{AlmanacError, Result};
use crate::protocol::{methods, InitializeResult, McpRequest, McpResponse, ToolCallResult};
use crate::registry::{Capability, CapabilityProvider, CapabilityRegistry, ParamMap};
pub use validate::{validate_arguments, validate_uri_params};

/// Audit identity for dispatches that never resolved to a registered
/// capability. Misses share this one entry so the trail stays bounded by the
/// registry instead of growing under caller-chosen names.
pub const UNRESOLVED_CAPABILITY: &str = "(unresolved)";

/// Per-connection protocol state. The first request must be `initialize`;
/// anything else fails with an ordering error and does not transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Ready,
    Closed,
}

/// How one dispatch ended, for attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ok,
    ClientError,
    Denied,
    Dependency,
    Timeout,
    Cancelled,
}

/// Counters for one capability identity
#[derive(Default)]
struct AuditCounters {
    ok: AtomicU64,
    client_errors: AtomicU64,
    denied: AtomicU64,
    dependency_errors: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time view of one capability's audit counters
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditRecord {
    pub capability: String,
    pub ok: u64,
    pub client_errors: u64,
    pub denied: u64,
    pub dependency_errors: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub last_dispatched: DateTime<Utc>,
}

impl AuditRecord {
    pub fn total(&self) -> u64 {
        self.ok
            + self.client_errors
            + self.denied
            + self.dependency_errors
            + self.timeouts
            + self.cancelled
    }
}

/// Per-capability dispatch attribution. Concurrent writers bump atomic
/// counters; readers take snapshots.
#[derive(Default)]
pub struct AuditTrail {
    entries: DashMap<String, (AuditCounters, parking_lot::Mutex<DateTime<Utc>>)>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, capability: &str, outcome: DispatchOutcome) {
        let entry = self
            .entries
            .entry(capability.to_string())
            .or_insert_with(|| (AuditCounters::default(), parking_lot::Mutex::new(Utc::now())));
        let (counters, last) = entry.value();
        let counter = match outcome {
            DispatchOutcome::Ok => &counters.ok,
            DispatchOutcome::ClientError => &counters.client_errors,
            DispatchOutcome::Denied => &counters.denied,
            DispatchOutcome::Dependency => &counters.dependency_errors,
            DispatchOutcome::Timeout => &counters.timeouts,
            DispatchOutcome::Cancelled => &counters.cancelled,
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
        *last.lock() = Utc::now();
    }

    pub fn snapshot(&self) -> Vec<AuditRecord> {
        let mut records: Vec<AuditRecord> = self
            .entries
            .iter()
            .map(|entry| {
                let (counters, last) = entry.value();
                AuditRecord {
                    capability: entry.key().clone(),
                    ok: counters.ok.load(AtomicOrdering::Relaxed),
                    client_errors: counters.client_errors.load(AtomicOrdering::Relaxed),
                    denied: counters.denied.load(AtomicOrdering::Relaxed),
                    dependency_errors: counters.dependency_errors.load(AtomicOrdering::Relaxed),
                    timeouts: counters.timeouts.load(AtomicOrdering::Relaxed),
                    cancelled: counters.cancelled.load(AtomicOrdering::Relaxed),
                    last_dispatched: *last.lock(),
                }
            })
            .collect();
        records.sort_by(|a, b| a.capability.cmp(&b.capability));
        records
    }

    pub fn record_for(&self, capability: &str) -> Option<AuditRecord> {
        self.snapshot()
            .into_iter()
            .find(|r| r.capability == capability)
    }
}

/// Stateless request dispatcher shared across connections. Per-connection
/// ordering lives in the `ConnectionState` the transport owns.
pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    server_name: String,
    call_timeout: Duration,
    audit: Arc<AuditTrail>,
    inflight: DashMap<(String, String), AbortHandle>,
}

impl Dispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, config: &ServerConfig, audit: Arc<AuditTrail>) -> Self {
        Self {
            registry,
            server_name: config.server_name.clone(),
            call_timeout: config.call_timeout,
            audit,
            inflight: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    /// Abort every in-flight call started on the named connection. Called on
    /// teardown; an aborted call emits no response. Other connections' calls
    /// are untouched.
    pub fn cancel_connection(&self, conn: &str) {
        self.inflight.retain(|key, handle| {
            if key.0 == conn {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Dispatch one request frame for the named connection. `conn` scopes the
    /// in-flight registry: cancellation only ever reaches calls started on the
    /// same connection. Returns `None` for notifications and for calls
    /// cancelled mid-flight - in both cases nothing goes back on the wire.
    pub async fn handle(
        &self,
        conn: &str,
        state: &mut ConnectionState,
        request: McpRequest,
        auth: Option<&AuthContext>,
    ) -> Option<McpResponse> {
        if request.jsonrpc != "2.0" {
            return Some(McpResponse::from_error(
                request.id,
                &AlmanacError::InvalidRequest("jsonrpc must be \"2.0\"".into()),
            ));
        }

        if request.is_notification() {
            self.handle_notification(conn, &request);
            return None;
        }

        let id = request.id.clone();

        if *state == ConnectionState::Closed {
            return Some(McpResponse::from_error(
                id,
                &AlmanacError::InvalidRequest("connection is closed".into()),
            ));
        }

        // Handshake ordering: initialize first, exactly once
        match (*state, request.method.as_str()) {
            (ConnectionState::Uninitialized, methods::INITIALIZE) => {
                *state = ConnectionState::Ready;
                let result = InitializeResult::new(&self.server_name);
                return Some(McpResponse::success(
                    id,
                    serde_json::to_value(result).unwrap_or_default(),
                ));
            }
            (ConnectionState::Uninitialized, other) => {
                return Some(McpResponse::from_error(
                    id,
                    &AlmanacError::Ordering(format!(
                        "'{other}' before initialize; the first request must be the handshake"
                    )),
                ));
            }
            (ConnectionState::Ready, methods::INITIALIZE) => {
                return Some(McpResponse::from_error(
                    id,
                    &AlmanacError::Ordering("connection is already initialized".into()),
                ));
            }
            _ => {}
        }

        let outcome = match request.method.as_str() {
            methods::PING => Ok(json!({})),
            methods::LIST_TOOLS => Ok(self.list_tools()),
            methods::LIST_RESOURCES => Ok(self.list_resources()),
            methods::LIST_RESOURCE_TEMPLATES => Ok(self.list_resource_templates()),
            methods::CALL_TOOL => match self.call_tool(conn, &request, auth).await {
                CallResult::Done(result) => result,
                CallResult::Cancelled => return None,
            },
            methods::READ_RESOURCE => match self.read_resource(conn, &request, auth).await {
                CallResult::Done(result) => result,
                CallResult::Cancelled => return None,
            },
            other => Err(AlmanacError::MethodNotFound(other.to_string())),
        };

        Some(match outcome {
            Ok(result) => McpResponse::success(id, result),
            Err(err) => McpResponse::from_error(id, &err),
        })
    }

    fn handle_notification(&self, conn: &str, request: &McpRequest) {
        match request.method.as_str() {
            methods::INITIALIZED => {}
            methods::CANCELLED => {
                // Request ids are only unique per connection; a cancel can
                // never reach a call started elsewhere
                if let Some(request_id) = request.params.get("requestId") {
                    let key = (conn.to_string(), inflight_key(request_id));
                    if let Some((_, handle)) = self.inflight.remove(&key) {
                        handle.abort();
                        tracing::debug!(request_id = %key.1, "cancelled in-flight call");
                    }
                }
            }
            other => {
                tracing::debug!(method = other, "ignoring unknown notification");
            }
        }
    }

    fn list_tools(&self) -> Value {
        let tools: Vec<Value> = self
            .registry
            .list_actions()
            .iter()
            .map(|cap| {
                json!({
                    "name": cap.id,
                    "description": cap.description,
                    "inputSchema": cap.input_schema(),
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    fn list_resources(&self) -> Value {
        let resources: Vec<Value> = self
            .registry
            .list_static_resources()
            .iter()
            .map(|cap| {
                json!({
                    "uri": cap.id,
                    "name": cap.name,
                    "description": cap.description,
                    "mimeType": cap.mime_type,
                })
            })
            .collect();
        json!({ "resources": resources })
    }

    fn list_resource_templates(&self) -> Value {
        let templates: Vec<Value> = self
            .registry
            .list_templates()
            .iter()
            .map(|(template, cap)| {
                json!({
                    "uriTemplate": template.pattern(),
                    "name": cap.name,
                    "description": cap.description,
                    "mimeType": cap.mime_type,
                })
            })
            .collect();
        json!({ "resourceTemplates": templates })
    }

    async fn call_tool(
        &self,
        conn: &str,
        request: &McpRequest,
        auth: Option<&AuthContext>,
    ) -> CallResult {
        let name = match request.params.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                return CallResult::Done(Err(AlmanacError::InvalidParams(
                    "tools/call requires a 'name' parameter".into(),
                )))
            }
        };

        let Some((capability, provider)) = self.registry.resolve_action(&name) else {
            self.audit
                .record(UNRESOLVED_CAPABILITY, DispatchOutcome::ClientError);
            return CallResult::Done(Err(AlmanacError::NotFound(format!("tool '{name}'"))));
        };
        let capability = capability.clone();
        let provider = provider.clone();

        if let Err(err) = self.gate(auth, &capability) {
            return CallResult::Done(Err(err));
        }

        let arguments = request
            .params
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let arguments = match validate_arguments(&capability.params, &arguments) {
            Ok(args) => args,
            Err(err) => {
                self.audit.record(&capability.id, DispatchOutcome::ClientError);
                return CallResult::Done(Err(err));
            }
        };

        let invocation = self
            .bounded_call(conn, request, &capability, invoke_future(provider, name, arguments))
            .await;
        match invocation {
            Invocation::Cancelled => CallResult::Cancelled,
            Invocation::Finished(result) => CallResult::Done(result.map(|value| {
                serde_json::to_value(ToolCallResult::json(&value)).unwrap_or_default()
            })),
        }
    }

    async fn read_resource(
        &self,
        conn: &str,
        request: &McpRequest,
        auth: Option<&AuthContext>,
    ) -> CallResult {
        let uri = match request.params.get("uri").and_then(Value::as_str) {
            Some(uri) => uri.to_string(),
            None => {
                return CallResult::Done(Err(AlmanacError::InvalidParams(
                    "resources/read requires a 'uri' parameter".into(),
                )))
            }
        };

        // Static index first, then the templated index via the resolver
        let (capability, provider, params) = match self.registry.resolve_static(&uri) {
            Some((capability, provider)) => {
                (capability.clone(), provider.clone(), ParamMap::new())
            }
            None => match self.registry.resolve_templated(&uri) {
                Ok(resolved) => (resolved.capability, resolved.provider, resolved.params),
                Err(err) => {
                    self.audit
                        .record(UNRESOLVED_CAPABILITY, DispatchOutcome::ClientError);
                    return CallResult::Done(Err(err));
                }
            },
        };

        if let Err(err) = self.gate(auth, &capability) {
            return CallResult::Done(Err(err));
        }

        if let Err(err) = validate_uri_params(&capability.params, &params) {
            self.audit.record(&capability.id, DispatchOutcome::ClientError);
            return CallResult::Done(Err(err));
        }

        let invocation = self
            .bounded_call(conn, request, &capability, read_future(provider, uri, params))
            .await;
        match invocation {
            Invocation::Cancelled => CallResult::Cancelled,
            Invocation::Finished(result) => CallResult::Done(result.map(|contents| {
                json!({ "contents": [contents] })
            })),
        }
    }

    /// Scope gate, applied only when the transport supplies an auth context
    /// (the stdio pipe runs locally and carries none)
    fn gate(&self, auth: Option<&AuthContext>, capability: &Capability) -> Result<()> {
        let Some(ctx) = auth else { return Ok(()) };
        match authorize(ctx, capability) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.audit.record(&capability.id, DispatchOutcome::Denied);
                tracing::warn!(
                    capability = %capability.id,
                    subject = %ctx.subject,
                    "scope denied"
                );
                Err(err.into())
            }
        }
    }

    /// Run a collaborator call under the configured timeout, registered for
    /// cancellation under the connection plus request id. Cancelled calls
    /// surface as `Invocation::Cancelled` so no response is emitted for them.
    async fn bounded_call<F>(
        &self,
        conn: &str,
        request: &McpRequest,
        capability: &Capability,
        fut: F,
    ) -> Invocation
    where
        F: std::future::Future<Output = Result<Value>>,
    {
        let key = request
            .id
            .as_ref()
            .map(|id| (conn.to_string(), inflight_key(id)));
        let (abortable, handle) = futures::future::abortable(fut);
        if let Some(key) = &key {
            self.inflight.insert(key.clone(), handle);
        }

        let result = tokio::time::timeout(self.call_timeout, abortable).await;

        if let Some(key) = &key {
            self.inflight.remove(key);
        }

        match result {
            Err(_) => {
                self.audit.record(&capability.id, DispatchOutcome::Timeout);
                let millis = self.call_timeout.as_millis() as u64;
                tracing::warn!(capability = %capability.id, millis, "capability call timed out");
                Invocation::Finished(Err(AlmanacError::Timeout(millis)))
            }
            Ok(Err(Aborted)) => {
                self.audit.record(&capability.id, DispatchOutcome::Cancelled);
                Invocation::Cancelled
            }
            Ok(Ok(Ok(value))) => {
                self.audit.record(&capability.id, DispatchOutcome::Ok);
                Invocation::Finished(Ok(value))
            }
            Ok(Ok(Err(err))) => {
                let outcome = match &err {
                    AlmanacError::InvalidParams(_) | AlmanacError::NotFound(_) => {
                        DispatchOutcome::ClientError
                    }
                    _ => DispatchOutcome::Dependency,
                };
                self.audit.record(&capability.id, outcome);
                if outcome == DispatchOutcome::Dependency {
                    // Full detail stays in server logs; the caller sees Internal
                    tracing::error!(capability = %capability.id, error = %err, "collaborator failed");
                    Invocation::Finished(Err(AlmanacError::Dependency(err.to_string())))
                } else {
                    Invocation::Finished(Err(err))
                }
            }
        }
    }
}

enum CallResult {
    Done(Result<Value>),
    Cancelled,
}

enum Invocation {
    Finished(Result<Value>),
    Cancelled,
}

fn inflight_key(id: &Value) -> String {
    id.to_string()
}

async fn invoke_future(
    provider: Arc<dyn CapabilityProvider>,
    name: String,
    arguments: Map<String, Value>,
) -> Result<Value> {
    provider.invoke(&name, &arguments).await
}

async fn read_future(
    provider: Arc<dyn CapabilityProvider>,
    uri: String,
    params: ParamMap,
) -> Result<Value> {
    let contents = provider.read(&uri, &params).await?;
    serde_json::to_value(contents).map_err(AlmanacError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::registry::{ParamDescriptor, ParamType, ResourceContents};

    struct EchoProvider;

    #[async_trait]
    impl CapabilityProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        fn describe(&self) -> Vec<Capability> {
            vec![
                Capability::action("echo", "echo arguments back", "test.invoke").with_params(
                    vec![ParamDescriptor::required("message", ParamType::String)],
                ),
                Capability::static_resource("sys://echo", "echo", "echo resource", "test.read"),
            ]
        }

        async fn invoke(&self, _name: &str, args: &Map<String, Value>) -> Result<Value> {
            Ok(Value::Object(args.clone()))
        }

        async fn read(&self, uri: &str, _params: &ParamMap) -> Result<ResourceContents> {
            Ok(ResourceContents {
                uri: uri.to_string(),
                mime_type: "application/json".to_string(),
                text: "{}".to_string(),
            })
        }
    }

    struct StuckProvider;

    #[async_trait]
    impl CapabilityProvider for StuckProvider {
        fn name(&self) -> &str {
            "stuck"
        }

        fn describe(&self) -> Vec<Capability> {
            vec![Capability::action("hang", "never returns", "test.invoke")]
        }

        async fn invoke(&self, _name: &str, _args: &Map<String, Value>) -> Result<Value> {
            futures::future::pending().await
        }

        async fn read(&self, _uri: &str, _params: &ParamMap) -> Result<ResourceContents> {
            futures::future::pending().await
        }
    }

    fn dispatcher_with(providers: Vec<Arc<dyn CapabilityProvider>>, timeout_ms: u64) -> Dispatcher {
        let registry = Arc::new(CapabilityRegistry::build(providers).unwrap());
        let config = ServerConfig {
            server_name: "test".to_string(),
            call_timeout: Duration::from_millis(timeout_ms),
            oauth: None,
        };
        Dispatcher::new(registry, &config, Arc::new(AuditTrail::new()))
    }

    fn request(id: u64, method: &str, params: Value) -> McpRequest {
        McpRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(id)),
            method: method.to_string(),
            params,
        }
    }

    async fn initialized(dispatcher: &Dispatcher) -> ConnectionState {
        let mut state = ConnectionState::Uninitialized;
        dispatcher
            .handle("conn", &mut state, request(0, methods::INITIALIZE, json!({})), None)
            .await;
        state
    }

    #[tokio::test]
    async fn test_handshake_required_first() {
        let dispatcher = dispatcher_with(vec![Arc::new(EchoProvider)], 1000);
        let mut state = ConnectionState::Uninitialized;

        let response = dispatcher
            .handle("conn", &mut state, request(1, methods::LIST_TOOLS, json!({})), None)
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32002);
        // No transition happened
        assert_eq!(state, ConnectionState::Uninitialized);

        let response = dispatcher
            .handle("conn", &mut state, request(2, methods::INITIALIZE, json!({})), None)
            .await
            .unwrap();
        assert!(response.error.is_none());
        assert_eq!(state, ConnectionState::Ready);

        let response = dispatcher
            .handle("conn", &mut state, request(3, methods::LIST_TOOLS, json!({})), None)
            .await
            .unwrap();
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_double_initialize_is_ordering_error() {
        let dispatcher = dispatcher_with(vec![Arc::new(EchoProvider)], 1000);
        let mut state = initialized(&dispatcher).await;
        let response = dispatcher
            .handle("conn", &mut state, request(1, methods::INITIALIZE, json!({})), None)
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32002);
    }

    #[tokio::test]
    async fn test_tool_call_round_trip() {
        let dispatcher = dispatcher_with(vec![Arc::new(EchoProvider)], 1000);
        let mut state = initialized(&dispatcher).await;

        let response = dispatcher
            .handle(
                "conn",
                &mut state,
                request(
                    1,
                    methods::CALL_TOOL,
                    json!({"name": "echo", "arguments": {"message": "hi"}}),
                ),
                None,
            )
            .await
            .unwrap();
        let result = response.result.unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("hi"));
        assert_eq!(
            dispatcher.audit().record_for("echo").unwrap().ok,
            1
        );
    }

    #[tokio::test]
    async fn test_missing_required_argument_is_invalid_params() {
        let dispatcher = dispatcher_with(vec![Arc::new(EchoProvider)], 1000);
        let mut state = initialized(&dispatcher).await;

        let response = dispatcher
            .handle(
                "conn",
                &mut state,
                request(1, methods::CALL_TOOL, json!({"name": "echo", "arguments": {}})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32602);
        assert_eq!(
            dispatcher.audit().record_for("echo").unwrap().client_errors,
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let dispatcher = dispatcher_with(vec![Arc::new(EchoProvider)], 1000);
        let mut state = initialized(&dispatcher).await;
        let response = dispatcher
            .handle(
                "conn",
                &mut state,
                request(1, methods::CALL_TOOL, json!({"name": "nope"})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32001);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let dispatcher = dispatcher_with(vec![Arc::new(StuckProvider)], 50);
        let mut state = initialized(&dispatcher).await;

        let response = dispatcher
            .handle(
                "conn",
                &mut state,
                request(1, methods::CALL_TOOL, json!({"name": "hang"})),
                None,
            )
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, -32008);
        assert_eq!(error.data.unwrap()["retryable"], true);
        assert_eq!(dispatcher.audit().record_for("hang").unwrap().timeouts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_emits_no_response() {
        let dispatcher = Arc::new(dispatcher_with(vec![Arc::new(StuckProvider)], 60_000));
        let mut state = initialized(&dispatcher).await;

        let inner = dispatcher.clone();
        let call = tokio::spawn(async move {
            let mut state = ConnectionState::Ready;
            inner
                .handle(
                    "conn",
                    &mut state,
                    request(7, methods::CALL_TOOL, json!({"name": "hang"})),
                    None,
                )
                .await
        });

        // Let the call register itself, then cancel it
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cancel = McpRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: methods::CANCELLED.to_string(),
            params: json!({"requestId": 7}),
        };
        assert!(dispatcher
            .handle("conn", &mut state, cancel, None)
            .await
            .is_none());

        let response = call.await.unwrap();
        assert!(response.is_none());
        assert_eq!(dispatcher.audit().record_for("hang").unwrap().cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancellation_does_not_cross_connections() {
        let dispatcher = Arc::new(dispatcher_with(vec![Arc::new(StuckProvider)], 200));
        let mut state = initialized(&dispatcher).await;

        let inner = dispatcher.clone();
        let call = tokio::spawn(async move {
            let mut state = ConnectionState::Ready;
            inner
                .handle(
                    "alice",
                    &mut state,
                    request(7, methods::CALL_TOOL, json!({"name": "hang"})),
                    None,
                )
                .await
        });

        // Another connection cancels the same request id; alice's call must
        // survive and run into its own timeout instead
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cancel = McpRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: methods::CANCELLED.to_string(),
            params: json!({"requestId": 7}),
        };
        assert!(dispatcher
            .handle("bob", &mut state, cancel, None)
            .await
            .is_none());

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.error.unwrap().code, -32008);
        let record = dispatcher.audit().record_for("hang").unwrap();
        assert_eq!(record.cancelled, 0);
        assert_eq!(record.timeouts, 1);
    }

    #[tokio::test]
    async fn test_teardown_aborts_only_that_connections_calls() {
        let dispatcher = Arc::new(dispatcher_with(vec![Arc::new(StuckProvider)], 300));
        initialized(&dispatcher).await;

        // Same request id on both connections on purpose
        let spawn_call = |conn: &'static str| {
            let inner = dispatcher.clone();
            tokio::spawn(async move {
                let mut state = ConnectionState::Ready;
                inner
                    .handle(
                        conn,
                        &mut state,
                        request(1, methods::CALL_TOOL, json!({"name": "hang"})),
                        None,
                    )
                    .await
            })
        };
        let alice = spawn_call("alice");
        let bob = spawn_call("bob");

        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.cancel_connection("alice");

        // Alice's call is aborted with no response; bob's keeps running to
        // its own timeout
        assert!(alice.await.unwrap().is_none());
        let response = bob.await.unwrap().unwrap();
        assert_eq!(response.error.unwrap().code, -32008);
        let record = dispatcher.audit().record_for("hang").unwrap();
        assert_eq!(record.cancelled, 1);
        assert_eq!(record.timeouts, 1);
    }

    #[tokio::test]
    async fn test_unresolved_dispatches_share_one_audit_identity() {
        let dispatcher = dispatcher_with(vec![Arc::new(EchoProvider)], 1000);
        let mut state = initialized(&dispatcher).await;

        for uri in ["kb://nope/1", "kb://nope/2"] {
            let response = dispatcher
                .handle(
                    "conn",
                    &mut state,
                    request(1, methods::READ_RESOURCE, json!({"uri": uri})),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(response.error.unwrap().code, -32001);
        }
        let response = dispatcher
            .handle(
                "conn",
                &mut state,
                request(2, methods::CALL_TOOL, json!({"name": "vanish"})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32001);

        // Misses never mint per-string entries
        let trail = dispatcher.audit().snapshot();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].capability, UNRESOLVED_CAPABILITY);
        assert_eq!(trail[0].client_errors, 3);
    }

    #[tokio::test]
    async fn test_scope_gate_denies_and_attributes() {
        use crate::auth::ScopeSet;

        let dispatcher = dispatcher_with(vec![Arc::new(EchoProvider)], 1000);
        let mut state = initialized(&dispatcher).await;
        let ctx = AuthContext {
            subject: "mallory".to_string(),
            issuer: "https://id.test".to_string(),
            audience: "https://mcp.test".to_string(),
            scopes: ScopeSet::from_claim("some.other"),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };

        let response = dispatcher
            .handle(
                "conn",
                &mut state,
                request(
                    1,
                    methods::CALL_TOOL,
                    json!({"name": "echo", "arguments": {"message": "hi"}}),
                ),
                Some(&ctx),
            )
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32004);
        assert_eq!(dispatcher.audit().record_for("echo").unwrap().denied, 1);
    }

    #[tokio::test]
    async fn test_read_static_resource() {
        let dispatcher = dispatcher_with(vec![Arc::new(EchoProvider)], 1000);
        let mut state = initialized(&dispatcher).await;
        let response = dispatcher
            .handle(
                "conn",
                &mut state,
                request(1, methods::READ_RESOURCE, json!({"uri": "sys://echo"})),
                None,
            )
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["contents"][0]["uri"], "sys://echo");
        assert_eq!(result["contents"][0]["mimeType"], "application/json");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let dispatcher = dispatcher_with(vec![Arc::new(EchoProvider)], 1000);
        let mut state = initialized(&dispatcher).await;
        let response = dispatcher
            .handle("conn", &mut state, request(1, "resources/subscribe", json!({})), None)
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }
}
