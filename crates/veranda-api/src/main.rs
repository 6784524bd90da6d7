//! Veranda - smart-home hub API server
//!
//! Thin HTTP/WebSocket shim over the device registry and the automation
//! engine; every route maps one-to-one onto a core operation.

use automation_engine::persistence::JsonAutomationStore;
use automation_engine::{
    AutomationEngine, AutomationError, CreateAutomationRequest, TriggerEvent,
    UpdateAutomationRequest,
};
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use device_registry::persistence::JsonDeviceStore;
use device_registry::{
    Actor, DeviceCommand, DeviceFilter, DeviceRegistry, DeviceSpec, DeviceUpdate, RegistryError,
    StateMap,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod websocket;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub engine: Arc<AutomationEngine>,
}

/// API response wrapper using serde_json::Value for flexibility
#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or(serde_json::Value::Null)),
            error: None,
        }
    }

    fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

fn registry_status(error: &RegistryError) -> StatusCode {
    match error {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Validation(_) => StatusCode::BAD_REQUEST,
        RegistryError::AddressInUse(_) => StatusCode::CONFLICT,
        RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn registry_error(error: &RegistryError) -> (StatusCode, Json<ApiResponse>) {
    (
        registry_status(error),
        Json(ApiResponse::error(error.to_string())),
    )
}

fn automation_status(error: &AutomationError) -> StatusCode {
    match error {
        AutomationError::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        AutomationError::Generation(_) | AutomationError::DeviceControlFailed(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn automation_error(error: &AutomationError) -> (StatusCode, Json<ApiResponse>) {
    (
        automation_status(error),
        Json(ApiResponse::error(error.to_string())),
    )
}

// ── Device routes ──────────────────────────────────────────────────────

/// List devices, optionally filtered
async fn list_devices(
    State(state): State<AppState>,
    Query(filter): Query<DeviceFilter>,
) -> impl IntoResponse {
    Json(ApiResponse::success(state.registry.list(&filter)))
}

/// Register a new device
async fn register_device(
    State(state): State<AppState>,
    Json(spec): Json<DeviceSpec>,
) -> impl IntoResponse {
    match state.registry.register(spec).await {
        Ok(device) => (StatusCode::CREATED, Json(ApiResponse::success(device))),
        Err(e) => registry_error(&e),
    }
}

/// Registry statistics
async fn device_statistics(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.registry.statistics()))
}

/// Get a specific device
async fn get_device(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.registry.get(&id) {
        Some(device) => (StatusCode::OK, Json(ApiResponse::success(device))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Device not found")),
        ),
    }
}

/// Update a device's descriptive fields
async fn update_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<DeviceUpdate>,
) -> impl IntoResponse {
    match state.registry.update_info(&id, patch).await {
        Ok(device) => (StatusCode::OK, Json(ApiResponse::success(device))),
        Err(e) => registry_error(&e),
    }
}

/// Delete a device
async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.delete(&id).await {
        Ok(device) => (StatusCode::OK, Json(ApiResponse::success(device))),
        Err(e) => registry_error(&e),
    }
}

#[derive(Deserialize)]
struct UpdateStateRequest {
    state: StateMap,
    #[serde(default)]
    user: Option<String>,
}

fn actor_for(user: Option<String>) -> Actor {
    match user {
        Some(id) => Actor::User { id },
        None => Actor::Protocol,
    }
}

/// Merge a partial state into a device
async fn update_device_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateStateRequest>,
) -> impl IntoResponse {
    match state
        .registry
        .update_state(&id, request.state, actor_for(request.user))
        .await
    {
        Ok(merged) => (StatusCode::OK, Json(ApiResponse::success(merged))),
        Err(e) => registry_error(&e),
    }
}

#[derive(Deserialize)]
struct ControlRequest {
    name: String,
    #[serde(default)]
    parameters: StateMap,
    #[serde(default)]
    user: Option<String>,
}

/// Issue a command toward a device
async fn control_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ControlRequest>,
) -> impl IntoResponse {
    let command = DeviceCommand {
        name: request.name,
        parameters: request.parameters,
    };
    match state
        .registry
        .control(&id, command, actor_for(request.user))
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "device_id": id
            }))),
        ),
        Err(e) => registry_error(&e),
    }
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default)]
    limit: Option<usize>,
}

/// Device state history
async fn device_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.registry.history(&id, query.limit).await {
        Ok(entries) => (StatusCode::OK, Json(ApiResponse::success(entries))),
        Err(e) => registry_error(&e),
    }
}

// ── Automation routes ──────────────────────────────────────────────────

/// List automations
async fn list_automations(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.engine.list()))
}

/// Create an automation
async fn create_automation(
    State(state): State<AppState>,
    Json(request): Json<CreateAutomationRequest>,
) -> impl IntoResponse {
    match state.engine.create(request).await {
        Ok(automation) => (StatusCode::CREATED, Json(ApiResponse::success(automation))),
        Err(e) => automation_error(&e),
    }
}

#[derive(Deserialize)]
struct GenerateRequest {
    prompt: String,
    user: String,
}

/// Create an automation from natural language via the AI collaborator
async fn generate_automation(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> impl IntoResponse {
    match state
        .engine
        .create_from_natural_language(&request.prompt, &request.user)
        .await
    {
        Ok(automation) => (StatusCode::CREATED, Json(ApiResponse::success(automation))),
        Err(e) => automation_error(&e),
    }
}

/// Get a specific automation
async fn get_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.get(&id) {
        Some(automation) => (StatusCode::OK, Json(ApiResponse::success(automation))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Automation not found")),
        ),
    }
}

/// Update an automation
async fn update_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateAutomationRequest>,
) -> impl IntoResponse {
    match state.engine.update(&id, request).await {
        Ok(automation) => (StatusCode::OK, Json(ApiResponse::success(automation))),
        Err(e) => automation_error(&e),
    }
}

/// Delete an automation
async fn delete_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.delete(&id).await {
        Ok(automation) => (StatusCode::OK, Json(ApiResponse::success(automation))),
        Err(e) => automation_error(&e),
    }
}

#[derive(Deserialize, Default)]
struct TriggerRequest {
    #[serde(default)]
    user: Option<String>,
}

/// Manually trigger an automation.
///
/// The run happens in the background; a trigger arriving while the same
/// automation is running is dropped by the engine.
async fn trigger_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<TriggerRequest>>,
) -> impl IntoResponse {
    if state.engine.get(&id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Automation not found")),
        );
    }

    let requested_by = request.and_then(|Json(r)| r.user);
    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        engine
            .trigger(&id, TriggerEvent::Manual { requested_by })
            .await;
    });

    (
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(serde_json::json!({
            "status": "triggered"
        }))),
    )
}

/// Execution journal for an automation
async fn automation_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.engine.runs(&id, query.limit).await {
        Ok(runs) => (StatusCode::OK, Json(ApiResponse::success(runs))),
        Err(e) => automation_error(&e),
    }
}

// ── Wiring ─────────────────────────────────────────────────────────────

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket::handle_socket(socket, state))
}

/// Health check
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Devices
        .route("/api/devices", get(list_devices).post(register_device))
        .route("/api/devices/statistics", get(device_statistics))
        .route(
            "/api/devices/:id",
            get(get_device).patch(update_device).delete(delete_device),
        )
        .route("/api/devices/:id/state", post(update_device_state))
        .route("/api/devices/:id/control", post(control_device))
        .route("/api/devices/:id/history", get(device_history))
        // Automations
        .route(
            "/api/automations",
            get(list_automations).post(create_automation),
        )
        .route("/api/automations/generate", post(generate_automation))
        .route(
            "/api/automations/:id",
            get(get_automation)
                .patch(update_automation)
                .delete(delete_automation),
        )
        .route("/api/automations/:id/trigger", post(trigger_automation))
        .route("/api/automations/:id/runs", get(automation_runs))
        // WebSocket
        .route("/ws", get(ws_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veranda_api=debug,info".into()),
        )
        .init();

    tracing::info!("Starting Veranda API server");

    let data_dir =
        std::path::PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));

    let device_store = Arc::new(JsonDeviceStore::open(&data_dir).await?);
    let registry = Arc::new(DeviceRegistry::new(device_store).await?);

    let automation_store = Arc::new(JsonAutomationStore::open(&data_dir).await?);
    // No AI collaborator is wired in by default; the generate route
    // reports a generation failure until one is configured.
    let engine = Arc::new(AutomationEngine::new(Arc::clone(&registry), automation_store, None).await?);
    engine.start();

    let state = AppState { registry, engine };
    let app = router(state);

    let addr: std::net::SocketAddr = std::env::var("VERANDA_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:3000".into())
        .parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
