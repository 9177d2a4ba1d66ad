//! # REST + WebSocket API
//!
//! The axum router a game host (or an operator) talks to. Every handler
//! shares [`AppState`] through axum's `State` extractor. Vault calls block on
//! storage, so they run on the blocking pool.
//!
//! ## Endpoints
//!
//! | Method | Path                                   | Description                   |
//! |--------|----------------------------------------|-------------------------------|
//! | GET    | `/health`                              | Liveness probe                |
//! | GET    | `/status`                              | Host status summary           |
//! | POST   | `/vaults`                              | Form a vault                  |
//! | GET    | `/vaults/:id`                          | Vault info                    |
//! | DELETE | `/vaults/:id`                          | Destroy a vault               |
//! | GET    | `/vaults/:id/snapshot`                 | Fresh contents from storage   |
//! | GET    | `/vaults/:id/transactions?page=`       | One page of the audit log     |
//! | GET    | `/owners/:owner/vault`                 | Vault held by an owner        |
//! | POST   | `/vaults/:id/viewers/:viewer/open`     | Open a view                   |
//! | POST   | `/vaults/:id/viewers/:viewer/close`    | Close a view                  |
//! | POST   | `/vaults/:id/viewers/:viewer/actions`  | Apply a viewer action         |
//! | GET    | `/ws`                                  | Live vault events             |
//!
//! Viewer handles live in the host. A viewer opening the same vault again
//! gets a fresh handle with the new permissions and the old one is released.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use guildvault::{
    ActionKind, ActionOutcome, ActorId, DestructionConfirmation, FormationEvent, ItemStack,
    Location, Orientation, OwnerId, Permissions, SlotContent, TransactionPage, Vault, VaultError,
    VaultId, VaultInfo, VaultResult, VaultService, VaultSnapshot, ViewHandle, ViewerAction,
};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub service: Arc<VaultService>,
    /// Open viewer handles, one per (vault, viewer).
    pub viewers: Arc<DashMap<(VaultId, ActorId), ViewHandle>>,
    pub metrics: SharedMetrics,
}

impl AppState {
    pub fn new(version: String, service: Arc<VaultService>, metrics: SharedMetrics) -> Self {
        Self {
            version,
            service,
            viewers: Arc::new(DashMap::new()),
            metrics,
        }
    }

    fn update_session_gauge(&self) {
        self.metrics
            .active_sessions
            .set(self.service.sessions().active_count() as i64);
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the API router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .route("/vaults", post(form_handler))
        .route("/vaults/:id", get(vault_info_handler).delete(destroy_handler))
        .route("/vaults/:id/snapshot", get(snapshot_handler))
        .route("/vaults/:id/transactions", get(transactions_handler))
        .route("/owners/:owner/vault", get(owner_vault_handler))
        .route("/vaults/:id/viewers/:viewer/open", post(open_handler))
        .route("/vaults/:id/viewers/:viewer/close", post(close_handler))
        .route("/vaults/:id/viewers/:viewer/actions", post(action_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub vaults: usize,
    /// Vaults with at least one open view.
    pub active_sessions: usize,
    pub open_viewers: usize,
    pub timestamp: String,
}

/// Body of `POST /vaults`.
#[derive(Debug, Serialize, Deserialize)]
pub struct FormRequest {
    pub owner: OwnerId,
    pub created_by: ActorId,
    pub location: Location,
    #[serde(default)]
    pub orientation: Orientation,
    /// Id to give the vault; generated when absent.
    #[serde(default)]
    pub vault_id: Option<VaultId>,
}

/// Body of `DELETE /vaults/:id`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub requester: ActorId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DestroyResponse {
    pub vault_id: VaultId,
    /// Stacks to drop at the vault's location.
    pub ejected: Vec<ItemStack>,
    pub transactions_removed: usize,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "first_page")]
    pub page: usize,
}

fn first_page() -> usize {
    1
}

/// Body of `POST .../open`.
#[derive(Debug, Serialize, Deserialize)]
pub struct OpenRequest {
    pub permissions: Permissions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenResponse {
    pub vault_id: VaultId,
    pub viewer: ActorId,
    pub permissions: Permissions,
    pub slots: Vec<SlotContent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseResponse {
    /// Whether this was the vault's last viewer.
    pub last_viewer: bool,
}

/// Body of `POST .../actions`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionRequest {
    pub slot: usize,
    pub kind: ActionKind,
    #[serde(default)]
    pub held_amount: u32,
    #[serde(default)]
    pub held_max_stack: u32,
    #[serde(default)]
    pub incoming: Option<ItemStack>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failed request: status code plus the message shown to the caller.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(error: VaultError) -> Self {
        let status = match &error {
            VaultError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            VaultError::Conflict { .. }
            | VaultError::AlreadyExists { .. }
            | VaultError::DuplicateVault(_) => StatusCode::CONFLICT,
            VaultError::VaultNotFound(_) | VaultError::SlotNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            VaultError::InvalidAction(_) | VaultError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            VaultError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %error, "vault request failed");
        }
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Runs a vault call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> VaultResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("vault task failed: {e}")))?
        .map_err(ApiError::from)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`.
async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let service = Arc::clone(&state.service);
    let vaults = blocking(move || service.vault_count()).await?;
    Ok(Json(StatusResponse {
        version: state.version.clone(),
        vaults,
        active_sessions: state.service.sessions().active_count(),
        open_viewers: state.viewers.len(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

/// `POST /vaults`.
async fn form_handler(
    State(state): State<AppState>,
    Json(req): Json<FormRequest>,
) -> Result<(StatusCode, Json<Vault>), ApiError> {
    let service = Arc::clone(&state.service);
    let event = FormationEvent {
        candidate_vault_id: req.vault_id.unwrap_or_default(),
        owner_id: req.owner,
        created_by: req.created_by,
        location: req.location,
        orientation: req.orientation,
    };
    let vault = blocking(move || service.form(event)).await?;
    state.metrics.vaults_formed_total.inc();
    Ok((StatusCode::CREATED, Json(vault)))
}

/// `GET /vaults/:id`.
async fn vault_info_handler(
    Path(vault_id): Path<VaultId>,
    State(state): State<AppState>,
) -> Result<Json<VaultInfo>, ApiError> {
    let service = Arc::clone(&state.service);
    Ok(Json(blocking(move || service.info(vault_id)).await?))
}

/// `DELETE /vaults/:id`.
///
/// Handles still held for the vault are dropped; their viewers get
/// "not found" on their next call.
async fn destroy_handler(
    Path(vault_id): Path<VaultId>,
    State(state): State<AppState>,
    Json(req): Json<DestroyRequest>,
) -> Result<Json<DestroyResponse>, ApiError> {
    let service = Arc::clone(&state.service);
    let confirmation = DestructionConfirmation {
        vault_id,
        requester_id: req.requester,
    };
    let destruction = blocking(move || service.destroy(confirmation)).await?;

    state.viewers.retain(|(id, _), _| *id != vault_id);
    state.metrics.vaults_destroyed_total.inc();
    state.update_session_gauge();

    Ok(Json(DestroyResponse {
        vault_id,
        ejected: destruction.contents.items().cloned().collect(),
        transactions_removed: destruction.transactions_removed,
    }))
}

/// `GET /vaults/:id/snapshot`.
async fn snapshot_handler(
    Path(vault_id): Path<VaultId>,
    State(state): State<AppState>,
) -> Result<Json<VaultSnapshot>, ApiError> {
    let service = Arc::clone(&state.service);
    let snapshot = blocking(move || {
        service.vault(vault_id)?;
        service.snapshot(vault_id)
    })
    .await?;
    Ok(Json(snapshot))
}

/// `GET /vaults/:id/transactions?page=N`.
async fn transactions_handler(
    Path(vault_id): Path<VaultId>,
    Query(query): Query<PageQuery>,
    State(state): State<AppState>,
) -> Result<Json<TransactionPage>, ApiError> {
    let service = Arc::clone(&state.service);
    let page = blocking(move || {
        service.vault(vault_id)?;
        service.transactions_page(vault_id, query.page)
    })
    .await?;
    Ok(Json(page))
}

/// `GET /owners/:owner/vault`.
async fn owner_vault_handler(
    Path(owner): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vault>, ApiError> {
    let service = Arc::clone(&state.service);
    let owner = OwnerId::new(owner);
    let lookup = owner.clone();
    blocking(move || service.vault_for_owner(&lookup))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("{owner} does not have a vault")))
}

/// `POST /vaults/:id/viewers/:viewer/open`.
async fn open_handler(
    Path((vault_id, viewer)): Path<(VaultId, ActorId)>,
    State(state): State<AppState>,
    Json(req): Json<OpenRequest>,
) -> Result<Json<OpenResponse>, ApiError> {
    let service = Arc::clone(&state.service);
    let viewers = Arc::clone(&state.viewers);
    let metrics = Arc::clone(&state.metrics);
    let response = blocking(move || {
        let handle = service.open(vault_id, viewer, req.permissions).map_err(|e| {
            metrics.record_error(&e);
            e
        })?;
        let response = OpenResponse {
            vault_id,
            viewer,
            permissions: handle.permissions(),
            slots: handle.view().contents(),
        };
        // Release the previous handle only after the new one holds the view.
        if let Some(previous) = viewers.insert((vault_id, viewer), handle) {
            service.close(previous)?;
        }
        Ok(response)
    })
    .await?;
    state.update_session_gauge();
    Ok(Json(response))
}

/// `POST /vaults/:id/viewers/:viewer/close`.
async fn close_handler(
    Path((vault_id, viewer)): Path<(VaultId, ActorId)>,
    State(state): State<AppState>,
) -> Result<Json<CloseResponse>, ApiError> {
    let (_, handle) = state
        .viewers
        .remove(&(vault_id, viewer))
        .ok_or_else(|| ApiError::not_found(format!("{viewer} has no view of {vault_id}")))?;
    let service = Arc::clone(&state.service);
    let last_viewer = blocking(move || service.close(handle)).await?;
    state.update_session_gauge();
    Ok(Json(CloseResponse { last_viewer }))
}

/// `POST /vaults/:id/viewers/:viewer/actions`.
async fn action_handler(
    Path((vault_id, viewer)): Path<(VaultId, ActorId)>,
    State(state): State<AppState>,
    Json(req): Json<ActionRequest>,
) -> Result<Json<ActionOutcome>, ApiError> {
    if !state.viewers.contains_key(&(vault_id, viewer)) {
        return Err(ApiError::not_found(format!(
            "{viewer} has no view of {vault_id}"
        )));
    }

    let mut action = ViewerAction::new(vault_id, viewer, req.slot, req.kind)
        .holding(req.held_amount, req.held_max_stack);
    action.incoming = req.incoming;

    let service = Arc::clone(&state.service);
    let viewers = Arc::clone(&state.viewers);
    let metrics = Arc::clone(&state.metrics);
    let outcome = blocking(move || {
        let handle = viewers
            .get(&(vault_id, viewer))
            .ok_or(VaultError::VaultNotFound(vault_id))?;
        let started = Instant::now();
        let result = service.act(handle.value(), &action);
        metrics
            .action_latency_seconds
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(outcome) => metrics.record_outcome(outcome),
            Err(e) => metrics.record_error(e),
        }
        result
    })
    .await?;
    Ok(Json(outcome))
}

/// `GET /ws`. Pushes every [`guildvault::VaultEvent`] as JSON text. Client
/// messages are ignored.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let mut rx = state.service.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to serialize vault event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "ws subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
