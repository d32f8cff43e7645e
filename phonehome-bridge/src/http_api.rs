//! Inbound listener for VM phone-home callbacks.
//!
//! Provides:
//! - `POST <connectivity path>` (default `/phonehome`) - hostname taken from the body
//! - `POST <metadata path>` (default `/metadata`) - hostname taken from the `Hostname` header
//! - `GET /wait/{kind}/{token}` - long-poll wait for test processes running elsewhere
//!
//! A callback is acknowledged as soon as it is structurally valid. Whether a
//! test was waiting for it never changes the response the VM sees.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::bus::NotificationBus;
use crate::registry::RegistryError;
use crate::waiter::WaitOutcome;
use phonehome_common::config::WAIT_PATH_PREFIX;
use phonehome_common::{
    BridgeConfig, Callback, CallbackKind, CorrelationToken, HostnameExtractor, TransactionId,
};

/// Optional tracing header, echoed on every callback response.
pub static TRANSACTION_ID_HEADER: HeaderName = HeaderName::from_static("transactionid");
/// Header carrying the VM hostname on metadata callbacks.
pub static HOSTNAME_HEADER: HeaderName = HeaderName::from_static("hostname");

pub const INTERNAL_ERROR_BODY: &str = "internal server error";
pub const INVALID_DATA_BODY: &str = "invalid data received";

/// Shared state for HTTP handlers.
#[derive(Clone, Debug)]
pub struct ListenerState {
    pub bus: NotificationBus,
    pub extractor: HostnameExtractor,
    /// Upper bound for reading one request body.
    pub read_timeout: Duration,
    pub max_body_bytes: usize,
    /// Default and ceiling for remote waits.
    pub wait_timeout: Duration,
}

impl ListenerState {
    pub fn new(bus: NotificationBus, extractor: HostnameExtractor, config: &BridgeConfig) -> Self {
        Self {
            bus,
            extractor,
            read_timeout: config.read_timeout,
            max_body_bytes: config.max_body_bytes,
            wait_timeout: config.wait_timeout,
        }
    }
}

/// Why a callback request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackRejection {
    #[error("Content-Length required")]
    LengthRequired,
    #[error("invalid Content-Length: {0}")]
    InvalidLength(String),
    #[error("payload of {declared} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { declared: usize, limit: usize },
    #[error("invalid data received: {0}")]
    InvalidData(&'static str),
    #[error("Hostname header required")]
    MissingHostname,
}

impl CallbackRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::LengthRequired => StatusCode::LENGTH_REQUIRED,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidLength(_) | Self::InvalidData(_) | Self::MissingHostname => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    fn body(&self) -> String {
        match self {
            Self::InvalidData(_) => INVALID_DATA_BODY.to_string(),
            other => other.to_string(),
        }
    }
}

/// Create the router serving both callback kinds and remote waits.
pub fn create_router(state: ListenerState, config: &BridgeConfig) -> Router {
    let router = Router::new()
        .route(&config.connectivity_path, post(connectivity_handler))
        .route(&config.metadata_path, post(metadata_handler))
        .route(&format!("{WAIT_PATH_PREFIX}/{{kind}}/{{token}}"), get(wait_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(state));
    with_error_handling(router)
}

/// Request tracing plus panic-to-500 conversion.
pub fn with_error_handling(router: Router) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::custom(panic_response)),
    )
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(detail = %detail, "Callback handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response()
}

async fn connectivity_handler(
    State(state): State<Arc<ListenerState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    handle_callback(&state, CallbackKind::Connectivity, headers, body).await
}

async fn metadata_handler(
    State(state): State<Arc<ListenerState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    handle_callback(&state, CallbackKind::Metadata, headers, body).await
}

async fn handle_callback(
    state: &ListenerState,
    kind: CallbackKind,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let transaction_id = TransactionId::from_header_or_generate(
        headers
            .get(&TRANSACTION_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    );

    let (status, message) = match accept_callback(state, kind, &headers, body, &transaction_id).await {
        Ok(callback) => {
            state.bus.dispatch(callback);
            (StatusCode::OK, "OK".to_string())
        }
        Err(rejection) => {
            warn!(
                %kind,
                %transaction_id,
                status = rejection.status().as_u16(),
                reason = %rejection,
                "Rejected phone-home request"
            );
            (rejection.status(), rejection.body())
        }
    };

    (
        status,
        [(TRANSACTION_ID_HEADER.clone(), transaction_id.to_string())],
        message,
    )
        .into_response()
}

/// Validate the request structurally and build the callback it carries.
async fn accept_callback(
    state: &ListenerState,
    kind: CallbackKind,
    headers: &HeaderMap,
    body: Body,
    transaction_id: &TransactionId,
) -> Result<Callback, CallbackRejection> {
    let declared = declared_length(headers)?;
    if declared > state.max_body_bytes {
        return Err(CallbackRejection::PayloadTooLarge {
            declared,
            limit: state.max_body_bytes,
        });
    }

    let header_token = match kind {
        CallbackKind::Metadata => Some(
            headers
                .get(&HOSTNAME_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(CorrelationToken::new)
                .ok_or(CallbackRejection::MissingHostname)?,
        ),
        CallbackKind::Connectivity => None,
    };

    let bytes = tokio::time::timeout(state.read_timeout, axum::body::to_bytes(body, declared))
        .await
        .map_err(|_| CallbackRejection::InvalidData("timed out reading body"))?
        .map_err(|_| CallbackRejection::InvalidData("body does not match Content-Length"))?;
    if bytes.is_empty() {
        return Err(CallbackRejection::InvalidData("empty body"));
    }
    if bytes.len() < declared {
        return Err(CallbackRejection::InvalidData("body shorter than Content-Length"));
    }

    let payload = String::from_utf8_lossy(&bytes).into_owned();
    let token = match kind {
        CallbackKind::Metadata => header_token,
        CallbackKind::Connectivity => state.extractor.extract(&payload),
    };

    Ok(Callback::new(kind, token, transaction_id.clone(), payload))
}

/// Parse a non-zero `Content-Length`.
fn declared_length(headers: &HeaderMap) -> Result<usize, CallbackRejection> {
    let raw = headers
        .get(header::CONTENT_LENGTH)
        .ok_or(CallbackRejection::LengthRequired)?;
    let text = raw
        .to_str()
        .map_err(|_| CallbackRejection::InvalidLength("<non-ascii>".to_string()))?;
    let length = text
        .trim()
        .parse::<usize>()
        .map_err(|_| CallbackRejection::InvalidLength(text.to_string()))?;
    if length == 0 {
        return Err(CallbackRejection::LengthRequired);
    }
    Ok(length)
}

#[derive(Debug, Deserialize)]
struct WaitParams {
    timeout_secs: Option<u64>,
}

/// Handler for `/wait/{kind}/{token}` - long-poll until the VM calls home.
async fn wait_handler(
    State(state): State<Arc<ListenerState>>,
    Path((kind, token)): Path<(String, String)>,
    Query(params): Query<WaitParams>,
) -> Response {
    let kind = match kind.parse::<CallbackKind>() {
        Ok(kind) => kind,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                .into_response();
        }
    };
    let Some(token) = CorrelationToken::new(token) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "token must not be empty" })),
        )
            .into_response();
    };
    let timeout = params
        .timeout_secs
        .map(Duration::from_secs)
        .map_or(state.wait_timeout, |t| t.min(state.wait_timeout));

    match state.bus.wait(kind, token.clone(), timeout).await {
        Ok(WaitOutcome::Delivered(callback)) => Json(json!({
            "delivered": true,
            "kind": callback.kind,
            "token": token,
            "transaction_id": callback.transaction_id,
            "payload": callback.payload,
            "received_at": callback.received_at.to_rfc3339(),
        }))
        .into_response(),
        Ok(WaitOutcome::TimedOut) => Json(json!({
            "delivered": false,
            "kind": kind,
            "token": token,
        }))
        .into_response(),
        Err(err @ RegistryError::AlreadyRegistered { .. }) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}
