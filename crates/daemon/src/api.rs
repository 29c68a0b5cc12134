// App Proxy - REST API Module
// Handles HTTP API endpoints for configuration and session control

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};

use axum::response::sse::Event;
use axum::response::Sse;
use futures::{stream, StreamExt};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use app_proxy_common::{uri, Error, ProxyConfig, ProxyConfigDraft, ProxyKind, SessionState};

use crate::allowlist::AllowListStore;
use crate::permission::InteractivePermissionBroker;
use crate::session::SessionController;
use crate::store::ConfigStore;

/// Shared application state
pub struct AppState {
    pub store: ConfigStore,
    pub allow_list: AllowListStore,
    pub controller: SessionController,
    /// Present only when permission grants are interactive.
    pub permission: Option<Arc<InteractivePermissionBroker>>,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// API success response
#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

/// A stored configuration as the API exposes it. The password never leaves
/// the daemon; `display_uri` is the redacted form clients may show.
#[derive(Serialize)]
struct ConfigResponse {
    id: i64,
    name: String,
    kind: ProxyKind,
    user: String,
    server: String,
    port: u16,
    selected: bool,
    display_uri: String,
}

impl From<ProxyConfig> for ConfigResponse {
    fn from(config: ProxyConfig) -> Self {
        let display_uri = uri::to_display_uri(&config);
        Self {
            id: config.id,
            name: config.name,
            kind: config.kind,
            user: config.user,
            server: config.server,
            port: config.port,
            selected: config.selected,
            display_uri,
        }
    }
}

#[derive(Serialize)]
struct ConfigsListResponse {
    configs: Vec<ConfigResponse>,
}

#[derive(Serialize, Deserialize)]
struct AppsResponse {
    apps: Vec<String>,
}

#[derive(Serialize)]
struct SessionResponse {
    state: SessionState,
}

#[derive(Serialize)]
struct PermissionStatusResponse {
    pending: bool,
}

#[derive(Deserialize)]
struct PermissionAnswer {
    granted: bool,
}

// Event type
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingEvent {
    Session { state: SessionState },
    Heartbeat { timestamp: DateTime<Utc> },
}

/// Map a domain error to the status code the API reports it with.
fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::NoSelectedConfiguration => StatusCode::CONFLICT,
        Error::PermissionDenied => StatusCode::FORBIDDEN,
        Error::InterfaceUnavailable | Error::EngineStart(_) => StatusCode::BAD_GATEWAY,
        Error::Database(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &Error) -> axum::response::Response {
    (
        status_for(error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/configs", get(list_configs).post(create_config))
        .route(
            "/api/configs/:id",
            get(get_config).put(update_config).delete(delete_config),
        )
        .route("/api/configs/:id/select", post(select_config))
        .route("/api/selected", get(get_selected))
        .route("/api/apps", get(get_apps).put(put_apps))
        .route("/api/session", get(session_status))
        .route("/api/session/start", post(start_session))
        .route("/api/session/stop", post(stop_session))
        .route("/api/session/toggle", post(toggle_session))
        .route("/api/permission", get(permission_status))
        .route("/api/permission", post(answer_permission))
        .route("/api/events", get(event_stream))
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

/// List all stored configurations
async fn list_configs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list().await {
        Ok(configs) => Json(ConfigsListResponse {
            configs: configs.into_iter().map(ConfigResponse::from).collect(),
        })
        .into_response(),
        Err(e) => {
            error!("Failed to list configurations: {}", e);
            error_response(&e)
        }
    }
}

/// Create a configuration
async fn create_config(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<ProxyConfigDraft>,
) -> impl IntoResponse {
    match state.store.insert(&draft).await {
        Ok(id) => match state.store.get(id).await {
            Ok(Some(config)) => {
                info!("Configuration {} created", id);
                (StatusCode::CREATED, Json(ConfigResponse::from(config))).into_response()
            }
            Ok(None) => error_response(&Error::NotFound(id)),
            Err(e) => error_response(&e),
        },
        Err(e) => {
            error!("Failed to create configuration: {}", e);
            error_response(&e)
        }
    }
}

/// Get a single configuration
async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.get(id).await {
        Ok(Some(config)) => Json(ConfigResponse::from(config)).into_response(),
        Ok(None) => error_response(&Error::NotFound(id)),
        Err(e) => error_response(&e),
    }
}

/// Update a configuration's fields (selection is untouched)
async fn update_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(draft): Json<ProxyConfigDraft>,
) -> impl IntoResponse {
    match state.store.update(id, &draft).await {
        Ok(()) => match state.store.get(id).await {
            Ok(Some(config)) => Json(ConfigResponse::from(config)).into_response(),
            Ok(None) => error_response(&Error::NotFound(id)),
            Err(e) => error_response(&e),
        },
        Err(e) => {
            error!("Failed to update configuration {}: {}", id, e);
            error_response(&e)
        }
    }
}

/// Delete a configuration
async fn delete_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.delete(id).await {
        Ok(()) => {
            info!("Configuration {} deleted", id);
            (
                StatusCode::OK,
                Json(SuccessResponse {
                    message: format!("Configuration {} deleted", id),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to delete configuration {}: {}", id, e);
            error_response(&e)
        }
    }
}

/// Make a configuration the selected one
async fn select_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.select(id).await {
        Ok(()) => {
            info!("Configuration {} selected", id);
            (
                StatusCode::OK,
                Json(SuccessResponse {
                    message: format!("Configuration {} selected", id),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to select configuration {}: {}", id, e);
            error_response(&e)
        }
    }
}

/// Get the currently selected configuration
async fn get_selected(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.get_selected().await {
        Ok(Some(config)) => Json(ConfigResponse::from(config)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "No configuration is selected".to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Get the tunnelled-application allow-list
async fn get_apps(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.allow_list.all().await {
        Ok(apps) => Json(AppsResponse { apps }).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Replace the tunnelled-application allow-list
async fn put_apps(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AppsResponse>,
) -> impl IntoResponse {
    match state.allow_list.replace(&body.apps).await {
        Ok(()) => {
            info!("Allow-list replaced ({} entries)", body.apps.len());
            Json(SuccessResponse {
                message: "Allow-list updated".to_string(),
            })
            .into_response()
        }
        Err(e) => {
            error!("Failed to replace allow-list: {}", e);
            error_response(&e)
        }
    }
}

/// Current session state
async fn session_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(SessionResponse {
        state: state.controller.state(),
    })
}

/// Start the proxy session from the selected configuration
async fn start_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("API: Start session request");
    match state.controller.start().await {
        Ok(()) => (
            StatusCode::OK,
            Json(SessionResponse {
                state: state.controller.state(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to start session: {}", e);
            error_response(&e)
        }
    }
}

/// Stop the proxy session
async fn stop_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("API: Stop session request");
    match state.controller.stop().await {
        Ok(()) => (
            StatusCode::OK,
            Json(SessionResponse {
                state: state.controller.state(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to stop session: {}", e);
            error_response(&e)
        }
    }
}

/// Toggle the proxy session
async fn toggle_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("API: Toggle session request");
    match state.controller.toggle().await {
        Ok(()) => (
            StatusCode::OK,
            Json(SessionResponse {
                state: state.controller.state(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to toggle session: {}", e);
            error_response(&e)
        }
    }
}

/// Whether a permission request is waiting for an answer
async fn permission_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pending = state
        .permission
        .as_ref()
        .is_some_and(|broker| broker.is_pending());
    Json(PermissionStatusResponse { pending })
}

/// Answer the outstanding permission request
async fn answer_permission(
    State(state): State<Arc<AppState>>,
    Json(answer): Json<PermissionAnswer>,
) -> impl IntoResponse {
    let Some(broker) = state.permission.as_ref() else {
        return (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "Permission grants are not interactive on this daemon".to_string(),
            }),
        )
            .into_response();
    };

    if broker.answer(answer.granted) {
        (
            StatusCode::OK,
            Json(SuccessResponse {
                message: "Permission answer submitted".to_string(),
            }),
        )
            .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "No pending permission request".to_string(),
            }),
        )
            .into_response()
    }
}

/// GET /api/events  → SSE stream of session state transitions
///
/// The first event carries the state at subscription time so clients never
/// render from nothing; later events follow publication order.
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.controller.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let initial = stream::iter(session_event(subscription.current));

    let transitions = BroadcastStream::new(subscription.rx).filter_map(|msg| async move {
        match msg {
            Ok(session_state) => session_event(session_state),
            Err(lagged) => {
                // The client fell behind the broadcast channel; it will catch
                // up with future transitions.
                tracing::debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    let merged = stream::select(initial.chain(transitions), heartbeat_stream());

    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn session_event(session_state: SessionState) -> Option<Result<Event, Infallible>> {
    match serde_json::to_string(&OutgoingEvent::Session {
        state: session_state,
    }) {
        Ok(json) => Some(Ok(Event::default().data(json))),
        Err(e) => {
            tracing::error!("Failed to serialize session event: {e}");
            None
        }
    }
}

fn heartbeat_stream(
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    match serde_json::to_string(&OutgoingEvent::Heartbeat {
        timestamp: Utc::now(),
    }) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize heartbeat: {e}");
            "{}".to_string()
        }
    }
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use app_proxy_common::FailureReason;
    use futures::StreamExt;

    #[test]
    fn status_codes_map_domain_errors() {
        assert_eq!(
            status_for(&Error::InvalidInput("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&Error::NotFound(7)), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&Error::NoSelectedConfiguration),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::PermissionDenied),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&Error::InterfaceUnavailable),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&Error::EngineStart("boom".to_string())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn config_response_omits_the_password() {
        let config = ProxyConfig {
            id: 3,
            name: "work".to_string(),
            kind: ProxyKind::Socks5,
            user: "alice".to_string(),
            pass: "hunter2".to_string(),
            server: "proxy.example.com".to_string(),
            port: 1080,
            selected: true,
        };
        let json = serde_json::to_string(&ConfigResponse::from(config)).unwrap();

        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"display_uri\":\"proxy.example.com:1080\""));
        assert!(json.contains("\"selected\":true"));
    }

    #[test]
    fn session_events_serialize_with_their_reason() {
        let event = session_event(SessionState::Failed {
            reason: FailureReason::EngineStart {
                message: "relay exited".to_string(),
            },
        });
        assert!(event.is_some());

        let json = serde_json::to_string(&OutgoingEvent::Session {
            state: SessionState::Failed {
                reason: FailureReason::PermissionDenied,
            },
        })
        .unwrap();
        assert!(json.contains("\"type\":\"session\""));
        assert!(json.contains("\"state\":\"failed\""));
        assert!(json.contains("permission_denied"));
    }

    #[tokio::test]
    async fn heartbeat_stream_emits() {
        // With test interval override, we should see a heartbeat well within 1s.
        let mut stream = heartbeat_stream();
        let _evt = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended");

        let json = heartbeat_payload();
        assert!(json.contains("heartbeat"), "heartbeat payload missing marker");
    }
}
