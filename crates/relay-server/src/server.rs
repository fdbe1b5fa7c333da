use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_core::ConnectionId;
use relay_engine::subscriptions::CORRELATION_PARAM;
use relay_engine::{resolve_correlation_id, Invocation, Relay, RelayConfig, RelayDeps};
use relay_store::{ConnectionRepo, Database, NotificationRepo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, ClientRegistry};
use crate::config::ServerConfig;
use crate::protocol::{InboundFrame, ResponseEnvelope};
use crate::router;
use crate::sweeper;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ConnectionId, String)>,
    pub heartbeat_interval: Duration,
    /// Parent of every connection and invocation token.
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/notifications", post(publish_handler))
        .route(
            "/notifications/{order_id}",
            get(replay_handler).delete(ack_handler),
        )
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Wire the relay over `db`, bind the listener and spawn the background tasks.
pub async fn start(
    config: ServerConfig,
    relay_config: RelayConfig,
    db: Database,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let client_registry = Arc::new(
        ClientRegistry::new(config.max_send_queue, config.client_timeout).with_shutdown(&shutdown),
    );
    let deps = RelayDeps::new(
        Arc::new(ConnectionRepo::new(db.clone())),
        Arc::new(NotificationRepo::new(db)),
        client_registry.clone(),
    );
    let relay = Arc::new(Relay::new(deps, relay_config));

    let cleanup_relay = Arc::clone(&relay);
    let cleanup = client::start_cleanup_task(
        Arc::clone(&client_registry),
        config.cleanup_interval,
        shutdown.clone(),
        move |connection_id| {
            if let Err(error) = cleanup_relay.unsubscribe(connection_id) {
                tracing::warn!(connection_id = %connection_id, %error, "failed to unsubscribe dead client");
            }
        },
    );
    let sweeper = sweeper::start_sweeper(Arc::clone(&relay), config.purge_interval, shutdown.clone());

    let (msg_tx, msg_rx) = mpsc::channel::<(ConnectionId, String)>(1024);
    let frames = tokio::spawn(process_frames(
        msg_rx,
        Arc::clone(&relay),
        Arc::clone(&client_registry),
        shutdown.clone(),
    ));

    let app_state = AppState {
        relay,
        client_registry,
        message_tx: msg_tx,
        heartbeat_interval: config.heartbeat_interval,
        shutdown: shutdown.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "relay server started");

    let router = build_router(app_state);
    let serve_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router)
            .with_graceful_shutdown(serve_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(%error, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        tasks: vec![server, frames, cleanup, sweeper],
    })
}

/// Handle returned by [`start`]. Keeps background tasks alive until shut down.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting, close live connections and wait for background tasks.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let stopped = futures::future::join_all(self.tasks);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, stopped).await.is_err() {
            tracing::warn!(timeout = ?SHUTDOWN_TIMEOUT, "background tasks did not stop in time");
        }
        tracing::info!("relay server stopped");
    }
}

/// Connect: issue a handle, subscribe if `order_id` was given, then upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let connection_id = ConnectionId::new();
    let rx = state.client_registry.register(connection_id.clone());

    if query.contains_key(CORRELATION_PARAM) {
        let subscribed = resolve_correlation_id(&query, None)
            .and_then(|order_id| state.relay.subscribe(&connection_id, order_id.as_str()));
        if let Err(error) = subscribed {
            state.client_registry.unregister(&connection_id);
            return http_response(router::into_envelope(Err(error)));
        }
    }
    tracing::info!(connection_id = %connection_id, "client connected");

    let failed_state = state.clone();
    let failed_id = connection_id.clone();
    ws.on_failed_upgrade(move |error| {
        tracing::warn!(connection_id = %failed_id, %error, "websocket upgrade failed");
        disconnect(&failed_state, &failed_id);
    })
    .on_upgrade(move |socket| handle_socket(socket, connection_id, rx, state))
}

async fn handle_socket(
    socket: WebSocket,
    connection_id: ConnectionId,
    rx: mpsc::Receiver<String>,
    state: AppState,
) {
    client::handle_ws_connection(
        socket,
        connection_id.clone(),
        rx,
        Arc::clone(&state.client_registry),
        state.heartbeat_interval,
        state.message_tx.clone(),
        state.shutdown.child_token(),
    )
    .await;

    disconnect(&state, &connection_id);
    tracing::info!(connection_id = %connection_id, "client disconnected");
}

/// Drop the client and its subscription row.
fn disconnect(state: &AppState, connection_id: &ConnectionId) {
    state.client_registry.unregister(connection_id);
    if let Err(error) = state.relay.unsubscribe(connection_id) {
        tracing::warn!(connection_id = %connection_id, %error, "failed to unsubscribe");
    }
}

/// Each inbound frame runs as its own task. Its token is a child of the
/// sending client's `closed` token, so a disconnect cancels it.
async fn process_frames(
    mut rx: mpsc::Receiver<(ConnectionId, String)>,
    relay: Arc<Relay>,
    registry: Arc<ClientRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let (connection_id, raw) = tokio::select! {
            () = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        let Some(closed) = registry.closed_token(&connection_id) else {
            tracing::debug!(connection_id = %connection_id, "frame from closed connection dropped");
            continue;
        };
        let relay = Arc::clone(&relay);
        let registry = Arc::clone(&registry);
        let cancel = closed.child_token();
        tokio::spawn(async move {
            let inv = Invocation::from_connection(connection_id.clone(), cancel);
            let envelope = router::route_frame(&relay, &inv, &raw).await;
            if let Err(error) = registry.try_send(&connection_id, envelope.to_json()) {
                tracing::debug!(connection_id = %connection_id, %error, "response not delivered");
            }
        });
    }
}

/// Producer publish without a connection: nobody is excluded from fan-out.
async fn publish_handler(State(state): State<AppState>, body: String) -> Response {
    let inv = Invocation::detached(state.shutdown.child_token());
    let result = match InboundFrame::parse(&body) {
        Ok(frame) => {
            let payload = frame.message.clone().unwrap_or_default();
            router::publish(&state.relay, &inv, frame.order_id(), payload).await
        }
        Err(error) => Err(error),
    };
    http_response(router::into_envelope(result))
}

async fn replay_handler(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Response {
    let inv = Invocation::detached(state.shutdown.child_token());
    http_response(router::into_envelope(
        router::replay(&state.relay, &inv, &order_id).await,
    ))
}

async fn ack_handler(State(state): State<AppState>, Path(order_id): Path<String>) -> Response {
    let inv = Invocation::detached(state.shutdown.child_token());
    http_response(router::into_envelope(router::acknowledge(
        &state.relay,
        &inv,
        &order_id,
    )))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "connections": state.client_registry.count(),
    }))
}

fn http_response(envelope: ResponseEnvelope) -> Response {
    let status =
        StatusCode::from_u16(envelope.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(envelope)).into_response()
}
