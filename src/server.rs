//! HTTP/WebSocket server
//!
//! One axum app carries the player WebSocket endpoint, the operator round
//! controls, and the health/metrics surface. Each accepted socket becomes a
//! pump task: inbound text frames go to the gateway, outbound frames drain
//! from the connection's channel. Background tasks (registry sweep,
//! heartbeat, table ticker) run alongside and stop with the server.

use crate::config::DicehallConfig;
use crate::errors::EngineError;
use crate::gateway::{Gateway, Outbound};
use crate::metrics::MetricsRegistry;
use crate::notify::NotificationDispatcher;
use crate::rounds::{Round, RoundMachine, TableTicker};
use crate::settlement::SettlementSummary;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Request, State,
    },
    http::HeaderName,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{signal, sync::mpsc, time::interval};
use tower_http::cors::{Any, CorsLayer, ExposeHeaders};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub machine: Arc<RoundMachine>,
    pub notifier: Arc<NotificationDispatcher>,
    pub metrics: MetricsRegistry,
}

pub struct DicehallServer {
    config: DicehallConfig,
    state: AppState,
    ticker: Arc<TableTicker>,
}

impl DicehallServer {
    pub fn new(config: DicehallConfig, state: AppState, ticker: Arc<TableTicker>) -> Self {
        Self {
            config,
            state,
            ticker,
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let addr = SocketAddr::from((
            self.config.server.host.parse::<std::net::IpAddr>()?,
            self.config.server.port,
        ));
        let app = self.create_app();
        self.spawn_background_tasks();

        info!("starting dicehall table server");
        info!("   listen: http://{}", addr);
        info!("   tables endpoint: /tables/:id/round");
        info!("   websocket: /ws");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        info!("server stopped gracefully");
        Ok(())
    }

    fn create_app(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health))
            .route("/metrics", get(metrics))
            .route("/tables/:table_id/round", get(current_round))
            .route("/tables/:table_id/round/start", post(start_round))
            .route("/tables/:table_id/round/close", post(close_betting))
            .route("/tables/:table_id/round/outcome", post(submit_outcome))
            .route("/tables/:table_id/round/cancel", post(cancel_round))
            .with_state(self.state.clone())
            // Request ID first so every log line can carry it
            .layer(axum::middleware::from_fn(request_id_middleware))
            // CORS before timeout so preflights are answered
            .layer(create_cors_layer(
                self.config.server.allowed_origins.clone(),
            ))
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.server.request_timeout_secs,
            )))
            .layer(TraceLayer::new_for_http())
    }

    fn spawn_background_tasks(&self) {
        self.ticker.clone().spawn();

        let gateway = self.state.gateway.clone();
        let sweep_every = Duration::from_secs(self.config.session.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticks = interval(sweep_every);
            loop {
                ticks.tick().await;
                gateway.sweep();
            }
        });

        let notifier = self.state.notifier.clone();
        let heartbeat_every = Duration::from_secs(self.config.session.heartbeat_interval_secs);
        tokio::spawn(async move {
            let mut ticks = interval(heartbeat_every);
            loop {
                ticks.tick().await;
                notifier.heartbeat();
            }
        });
    }
}

pub fn create_cors_layer(allowed_origins: Vec<String>) -> CorsLayer {
    let expose = ExposeHeaders::list([HeaderName::from_static(REQUEST_ID_HEADER)]);
    if allowed_origins.is_empty() || allowed_origins.contains(&"*".to_string()) {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(expose)
    } else {
        CorsLayer::new()
            .allow_origin(
                allowed_origins
                    .into_iter()
                    .filter_map(|o| o.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers(Any)
            .expose_headers(expose)
    }
}

/// Stamp every request and response with an id for correlation
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    connections: usize,
    authenticated: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        connections: state.gateway.registry().connection_count(),
        authenticated: state.gateway.registry().authenticated_count(),
    })
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.to_prometheus_format()
}

async fn current_round(
    State(state): State<AppState>,
    Path(table_id): Path<u64>,
) -> Result<Json<Round>, EngineError> {
    let round = state
        .machine
        .current_round(table_id)
        .await?
        .ok_or(crate::errors::BusinessError::RoundNotFound(table_id))?;
    Ok(Json(round))
}

#[derive(Debug, Default, Deserialize)]
struct StartRoundBody {
    dealer_id: Option<u64>,
}

async fn start_round(
    State(state): State<AppState>,
    Path(table_id): Path<u64>,
    body: Option<Json<StartRoundBody>>,
) -> Result<Json<Round>, EngineError> {
    let dealer_id = body.and_then(|Json(b)| b.dealer_id);
    let round = state.machine.start_round(table_id, dealer_id).await?;
    Ok(Json(round))
}

async fn close_betting(
    State(state): State<AppState>,
    Path(table_id): Path<u64>,
) -> Result<Json<Round>, EngineError> {
    let round = state.machine.stop_betting(table_id).await?;
    Ok(Json(round))
}

#[derive(Debug, Deserialize)]
struct OutcomeBody {
    round_id: String,
    dice: [u8; 3],
}

async fn submit_outcome(
    State(state): State<AppState>,
    Path(table_id): Path<u64>,
    Json(body): Json<OutcomeBody>,
) -> Result<Json<SettlementSummary>, EngineError> {
    let summary = state
        .machine
        .submit_outcome(table_id, &body.round_id, body.dice)
        .await?;
    Ok(Json(summary))
}

async fn cancel_round(
    State(state): State<AppState>,
    Path(table_id): Path<u64>,
) -> Result<Json<Round>, EngineError> {
    let round = state.machine.cancel_round(table_id).await?;
    Ok(Json(round))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

/// Pump one socket: outbound frames drain from the connection channel,
/// inbound text goes through the gateway, and either side closing ends both
async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let conn_id = state.gateway.on_connect(addr, tx);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(%conn_id, error = %err, "outbound frame serialization failed");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Connection was unregistered (sweep or session replace)
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        state.gateway.handle_frame(conn_id, &text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary and pong frames are ignored
                    Some(Err(err)) => {
                        tracing::debug!(%conn_id, error = %err, "socket error");
                        break;
                    }
                }
            }
        }
    }

    state.gateway.on_disconnect(conn_id);
    let _ = sink.send(Message::Close(None)).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => warn!(error = %err, "failed to install signal handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
