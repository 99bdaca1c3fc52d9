//! HTTP API Server
//!
//! Read-only REST view of a node's membership state.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::state::{Leader, NodeAddress, RemoteNode, RingLink, SharedContext};

/// Shared application state
pub struct AppState {
    pub context: SharedContext,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, context: SharedContext) -> Self {
        let state = Arc::new(AppState {
            context,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
        });
        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/cluster/nodes", get(handle_nodes))
            .route("/cluster/ring", get(handle_ring))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `cancel` fires
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| Error::Bind {
                address: self.config.bind_address.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub is_leader: bool,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub address: NodeAddress,
    pub leader: Option<Leader>,
    pub is_leader: bool,
    pub neighbour: Option<RemoteNode>,
    pub joined: bool,
    pub election_in_progress: bool,
    pub cluster_size: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
}

/// One known node
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: NodeAddress,
    pub role: String,
    /// Only reported by the leader
    pub last_heartbeat_ms: Option<u64>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.context.snapshot().await;
    Json(HealthResponse {
        healthy: snapshot.joined,
        node_id: snapshot.node_id.to_string(),
        is_leader: snapshot.is_leader,
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.context.snapshot().await;
    Json(StatusResponse {
        node_id: snapshot.node_id.to_string(),
        address: snapshot.address,
        leader: snapshot.leader,
        is_leader: snapshot.is_leader,
        neighbour: snapshot.neighbour,
        joined: snapshot.joined,
        election_in_progress: snapshot.election_in_progress,
        // Known peers plus this node
        cluster_size: snapshot.nodes.len() + 1,
        started_at: state.started_at_utc,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.context.snapshot().await;
    let alive = snapshot.alive.unwrap_or_default();

    let mut nodes = vec![NodeEntry {
        address: snapshot.address,
        role: role(snapshot.is_leader).to_string(),
        last_heartbeat_ms: None,
    }];
    nodes.extend(snapshot.nodes.iter().map(|node| NodeEntry {
        address: *node,
        role: role(snapshot.leader == Some(*node)).to_string(),
        last_heartbeat_ms: alive
            .iter()
            .find(|entry| entry.node == *node)
            .map(|entry| entry.last_heartbeat_ms),
    }));

    Json(nodes)
}

async fn handle_ring(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match state.context.snapshot().await.ring {
        Some(ring) => Json::<Vec<RingLink>>(ring).into_response(),
        None => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "Ring links are only known to the leader".to_string(),
                code: "NOT_LEADER".to_string(),
            }),
        )
            .into_response(),
    }
}

fn role(is_leader: bool) -> &'static str {
    if is_leader {
        "leader"
    } else {
        "member"
    }
}
