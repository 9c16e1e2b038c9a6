//! Client-facing HTTP endpoints.
//!
//! - `GET /increment`: one local increment, broadcast to the cluster.
//! - `GET /count`: `{"count": <i64>}`.
//! - `GET /peers`: `{"peers": [...]}`, this node plus its live peers.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::node::Node;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountBody {
    pub count: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeersBody {
    pub peers: Vec<String>,
}

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/increment", get(increment))
        .route("/count", get(count))
        .route("/peers", get(peers))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

async fn increment(State(node): State<Arc<Node>>) -> &'static str {
    node.increment().await;
    "Counter incremented"
}

async fn count(State(node): State<Arc<Node>>) -> Json<CountBody> {
    Json(CountBody {
        count: node.counter(),
    })
}

async fn peers(State(node): State<Arc<Node>>) -> Json<PeersBody> {
    Json(PeersBody {
        peers: node.peers(),
    })
}
