pub mod api;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod passages;
pub mod registry;
pub mod results;
pub mod room;
pub mod store;
pub mod tracker;
pub mod ws;

use axum::{
    routing::{get, patch, post},
    Router,
};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{
    task::JoinHandle,
    time::{interval, Duration, Instant, MissedTickBehavior},
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::registry::RoomRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
}

/// REST and WebSocket routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/rooms", post(api::create_room))
        .route("/rooms/:code", get(api::get_room))
        .route("/rooms/:code/join", post(api::join_room))
        .route("/rooms/:code/leave", post(api::leave_room))
        .route("/rooms/:code/settings", patch(api::update_settings))
        .route(
            "/rooms/:code/results",
            get(api::get_results).post(api::submit_results),
        )
        .route("/passages", get(api::get_passage))
        .route("/ws", get(ws::ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Drives countdowns, race deadlines, progress flushes and eviction for every room.
pub fn spawn_ticker(registry: Arc<RoomRegistry>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            registry.tick_all(Instant::now()).await;
        }
    })
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
