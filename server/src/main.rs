use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use typerace_server::{
    app,
    config::Config,
    db,
    passages::{PassageProvider, PgPassages, StaticPassages},
    registry::RoomRegistry,
    results::ResultsAdjudicator,
    room::RoomContext,
    spawn_ticker,
    store::{MemoryResultStore, PgResultStore, ResultStore},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let (passages, store): (Arc<dyn PassageProvider>, Arc<dyn ResultStore>) =
        match &config.database_url {
            Some(url) => {
                let pool = db::connect(url).await?;
                info!("Connected to database");
                (
                    Arc::new(PgPassages::new(pool.clone())),
                    Arc::new(PgResultStore::new(pool)),
                )
            }
            None => {
                warn!("DATABASE_URL not set; using static passages and in-memory results");
                (
                    Arc::new(StaticPassages),
                    Arc::new(MemoryResultStore::default()),
                )
            }
        };

    let adjudicator = Arc::new(ResultsAdjudicator::new(store, config.commit_retries));
    let registry = Arc::new(RoomRegistry::new(RoomContext {
        passages,
        adjudicator,
        timing: config.timing,
    }));

    spawn_ticker(registry.clone(), config.tick_interval);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("Server running on http://{}", config.bind_addr);

    axum::serve(listener, app(AppState { registry })).await?;
    Ok(())
}
