mod auth;
mod channel;
mod config;
mod coordinator;
mod error;
mod models;
mod pending;
mod registry;
mod routes;
mod routing;
mod ws;

use crate::channel::CommandChannel;
use crate::config::{CommandTimeouts, Config};
use crate::coordinator::VmLifecycleCoordinator;
use crate::models::{MemoryVmStore, PgVmStore, VmStore};
use crate::pending::PendingTable;
use crate::registry::AgentRegistry;
use crate::routes::{
    create_vm, exec_vm, health_check, inspect_vm, list_agents, list_vms, start_vm, stop_vm,
};
use crate::routing::RoutingTable;
use axum::http::{StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Extension, Router};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct State {
    pub coordinator: Arc<VmLifecycleCoordinator>,
    pub registry: Arc<AgentRegistry>,
    pub channel: CommandChannel,
    pub routes: Arc<RoutingTable>,
}

impl State {
    pub fn new(store: Arc<dyn VmStore>, timeouts: CommandTimeouts) -> Self {
        let pending = Arc::new(PendingTable::new());
        let registry = Arc::new(AgentRegistry::new(pending.clone()));
        let channel = CommandChannel::new(registry.clone(), pending);
        let routes = Arc::new(RoutingTable::new());
        let coordinator = Arc::new(VmLifecycleCoordinator::new(
            registry.clone(),
            channel.clone(),
            routes.clone(),
            store,
            timeouts,
        ));
        Self {
            coordinator,
            registry,
            channel,
            routes,
        }
    }
}

pub fn app(state: State) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/agents", get(list_agents))
        .route("/agents/connect", get(ws::connect))
        .route("/vms", get(list_vms))
        .route("/vms/create", post(create_vm))
        .route("/vms/exec", post(exec_vm))
        .route("/vms/start/:id", post(start_vm))
        .route("/vms/stop/:id", post(stop_vm))
        .route("/vms/:vmId", get(inspect_vm))
        .fallback(fallback)
        .layer(Extension(state))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn VmStore> = match &config.database_url {
        Some(url) => Arc::new(PgVmStore::connect(url, config.db_pool_size)?),
        None => {
            warn!("DATABASE_URL not set; VM records are kept in memory only");
            Arc::new(MemoryVmStore::new())
        }
    };

    let state = State::new(store.clone(), config.timeouts);
    let records = store.list().await?;
    let bound = state.routes.warm(&records);
    info!(
        "Loaded {} VM record(s), {bound} bound to an agent",
        records.len()
    );

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let server = axum::Server::bind(&addr).serve(app(state).into_make_service());

    info!("Webserver running on http://{addr}");

    let graceful = server.with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    });

    if let Err(e) = graceful.await {
        error!("Shutdown error: {e}");
    }

    Ok(())
}

async fn fallback(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("No route for {uri}"))
}
