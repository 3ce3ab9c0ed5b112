mod config;
mod handlers;
mod offers;
mod state;

use crate::config::SchedulerConfig;
use crate::state::AppState;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,common=debug,tower_http=info")),
        )
        .init();

    let config = SchedulerConfig::from_env();
    info!(
        "config: ofertas cada {:?}, timeout de agentes {:?}",
        config.offer_interval, config.agent_timeout
    );

    let state = AppState::new(config);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // loop de ofertas en segundo plano
    let offers_state = state.clone();
    tokio::spawn(async move {
        offers::run_offer_loop(offers_state).await;
    });

    let listener = TcpListener::bind(&state.config.bind_addr).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await
}
