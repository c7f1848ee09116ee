pub mod error;
pub mod routes;

pub use routes::{create_router, AppState};

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Settings;
use crate::core::CrmCli;

/// Serves the API until Ctrl-C, then aborts any migration pollers.
pub async fn run_server(settings: Settings, port: u16) -> anyhow::Result<()> {
    let source = Arc::new(CrmCli::from_settings(&settings.cluster));
    let state = Arc::new(AppState::new(source, settings.migration.clone()));

    if let Err(e) = state.store.refresh().await {
        // keep serving, the next request retries
        warn!(error = %e, "initial inventory build failed");
    }

    let app = create_router(state.clone(), &settings.server.api_prefix);
    let addr = format!("{}:{}", settings.server.host, port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for shutdown signal");
            }
            info!("shutting down");
        })
        .await?;

    state.migrations.shutdown();
    Ok(())
}
