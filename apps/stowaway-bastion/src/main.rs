use std::sync::Arc;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stowaway_bastion::config::Config;
use stowaway_bastion::hub::Hub;
use stowaway_bastion::routes::{self, AppState};
use stowaway_bastion::store::PgStore;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env();

    let store = PgStore::connect(&config.database_url)
        .await
        .context("database")?;
    store.migrate().await.context("migrations")?;

    let addr = config.listen_addr().context("SERVER_ADDR")?;
    let tls = match (&config.tls_cert_file, &config.tls_key_file) {
        (Some(cert), Some(key)) => Some(
            RustlsConfig::from_pem_file(cert, key)
                .await
                .context("load TLS certificate")?,
        ),
        _ => None,
    };

    let state = AppState {
        config,
        store: Arc::new(store),
        hub: Hub::new(),
    };
    let app = routes::router(state);

    match tls {
        Some(tls) => {
            info!(%addr, "stowaway-bastion listening (TLS)");
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await
                .context("server")?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .context("bind listener")?;
            info!(%addr, "stowaway-bastion listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("server")?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
