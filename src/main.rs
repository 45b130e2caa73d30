use std::net::SocketAddr;

use modelgate::config::Config;
use modelgate::{api, backends, observability};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("modelgate: {e}");
            std::process::exit(1);
        }
    };
    observability::init_tracing(config.debug);

    let backend = match backends::build(&config) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("modelgate: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = backend.probe().await {
        eprintln!("modelgate: {} liveness check failed: {e}", backend.name());
        std::process::exit(1);
    }
    tracing::info!(backend = backend.name(), "backend ready");

    let state = api::AppState::new(backend, &config);
    let app = api::router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("modelgate listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
