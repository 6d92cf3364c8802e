use imagehoster::{router, AppState, Config};
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagehoster=debug,tower_http=info".into()),
        )
        .init();

    let cfg = Config::load()?;
    if cfg.num_workers > 0 {
        // clustering is left to the process supervisor
        tracing::info!(num_workers = cfg.num_workers, "num_workers is ignored");
    }
    let port = cfg.port;
    tracing::info!(service_url = %cfg.service_url, "starting imagehoster");

    let state = AppState::build(cfg).await?;
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "listening");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
