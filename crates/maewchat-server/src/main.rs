use std::net::SocketAddr;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

mod routes;

use routes::AppStateInner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maewchat_server=debug,maewchat_client=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let host = std::env::var("MAEWCHAT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("MAEWCHAT_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Missing credentials are reported per request, not at start-up
    let state = AppStateInner::from_env();

    let app = routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Maewchat server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
