use std::sync::Arc;

use maewchat_client::{PublicClient, PublicConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so they do not interleave with the chat on stdout
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maewchat=info,maewchat_app=info,maewchat_client=warn".into()),
        )
        .init();

    let config = PublicConfig::from_env()?;
    // The views share any backend through `Arc<B>`; for this client that is
    // one extra pointer around its own shared state.
    let client = Arc::new(PublicClient::new(config)?);

    maewchat_app::terminal::run(client).await
}
