use anyhow::Context;
use nostr_relay::{Database, DatabaseConfig, RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "nostr_relay=info".into()))
        .json()
        .init();

    let config = RelayConfig::load().context("loading relay configuration")?;
    let db_path = std::env::var("NOSTR_RELAY_DB").unwrap_or_else(|_| "nostr-relay.sqlite3".to_string());
    let database = Database::new(DatabaseConfig { path: db_path.into(), max_pool_size: 16 }).context("opening event store")?;

    let server = RelayServer::new(config, database);
    server.start().await.context("relay server exited")?;
    Ok(())
}
