// siteharvest server: database-backed crawling, extraction and analysis.
//
// Hosts a fleet of worker threads coordinated through a shared SQLite store.
// The command channel attaches to `server::Server`; this binary runs the
// control loop until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use siteharvest::db::Database;
use siteharvest::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,siteharvest=debug")),
        )
        .init();

    let db_path: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SITEHARVEST_DB").ok())
        .unwrap_or_else(|| "siteharvest.sqlite".to_owned())
        .into();

    tracing::info!(path = %db_path.display(), "opening database");

    let db = Database::open(&db_path)
        .await
        .context("could not open the database")?;

    let server = Server::new(db, tokio::runtime::Handle::current())
        .await
        .context("could not bring up the server")?;

    tracing::info!("server ready");

    server.run().await?;

    Ok(())
}
