#![deny(warnings)]

use anyhow::Context;
use persistence::default_sqlite_url;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let url = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TELEMETRY_DB_URL").ok())
        .unwrap_or_else(|| default_sqlite_url().to_string());

    // Ensure the parent directory of a file-backed database exists.
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .and_then(|rest| rest.split('?').next())
        .filter(|path| !path.is_empty() && !path.contains(":memory:"));
    if let Some(path) = path {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
    }

    let pool = persistence::init_db(&url)
        .await
        .with_context(|| format!("migrating {url}"))?;
    let tracked = persistence::list_tracked(&pool).await?;
    info!(url = %url, tracked = tracked.len(), "database migrated");
    Ok(())
}
