use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use blobhouse::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = ServerConfig::from_env().apply_args(&args);

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "blobhouse",
        "blobhouse starting: RUST_LOG='{}', bind={}, http_port={}, storage_root='{}'",
        rust_log,
        config.bind_addr,
        config.http_port,
        config.storage_root.display()
    );

    blobhouse::server::run(config).await
}
