use anyhow::Context;
use tracing::info;

use onerelay_core::bootstrap_from_env;
use onerelay_router::app_router;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("onerelay failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let boot = bootstrap_from_env().await?;
    let bind = {
        let global = boot.state.global.load();
        format!("{}:{}", global.host, global.port)
    };
    let app = app_router(&boot);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    // Pending batched quota deltas would otherwise be lost on exit.
    match boot.engine.ledger().flush().await {
        Ok(entries) => info!(entries, "ledger flushed on shutdown"),
        Err(err) => eprintln!("ledger flush on shutdown failed: {err}"),
    }
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("onerelay=info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
