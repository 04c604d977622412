/// Taskgate - authentication and authorization core
///
/// Accounts, sessions, second factor, global roles and per-project access
/// for a multi-tenant project tracker.

mod account;
mod api;
mod auth;
mod config;
mod context;
mod db;
mod error;
mod guard;
mod jobs;
mod permissions;
mod projects;
mod second_factor;
mod server;
mod store;
mod token;

use config::{ServerConfig, DEFAULT_LOG_FILTER};
use context::AppContext;
use error::GateResult;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> GateResult<()> {
    // Load configuration first: it decides the log format
    let config = ServerConfig::from_env()?;

    let json = config.logging.json;
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();

    print_banner();

    let ctx = AppContext::new(config).await?;
    ctx.bootstrap().await?;
    info!("Services ready");

    // Start background jobs
    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::new(ctx.clone())));
    scheduler.start();

    server::serve(ctx).await?;

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  _            _                   _
 | |_ __ _ ___| | ____ _  __ _| |_ ___
 | __/ _` / __| |/ / _` |/ _` | __/ _ \
 | || (_| \__ \   < (_| | (_| | ||  __/
  \__\__,_|___/_|\_\__, |\__,_|\__\___|
                   |___/
        Auth core v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
