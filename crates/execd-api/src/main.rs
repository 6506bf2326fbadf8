//! execd-api entry point. Thin by design: load config, build the shared
//! state, wire middleware, serve. Route handlers live in `routes.rs`; shared
//! state lives in `state.rs`. The worker loop is a separate process
//! (`execd-worker`) sharing this store, not embedded here.

use std::net::SocketAddr;

use anyhow::Context;
use execd_api::{routes, state::AppState};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = execd_config::Config::from_env().context("loading configuration")?;
    let pool = execd_db::connect_from_env()
        .await
        .context("connecting to database")?;
    execd_db::migrate(&pool).await.context("running migrations")?;
    execd_db::strict_check(&pool)
        .await
        .context("strict schema check failed")?;

    let shared = AppState::new(pool, config).context("building shared state")?;

    let app = routes::build_router(shared).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));
    info!("execd-api listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("EXECD_API_ADDR").ok()?.parse().ok()
}
