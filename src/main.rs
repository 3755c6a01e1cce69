//! tiered-swap: standalone node serving a tiered store over HTTP.
//!
//! Runs one string-keyed cache space backed by the in-process off-heap
//! region and the disk swap space, and exposes it through the admin API.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use tiered_swap::config::{Cli, Config};
use tiered_swap::context::StoreContext;
use tiered_swap::engine::region::MemoryRegion;
use tiered_swap::engine::swap_file::FileSwapSpace;
use tiered_swap::metrics::PrometheusEvents;
use tiered_swap::server::admin_api::{build_router, AppState};
use tiered_swap::TieredStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "tiered_swap=debug,tower_http=debug"
    } else {
        "tiered_swap=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("tiered-swap v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    info!(
        space = %config.store.space_name,
        memory_mode = ?config.store.memory_mode,
        offheap_max_memory = config.store.offheap_max_memory,
        partitions = config.store.partitions,
        swap_path = %config.swap.path.display(),
        "Configuration loaded"
    );

    // Engines.
    let region = Arc::new(MemoryRegion::new(config.eviction.clone()));
    let swap = Arc::new(FileSwapSpace::from_config(&config.swap)?);

    // Store.
    let metrics = Arc::new(PrometheusEvents::new()?);
    let ctx = StoreContext::<String, String>::standalone(config.store.partitions).with_events(metrics.clone());
    let store = TieredStore::start(&config.store, config.swap.enabled, ctx, region, swap)?;

    info!(selection = ?store.selection(), "Store ready");

    // Build the HTTP router.
    let state = Arc::new(AppState::new(Arc::new(store), metrics));
    let app = build_router(state).layer(TraceLayer::new_for_http());

    // Start the server.
    let listen_addr = cli.listen.unwrap_or(config.server.listen);
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
