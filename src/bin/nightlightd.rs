use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use nightlight_controller::http::{router, AppState};
use nightlight_controller::*;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::EnvFilter;

/// Schedule daemon: runs the alarm loop and serves the configuration form
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration
    #[arg(short, long)]
    listen: Option<String>,

    /// Store image, overrides the configuration
    #[arg(short, long)]
    store: Option<PathBuf>,
}

type Controller = ScheduleController<SystemClock, FileStore, Box<dyn OutputDriver + Send>>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("nightlight_controller=info,nightlightd=info")),
        )
        .compact()
        .init();

    color_eyre::install()?;

    let args = Args::parse();
    debug!("Parsed command line arguments: {:?}", args);

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(store) = args.store {
        config.store_path = store;
    }
    config.validate()?;

    let controller = Arc::new(Mutex::new(build_controller(&config)?));

    let ticker = tokio::spawn(run_ticks(
        Arc::clone(&controller),
        Duration::from_secs(config.tick_interval_secs),
    ));

    let app = router(
        AppState::new(controller, &config.gatekeeper).with_debug_page(config.debug_page),
    );
    if config.debug_page {
        warn!("Debug page enabled at /debug");
    }
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .wrap_err_with(|| format!("binding {}", config.listen))?;
    info!("Listening on {}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ticker.abort();
    info!("Stopped");
    Ok(())
}

/// Builds the adapters and restores the stored schedule
#[instrument(skip(config))]
fn build_controller(config: &Config) -> Result<Controller> {
    let driver = config.build_driver()?;
    let store = FileStore::new(&config.store_path);
    let mut controller = ScheduleController::new(
        SystemClock::new(config.utc_offset_secs),
        store,
        driver,
        config.utc_offset_secs,
    )
    .with_address(config.store_address);

    controller.clock_mut().sync();
    if controller.restore_from_store().is_none() {
        info!("Serving the configuration form until a schedule is set");
    }
    Ok(controller)
}

async fn run_ticks(controller: Arc<Mutex<Controller>>, period: Duration) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let fired = controller.lock().tick();
        if !fired.is_empty() {
            debug!("Fired {:?}", fired);
        }
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // without a signal handler, run until killed
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
