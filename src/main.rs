//! Optiscan: scan one optical code from a live camera and hand it off

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use optiscan::capture;
use optiscan::decode::QrDecoder;
use optiscan::utils;
use optiscan::{ChannelSink, ScanSession};

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("optiscan=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Optiscan launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = optiscan::load_config(config_path.as_deref())?;

    // Auto-detect capture device if needed
    if config.capture.device.path.is_empty() {
        config.capture.device = utils::auto_detect_device()?;
    }
    optiscan::CONFIG.store(Arc::new(config));
    let config = optiscan::CONFIG.load_full();

    info!("Using capture device: {:?}", config.capture.device);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.scanner.decode_workers.max(1))
        .thread_name("decode-worker")
        .enable_all()
        .build()?;
    let _guard = runtime.enter();

    let (sink, outcomes) = ChannelSink::new();
    let session = ScanSession::new(
        config.scanner.clone(),
        capture::open_source(&config.capture)?,
        Arc::new(QrDecoder::new()),
        Arc::new(sink),
        capture::permission_for(&config.capture),
    )?;
    session.activate()?;

    let outcome = runtime.block_on(async {
        tokio::select! {
            outcome = outcomes.recv_async() => outcome.ok(),
            _ = tokio::signal::ctrl_c() => None,
        }
    });

    // Host lifecycle ends here whether or not a code was found
    session.deactivate();
    info!("Scan stats: {:?}", session.stats());

    match outcome {
        // Record lookup keyed by the payload happens downstream
        Some(Ok(payload)) => info!("Scanned payload: {}", payload),
        Some(Err(e)) => return Err(e.into()),
        None => warn!("Scan cancelled before a code was found"),
    }

    info!("Optiscan shutting down");
    Ok(())
}
