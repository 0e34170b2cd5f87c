// In src/main.rs

// Declare modules
pub mod config;
pub mod error;
pub mod kms;
pub mod os;
pub mod render;
pub mod sync;
pub mod teardown;

use crate::{
    config::Config,
    kms::{bind, enumerate, DeviceHandle},
    os::signals::{install_interrupt_handler, CancelToken},
    render::drive_outputs,
    teardown::teardown,
};

// Logging
use anyhow::Context; // For context on Results
use log::{error, info, warn};

/// Main entry point for the `kmsflip` application.
fn main() -> anyhow::Result<()> {
    // Initialize the logger. Default filter is "info" if RUST_LOG is not set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    info!("Starting kmsflip...");

    // --- Configuration ---
    let config = Config::load().context("Failed to load configuration")?;
    info!(
        "Configuration: card{}, {:?} sync, pattern {:?}",
        config.device.card_index, config.sync.strategy, config.render.pattern
    );

    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel).context("Failed to install SIGINT/SIGTERM handlers")?;

    // --- Device and outputs ---
    let handle = DeviceHandle::open(config.device.card_index).with_context(|| {
        format!(
            "Failed to open display device card{}",
            config.device.card_index
        )
    })?;
    let outputs = enumerate(&handle).context("Failed to enumerate outputs")?;
    if outputs.is_empty() {
        info!("No connected outputs; nothing to render.");
        return Ok(());
    }

    // --- Bind ---
    // Only successfully bound sets are torn down if a later bind fails.
    let mut sets = Vec::with_capacity(outputs.len());
    for output in outputs {
        match bind(&handle, output, config.settle()) {
            Ok(set) => sets.push(set),
            Err(e) => {
                error!("Binding CRTC {} failed: {}", output.crtc_id, e);
                teardown(&handle, sets);
                return Err(e).with_context(|| {
                    format!(
                        "Failed to bind connector {} to CRTC {}",
                        output.connector_id, output.crtc_id
                    )
                });
            }
        }
    }

    // --- Render ---
    let results = drive_outputs(&handle, &mut sets, &config, &cancel);
    let report = teardown(&handle, sets);

    let mut first_error = None;
    for result in results {
        match result {
            Ok(stats) => info!(
                "Output finished: {} frames presented, {} dropped",
                stats.presented, stats.dropped
            ),
            Err(e) => {
                error!("Render loop failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
    }
    if !report.is_clean() {
        warn!("Display state may not be fully restored: {:?}", report);
    }
    if let Some(e) = first_error {
        return Err(e).context("Render loop aborted");
    }

    info!("kmsflip exited cleanly.");
    Ok(())
}
