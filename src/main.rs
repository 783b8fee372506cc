use std::fs::File;
use std::io::BufWriter;

use anyhow::{Context, Result};
use log::{info, warn};

use muse_lsl::backend::BackendSelector;
use muse_lsl::config::StreamConfig;
use muse_lsl::locator::DeviceLocator;
use muse_lsl::outlet::JsonLinesBus;
use muse_lsl::session::SessionController;
use muse_lsl::status::Status;
use muse_lsl::supervisor::CancelToken;

const USAGE: &str = "usage: muse-lsl [list] [CONFIG.json]";

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=muse_lsl=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Arguments ─────────────────────────────────────────────────────────────
    let mut list_only = false;
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "list" => list_only = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(());
            }
            path => config_path = Some(path.to_string()),
        }
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = match &config_path {
        Some(path) => StreamConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => StreamConfig::default(),
    };

    // Progress lines never share stdout with the bus.
    let status = if list_only || config.output.is_some() {
        Status::stdout()
    } else {
        Status::stderr()
    };

    let selector = BackendSelector::new(config.backend_options());
    let mut locator = DeviceLocator::default()
        .with_product(config.name_prefix.clone())
        .with_status(status.clone());

    if list_only {
        let mut strategy = selector.resolve(config.backend)?;
        locator.discover(&mut strategy, config.scan_timeout()).await?;
        return Ok(());
    }

    // ── Bus ───────────────────────────────────────────────────────────────────
    let bus = match &config.output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            info!("Writing samples to {}", path.display());
            JsonLinesBus::new(BufWriter::new(file))
        }
        None => JsonLinesBus::stdout(),
    }
    .with_clock(config.clock);

    // ── Ctrl-C ────────────────────────────────────────────────────────────────
    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    let interrupt_status = status.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                interrupt_status.line("\nInterrupted by user");
                on_interrupt.cancel();
            }
            Err(e) => warn!("Could not listen for Ctrl-C: {e}"),
        }
    });

    // ── Stream ────────────────────────────────────────────────────────────────
    let mut controller = SessionController::new(selector, locator, Box::new(bus)).with_status(status);
    let outcome = controller.stream(&config.request(), &cancel).await?;
    info!("Done: {outcome:?}");
    Ok(())
}
