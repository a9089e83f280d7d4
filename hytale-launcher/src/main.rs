//! Hytale launcher entry point.
//!
//! Three modes, decided by argv before anything else runs:
//! `-test` is the smoke-test probe used on freshly downloaded binaries;
//! a signed self-update argument vector turns this process into the update
//! helper; otherwise the launcher app starts normally.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use hytale_lib::build;
use hytale_lib::selfupdate::{self, SelfUpdateArgs};
use hytale_lib::storage::Storage;

mod app;
mod events;
mod refresher;

use app::App;
use events::LogSink;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

fn init_logging() {
    let level = if build::debug_logging() { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() {
    // Smoke-test mode: prove the binary starts and exit clean.
    if std::env::args().skip(1).any(|a| a == "-test") {
        println!("ok");
        return;
    }

    // Self-update helper mode: swap the binary, relaunch, exit.
    if let Some(args) = SelfUpdateArgs::from_env() {
        init_logging();
        let storage = match Storage::resolve() {
            Ok(s) => s,
            Err(err) => {
                log::error!("unable to resolve storage: {:#}", err);
                std::process::exit(1);
            }
        };
        if let Err(err) = selfupdate::run(&args, &storage) {
            log::error!("self-update failed: {:#}", err);
            std::process::exit(1);
        }
        return;
    }

    init_logging();
    log::info!(
        "starting Hytale Launcher: version={} release={} platform={:?}",
        build::VERSION,
        build::RELEASE,
        hytale_lib::build::Platform::current()
    );

    if let Err(err) = run() {
        log::error!("error during app initialization: {:#}", err);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let app = Arc::new(App::new(Arc::new(LogSink))?);
    app.startup()?;

    // Observe a finished self-update from a previous run.
    let storage = Storage::resolve()?;
    if let Ok(Some(note)) = hytale_lib::selfupdate::CleanupNote::read(&storage) {
        log::info!(
            "completed self-update: channel={} old_version={}",
            note.channel,
            note.version
        );
        hytale_lib::selfupdate::CleanupNote::remove(&storage);
    }

    // Hourly soft refresh.
    let refresh_app = app.clone();
    let _refresher = refresher::Refresher::start(REFRESH_INTERVAL, move || {
        let app = refresh_app.clone();
        async move { app.soft_refresh().await }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    Ok(())
}
