// SPDX-License-Identifier: GPL-3.0-only

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use crate::cli::Cli;
use crate::config::Settings;
use crate::engine::{CycleOutcome, Engine, EngineState};
use crate::monitor::SystemDisplays;
use crate::permissions::SystemGrantor;
use crate::service::SystemServices;

#[macro_use]
extern crate tracing;

mod cli;
mod config;
mod engine;
mod error;
mod hotplug;
mod monitor;
mod permissions;
mod service;
mod sync;
#[cfg(test)]
mod testing;

/// Pending topology notifications kept while a cycle runs
const NOTIFICATION_QUEUE: usize = 16;

fn setup_logs() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = fmt::layer().with_target(false);
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(format!(
        "warn,{}=info",
        env!("CARGO_CRATE_NAME")
    )));

    #[cfg(target_os = "linux")]
    if let Ok(journal_layer) = tracing_journald::layer() {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(journal_layer)
            .init();
        return;
    }

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logs();

    let mut settings = Settings::load(cli.settings.as_deref()).context("failed to load settings")?;
    cli.apply(&mut settings);
    settings.validate()?;

    let config_path = settings.resolve_config_path()?;
    config::check_install_root(&config_path)?;

    info!(
        target_adapter = %settings.target,
        service = %settings.service,
        config = %config_path.display(),
        "Starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut engine = Engine::new(
        SystemDisplays,
        SystemServices::new(settings.service_scope),
        SystemGrantor,
        settings.engine_settings(config_path.clone()),
        shutdown_rx,
    );

    if cli.once {
        match engine.startup().await {
            CycleOutcome::EnumerationFailed(e) => return Err(e.into()),
            CycleOutcome::Reconciled(report) if !report.is_complete() => {
                anyhow::bail!("reconcile for {} did not complete", report.identifier)
            }
            _ => {}
        }
        if let EngineState::Resolved(identifier) = engine.state() {
            if let Ok(Some(value)) = sync::get_key(&config_path, sync::OUTPUT_NAME_KEY) {
                info!(identifier = %identifier, "{} = {}", sync::OUTPUT_NAME_KEY, value);
            }
        }
        return Ok(());
    }

    // Subscribe before the startup cycle so no change in between is missed
    let events = hotplug::subscribe(NOTIFICATION_QUEUE)
        .context("failed to subscribe to display changes")?;

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    engine.run(events).await;
    info!("Stopped");
    Ok(())
}
