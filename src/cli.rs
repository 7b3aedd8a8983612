// SPDX-License-Identifier: GPL-3.0-only
//! Command line flags; they take precedence over the settings file

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::Settings;

#[derive(Parser, Debug)]
#[command(
    name = "virtual-monitor-helper",
    version,
    about = "Keeps Sunshine's output_name pointed at the virtual display adapter"
)]
pub struct Cli {
    #[arg(long, value_name = "PATH", help = "KDL settings file to load")]
    pub settings: Option<PathBuf>,

    #[arg(long, env = "VMH_TARGET", help = "Description of the adapter to track")]
    pub target: Option<String>,

    #[arg(long, env = "VMH_SERVICE", help = "Service to restart after the config changes")]
    pub service: Option<String>,

    #[arg(
        long,
        env = "VMH_CONFIG_PATH",
        value_name = "PATH",
        help = "Config file holding the output_name key"
    )]
    pub config_path: Option<PathBuf>,

    #[arg(long, value_name = "SECS", help = "Bound on each service state transition")]
    pub service_timeout_secs: Option<u64>,

    #[arg(long, help = "Reconcile once and exit instead of watching for changes")]
    pub once: bool,
}

impl Cli {
    /// Overlay every flag that was given onto `settings`
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(target) = &self.target {
            settings.target = target.clone();
        }
        if let Some(service) = &self.service {
            settings.service = service.clone();
        }
        if let Some(config_path) = &self.config_path {
            settings.config_path = Some(config_path.clone());
        }
        if let Some(secs) = self.service_timeout_secs {
            settings.service_timeout = Duration::from_secs(secs);
        }
    }
}
