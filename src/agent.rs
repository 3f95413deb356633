use anyhow::Result;
use serde::Deserialize;
use std::{path::Path, time::Duration};
use sysinfo::{System, SystemExt};
use tokio::{select, sync::watch};
use tracing::{error, info, warn};

use crate::{
    reconciler::Reconciler,
    runner::{host_socket_path, Runner},
    schedule::{Schedule, ScheduleProvider},
};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub poll: PollConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceConfig {
    /// Stable device identifier sent with every schedule fetch. Defaults to
    /// the hostname, resolved once at startup.
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DockerConfig {
    /// Runtime control socket. Overridden by `DOCKER_HOST` when set.
    #[serde(default = "default_socket")]
    pub socket: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
        }
    }
}

fn default_socket() -> String {
    "/var/run/balena-engine.sock".to_owned()
}

#[derive(Debug, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize)]
pub struct ScheduleConfig {
    /// Path the file-backed schedule provider reads on every tick.
    pub file: String,
}

impl Config {
    #[tracing::instrument(name = "agent::Config::from_file", skip_all, fields(
        file_path = ?file_path.as_ref()
    ))]
    pub async fn from_file(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_contents = tokio::fs::read_to_string(file_path.as_ref()).await?;

        let mut config: Config = serde_yaml::from_str(&file_contents)?;

        if let Ok(socket) = std::env::var("DOCKER_HOST") {
            if !socket.is_empty() {
                config.docker.socket = socket;
            }
        }

        Ok(config)
    }
}

/// Owns the polling cadence and top-level cancellation. Each tick fetches
/// the schedule and reconciles to completion before the next tick can
/// fire, so ticks never overlap.
pub struct Agent {
    device_id: String,
    interval: Duration,
    provider: Box<dyn ScheduleProvider>,
    reconciler: Reconciler,
}

impl Agent {
    #[tracing::instrument(name = "Agent::new", skip_all)]
    pub fn new(
        config: &Config,
        provider: Box<dyn ScheduleProvider>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let device_id = match &config.device.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => resolve_hostname(),
        };

        info!(%device_id, socket = %config.docker.socket, "configuring agent");

        let runner = Runner::new(&config.docker.socket, shutdown)?;
        let reconciler = Reconciler::new(
            runner,
            host_socket_path(&config.docker.socket).to_owned(),
        );

        Ok(Self {
            device_id,
            interval: Duration::from_secs(config.poll.interval_secs),
            provider,
            reconciler,
        })
    }

    /// Runs one tick immediately, then one per interval, until shutdown.
    /// A shutdown arriving mid-tick lets the tick finish first.
    #[tracing::instrument(name = "Agent::run", skip_all, fields(
        device_id = %self.device_id
    ))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("starting agent control loop");

        let mut interval = tokio::time::interval(self.interval);

        loop {
            select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("shutting down");
                    return;
                }
            }
        }
    }

    /// One fetch-diff-apply cycle. Every failure is logged and retried on
    /// the next tick; nothing here is fatal to the loop.
    #[tracing::instrument(name = "Agent::tick", skip_all)]
    async fn tick(&self) {
        let schedule = match self.provider.fetch(&self.device_id).await {
            Err(error) => {
                error!(?error, "unable to fetch schedule");
                return;
            }
            Ok(schedule) => schedule,
        };

        let schedule = match schedule {
            Some(schedule) => schedule,
            None => {
                // No assignment means the desired set is empty: stop
                // everything we manage.
                info!("no schedule assigned");
                Schedule::empty()
            }
        };

        if let Err(error) = self.reconciler.reconcile(&schedule).await {
            error!(?error, "reconciliation failed");
        }
    }
}

/// Device identity defaults to the hostname. Resolution failure does not
/// block startup; the provider side is expected to reject an empty
/// identity gracefully.
fn resolve_hostname() -> String {
    match System::new().host_name() {
        Some(hostname) => hostname,
        None => {
            warn!("unable to resolve hostname, sending empty device identity");
            String::new()
        }
    }
}
