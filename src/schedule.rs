use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};

/// The desired state for one device: the set of containers that should be
/// running on it. Fetched fresh on every reconciliation tick and never
/// persisted locally.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Schedule {
    pub id: String,
    /// Whether this is the active assignment for the device. The control
    /// plane returns at most one current schedule per device.
    #[serde(default)]
    pub current: bool,
    #[serde(default)]
    pub containers: Vec<Task>,
}

impl Schedule {
    /// The schedule used when a device has no assignment: everything the
    /// agent manages should be stopped.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// One container the control plane wants running. `id` is assigned by the
/// control plane, is unique within a schedule, and is the sole correlation
/// key between desired and observed state.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub container_image: String,
    /// Optional command override. A single string, matching the control
    /// plane's wire shape.
    #[serde(default)]
    pub command: String,
    /// Optional entrypoint override.
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub bind_dev: bool,
    #[serde(default)]
    pub bind_proc: bool,
    #[serde(default)]
    pub bind_sys: bool,
    #[serde(default)]
    pub bind_shm: bool,
    #[serde(default)]
    pub bind_cgroup: bool,
    #[serde(default)]
    pub bind_docker_socket: bool,
    #[serde(default)]
    pub bind_boot: bool,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

/// Network mode requested for a task. Unrecognized values from the control
/// plane fall back to `Bridge`; that fallback is externally observable
/// behavior and must not change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Host,
    None,
    // The catch-all variant has to be declared last.
    #[default]
    #[serde(other)]
    Bridge,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    /// Host port to publish on. Defaults to the container port.
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

impl PortMapping {
    pub fn host_port(&self) -> u16 {
        self.host_port.unwrap_or(self.container_port)
    }
}

fn default_protocol() -> String {
    "tcp".to_owned()
}

/// Source of desired state. The RPC transport that talks to the control
/// plane lives behind this seam; the agent only needs one blocking call.
#[async_trait]
pub trait ScheduleProvider: Send + Sync {
    /// Fetches the current schedule for a device. `Ok(None)` means no
    /// schedule is assigned, which the reconciler treats as an empty
    /// desired set.
    async fn fetch(&self, device_id: &str) -> Result<Option<Schedule>>;
}

/// Reads the schedule from a YAML file on every fetch. Stands in for the
/// control-plane transport during local development and in tests.
pub struct FileScheduleProvider {
    path: PathBuf,
}

impl FileScheduleProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ScheduleProvider for FileScheduleProvider {
    #[tracing::instrument(name = "FileScheduleProvider::fetch", skip_all, fields(
        path = ?self.path,
        device_id = %device_id
    ))]
    async fn fetch(&self, device_id: &str) -> Result<Option<Schedule>> {
        let file_contents = tokio::fs::read_to_string(&self.path)
            .await
            .context("reading schedule file")?;

        let schedule: Schedule =
            serde_yaml::from_str(&file_contents).context("parsing schedule file")?;

        Ok(Some(schedule))
    }
}
