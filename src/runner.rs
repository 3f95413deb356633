use docker_api::{
    conn::TtyChunk,
    container::Container,
    exec::Exec,
    models::ContainerSummary,
    opts::{
        ContainerCreateOpts, ContainerFilter, ContainerListOpts, ExecCreateOpts, LogsOpts,
        PublishPort, PullOpts,
    },
    Docker,
};
use futures_util::stream::StreamExt;
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, Mutex},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    logs::{LineBuffer, LogMux},
    schedule::Task,
};

/// Marks a container as owned by this agent. The marker alone is sufficient
/// grounds for the reconciler to stop a container.
pub const MANAGED_LABEL: &str = "io.uinta.pando.managed";
pub const TASK_ID_LABEL: &str = "io.uinta.pando.task-id";
pub const TASK_NAME_LABEL: &str = "io.uinta.pando.task-name";
pub const SCHEDULE_ID_LABEL: &str = "io.uinta.pando-schedule-id";

/// Where the runtime control socket lives inside a container that asked for
/// it, and the default host-side location it is mounted from.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(#[source] docker_api::Error),
    #[error("cannot request both host network mode and a container network mode")]
    LaunchConflict,
    #[error("failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },
    #[error("invalid port mapping {spec}: {message}")]
    InvalidPort { spec: String, message: String },
    #[error(transparent)]
    Runtime(#[from] docker_api::Error),
}

/// A container the runtime reports as running under our managed label.
/// Re-queried on every tick, never cached.
#[derive(Debug, Clone)]
pub struct ObservedContainer {
    pub id: String,
    /// Value of the task-id label, when present. Containers without it are
    /// still ours to stop.
    pub task_id: Option<String>,
    pub labels: HashMap<String, String>,
}

impl From<ContainerSummary> for ObservedContainer {
    fn from(summary: ContainerSummary) -> Self {
        let labels = summary.labels.unwrap_or_default();

        Self {
            id: summary.id.unwrap_or_default(),
            task_id: labels.get(TASK_ID_LABEL).cloned(),
            labels,
        }
    }
}

/// Per-task launch configuration. Host and container network modes are
/// mutually exclusive; requesting both is rejected before any runtime call.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Mount the host's runtime control socket into the container. High
    /// privilege, must be requested per task.
    pub bind_docker_socket: bool,
    pub network_mode_host: bool,
    /// Join the network namespace of another container.
    pub network_mode_container: Option<String>,
    /// Host-side location of the runtime socket, for the bind mount.
    pub docker_socket_override: Option<String>,
}

impl LaunchOptions {
    pub fn network_mode(&self) -> Result<String, RunnerError> {
        match (&self.network_mode_container, self.network_mode_host) {
            (Some(_), true) => Err(RunnerError::LaunchConflict),
            (Some(reference), false) => Ok(reference.clone()),
            (None, true) => Ok("host".to_owned()),
            (None, false) => Ok("bridge".to_owned()),
        }
    }

    pub fn binds(&self) -> Vec<String> {
        if !self.bind_docker_socket {
            return Vec::new();
        }

        let host_socket = self
            .docker_socket_override
            .as_deref()
            .unwrap_or(DEFAULT_DOCKER_SOCKET);

        vec![format!("{host_socket}:{DEFAULT_DOCKER_SOCKET}")]
    }
}

/// Strips the uri scheme off a socket setting so it can be used as a bind
/// mount source. `DOCKER_HOST` style settings carry the scheme, bind mounts
/// must not.
pub fn host_socket_path(socket: &str) -> &str {
    socket.strip_prefix("unix://").unwrap_or(socket)
}

pub(crate) struct LogSession {
    pub(crate) mux: LogMux,
    pub(crate) producer: JoinHandle<()>,
    pub(crate) consumer: JoinHandle<()>,
}

impl LogSession {
    /// Closes the session and waits for its producer and consumer tasks to
    /// finish. The consumer still drains lines that were already delivered.
    pub(crate) async fn shutdown(self) {
        let Self {
            mux,
            producer,
            consumer,
        } = self;

        mux.close();
        // The consumer ends once every producer-side handle is gone.
        drop(mux);

        if let Err(error) = producer.await {
            warn!(?error, "log producer task failed");
        }
        if let Err(error) = consumer.await {
            warn!(?error, "log consumer task failed");
        }
    }
}

/// Thin capability surface over the container runtime. The underlying
/// connection is shared by every concurrent caller; `Docker` is safe for
/// concurrent use.
pub struct Runner {
    docker: Docker,
    shutdown: watch::Receiver<bool>,
    /// Live log-capture sessions keyed by runtime container id.
    sessions: Arc<Mutex<HashMap<String, LogSession>>>,
}

impl Runner {
    pub fn new(socket: &str, shutdown: watch::Receiver<bool>) -> Result<Self, RunnerError> {
        let uri = if socket.contains("://") {
            socket.to_owned()
        } else {
            format!("unix://{socket}")
        };

        let docker = Docker::new(uri)?;

        Ok(Self {
            docker,
            shutdown,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Lists every running container bearing the managed-marker label,
    /// regardless of task.
    #[tracing::instrument(name = "Runner::list_managed", skip_all)]
    pub async fn list_managed(&self) -> Result<Vec<ObservedContainer>, RunnerError> {
        let opts = ContainerListOpts::builder()
            .filter([ContainerFilter::Label(
                MANAGED_LABEL.to_owned(),
                "true".to_owned(),
            )])
            .build();

        let summaries = self
            .docker
            .containers()
            .list(&opts)
            .await
            .map_err(RunnerError::RuntimeUnavailable)?;

        Ok(summaries.into_iter().map(ObservedContainer::from).collect())
    }

    /// Blocks until the image is locally available or the pull fails. Pull
    /// progress goes to a discard sink.
    #[tracing::instrument(name = "Runner::pull_image", skip_all, fields(
        image = %image
    ))]
    pub async fn pull_image(&self, image: &str) -> Result<(), RunnerError> {
        info!("pulling image");

        let pull_opts = PullOpts::builder().image(image).build();

        let images = self.docker.images();

        let mut stream = images.pull(&pull_opts);
        while let Some(chunk) = stream.next().await {
            if let Err(error) = chunk {
                return Err(RunnerError::ImagePull {
                    image: image.to_owned(),
                    message: error.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Creates and starts a container for a task, labelled so the agent can
    /// find it again, then begins an asynchronous log-capture session keyed
    /// by the returned runtime id. The container name is derived from the
    /// task id, so a restarted task reuses its name.
    #[tracing::instrument(name = "Runner::start_task", skip_all, fields(
        task_id = %task.id,
        image = %task.container_image
    ))]
    pub async fn start_task(
        &self,
        task: &Task,
        schedule_id: &str,
        opts: &LaunchOptions,
    ) -> Result<String, RunnerError> {
        let network_mode = opts.network_mode()?;
        let binds = opts.binds();

        let mut env: Vec<String> = task.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.sort();

        let labels = [
            (MANAGED_LABEL, "true".to_owned()),
            (TASK_ID_LABEL, task.id.clone()),
            (TASK_NAME_LABEL, task.name.clone()),
            (SCHEDULE_ID_LABEL, schedule_id.to_owned()),
        ];

        let mut create_opts = ContainerCreateOpts::builder()
            .image(&task.container_image)
            .name(&task.id)
            .labels(labels)
            .env(&env)
            .network_mode(&network_mode)
            .auto_remove(true)
            .tty(true)
            .attach_stdout(true)
            .attach_stderr(true);

        if !task.command.is_empty() {
            create_opts = create_opts.command([task.command.clone()]);
        }

        if !task.entrypoint.is_empty() {
            create_opts = create_opts.entrypoint([task.entrypoint.clone()]);
        }

        if !binds.is_empty() {
            create_opts = create_opts.volumes(binds);
        }

        for port in task.ports.iter() {
            let spec = format!("{}/{}", port.container_port, port.protocol.to_lowercase());
            let publish =
                PublishPort::from_str(&spec).map_err(|error| RunnerError::InvalidPort {
                    spec: spec.clone(),
                    message: error.to_string(),
                })?;

            create_opts = create_opts.expose(publish, u32::from(port.host_port()));
        }

        let containers = self.docker.containers();

        let created = containers.create(&create_opts.build()).await?;
        let container_id = created.id().to_string();

        created.start().await?;

        info!(%container_id, "container started");

        self.spawn_log_session(container_id.clone());

        Ok(container_id)
    }

    /// Sends SIGTERM. Killing a container that already stopped or was
    /// removed is not an error. Tears down the container's log session,
    /// waiting for its tasks to finish.
    #[tracing::instrument(name = "Runner::kill", skip_all, fields(
        container_id = %container_id
    ))]
    pub async fn kill(&self, container_id: &str) -> Result<(), RunnerError> {
        let container = Container::new(self.docker.clone(), container_id.to_owned());
        let result = container.kill(Some("SIGTERM")).await;

        let session = self
            .sessions
            .lock()
            .expect("log session table poisoned")
            .remove(container_id);

        if let Some(session) = session {
            session.shutdown().await;
        }

        match result {
            Ok(()) => Ok(()),
            Err(docker_api::Error::Fault { code, .. })
                if code.as_u16() == 404 || code.as_u16() == 409 =>
            {
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Blocks until the container is no longer running, returning its exit
    /// code. Returns `Ok(None)` on shutdown: the caller is choosing not to
    /// wait, not observing a failure.
    #[tracing::instrument(name = "Runner::await_exit", skip_all, fields(
        container_id = %container_id
    ))]
    pub async fn await_exit(&self, container_id: &str) -> Result<Option<i64>, RunnerError> {
        let container = Container::new(self.docker.clone(), container_id.to_owned());
        let mut shutdown = self.shutdown.clone();

        tokio::select! {
            // Prefer the shutdown branch so a cancelled wait never races
            // a runtime response.
            biased;
            _ = shutdown.changed() => Ok(None),
            exit = container.wait() => {
                let exit = exit?;
                Ok(Some(exit.status_code as i64))
            }
        }
    }

    /// Runs a command to completion inside a running container and returns
    /// its combined output. Maintenance path, not used by reconciliation.
    #[tracing::instrument(name = "Runner::exec", skip_all, fields(
        container_id = %container_id,
        command = ?command
    ))]
    pub async fn exec(
        &self,
        container_id: &str,
        command: &[String],
    ) -> Result<String, RunnerError> {
        let opts = ExecCreateOpts::builder()
            .command(command)
            .attach_stdout(true)
            .attach_stderr(true)
            .build();

        let exec = Exec::create(self.docker.clone(), container_id, &opts).await?;

        let mut stream = Box::pin(exec.start());

        let mut output = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(docker_api::Error::from)? {
                TtyChunk::StdOut(bytes) | TtyChunk::StdErr(bytes) => output.extend(bytes),
                TtyChunk::StdIn(_) => {}
            }
        }

        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Spawns the producer/consumer pair that follows a container's output
    /// for as long as it runs. The session outlives the tick that created
    /// it and ends on stream end, session close, or process shutdown.
    pub(crate) fn spawn_log_session(&self, container_id: String) {
        let (mux, mut rx) = LogMux::new();

        let consumer_id = container_id.clone();
        let consumer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                info!(container_id = %consumer_id, "{line}");
            }
        });

        let producer = self.spawn_log_capture(container_id.clone(), mux.clone());

        let mut sessions = self.sessions.lock().expect("log session table poisoned");

        // A session whose producer already finished belongs to a container
        // that exited on its own. Close it so its consumer drains and ends.
        sessions.retain(|_, session| {
            if session.producer.is_finished() {
                session.mux.close();
                false
            } else {
                true
            }
        });

        sessions.insert(
            container_id,
            LogSession {
                mux,
                producer,
                consumer,
            },
        );
    }

    fn spawn_log_capture(&self, container_id: String, mux: LogMux) -> JoinHandle<()> {
        let docker = self.docker.clone();
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let container = Container::new(docker, container_id.clone());
            let opts = LogsOpts::builder()
                .stdout(true)
                .stderr(true)
                .follow(true)
                .build();

            let mut stream = Box::pin(container.logs(&opts));
            let mut lines = LineBuffer::default();

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = mux.closed() => break,
                    chunk = stream.next() => {
                        let bytes = match chunk {
                            None => break,
                            Some(Err(error)) => {
                                warn!(%container_id, ?error, "container log stream failed");
                                break;
                            }
                            Some(Ok(TtyChunk::StdOut(bytes))) | Some(Ok(TtyChunk::StdErr(bytes))) => bytes,
                            Some(Ok(TtyChunk::StdIn(_))) => continue,
                        };

                        for line in lines.push(&bytes) {
                            mux.deliver(line);
                        }
                    }
                }
            }

            if let Some(line) = lines.flush() {
                mux.deliver(line);
            }
        })
    }
}
