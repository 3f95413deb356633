use std::collections::HashMap;

use tokio::sync::watch;

use crate::{
    runner::{host_socket_path, LaunchOptions, Runner, RunnerError, DEFAULT_DOCKER_SOCKET},
    schedule::{NetworkMode, Task},
};

fn task(id: &str, image: &str) -> Task {
    Task {
        id: id.to_owned(),
        name: format!("task-{id}"),
        container_image: image.to_owned(),
        command: String::new(),
        entrypoint: String::new(),
        env: HashMap::new(),
        network_mode: NetworkMode::Bridge,
        privileged: false,
        bind_dev: false,
        bind_proc: false,
        bind_sys: false,
        bind_shm: false,
        bind_cgroup: false,
        bind_docker_socket: false,
        bind_boot: false,
        ports: Vec::new(),
    }
}

#[cfg(test)]
mod launch_options_tests {
    use super::*;

    #[test]
    fn defaults_to_bridge_network_mode() {
        let opts = LaunchOptions::default();

        assert_eq!("bridge", opts.network_mode().unwrap());
    }

    #[test]
    fn host_network_mode_is_selectable() {
        let opts = LaunchOptions {
            network_mode_host: true,
            ..LaunchOptions::default()
        };

        assert_eq!("host", opts.network_mode().unwrap());
    }

    #[test]
    fn container_network_mode_joins_the_referenced_container() {
        let opts = LaunchOptions {
            network_mode_container: Some("container:db".to_owned()),
            ..LaunchOptions::default()
        };

        assert_eq!("container:db", opts.network_mode().unwrap());
    }

    #[test]
    fn host_and_container_network_modes_are_mutually_exclusive() {
        let opts = LaunchOptions {
            network_mode_host: true,
            network_mode_container: Some("container:db".to_owned()),
            ..LaunchOptions::default()
        };

        assert!(matches!(
            opts.network_mode(),
            Err(RunnerError::LaunchConflict)
        ));
    }

    #[test]
    fn no_binds_unless_the_socket_mount_is_requested() {
        let opts = LaunchOptions::default();

        assert!(opts.binds().is_empty());
    }

    #[test]
    fn socket_mount_defaults_to_the_well_known_path() {
        let opts = LaunchOptions {
            bind_docker_socket: true,
            ..LaunchOptions::default()
        };

        assert_eq!(
            vec![format!("{DEFAULT_DOCKER_SOCKET}:{DEFAULT_DOCKER_SOCKET}")],
            opts.binds()
        );
    }

    #[test]
    fn socket_mount_honors_the_host_side_override() {
        let opts = LaunchOptions {
            bind_docker_socket: true,
            docker_socket_override: Some("/var/run/balena-engine.sock".to_owned()),
            ..LaunchOptions::default()
        };

        assert_eq!(
            vec![format!("/var/run/balena-engine.sock:{DEFAULT_DOCKER_SOCKET}")],
            opts.binds()
        );
    }
}

#[cfg(test)]
mod runner_tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn start_task_rejects_conflicting_network_modes_before_any_runtime_call() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        // The socket does not exist; the conflict must surface before the
        // runner ever touches it.
        let runner = Runner::new("/tmp/does-not-exist.sock", shutdown_rx).unwrap();

        let opts = LaunchOptions {
            network_mode_host: true,
            network_mode_container: Some("container:db".to_owned()),
            ..LaunchOptions::default()
        };

        let result = runner
            .start_task(&task("t1", "nginx:latest"), "s1", &opts)
            .await;

        assert!(matches!(result, Err(RunnerError::LaunchConflict)));
    }

    #[tokio::test]
    async fn await_exit_returns_cleanly_when_shutdown_fires() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = Runner::new("/tmp/does-not-exist.sock", shutdown_rx).unwrap();

        shutdown_tx.send(true).unwrap();

        // The caller is choosing not to wait: no error, no exit code, and
        // the runtime is never consulted.
        let exit = runner.await_exit("c1").await.unwrap();
        assert_eq!(None, exit);
    }

    #[tokio::test]
    async fn kill_tears_down_the_container_log_session() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = Runner::new("/tmp/does-not-exist.sock", shutdown_rx).unwrap();

        runner.spawn_log_session("c1".to_owned());

        // kill waits for the session's producer and consumer tasks to
        // finish; a stuck session would hang here.
        tokio::time::timeout(Duration::from_secs(1), runner.kill("c1"))
            .await
            .expect("kill should return once the log session is torn down")
            .ok();
    }
}

#[cfg(test)]
mod log_session_tests {
    use std::time::Duration;

    use crate::{logs::LogMux, runner::LogSession};

    #[tokio::test]
    async fn shutdown_joins_the_producer_and_the_consumer() {
        let (mux, mut rx) = LogMux::new();

        let producer = {
            let mux = mux.clone();
            tokio::spawn(async move {
                mux.deliver("one last line".to_owned());
                mux.closed().await;
            })
        };

        let consumer = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let session = LogSession {
            mux,
            producer,
            consumer,
        };

        tokio::time::timeout(Duration::from_secs(1), session.shutdown())
            .await
            .expect("both session tasks should finish once the session closes");
    }
}

#[cfg(test)]
mod host_socket_path_tests {
    use super::*;

    #[test]
    fn strips_the_unix_scheme() {
        assert_eq!(
            "/var/run/docker.sock",
            host_socket_path("unix:///var/run/docker.sock")
        );
    }

    #[test]
    fn leaves_plain_paths_untouched() {
        assert_eq!(
            "/var/run/balena-engine.sock",
            host_socket_path("/var/run/balena-engine.sock")
        );
    }
}
