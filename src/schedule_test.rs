use anyhow::Result;
use std::io::Write;

use crate::schedule::{FileScheduleProvider, NetworkMode, Schedule, ScheduleProvider};

#[cfg(test)]
mod schedule_document_tests {
    use super::*;

    #[test]
    fn parses_a_full_task() -> Result<()> {
        let schedule: Schedule = serde_yaml::from_str(
            r#"
id: "s1"
current: true
containers:
  - id: "t1"
    name: "web"
    container_image: "nginx:latest"
    command: "nginx -g 'daemon off;'"
    env:
      PORT: "8080"
    network_mode: "host"
    bind_docker_socket: true
    ports:
      - container_port: 8080
        host_port: 80
        protocol: "tcp"
"#,
        )?;

        assert_eq!("s1", schedule.id);
        assert!(schedule.current);

        let task = &schedule.containers[0];
        assert_eq!("t1", task.id);
        assert_eq!("web", task.name);
        assert_eq!("nginx:latest", task.container_image);
        assert_eq!(NetworkMode::Host, task.network_mode);
        assert!(task.bind_docker_socket);
        assert!(!task.privileged);
        assert_eq!("8080", task.env["PORT"]);
        assert_eq!(8080, task.ports[0].container_port);
        assert_eq!(80, task.ports[0].host_port());
        assert_eq!("tcp", task.ports[0].protocol);

        Ok(())
    }

    #[test]
    fn network_mode_defaults_to_bridge() -> Result<()> {
        let schedule: Schedule = serde_yaml::from_str(
            r#"
id: "s1"
containers:
  - id: "t1"
    container_image: "nginx:latest"
"#,
        )?;

        assert_eq!(NetworkMode::Bridge, schedule.containers[0].network_mode);

        Ok(())
    }

    #[test]
    fn unrecognized_network_mode_falls_back_to_bridge() -> Result<()> {
        // Externally observable rule: unknown values from the control
        // plane must not fail the whole schedule.
        let schedule: Schedule = serde_yaml::from_str(
            r#"
id: "s1"
containers:
  - id: "t1"
    container_image: "nginx:latest"
    network_mode: "overlay"
"#,
        )?;

        assert_eq!(NetworkMode::Bridge, schedule.containers[0].network_mode);

        Ok(())
    }

    #[test]
    fn none_network_mode_is_recognized() -> Result<()> {
        let schedule: Schedule = serde_yaml::from_str(
            r#"
id: "s1"
containers:
  - id: "t1"
    container_image: "nginx:latest"
    network_mode: "none"
"#,
        )?;

        assert_eq!(NetworkMode::None, schedule.containers[0].network_mode);

        Ok(())
    }

    #[test]
    fn port_mapping_defaults_host_port_to_the_container_port() -> Result<()> {
        let schedule: Schedule = serde_yaml::from_str(
            r#"
id: "s1"
containers:
  - id: "t1"
    container_image: "nginx:latest"
    ports:
      - container_port: 9000
"#,
        )?;

        let port = &schedule.containers[0].ports[0];
        assert_eq!(9000, port.host_port());
        assert_eq!("tcp", port.protocol);

        Ok(())
    }
}

#[cfg(test)]
mod file_schedule_provider_tests {
    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn reads_the_schedule_file_on_every_fetch() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(
            &mut file,
            r#"
id: "s1"
containers:
  - id: "t1"
    container_image: "nginx:latest"
"#
        )?;

        let provider = FileScheduleProvider::new(file.path());

        let schedule = provider
            .fetch("device-1")
            .await?
            .expect("schedule should be present");

        assert_eq!("s1", schedule.id);
        assert_eq!(1, schedule.containers.len());

        Ok(())
    }

    #[tokio::test]
    async fn fetch_fails_when_the_file_is_missing() {
        let provider = FileScheduleProvider::new("/tmp/does-not-exist-schedule.yaml");

        assert!(provider.fetch("device-1").await.is_err());
    }

    #[tokio::test]
    async fn fetch_fails_on_malformed_documents() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(&mut file, "containers: 42")?;

        let provider = FileScheduleProvider::new(file.path());

        assert!(provider.fetch("device-1").await.is_err());

        Ok(())
    }
}
