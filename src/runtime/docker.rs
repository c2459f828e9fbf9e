// src/runtime/docker.rs
//! Docker launcher
//!
//! Runners run attached (`docker run --rm`) so the client process mirrors
//! the container: its exit is the container's exit and its stdout/stderr
//! carry the container's output. Containers are labelled with the
//! controller's instance tag so dangling detection can find them.

use crate::runtime::process_manager::{watch_child, LaunchSpec, ProcessHandle, RunnerLauncher};
use crate::utils::config::LauncherConfig;
use crate::utils::errors::{ControllerError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

const INSTANCE_LABEL: &str = "runner-controller.instance";
const RUNNER_LABEL: &str = "runner-controller.runner-id";

pub fn container_name(runner_id: &str) -> String {
    format!("runner-{}", runner_id)
}

pub struct DockerLauncher {
    image: String,
    instance_tag: String,
    network: Option<String>,
    args: Vec<String>,
}

impl DockerLauncher {
    pub fn new(config: &LauncherConfig) -> Self {
        Self {
            image: config.image.clone(),
            instance_tag: config.instance_tag.clone(),
            network: config.network.clone(),
            args: config.args.clone(),
        }
    }

    /// `docker run` arguments for one runner
    pub fn run_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={}", container_name(&spec.runner_id)),
            format!("--label={}={}", INSTANCE_LABEL, self.instance_tag),
            format!("--label={}={}", RUNNER_LABEL, spec.runner_id),
        ];

        if let Some(network) = &self.network {
            args.push(format!("--network={}", network));
        }
        args.extend(spec.limits.docker_args());
        for (key, value) in spec.environment() {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args.extend(spec.runner_args());
        args
    }
}

/// Kills the container, then the attached client
struct ContainerHandle {
    runner_id: String,
    client: Box<dyn ProcessHandle>,
}

impl ProcessHandle for ContainerHandle {
    fn kill(&self) {
        let name = container_name(&self.runner_id);
        tokio::spawn(async move {
            if let Err(e) = docker_kill(&name).await {
                debug!(container = %name, error = %e, "docker kill failed");
            }
        });
        self.client.kill();
    }
}

async fn docker_kill(name: &str) -> Result<()> {
    let output = Command::new("docker")
        .args(["kill", name])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ControllerError::LauncherError(format!(
            "docker kill {}: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[async_trait]
impl RunnerLauncher for DockerLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn ProcessHandle>> {
        spec.limits
            .validate()
            .map_err(ControllerError::LauncherError)?;

        let args = self.run_args(&spec);
        debug!(runner_id = %spec.runner_id, image = %self.image, "Starting runner container");

        let child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControllerError::ProcessSpawnFailed(format!("Failed to run docker: {}", e)))?;

        let runner_id = spec.runner_id.clone();
        let client = watch_child(spec.runner_id, child, spec.exits, || {});
        Ok(Arc::new(ContainerHandle {
            runner_id,
            client: Box::new(client),
        }))
    }

    async fn list_workers(&self) -> Result<Vec<String>> {
        let output = Command::new("docker")
            .args([
                "ps".to_string(),
                format!("--filter=label={}={}", INSTANCE_LABEL, self.instance_tag),
                format!("--format={{{{.Label \"{}\"}}}}", RUNNER_LABEL),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(ControllerError::LauncherError(format!(
                "docker ps: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_worker_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn kill_worker(&self, runner_id: &str) -> Result<()> {
        let name = container_name(runner_id);
        docker_kill(&name).await.map_err(|e| {
            warn!(container = %name, error = %e, "Failed to kill container");
            e
        })
    }
}

fn parse_worker_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::resource_limiter::ResourceLimits;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    #[test]
    fn test_run_args() {
        let launcher = DockerLauncher::new(&LauncherConfig {
            image: "runner:1".to_string(),
            instance_tag: "ctl-a".to_string(),
            network: Some("runners".to_string()),
            ..LauncherConfig::default()
        });
        let (exits, _rx) = mpsc::unbounded_channel();
        let spec = LaunchSpec {
            runner_id: "r1".to_string(),
            job_id: "j1".to_string(),
            action_id: "a1".to_string(),
            controller_host: "10.0.0.1".to_string(),
            controller_port: 7440,
            env: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
            limits: ResourceLimits::default(),
            exits,
        };

        let args = launcher.run_args(&spec);
        assert_eq!(&args[..3], &["run", "--rm", "--name=runner-r1"]);
        assert!(args.contains(&"--label=runner-controller.instance=ctl-a".to_string()));
        assert!(args.contains(&"--network=runners".to_string()));
        assert!(args.contains(&"GREETING=hi".to_string()));

        // image comes before the runner parameters
        let image = args.iter().position(|a| a == "runner:1").unwrap();
        let id_flag = args.iter().position(|a| a == "--runner-identifier").unwrap();
        assert!(image < id_flag);
        assert_eq!(args.last().unwrap(), "7440");
    }

    #[test]
    fn test_parse_worker_list() {
        assert_eq!(parse_worker_list("r1\n\n r2 \n"), vec!["r1", "r2"]);
        assert!(parse_worker_list("").is_empty());
    }
}
