//! Docker-backed container engine, driving the `docker` command line tool
//! and reading its `--format '{{json .}}'` output.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ContainerEngine, ContainerInfo, DbContainerSpec, HealthState, PROXY_IMAGE,
    PROXY_NETWORK};
use crate::{Error, Result};

#[derive(Default)]
pub struct DockerEngine;

impl DockerEngine {
    pub fn new() -> Self {
        Self
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("docker").args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("port is already allocated") {
                return Err(Error::Transient(stderr));
            }
            return Err(Error::Container(format!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Ports", default)]
    ports: String,
}

/// Extracts the first host port out of a docker port summary such as
/// `0.0.0.0:5433->5433/tcp, 0.0.0.0:5433->5433/udp`.
fn parse_published_port(ports: &str) -> Option<u16> {
    for mapping in ports.split(',') {
        let mapping = mapping.trim();
        let Some((host, _)) = mapping.split_once("->") else {
            continue;
        };
        if let Some((_, port)) = host.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Some(port);
            }
        }
    }
    None
}

fn parse_ps_output(out: &str) -> Result<Vec<ContainerInfo>> {
    let mut containers = Vec::new();
    for line in out.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let ps: PsLine = serde_json::from_str(line)?;
        containers.push(ContainerInfo {
            running: ps.state == "running",
            state: ps.state,
            published_port: parse_published_port(&ps.ports),
            name: ps.names,
        });
    }
    Ok(containers)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ensure_network(&self) -> Result<()> {
        if self
            .docker(&["network", "inspect", PROXY_NETWORK])
            .await
            .is_ok()
        {
            return Ok(());
        }
        info!(network = PROXY_NETWORK, "creating proxy network");
        match self
            .docker(&["network", "create", "--attachable", PROXY_NETWORK])
            .await
        {
            Ok(_) => Ok(()),
            // Two creators can race; the network existing is the goal.
            Err(Error::Container(message)) if message.contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_db_container(&self, spec: &DbContainerSpec) -> Result<()> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            spec.name.clone(),
            "--domainname".into(),
            spec.name.clone(),
            "--network".into(),
            PROXY_NETWORK.into(),
            "--restart".into(),
            "unless-stopped".into(),
            "--label".into(),
            format!("owner={}", spec.owner),
            "--expose".into(),
            spec.db_port.to_string(),
            "-v".into(),
            format!("{}:{}", spec.mount_source.display(), spec.mount_target),
        ];
        for env in &spec.env {
            args.push("-e".into());
            args.push(env.clone());
        }
        if let Some(shm) = spec.shm_bytes {
            args.push("--shm-size".into());
            args.push(shm.to_string());
        }
        if let Some(health) = &spec.healthcheck {
            args.push("--health-cmd".into());
            args.push(health.cmd.clone());
            args.push("--health-interval".into());
            args.push(format!("{}s", health.interval_s));
            args.push("--health-timeout".into());
            args.push(format!("{}s", health.timeout_s));
            args.push("--health-start-period".into());
            args.push(format!("{}s", health.start_period_s));
            args.push("--health-retries".into());
            args.push(health.retries.to_string());
        }
        // The --entrypoint flag only takes the executable; any further
        // entrypoint elements go in front of the command arguments.
        let mut trailing: Vec<String> = Vec::new();
        if let Some(entrypoint) = &spec.entrypoint {
            if let Some((first, rest)) = entrypoint.split_first() {
                args.push("--entrypoint".into());
                args.push(first.clone());
                trailing.extend(rest.iter().cloned());
            }
        }
        args.push(spec.image.clone());
        args.extend(trailing);
        if let Some(cmd) = &spec.cmd {
            args.extend(cmd.iter().cloned());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.docker(&arg_refs).await?;
        self.docker(&["start", &spec.name]).await?;
        debug!(container = %spec.name, "db container started");
        Ok(())
    }

    async fn create_proxy_container(
        &self,
        clone: &str,
        owner: &str,
        port: u16,
        target_port: u16,
    ) -> Result<()> {
        let name = format!("{clone}-proxy");
        let owner_label = format!("owner={owner}");
        let listen = format!("LISTEN_PORT={port}");
        let target = format!("TARGET_ADDRESS={clone}:{target_port}");
        let tcp = format!("0.0.0.0:{port}:{port}/tcp");
        let udp = format!("0.0.0.0:{port}:{port}/udp");
        self.docker(&[
            "create",
            "--name",
            &name,
            "--domainname",
            &name,
            "--network",
            PROXY_NETWORK,
            "--restart",
            "unless-stopped",
            "--label",
            &owner_label,
            "-e",
            &listen,
            "-e",
            &target,
            "-p",
            &tcp,
            "-p",
            &udp,
            PROXY_IMAGE,
        ])
        .await?;
        self.docker(&["start", &name]).await?;
        debug!(container = %name, port, "proxy container started");
        Ok(())
    }

    async fn inspect_health(&self, name: &str) -> Result<HealthState> {
        let out = self
            .docker(&[
                "inspect",
                "--format",
                "{{if .State.Health}}{{.State.Health.Status}}{{end}}",
                name,
            ])
            .await?;
        Ok(match out.trim() {
            "" => HealthState::None,
            "starting" => HealthState::Starting,
            "healthy" => HealthState::Healthy,
            _ => HealthState::Unhealthy,
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let out = self
            .docker(&["ps", "-a", "--format", "{{json .}}"])
            .await?;
        parse_ps_output(&out)
    }

    async fn stop(&self, name: &str, grace_s: u64) -> Result<()> {
        let grace = grace_s.to_string();
        self.docker(&["stop", "-t", &grace, name]).await?;
        Ok(())
    }

    async fn wait_not_running(&self, name: &str) -> Result<()> {
        self.docker(&["wait", name]).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match self.docker(&["rm", "-f", name]).await {
            Ok(_) => Ok(()),
            Err(Error::Container(message)) if message.contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }
}
