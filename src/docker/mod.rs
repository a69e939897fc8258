use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Timeout budgets per §4.5 — every spawn is wrapped, pull is unbounded.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const LIST_TIMEOUT: Duration = Duration::from_secs(5);
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(30);

/// One running container as reported by `docker ps`.
#[derive(Debug, Clone, Serialize)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
    pub status: String,
    /// Host port mappings, `container_port -> host_port`.
    pub ports: Vec<(u16, u16)>,
}

/// Spec for launching one inference-runtime container. Assembled by the
/// Deployment Lifecycle per §4.7.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub host_port: u16,
    /// Container-internal port the runtime listens on.
    pub container_port: u16,
    pub gpu_attach: bool,
    pub env: Vec<(String, String)>,
    /// `(host_path, container_path, read_only)`.
    pub volumes: Vec<(String, String, bool)>,
    pub args: Vec<String>,
}

/// Thin, typed façade over the `docker` CLI. Never shells out via a string —
/// every invocation is an explicit argv so model ids containing `/` or other
/// shell metacharacters can never be misinterpreted.
pub struct ContainerDriver {
    sudo: OnceCell<bool>,
}

impl ContainerDriver {
    pub fn new() -> Self {
        Self {
            sudo: OnceCell::new(),
        }
    }

    /// Force elevated invocations for this process's lifetime, bypassing the
    /// privilege probe. Used when `USE_SUDO_DOCKER` is set.
    pub async fn force_sudo(&self) {
        let _ = self.sudo.set(true).is_ok();
    }

    /// Determines once, and caches for the process lifetime, whether `docker`
    /// invocations need `sudo`. A bare `docker ps` is attempted first; any
    /// failure switches to elevated mode permanently.
    async fn needs_sudo(&self) -> bool {
        *self
            .sudo
            .get_or_init(|| async {
                match run_timeout(Command::new("docker").arg("ps"), PROBE_TIMEOUT).await {
                    Ok(output) if output.status.success() => false,
                    _ => {
                        warn!("docker ps failed unelevated, switching to sudo for this process");
                        true
                    }
                }
            })
            .await
    }

    async fn command(&self, args: &[&str]) -> Command {
        if self.needs_sudo().await {
            let mut cmd = Command::new("sudo");
            cmd.arg("docker").args(args);
            cmd
        } else {
            let mut cmd = Command::new("docker");
            cmd.args(args);
            cmd
        }
    }

    /// Containers whose name starts with `prefix`, confirmed running both by
    /// server-side status filter and a follow-up `Inspect`.
    pub async fn list_running(&self, prefix: &str) -> Result<Vec<RunningContainer>> {
        let filter = format!("name={prefix}");
        let mut cmd = self
            .command(&[
                "ps",
                "--filter",
                &filter,
                "--filter",
                "status=running",
                "--format",
                "{{.ID}}\t{{.Names}}\t{{.Status}}\t{{.Ports}}",
            ])
            .await;
        let output = run_timeout(&mut cmd, LIST_TIMEOUT)
            .await
            .context("docker ps timed out")?;
        if !output.status.success() {
            return Err(anyhow!(
                "docker ps failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        let mut result = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mut fields = line.splitn(4, '\t');
            let (Some(id), Some(name), Some(status), ports) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next().unwrap_or(""),
            ) else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            // Confirm liveness with a separate Inspect rather than trusting
            // the status filter alone — crashed-but-not-yet-reaped containers
            // can linger in the filtered list.
            if self.inspect_running(id).await.unwrap_or(false) {
                result.push(RunningContainer {
                    id: id.to_string(),
                    name: name.to_string(),
                    status: status.to_string(),
                    ports: parse_port_mappings(ports),
                });
            }
        }
        Ok(result)
    }

    /// `docker inspect -f <field>`, trimmed.
    pub async fn inspect(&self, container_id: &str, field: &str) -> Result<String> {
        let mut cmd = self
            .command(&["inspect", "-f", field, container_id])
            .await;
        let output = run_timeout(&mut cmd, PROBE_TIMEOUT)
            .await
            .context("docker inspect timed out")?;
        if !output.status.success() {
            return Err(anyhow!(
                "docker inspect failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn inspect_running(&self, container_id: &str) -> Result<bool> {
        let value = self.inspect(container_id, "{{.State.Running}}").await?;
        Ok(value == "true")
    }

    pub async fn inspect_pid(&self, container_id: &str) -> Result<u32> {
        let value = self.inspect(container_id, "{{.State.Pid}}").await?;
        value.parse().context("non-numeric pid from docker inspect")
    }

    pub async fn inspect_exit_code(&self, container_id: &str) -> Result<i32> {
        let value = self.inspect(container_id, "{{.State.ExitCode}}").await?;
        value.parse().context("non-numeric exit code")
    }

    /// Runs a container per `spec`, returning its id. Falls back to a
    /// name lookup via `list_running` when the id cannot be parsed from
    /// `docker run`'s output (ambiguous or truncated stdout).
    pub async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "-p".to_string(),
            format!("{}:{}", spec.host_port, spec.container_port),
        ];
        if spec.gpu_attach {
            args.push("--gpus".to_string());
            args.push("all".to_string());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for (host, container, read_only) in &spec.volumes {
            args.push("-v".to_string());
            if *read_only {
                args.push(format!("{host}:{container}:ro"));
            } else {
                args.push(format!("{host}:{container}"));
            }
        }
        args.push(spec.image.clone());
        args.extend(spec.args.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut cmd = self.command(&arg_refs).await;
        let output = run_timeout(&mut cmd, VALIDATE_TIMEOUT)
            .await
            .context("docker run timed out")?;

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() && !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(id);
        }

        warn!(
            name = %spec.name,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "docker run did not yield an unambiguous container id, falling back to name lookup"
        );
        let running = self.list_running(&spec.name).await?;
        running
            .into_iter()
            .find(|c| c.name == spec.name)
            .map(|c| c.id)
            .ok_or_else(|| anyhow!("container {} not found after run", spec.name))
    }

    /// Idempotent stop; non-zero exit tolerated (already stopped, or never existed).
    pub async fn stop(&self, name: &str) -> bool {
        let mut cmd = self.command(&["stop", name]).await;
        matches!(run_timeout(&mut cmd, VALIDATE_TIMEOUT).await, Ok(o) if o.status.success())
    }

    /// Idempotent remove; non-zero exit tolerated.
    pub async fn remove(&self, name: &str) -> bool {
        let mut cmd = self.command(&["rm", "-f", name]).await;
        matches!(run_timeout(&mut cmd, VALIDATE_TIMEOUT).await, Ok(o) if o.status.success())
    }

    /// Pulls `image` only if not already present locally.
    pub async fn pull_if_missing(&self, image: &str) -> Result<()> {
        let mut inspect_cmd = self.command(&["image", "inspect", image]).await;
        if let Ok(output) = run_timeout(&mut inspect_cmd, PROBE_TIMEOUT).await {
            if output.status.success() {
                debug!(image, "image already present");
                return Ok(());
            }
        }
        info!(image, "pulling image");
        let mut cmd = self.command(&["pull", image]).await;
        // Pull is intentionally unbounded — large images can legitimately
        // take many minutes on a cold cache.
        let output = cmd.output().await.context("docker pull spawn failed")?;
        if !output.status.success() {
            return Err(anyhow!(
                "docker pull failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(())
    }

    /// Last `n` lines of combined stdout+stderr logs, for diagnostics.
    pub async fn logs(&self, container_id: &str, n: u32) -> Vec<String> {
        let tail = n.to_string();
        let mut cmd = self
            .command(&["logs", "--tail", &tail, container_id])
            .await;
        match run_timeout(&mut cmd, LIST_TIMEOUT).await {
            Ok(output) => {
                let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(String::from)
                    .collect();
                lines.extend(
                    String::from_utf8_lossy(&output.stderr)
                        .lines()
                        .map(String::from),
                );
                lines
            }
            Err(_) => Vec::new(),
        }
    }
}

impl Default for ContainerDriver {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_timeout(cmd: &mut Command, budget: Duration) -> Result<std::process::Output> {
    match timeout(budget, cmd.output()).await {
        Ok(result) => result.context("failed to spawn docker"),
        Err(_) => Err(anyhow!("docker invocation exceeded {:?} budget", budget)),
    }
}

/// Parses the Go-template `{{.Ports}}` rendering, e.g.
/// `0.0.0.0:8000->8000/tcp, :::8000->8000/tcp`, into `(container, host)` pairs.
fn parse_port_mappings(raw: &str) -> Vec<(u16, u16)> {
    let mut result = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        let Some((host_side, container_side)) = part.split_once("->") else {
            continue;
        };
        let Some(host_port) = host_side.rsplit(':').next().and_then(|p| p.parse().ok()) else {
            continue;
        };
        let container_port: u16 = match container_side.split('/').next() {
            Some(p) => match p.parse() {
                Ok(v) => v,
                Err(_) => continue,
            },
            None => continue,
        };
        result.push((container_port, host_port));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dual_stack_port_mapping() {
        let mapped = parse_port_mappings("0.0.0.0:8000->8000/tcp, :::8000->8000/tcp");
        assert_eq!(mapped, vec![(8000, 8000), (8000, 8000)]);
    }

    #[test]
    fn parses_empty_ports_string() {
        assert!(parse_port_mappings("").is_empty());
    }

    #[test]
    fn ignores_malformed_segment() {
        let mapped = parse_port_mappings("garbage, 0.0.0.0:9001->9000/tcp");
        assert_eq!(mapped, vec![(9000, 9001)]);
    }
}
