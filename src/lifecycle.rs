use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::catalog::{CatalogClient, CatalogError};
use crate::config::AppConfig;
use crate::docker::{ContainerDriver, ContainerSpec};
use crate::gpu::{detect_gpu_class, GpuProbe};
use crate::gpu_config::ConfigCatalog;
use crate::registry::{container_name_for, Registry};

const INFERENCE_IMAGE: &str = "vllm/vllm-openai:latest";
const CONTAINER_PORT: u16 = 8000;
const PORT_SCAN_RANGE: u16 = 1000;
const CONFIG_MOUNT_PATH: &str = "/configs/model.yaml";
const HF_CACHE_HOST_DIR: &str = "/root/.cache/huggingface";
const HF_CACHE_CONTAINER_DIR: &str = "/root/.cache/huggingface";

#[derive(Debug, Clone, Serialize, Default)]
pub struct DeployOutcome {
    pub success: bool,
    pub message: String,
    pub container_id: Option<String>,
    pub port: Option<u16>,
}

/// Validates model identifiers, allocates ports, orchestrates container
/// start/stop, probes liveness, and maintains the Deployment Registry.
pub struct Lifecycle {
    config: AppConfig,
    probe: Arc<GpuProbe>,
    driver: Arc<ContainerDriver>,
    registry: Registry,
    catalog: CatalogClient,
    configs: ConfigCatalog,
    /// Only one `deploy` invocation may be in flight for a given model id.
    in_flight: Mutex<HashSet<String>>,
}

impl Lifecycle {
    pub fn new(
        config: AppConfig,
        probe: Arc<GpuProbe>,
        driver: Arc<ContainerDriver>,
        registry: Registry,
    ) -> Self {
        let configs = ConfigCatalog::new(config.configs_dir());
        Self {
            config,
            probe,
            driver,
            registry,
            catalog: CatalogClient::new(),
            configs,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub async fn deploy(
        &self,
        model_id: &str,
        token: Option<&str>,
        requested_port: Option<u16>,
        gpu_class_override: Option<&str>,
        config_override: Option<PathBuf>,
    ) -> DeployOutcome {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return DeployOutcome {
                success: false,
                message: "model_id is required or contains only whitespace".to_string(),
                container_id: None,
                port: None,
            };
        }

        // Single-flight guard per model id.
        {
            let mut guard = self.in_flight.lock().await;
            if !guard.insert(model_id.to_string()) {
                return DeployOutcome {
                    success: false,
                    message: format!("a deployment for {model_id} is already in progress"),
                    container_id: None,
                    port: None,
                };
            }
        }
        let result = self
            .deploy_inner(model_id, token, requested_port, gpu_class_override, config_override)
            .await;
        self.in_flight.lock().await.remove(model_id);
        result
    }

    async fn deploy_inner(
        &self,
        model_id: &str,
        token: Option<&str>,
        requested_port: Option<u16>,
        gpu_class_override: Option<&str>,
        config_override: Option<PathBuf>,
    ) -> DeployOutcome {
        let token = token
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .or_else(|| self.config.hf_token.clone());
        let Some(token) = token else {
            return fail("HF token is required (pass hf_token or set HF_TOKEN)");
        };

        let running = self.registry.list(&self.driver).await;
        let running_count = running.iter().filter(|d| d.running).count();
        if running_count >= self.config.max_concurrent_models {
            return fail(&format!(
                "Cannot deploy: {running_count} models already deployed (max: {})",
                self.config.max_concurrent_models
            ));
        }

        let validation = match self.catalog.validate(model_id, Some(&token)).await {
            Ok(v) => v,
            Err(e) => return fail(&describe_catalog_error(&e)),
        };
        let canonical_id = validation.canonical_id;
        if validation.gated {
            info!(model_id = %canonical_id, "deploying gated model");
        }

        let container_name = container_name_for(&canonical_id);

        let port = match self.allocate_port(requested_port, &running).await {
            Ok(p) => p,
            Err(e) => return fail(&e),
        };

        let gpu_class = gpu_class_override
            .map(String::from)
            .or_else(|| self.config.gpu_type_override.clone())
            .unwrap_or_else(|| detect_gpu_class(self.probe.device_name().as_deref()));

        let ceiling = match &config_override {
            Some(path) => {
                let contents = tokio::fs::read_to_string(path).await.ok();
                let doc = contents.and_then(|c| serde_yaml::from_str(&c).ok());
                ConfigCatalog::extract_ceiling(doc.as_ref())
            }
            None => {
                let doc = self.configs.load(&gpu_class).await;
                ConfigCatalog::extract_ceiling(doc.as_ref())
            }
        };

        let device_count = self.probe.device_count().max(1) as usize;
        let tensor_parallel_size = self
            .config
            .tensor_parallel_size_override
            .unwrap_or(device_count)
            .clamp(1, device_count);

        if let Err(e) = self.driver.pull_if_missing(INFERENCE_IMAGE).await {
            warn!(error = %e, image = INFERENCE_IMAGE, "pull_if_missing failed, proceeding anyway");
        }

        self.driver.stop(&container_name).await;
        self.driver.remove(&container_name).await;

        let config_path = config_override
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| {
                self.config
                    .configs_dir()
                    .join(format!("{gpu_class}.yaml"))
                    .to_string_lossy()
                    .into_owned()
            });

        let spec = ContainerSpec {
            image: INFERENCE_IMAGE.to_string(),
            name: container_name.clone(),
            host_port: port,
            container_port: CONTAINER_PORT,
            gpu_attach: true,
            env: vec![("HF_TOKEN".to_string(), token.clone())],
            volumes: vec![
                (
                    HF_CACHE_HOST_DIR.to_string(),
                    HF_CACHE_CONTAINER_DIR.to_string(),
                    false,
                ),
                (config_path, CONFIG_MOUNT_PATH.to_string(), true),
            ],
            args: vec![
                "--model".to_string(),
                canonical_id.clone(),
                "--config".to_string(),
                CONFIG_MOUNT_PATH.to_string(),
                "--host".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                CONTAINER_PORT.to_string(),
                "--tensor-parallel-size".to_string(),
                tensor_parallel_size.to_string(),
                "--trust-remote-code".to_string(),
            ],
        };

        let container_id = match self.driver.run(&spec).await {
            Ok(id) => id,
            Err(e) => return fail(&format!("failed to launch container: {e}")),
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        if !self.driver.inspect_running(&container_id).await.unwrap_or(false) {
            let exit_code = self.driver.inspect_exit_code(&container_id).await.unwrap_or(-1);
            let logs = self.driver.logs(&container_id, 50).await;
            return DeployOutcome {
                success: false,
                message: format!(
                    "container exited shortly after start (code {exit_code}): {}",
                    logs.join("\n")
                ),
                container_id: Some(container_id),
                port: Some(port),
            };
        }

        // Extra grace period to catch crash-after-start, per §4.8 step 13.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let mut still_running = true;
        for _ in 0..3 {
            still_running = self.driver.inspect_running(&container_id).await.unwrap_or(false);
            if !still_running {
                break;
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        if !still_running {
            let exit_code = self.driver.inspect_exit_code(&container_id).await.unwrap_or(-1);
            let logs = self.driver.logs(&container_id, 50).await;
            return DeployOutcome {
                success: false,
                message: format!(
                    "container crashed after start (code {exit_code}): {}",
                    logs.join("\n")
                ),
                container_id: Some(container_id),
                port: Some(port),
            };
        }

        // Best-effort health probe — its result does not gate success, per
        // §4.8 step 14 (large models may still be loading).
        let healthy = probe_health(&self.config.vllm_host, port).await;
        info!(model_id = %canonical_id, healthy, "post-deploy health probe");

        let mut pid = self.driver.inspect_pid(&container_id).await.unwrap_or(0);
        if pid == 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            pid = self.driver.inspect_pid(&container_id).await.unwrap_or(0);
        }

        self.registry
            .register(&canonical_id, &container_id, &container_name, port, ceiling, &gpu_class, pid)
            .await;

        DeployOutcome {
            success: true,
            message: "deployed".to_string(),
            container_id: Some(container_id),
            port: Some(port),
        }
    }

    /// Allocates a host port: the requested port if free, else the first
    /// free port scanning upward from `start_port`, capped at start+1000.
    async fn allocate_port(
        &self,
        requested: Option<u16>,
        running: &[crate::registry::Deployment],
    ) -> Result<u16, String> {
        if let Some(port) = requested {
            if self.is_port_free(port, running).await {
                return Ok(port);
            }
            if let Some(owner) = running.iter().find(|d| d.port == port) {
                return Err(format!("port in use by {}", owner.container_name));
            }
            return Err(format!("port {port} in use"));
        }

        let start = self.config.start_port;
        for candidate in start..=start.saturating_add(PORT_SCAN_RANGE) {
            if self.is_port_free(candidate, running).await {
                return Ok(candidate);
            }
        }
        Err(format!(
            "no free port found in range {start}-{}",
            start.saturating_add(PORT_SCAN_RANGE)
        ))
    }

    async fn is_port_free(&self, port: u16, running: &[crate::registry::Deployment]) -> bool {
        if running.iter().any(|d| d.port == port) {
            return false;
        }
        TcpListener::bind(("0.0.0.0", port)).await.is_ok()
    }

    /// Derives the container name and removes the registry entry before
    /// stopping/removing the container, so a racing Aggregator iteration
    /// never observes a half-torn-down record.
    pub async fn spindown(&self, model_id: Option<&str>, container_id: Option<&str>) -> bool {
        let container_name = if let Some(model_id) = model_id {
            Some(container_name_for(model_id.trim()))
        } else if let Some(container_id) = container_id {
            self.registry
                .list_unpruned()
                .await
                .into_iter()
                .find(|d| d.container_id == container_id)
                .map(|d| d.container_name)
        } else {
            None
        };

        let Some(container_name) = container_name else {
            return false;
        };

        self.registry.unregister(&container_name).await;
        let stopped = self.driver.stop(&container_name).await;
        let removed = self.driver.remove(&container_name).await;
        stopped || removed
    }
}

fn fail(message: &str) -> DeployOutcome {
    DeployOutcome {
        success: false,
        message: message.to_string(),
        container_id: None,
        port: None,
    }
}

fn describe_catalog_error(err: &CatalogError) -> String {
    match err {
        CatalogError::NotFound => "model not found in catalog".to_string(),
        CatalogError::Status(code) => format!("catalog returned status {code}"),
        CatalogError::Connection(msg) => msg.clone(),
    }
}

/// One best-effort 2s HTTP health probe to `/health`.
async fn probe_health(host: &str, port: u16) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    let url = format!("http://{host}:{port}/health");
    client
        .get(&url)
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_outcome_carries_no_container_or_port() {
        let outcome = fail("nope");
        assert!(!outcome.success);
        assert_eq!(outcome.message, "nope");
        assert!(outcome.container_id.is_none());
        assert!(outcome.port.is_none());
    }

    #[test]
    fn catalog_error_descriptions_are_human_readable() {
        assert_eq!(describe_catalog_error(&CatalogError::NotFound), "model not found in catalog");
        assert_eq!(
            describe_catalog_error(&CatalogError::Status(503)),
            "catalog returned status 503"
        );
        assert_eq!(
            describe_catalog_error(&CatalogError::Connection("Timeout".into())),
            "Timeout"
        );
    }
}
