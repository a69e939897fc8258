use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::docker::ContainerDriver;
use crate::registry::Registry;

const PROBE_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Periodic liveness probe of every registered deployment. Observability
/// only — it never mutates registry membership; pruning stale entries
/// remains the Registry's own responsibility.
pub fn spawn(registry: Registry, driver: Arc<ContainerDriver>, vllm_host: String) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROBE_INTERVAL);
        interval.tick().await; // first tick is immediate — skip it
        loop {
            interval.tick().await;
            let deployments = registry.list(&driver).await;
            for deployment in deployments {
                let healthy = probe_health(&vllm_host, deployment.port).await;
                if healthy {
                    debug!(model_id = %deployment.model_id, "health check ok");
                } else {
                    warn!(model_id = %deployment.model_id, port = deployment.port, "health check failed");
                }
            }
        }
    });
}

async fn probe_health(host: &str, port: u16) -> bool {
    let client = match reqwest::Client::builder().timeout(HEALTH_TIMEOUT).build() {
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
