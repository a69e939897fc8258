use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::docker::ContainerDriver;

/// Sample history is hard-capped at 100 entries per §3/§5.
const HISTORY_CAP: usize = 100;

/// One deployed inference runtime. Identity is its container name, which is
/// a deterministic function of model id (§3, invariant 7).
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub model_id: String,
    pub container_id: String,
    pub container_name: String,
    pub port: u16,
    pub memory_utilization_ceiling: f64,
    pub gpu_class: String,
    pub pid: u32,
    pub running: bool,
    /// FIFO history of observed VRAM-usage percentages, capped at 100.
    pub history: Vec<f64>,
    pub peak: f64,
}

/// Deterministic container name: `vllm-` + model id with every non-alphanumeric
/// character replaced by `-`.
pub fn container_name_for(model_id: &str) -> String {
    let mut name = String::with_capacity(model_id.len() + 5);
    name.push_str("vllm-");
    for c in model_id.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c);
        } else {
            name.push('-');
        }
    }
    name
}

/// Single in-process structure keyed by container name. Guarded by one
/// mutex (here, an `RwLock`) for the duration of each operation, including
/// the compound `prune_stale` → read sequence, so that no reader observes a
/// registry entry straddling a concurrent write.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, Deployment>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert a new deployment; idempotent — re-registering the same
    /// container name overwrites the prior record.
    pub async fn register(
        &self,
        model_id: &str,
        container_id: &str,
        container_name: &str,
        port: u16,
        ceiling: f64,
        gpu_class: &str,
        pid: u32,
    ) {
        let mut guard = self.inner.write().await;
        guard.insert(
            container_name.to_string(),
            Deployment {
                model_id: model_id.to_string(),
                container_id: container_id.to_string(),
                container_name: container_name.to_string(),
                port,
                memory_utilization_ceiling: ceiling,
                gpu_class: gpu_class.to_string(),
                pid,
                running: true,
                history: Vec::new(),
                peak: 0.0,
            },
        );
    }

    pub async fn unregister(&self, container_name: &str) {
        self.inner.write().await.remove(container_name);
    }

    /// Appends one sample to the named deployment's history (FIFO, cap 100)
    /// and updates its peak. No-op if the container name is unknown.
    pub async fn record_sample(&self, container_name: &str, percent: f64) {
        let mut guard = self.inner.write().await;
        if let Some(d) = guard.get_mut(container_name) {
            if d.history.len() >= HISTORY_CAP {
                d.history.remove(0);
            }
            d.history.push(percent);
            if percent > d.peak {
                d.peak = percent;
            }
        }
    }

    /// Returns a snapshot copy of the registry after first pruning stale
    /// entries. All external iteration must go through this method to
    /// guarantee freshness (§4.4). The prune-then-read is atomic w.r.t.
    /// other registry writers: the container-runtime query (the only
    /// suspension point) happens *before* the write lock is taken, then one
    /// guard covers both the retain and the snapshot collection.
    pub async fn list(&self, driver: &ContainerDriver) -> Vec<Deployment> {
        let running_names = Self::running_container_names(driver).await;

        let mut guard = self.inner.write().await;
        if let Some(names) = &running_names {
            guard.retain(|name, _| names.contains(name.as_str()));
        }
        guard.values().cloned().collect()
    }

    /// Like `list`, but does not consult the container runtime — used by
    /// callers that have already pruned in the same logical operation (e.g.
    /// the aggregator, which prunes once per `Collect`).
    pub async fn list_unpruned(&self) -> Vec<Deployment> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn get(&self, container_name: &str) -> Option<Deployment> {
        self.inner.read().await.get(container_name).cloned()
    }

    pub async fn find_by_model_id(&self, model_id: &str) -> Option<Deployment> {
        self.inner
            .read()
            .await
            .values()
            .find(|d| d.model_id == model_id)
            .cloned()
    }

    pub async fn running_count(&self) -> usize {
        self.inner.read().await.values().filter(|d| d.running).count()
    }

    pub async fn port_in_use(&self, port: u16) -> bool {
        self.inner.read().await.values().any(|d| d.port == port)
    }

    /// Queries the container runtime for currently-running deployments
    /// matching the registry's naming prefix (`vllm-`) and removes any
    /// registry entry absent from that set. This is the registry's
    /// consistency anchor against crashed or externally-removed containers.
    pub async fn prune_stale(&self, driver: &ContainerDriver) {
        let Some(running_names) = Self::running_container_names(driver).await else {
            return;
        };
        let mut guard = self.inner.write().await;
        guard.retain(|name, _| running_names.contains(name.as_str()));
    }

    /// Names of currently-running `vllm-`-prefixed containers, per the
    /// container runtime. Returns `None` when the runtime query itself
    /// failed (callers then leave the registry untouched rather than
    /// treating a query failure as "nothing is running"). Deliberately
    /// awaited *before* any write guard is taken — the subprocess spawn is
    /// the only suspension point in the prune-then-read sequence, so it
    /// must not happen while holding the lock.
    async fn running_container_names(
        driver: &ContainerDriver,
    ) -> Option<std::collections::HashSet<String>> {
        let running = driver.list_running("vllm-").await.ok()?;
        Some(running.into_iter().map(|c| c.name).collect())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_replaces_non_alphanumerics() {
        assert_eq!(
            container_name_for("Qwen/Qwen2.5-7B-Instruct"),
            "vllm-Qwen-Qwen2-5-7B-Instruct"
        );
    }

    #[test]
    fn container_name_is_deterministic() {
        assert_eq!(
            container_name_for("meta-llama/Llama-3-8B"),
            container_name_for("meta-llama/Llama-3-8B")
        );
    }

    #[tokio::test]
    async fn register_and_get_round_trips() {
        let registry = Registry::new();
        registry
            .register("m1", "abc123", "vllm-m1", 8000, 0.9, "A100", 42)
            .await;
        let d = registry.get("vllm-m1").await.unwrap();
        assert_eq!(d.model_id, "m1");
        assert_eq!(d.port, 8000);
        assert!(d.running);
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let registry = Registry::new();
        registry
            .register("m1", "abc", "vllm-m1", 8000, 0.9, "T4", 1)
            .await;
        registry.unregister("vllm-m1").await;
        assert!(registry.get("vllm-m1").await.is_none());
    }

    #[tokio::test]
    async fn history_is_capped_at_100_and_tracks_peak() {
        let registry = Registry::new();
        registry
            .register("m1", "abc", "vllm-m1", 8000, 0.9, "T4", 1)
            .await;
        for i in 0..150 {
            registry.record_sample("vllm-m1", i as f64).await;
        }
        let d = registry.get("vllm-m1").await.unwrap();
        assert_eq!(d.history.len(), 100);
        assert_eq!(d.peak, 149.0);
        // FIFO: oldest entries (0..50) were evicted.
        assert_eq!(d.history[0], 50.0);
    }

    #[tokio::test]
    async fn record_sample_is_noop_for_unknown_container() {
        let registry = Registry::new();
        registry.record_sample("vllm-ghost", 50.0).await;
        assert!(registry.get("vllm-ghost").await.is_none());
    }

    #[tokio::test]
    async fn port_in_use_reflects_registered_deployments() {
        let registry = Registry::new();
        registry
            .register("m1", "abc", "vllm-m1", 8001, 0.9, "T4", 1)
            .await;
        assert!(registry.port_in_use(8001).await);
        assert!(!registry.port_in_use(8002).await);
    }
}
