use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tracing::warn;

use crate::docker::ContainerDriver;
use crate::gpu::GpuProbe;
use crate::registry::Registry;
use crate::resolver::Resolver;
use crate::scrape::{ModelBlockData, ScrapeClient};

const DEFAULT_BLOCK_SIZE_BYTES: u64 = 16 * 1024;
/// Windowed sampling cadence and cap, per §4.7.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
const SAMPLE_CAP: usize = 100;

/// One model's contribution to a Snapshot.
#[derive(Debug, Clone, Serialize, Default)]
pub struct PerModelEntry {
    pub model_id: String,
    pub port: u16,
    pub allocated_vram_bytes: u64,
    pub used_kv_cache_bytes: u64,
}

/// The canonical per-instant reading. Derived; never stored.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Snapshot {
    pub total_vram_bytes: u64,
    pub allocated_vram_bytes: u64,
    pub used_kv_cache_bytes: u64,
    pub prefix_cache_hit_rate: f64,
    pub models: Vec<PerModelEntry>,
}

/// min/max/mean/p95/p99/count over a requested sampling window.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SeriesStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct AggregatedSnapshot {
    pub window_seconds: u64,
    pub sample_count: usize,
    pub allocated_vram_bytes: SeriesStats,
    pub used_kv_cache_bytes: SeriesStats,
    pub prefix_cache_hit_rate: SeriesStats,
    pub running_requests: SeriesStats,
    pub waiting_requests: SeriesStats,
    pub models: Vec<PerModelEntry>,
}

/// Internal result of one `Collect()` pass, carrying the system-wide request
/// counts that the windowed path needs but the public Snapshot does not
/// expose.
struct RawCollection {
    snapshot: Snapshot,
    total_running_requests: u64,
    total_waiting_requests: u64,
}

/// Combines GPU Probe + per-model Scrape + Process-to-Model Resolver into one
/// consistent Snapshot, then computes sliding-window statistics on request.
pub struct MetricAggregator {
    probe: Arc<GpuProbe>,
    registry: Registry,
    driver: Arc<ContainerDriver>,
    scrape: ScrapeClient,
    vllm_host: String,
}

impl MetricAggregator {
    pub fn new(
        probe: Arc<GpuProbe>,
        registry: Registry,
        driver: Arc<ContainerDriver>,
        vllm_host: String,
    ) -> Self {
        Self {
            probe,
            registry,
            driver,
            scrape: ScrapeClient::new(),
            vllm_host,
        }
    }

    /// Single-shot collection per §4.7.
    pub async fn collect(&self) -> Snapshot {
        self.collect_raw().await.snapshot
    }

    async fn collect_raw(&self) -> RawCollection {
        let (total, used, _free) = self.probe.total_device_memory().unwrap_or((0, 0, 0));

        let deployments = self.registry.list(&self.driver).await;

        // Scrape every running deployment concurrently — bounded concurrency
        // equal to the deployment count, per §4.7 step 3.
        let scrapes = join_all(deployments.iter().map(|d| {
            let scrape = self.scrape.clone();
            let host = self.vllm_host.clone();
            let port = d.port;
            async move { scrape.scrape(&host, port).await }
        }))
        .await;

        // Map compute processes to deployments via the resolver, accumulating
        // per-container allocated-VRAM from process memory.
        let mut allocated_by_container: HashMap<String, u64> = HashMap::new();
        match self.probe.compute_processes() {
            Ok(processes) => {
                for (pid, bytes) in processes {
                    let Some(resolved) = Resolver::resolve(pid).await else {
                        continue;
                    };
                    if let Some(d) = deployments
                        .iter()
                        .find(|d| Resolver::matches(&resolved, &d.container_id))
                    {
                        *allocated_by_container
                            .entry(d.container_name.clone())
                            .or_insert(0) += bytes;
                    }
                }
            }
            Err(_) => {
                // Probe unavailable: report zeros, don't crash (§4.1).
            }
        }

        let mut models = Vec::with_capacity(deployments.len());
        let mut total_running_requests = 0u64;
        let mut total_waiting_requests = 0u64;
        let mut hit_rate_sum = 0.0;
        let mut hit_rate_count = 0u64;

        for (deployment, block_data) in deployments.iter().zip(scrapes.iter()) {
            let allocated = allocated_by_container
                .get(&deployment.container_name)
                .copied()
                .unwrap_or(0);

            let used_kv_cache_bytes = used_kv_cache_bytes_for(block_data, allocated);

            if block_data.prefix_cache_hit_rate_percent > 0.0 {
                hit_rate_sum += block_data.prefix_cache_hit_rate_percent;
                hit_rate_count += 1;
            }
            total_running_requests += block_data.num_requests_running;
            total_waiting_requests += block_data.num_requests_waiting;

            models.push(PerModelEntry {
                model_id: deployment.model_id.clone(),
                port: deployment.port,
                allocated_vram_bytes: allocated,
                used_kv_cache_bytes,
            });
        }

        reconcile_unmatched_allocation(&mut models, used);

        let allocated_vram_bytes: u64 = models.iter().map(|m| m.allocated_vram_bytes).sum();
        let used_kv_cache_bytes: u64 = models.iter().map(|m| m.used_kv_cache_bytes).sum();
        let prefix_cache_hit_rate = if hit_rate_count > 0 {
            hit_rate_sum / hit_rate_count as f64
        } else {
            0.0
        };

        if total < used {
            warn!(total, used, "device reports allocated VRAM exceeding total");
        }

        RawCollection {
            snapshot: Snapshot {
                total_vram_bytes: total,
                allocated_vram_bytes,
                used_kv_cache_bytes,
                prefix_cache_hit_rate,
                models,
            },
            total_running_requests,
            total_waiting_requests,
        }
    }

    /// Windowed statistics over `window` seconds, clamped to [1, 60].
    pub async fn collect_aggregated(&self, window: u64) -> AggregatedSnapshot {
        let window = clamp_window(window);
        let deadline = Instant::now() + Duration::from_secs(window);

        let mut allocated_samples = Vec::new();
        let mut used_kv_samples = Vec::new();
        let mut hit_rate_samples = Vec::new();
        let mut running_samples = Vec::new();
        let mut waiting_samples = Vec::new();

        while Instant::now() < deadline && allocated_samples.len() < SAMPLE_CAP {
            let raw = self.collect_raw().await;
            allocated_samples.push(raw.snapshot.allocated_vram_bytes as f64);
            used_kv_samples.push(raw.snapshot.used_kv_cache_bytes as f64);
            hit_rate_samples.push(raw.snapshot.prefix_cache_hit_rate);
            running_samples.push(raw.total_running_requests as f64);
            waiting_samples.push(raw.total_waiting_requests as f64);
            tokio::time::sleep(SAMPLE_INTERVAL).await;
        }

        let sample_count = allocated_samples.len();
        let final_models = self.collect().await.models;

        AggregatedSnapshot {
            window_seconds: window,
            sample_count,
            allocated_vram_bytes: series_stats(&allocated_samples),
            used_kv_cache_bytes: series_stats(&used_kv_samples),
            prefix_cache_hit_rate: series_stats(&hit_rate_samples),
            running_requests: series_stats(&running_samples),
            waiting_requests: series_stats(&waiting_samples),
            models: final_models,
        }
    }
}

/// Used-KV-cache bytes for one model's scrape result, per §4.7 step 5.
/// Capped at `allocated` unconditionally — when no compute process has
/// been matched to the model yet (`allocated == 0`, e.g. the GPU probe is
/// unavailable), this correctly yields 0 rather than an unbacked estimate,
/// preserving `used ≤ allocated` regardless of whether reconciliation runs.
fn used_kv_cache_bytes_for(block_data: &ModelBlockData, allocated: u64) -> u64 {
    if !block_data.available {
        return 0;
    }
    let block_size = if allocated > 0 && block_data.num_gpu_blocks > 0 {
        allocated / block_data.num_gpu_blocks
    } else {
        DEFAULT_BLOCK_SIZE_BYTES
    };
    let utilized_blocks =
        round_half_to_nearest(block_data.num_gpu_blocks as f64 * block_data.kv_cache_usage_perc)
            .min(block_data.num_gpu_blocks);
    (utilized_blocks * block_size).min(allocated)
}

/// Clamps a requested aggregation window to [1, 60] seconds, per §4.7.
fn clamp_window(window: u64) -> u64 {
    window.clamp(1, 60)
}

/// Round half to nearest, per the §9 open-question resolution (ceiling vs.
/// round was inconsistent in the original; this picks round-half-to-nearest
/// for determinism).
fn round_half_to_nearest(value: f64) -> u64 {
    value.round().max(0.0) as u64
}

/// If total matched allocated-VRAM is under 50% of device-used VRAM,
/// distribute the unmatched remainder across models — proportionally to
/// their used-KV-cache bytes, or evenly if none report usage. This is the
/// aggregator's key invariant-enforcement step (§4.7 step 6).
fn reconcile_unmatched_allocation(models: &mut [PerModelEntry], device_used: u64) {
    if models.is_empty() {
        return;
    }
    let matched: u64 = models.iter().map(|m| m.allocated_vram_bytes).sum();
    if device_used == 0 || matched >= device_used / 2 {
        return;
    }
    let remainder = device_used - matched;
    let usage_total: u64 = models.iter().map(|m| m.used_kv_cache_bytes).sum();

    if usage_total > 0 {
        for model in models.iter_mut() {
            let share = (remainder as f64) * (model.used_kv_cache_bytes as f64 / usage_total as f64);
            model.allocated_vram_bytes += share.round() as u64;
        }
    } else {
        let even_share = remainder / models.len() as u64;
        for model in models.iter_mut() {
            model.allocated_vram_bytes += even_share;
        }
    }

    // Cap used-KV-cache at allocated-VRAM to preserve the invariant even
    // after redistribution.
    for model in models.iter_mut() {
        model.used_kv_cache_bytes = model.used_kv_cache_bytes.min(model.allocated_vram_bytes);
    }
}

/// p-th percentile via linear interpolation between adjacent ranks.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let idx = rank.floor() as usize;
    let frac = rank - idx as f64;
    if idx + 1 < sorted.len() {
        sorted[idx] + frac * (sorted[idx + 1] - sorted[idx])
    } else {
        sorted[idx]
    }
}

fn series_stats(samples: &[f64]) -> SeriesStats {
    if samples.is_empty() {
        return SeriesStats::default();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    let avg = sorted.iter().sum::<f64>() / sorted.len() as f64;
    SeriesStats {
        min,
        max,
        avg,
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
        count: sorted.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolation_matches_spec_example() {
        let samples: Vec<f64> = (0..=10).map(|i| i as f64 * 10.0).collect();
        let stats = series_stats(&samples);
        assert_eq!(stats.p95, 95.0);
        assert_eq!(stats.p99, 99.0);
        assert_eq!(stats.avg, 50.0);
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 100.0);
        assert_eq!(stats.count, 11);
    }

    #[test]
    fn series_stats_ordering_invariant_holds() {
        let samples = vec![3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
        let stats = series_stats(&samples);
        assert!(stats.min <= stats.p95);
        assert!(stats.p95 <= stats.p99);
        assert!(stats.p99 <= stats.max);
        assert!(stats.min <= stats.avg && stats.avg <= stats.max);
    }

    #[test]
    fn window_clamp_matches_spec_example() {
        // Literal scenario from §8: ?window=999 => window_seconds = 60.
        assert_eq!(clamp_window(999), 60);
        assert_eq!(clamp_window(0), 1);
        assert_eq!(clamp_window(30), 30);
    }

    #[test]
    fn used_kv_cache_bytes_is_zero_when_allocated_is_unknown() {
        // Reachable state: GPU probe unavailable (allocated never resolved
        // from any process) but the runtime is still scrapeable and reports
        // real usage. Must not emit an uncapped estimate.
        let block_data = ModelBlockData {
            num_gpu_blocks: 1000,
            block_size_bytes: 16 * 1024,
            kv_cache_usage_perc: 0.42,
            prefix_cache_hit_rate_percent: 0.0,
            num_requests_running: 0,
            num_requests_waiting: 0,
            available: true,
        };
        assert_eq!(used_kv_cache_bytes_for(&block_data, 0), 0);
    }

    #[test]
    fn used_kv_cache_bytes_caps_at_allocated_when_known() {
        let block_data = ModelBlockData {
            num_gpu_blocks: 1000,
            block_size_bytes: 16 * 1024,
            kv_cache_usage_perc: 1.0,
            prefix_cache_hit_rate_percent: 0.0,
            num_requests_running: 0,
            num_requests_waiting: 0,
            available: true,
        };
        // block_size derives to 10 bytes/block here; 1000 blocks * 10 =
        // 10_000 raw, but allocated is only 5_000.
        assert_eq!(used_kv_cache_bytes_for(&block_data, 5_000), 5_000);
    }

    #[test]
    fn used_kv_cache_bytes_is_zero_when_unavailable() {
        let block_data = ModelBlockData::default();
        assert_eq!(used_kv_cache_bytes_for(&block_data, 10_000), 0);
    }

    #[test]
    fn round_half_to_nearest_rounds_up_at_half() {
        assert_eq!(round_half_to_nearest(2.5), 3);
        assert_eq!(round_half_to_nearest(2.4), 2);
    }

    #[test]
    fn reconciliation_skips_when_majority_matched() {
        let mut models = vec![PerModelEntry {
            model_id: "m1".into(),
            port: 8000,
            allocated_vram_bytes: 6_000,
            used_kv_cache_bytes: 1_000,
        }];
        reconcile_unmatched_allocation(&mut models, 10_000);
        assert_eq!(models[0].allocated_vram_bytes, 6_000);
    }

    #[test]
    fn reconciliation_distributes_proportionally_to_usage() {
        let mut models = vec![
            PerModelEntry {
                model_id: "m1".into(),
                port: 8000,
                allocated_vram_bytes: 1_000,
                used_kv_cache_bytes: 300,
            },
            PerModelEntry {
                model_id: "m2".into(),
                port: 8001,
                allocated_vram_bytes: 1_000,
                used_kv_cache_bytes: 100,
            },
        ];
        reconcile_unmatched_allocation(&mut models, 10_000);
        // matched = 2000 < 5000 (50% of 10000) so remainder 8000 distributed 3:1.
        assert_eq!(models[0].allocated_vram_bytes, 1_000 + 6_000);
        assert_eq!(models[1].allocated_vram_bytes, 1_000 + 2_000);
    }

    #[test]
    fn reconciliation_splits_evenly_when_no_usage_reported() {
        let mut models = vec![
            PerModelEntry {
                model_id: "m1".into(),
                port: 8000,
                allocated_vram_bytes: 0,
                used_kv_cache_bytes: 0,
            },
            PerModelEntry {
                model_id: "m2".into(),
                port: 8001,
                allocated_vram_bytes: 0,
                used_kv_cache_bytes: 0,
            },
        ];
        reconcile_unmatched_allocation(&mut models, 10_000);
        assert_eq!(models[0].allocated_vram_bytes, 5_000);
        assert_eq!(models[1].allocated_vram_bytes, 5_000);
    }

    #[test]
    fn used_kv_cache_never_exceeds_allocated_after_reconciliation() {
        let mut models = vec![PerModelEntry {
            model_id: "m1".into(),
            port: 8000,
            allocated_vram_bytes: 0,
            used_kv_cache_bytes: 500,
        }];
        reconcile_unmatched_allocation(&mut models, 1_000);
        assert!(models[0].used_kv_cache_bytes <= models[0].allocated_vram_bytes);
    }
}
