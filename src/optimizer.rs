use std::path::PathBuf;

use tracing::info;

use crate::docker::ContainerDriver;
use crate::gpu_config::ConfigCatalog;
use crate::lifecycle::Lifecycle;
use crate::registry::{Deployment, Registry};

/// Minimum sample count before a deployment is eligible for restart analysis.
const MIN_SAMPLES: usize = 10;
/// Fraction of the configured ceiling a deployment's mean usage must fall
/// under to be marked for restart.
const UNDERUTILIZATION_FACTOR: f64 = 0.7;

/// Observes long-run memory-utilization histories per model and restarts
/// models whose sustained usage no longer justifies their current ceiling.
pub struct Optimizer {
    registry: Registry,
    driver: std::sync::Arc<ContainerDriver>,
    lifecycle: std::sync::Arc<Lifecycle>,
    temp_config_dir: PathBuf,
}

impl Optimizer {
    pub fn new(
        registry: Registry,
        driver: std::sync::Arc<ContainerDriver>,
        lifecycle: std::sync::Arc<Lifecycle>,
        temp_config_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            driver,
            lifecycle,
            temp_config_dir,
        }
    }

    /// Restarts every deployment whose sustained memory usage no longer
    /// justifies its current ceiling, at a tighter one. Returns the
    /// container names restarted.
    pub async fn optimize(&self) -> Vec<String> {
        let deployments = self.registry.list(&self.driver).await;
        let marked: Vec<Deployment> = deployments
            .into_iter()
            .filter(|d| should_restart(d))
            .collect();

        let mut restarted = Vec::with_capacity(marked.len());
        for deployment in marked {
            let new_ceiling = (deployment.peak / 100.0).clamp(0.1, 0.95);
            info!(
                model_id = %deployment.model_id,
                old_ceiling = deployment.memory_utilization_ceiling,
                new_ceiling,
                "restarting underutilized deployment with a tighter ceiling"
            );

            self.lifecycle
                .spindown(Some(&deployment.model_id), None)
                .await;

            let config_path = match ConfigCatalog::write_temp_ceiling(
                &self.temp_config_dir,
                &deployment.container_name,
                new_ceiling,
            )
            .await
            {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(
                        model_id = %deployment.model_id,
                        error = %e,
                        "failed to write temp ceiling config, skipping redeploy"
                    );
                    continue;
                }
            };

            let outcome = self
                .lifecycle
                .deploy(
                    &deployment.model_id,
                    None,
                    Some(deployment.port),
                    Some(&deployment.gpu_class),
                    Some(config_path),
                )
                .await;

            if outcome.success {
                restarted.push(deployment.container_name);
            }
        }
        restarted
    }
}

/// A deployment is a restart candidate when it has enough history to trust
/// the mean, that mean sits well under the configured ceiling, and it has
/// actually seen nonzero peak usage (a deployment that never recorded any
/// usage is not "underutilized", it's simply unobserved).
fn should_restart(d: &Deployment) -> bool {
    if d.history.len() < MIN_SAMPLES {
        return false;
    }
    let mean = d.history.iter().sum::<f64>() / d.history.len() as f64;
    let threshold = d.memory_utilization_ceiling * 100.0 * UNDERUTILIZATION_FACTOR;
    mean < threshold && d.peak > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment_with(history: Vec<f64>, ceiling: f64, peak: f64) -> Deployment {
        Deployment {
            model_id: "m1".into(),
            container_id: "abc".into(),
            container_name: "vllm-m1".into(),
            port: 8000,
            memory_utilization_ceiling: ceiling,
            gpu_class: "T4".into(),
            pid: 1,
            running: true,
            history,
            peak,
        }
    }

    #[test]
    fn requires_minimum_sample_count() {
        let d = deployment_with(vec![10.0; 5], 0.9, 20.0);
        assert!(!should_restart(&d));
    }

    #[test]
    fn marks_when_mean_under_threshold_and_peak_nonzero() {
        // ceiling 0.9 => threshold = 63.0; mean of all-20s is well under.
        let d = deployment_with(vec![20.0; 10], 0.9, 25.0);
        assert!(should_restart(&d));
    }

    #[test]
    fn does_not_mark_when_mean_meets_threshold() {
        let d = deployment_with(vec![80.0; 10], 0.9, 85.0);
        assert!(!should_restart(&d));
    }

    #[test]
    fn does_not_mark_when_peak_is_zero() {
        let d = deployment_with(vec![0.0; 10], 0.9, 0.0);
        assert!(!should_restart(&d));
    }
}
