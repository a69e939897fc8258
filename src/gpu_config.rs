use std::path::{Path, PathBuf};

use tracing::warn;

/// YAML keys that may carry the memory-utilization ceiling, tried in order
/// per §4.8 step 6.
const CEILING_KEYS: [&str; 3] = [
    "gpu-memory-utilization",
    "gpu_memory_utilization",
    "max_gpu_utilization",
];

const DEFAULT_CEILING: f64 = 0.95;

/// Resolves and reads the per-GPU-class tuning file, falling back to
/// `T4.yaml` when the class-specific file is absent.
pub struct ConfigCatalog {
    configs_dir: PathBuf,
}

impl ConfigCatalog {
    pub fn new(configs_dir: PathBuf) -> Self {
        Self { configs_dir }
    }

    fn path_for(&self, gpu_class: &str) -> PathBuf {
        self.configs_dir.join(format!("{gpu_class}.yaml"))
    }

    /// Loads the YAML document for `gpu_class`, falling back to `T4.yaml`
    /// when missing. Returns `None` if neither file is readable.
    pub async fn load(&self, gpu_class: &str) -> Option<serde_yaml::Value> {
        let primary = self.path_for(gpu_class);
        match tokio::fs::read_to_string(&primary).await {
            Ok(contents) => return parse_or_warn(&primary, &contents),
            Err(_) if gpu_class != "T4" => {
                warn!(
                    gpu_class,
                    path = %primary.display(),
                    "per-GPU config not found, falling back to T4.yaml"
                );
            }
            Err(_) => {}
        }
        let fallback = self.path_for("T4");
        let contents = tokio::fs::read_to_string(&fallback).await.ok()?;
        parse_or_warn(&fallback, &contents)
    }

    /// Extracts the memory-utilization ceiling from a loaded document, trying
    /// each accepted spelling in order and defaulting to 0.95.
    pub fn extract_ceiling(doc: Option<&serde_yaml::Value>) -> f64 {
        let Some(doc) = doc else {
            return DEFAULT_CEILING;
        };
        for key in CEILING_KEYS {
            if let Some(value) = doc.get(key).and_then(|v| v.as_f64()) {
                return value;
            }
        }
        DEFAULT_CEILING
    }

    /// Writes a temporary config at `gpu-memory-utilization: <ceiling>`,
    /// used by the Optimization Controller to override the ceiling on
    /// redeploy. Returns the path written.
    pub async fn write_temp_ceiling(
        base_dir: &Path,
        container_name: &str,
        ceiling: f64,
    ) -> std::io::Result<PathBuf> {
        let path = base_dir.join(format!("{container_name}-optimized.yaml"));
        let contents = format!("gpu-memory-utilization: {ceiling}\n");
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }
}

fn parse_or_warn(path: &Path, contents: &str) -> Option<serde_yaml::Value> {
    match serde_yaml::from_str(contents) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse per-GPU config");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_matching_spelling() {
        let doc: serde_yaml::Value =
            serde_yaml::from_str("gpu_memory_utilization: 0.8\nother: 1").unwrap();
        assert_eq!(ConfigCatalog::extract_ceiling(Some(&doc)), 0.8);
    }

    #[test]
    fn prefers_hyphenated_spelling_first() {
        let doc: serde_yaml::Value = serde_yaml::from_str(
            "gpu-memory-utilization: 0.7\ngpu_memory_utilization: 0.8\n",
        )
        .unwrap();
        assert_eq!(ConfigCatalog::extract_ceiling(Some(&doc)), 0.7);
    }

    #[test]
    fn defaults_when_no_key_present() {
        let doc: serde_yaml::Value = serde_yaml::from_str("unrelated: true").unwrap();
        assert_eq!(ConfigCatalog::extract_ceiling(Some(&doc)), DEFAULT_CEILING);
    }

    #[test]
    fn defaults_when_document_absent() {
        assert_eq!(ConfigCatalog::extract_ceiling(None), DEFAULT_CEILING);
    }
}
