use std::path::PathBuf;

/// Process-wide configuration, resolved once from the environment at startup.
///
/// Mirrors the environment contract: every field has a documented default and
/// no key is required. `.env` (if `BLACKBOX_ROOT` points at a directory
/// containing one) is preloaded by the caller via `dotenvy` before this is
/// constructed.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub hf_token: Option<String>,
    pub max_concurrent_models: usize,
    pub gpu_type_override: Option<String>,
    pub start_port: u16,
    pub tensor_parallel_size_override: Option<usize>,
    pub use_sudo_docker: bool,
    pub vllm_host: String,
    pub log_level: String,
    pub blackbox_root: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            hf_token: std::env::var("HF_TOKEN").ok().filter(|s| !s.is_empty()),
            max_concurrent_models: std::env::var("MAX_CONCURRENT_MODELS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            gpu_type_override: std::env::var("GPU_TYPE").ok().filter(|s| !s.is_empty()),
            start_port: std::env::var("START_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            tensor_parallel_size_override: std::env::var("TENSOR_PARALLEL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok()),
            use_sudo_docker: std::env::var("USE_SUDO_DOCKER")
                .ok()
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(false),
            vllm_host: std::env::var("VLLM_HOST").unwrap_or_else(|_| "localhost".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            blackbox_root: std::env::var("BLACKBOX_ROOT").ok().map(PathBuf::from),
        }
    }

    /// Resolves the listen port from the first CLI argument, falling back to 6767.
    pub fn listen_port(args: &[String]) -> u16 {
        args.get(1).and_then(|s| s.parse().ok()).unwrap_or(6767)
    }

    /// `EnvFilter` directive derived from `LOG_LEVEL`, scoped to this crate.
    pub fn tracing_filter(&self) -> String {
        let level = match self.log_level.to_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARN" => "warn",
            "ERROR" => "error",
            _ => "info",
        };
        format!("blackbox_server={level},tower_http={level}")
    }

    /// Path to the per-GPU-class config directory, relative to `blackbox_root`
    /// when set, else the process's current directory.
    pub fn configs_dir(&self) -> PathBuf {
        let root = self
            .blackbox_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        root.join("blackbox-server/src/configs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            hf_token: None,
            max_concurrent_models: 3,
            gpu_type_override: None,
            start_port: 8000,
            tensor_parallel_size_override: None,
            use_sudo_docker: false,
            vllm_host: "localhost".to_string(),
            log_level: "INFO".to_string(),
            blackbox_root: None,
        }
    }

    #[test]
    fn defaults_match_spec() {
        let c = base_config();
        assert_eq!(c.max_concurrent_models, 3);
        assert_eq!(c.start_port, 8000);
        assert_eq!(c.vllm_host, "localhost");
        assert!(!c.use_sudo_docker);
    }

    #[test]
    fn listen_port_defaults_to_6767() {
        assert_eq!(AppConfig::listen_port(&["bin".to_string()]), 6767);
    }

    #[test]
    fn listen_port_reads_first_positional_arg() {
        let args = vec!["bin".to_string(), "9090".to_string()];
        assert_eq!(AppConfig::listen_port(&args), 9090);
    }

    #[test]
    fn listen_port_ignores_unparseable_arg() {
        let args = vec!["bin".to_string(), "not-a-port".to_string()];
        assert_eq!(AppConfig::listen_port(&args), 6767);
    }

    #[test]
    fn tracing_filter_respects_log_level() {
        let mut c = base_config();
        c.log_level = "DEBUG".to_string();
        assert_eq!(c.tracing_filter(), "blackbox_server=debug,tower_http=debug");
    }

    #[test]
    fn tracing_filter_defaults_to_info_for_unknown_level() {
        let mut c = base_config();
        c.log_level = "TRACE".to_string();
        assert_eq!(c.tracing_filter(), "blackbox_server=info,tower_http=info");
    }

    #[test]
    fn configs_dir_joins_blackbox_root() {
        let mut c = base_config();
        c.blackbox_root = Some(PathBuf::from("/srv/app"));
        assert_eq!(
            c.configs_dir(),
            PathBuf::from("/srv/app/blackbox-server/src/configs")
        );
    }
}
