use std::time::Duration;

use tracing::debug;

/// One runtime's scraped metric values. `available` is false whenever the
/// scrape failed, timed out, or reported zero KV-cache blocks.
#[derive(Debug, Clone, Default)]
pub struct ModelBlockData {
    pub num_gpu_blocks: u64,
    pub block_size_bytes: u64,
    pub kv_cache_usage_perc: f64,
    pub prefix_cache_hit_rate_percent: f64,
    pub num_requests_running: u64,
    pub num_requests_waiting: u64,
    pub available: bool,
}

const DEFAULT_BLOCK_SIZE_BYTES: u64 = 16 * 1024;

#[derive(Clone)]
pub struct ScrapeClient {
    client: reqwest::Client,
}

impl ScrapeClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(1000))
            .timeout(Duration::from_millis(2000))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Fetches and parses `http://<host>:<port>/metrics`. Never returns an
    /// error: any network or parse failure yields `available: false`.
    pub async fn scrape(&self, host: &str, port: u16) -> ModelBlockData {
        let url = format!("http://{host}:{port}/metrics");
        match self.client.get(&url).send().await {
            Ok(resp) => match resp.text().await {
                Ok(body) => parse_exposition(&body),
                Err(e) => {
                    debug!(url, error = %e, "scrape body read failed");
                    ModelBlockData::default()
                }
            },
            Err(e) => {
                debug!(url, error = %e, "scrape request failed");
                ModelBlockData::default()
            }
        }
    }
}

impl Default for ScrapeClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses the small, fixed set of series this system cares about out of an
/// exposition-format metrics page. Unrecognized lines and `#`-prefixed
/// comment lines are ignored.
fn parse_exposition(body: &str) -> ModelBlockData {
    let mut num_gpu_blocks = 0u64;
    let mut kv_cache_usage_perc = 0.0f64;
    let mut prefix_cache_queries = 0.0f64;
    let mut prefix_cache_hits = 0.0f64;
    let mut num_requests_running = 0u64;
    let mut num_requests_waiting = 0u64;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.contains("cache_config_info") {
            if let Some(v) = extract_label(line, "num_gpu_blocks") {
                num_gpu_blocks = v.parse().unwrap_or(0);
            }
        } else if line.contains("kv_cache_usage_perc") {
            if let Some(v) = value_after_last_brace(line) {
                kv_cache_usage_perc = v.parse().unwrap_or(0.0).clamp(0.0, 1.0);
            }
        } else if line.contains("prefix_cache_queries_total") {
            if let Some(v) = value_after_last_brace(line) {
                prefix_cache_queries = v.parse().unwrap_or(0.0);
            }
        } else if line.contains("prefix_cache_hits_total") {
            if let Some(v) = value_after_last_brace(line) {
                prefix_cache_hits = v.parse().unwrap_or(0.0);
            }
        } else if line.contains("num_requests_running") {
            if let Some(v) = value_after_last_brace(line) {
                num_requests_running = v.parse::<f64>().unwrap_or(0.0).max(0.0) as u64;
            }
        } else if line.contains("num_requests_waiting") {
            if let Some(v) = value_after_last_brace(line) {
                num_requests_waiting = v.parse::<f64>().unwrap_or(0.0).max(0.0) as u64;
            }
        }
    }

    let prefix_cache_hit_rate_percent = if prefix_cache_queries > 0.0 {
        (prefix_cache_hits / prefix_cache_queries * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    ModelBlockData {
        num_gpu_blocks,
        block_size_bytes: DEFAULT_BLOCK_SIZE_BYTES,
        kv_cache_usage_perc,
        prefix_cache_hit_rate_percent,
        num_requests_running,
        num_requests_waiting,
        available: num_gpu_blocks > 0,
    }
}

/// Pulls a decimal-digits-only label value (e.g. `num_gpu_blocks="1234"`) out
/// of a metric line's label set.
fn extract_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let needle = format!("{label}=\"");
    let start = line.find(&needle)? + needle.len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    let value = &rest[..end];
    if value.chars().all(|c| c.is_ascii_digit()) && !value.is_empty() {
        Some(value)
    } else {
        None
    }
}

/// Returns the float value found after the last `}` on a metric line, i.e.
/// the sample value following a label set (or the bare value when there is
/// no label set).
fn value_after_last_brace(line: &str) -> Option<&str> {
    let tail = match line.rfind('}') {
        Some(idx) => &line[idx + 1..],
        None => {
            let sp = line.find(' ')?;
            &line[sp..]
        }
    };
    let value = tail.trim().split_whitespace().next()?;
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_exposition_page() {
        let body = r#"
# HELP vllm:cache_config_info info
# TYPE vllm:cache_config_info gauge
vllm:cache_config_info{num_gpu_blocks="1000",block_size="16"} 1
vllm:kv_cache_usage_perc{model="x"} 0.42
vllm:prefix_cache_queries_total 200
vllm:prefix_cache_hits_total 50
vllm:num_requests_running 3
vllm:num_requests_waiting 1
"#;
        let data = parse_exposition(body);
        assert!(data.available);
        assert_eq!(data.num_gpu_blocks, 1000);
        assert_eq!(data.kv_cache_usage_perc, 0.42);
        assert_eq!(data.prefix_cache_hit_rate_percent, 25.0);
        assert_eq!(data.num_requests_running, 3);
        assert_eq!(data.num_requests_waiting, 1);
        assert_eq!(data.block_size_bytes, DEFAULT_BLOCK_SIZE_BYTES);
    }

    #[test]
    fn unavailable_when_no_blocks_reported() {
        let data = parse_exposition("# nothing here\n");
        assert!(!data.available);
        assert_eq!(data.num_gpu_blocks, 0);
    }

    #[test]
    fn clamps_kv_cache_usage_perc_to_unit_interval() {
        let body = r#"vllm:cache_config_info{num_gpu_blocks="10"} 1
vllm:kv_cache_usage_perc{} 1.5"#;
        let data = parse_exposition(body);
        assert_eq!(data.kv_cache_usage_perc, 1.0);
    }

    #[test]
    fn zero_queries_yields_zero_hit_rate_without_dividing_by_zero() {
        let body = r#"vllm:cache_config_info{num_gpu_blocks="10"} 1"#;
        let data = parse_exposition(body);
        assert_eq!(data.prefix_cache_hit_rate_percent, 0.0);
    }
}
