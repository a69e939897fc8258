use tokio::fs;

/// Maps a GPU compute process to the owning deployment via `/proc/<pid>/cgroup`
/// inspection. Processes that cannot be attributed to any registered
/// container contribute only to system-level totals.
pub struct Resolver;

impl Resolver {
    /// Reads `/proc/<pid>/cgroup` and extracts the container id prefix, if any.
    pub async fn resolve(pid: u32) -> Option<String> {
        let path = format!("/proc/{pid}/cgroup");
        let content = fs::read_to_string(&path).await.ok()?;
        extract_container_id(&content)
    }

    /// Matches a resolved container id against the registry's known
    /// container ids. Either side may be a truncated form of the other, so
    /// the match is a bidirectional `starts_with`.
    pub fn matches(resolved: &str, registry_id: &str) -> bool {
        resolved.starts_with(registry_id) || registry_id.starts_with(resolved)
    }
}

/// Extracts a container id from raw `/proc/<pid>/cgroup` content, matching
/// both classic `/docker/<id>` paths and `cri-containerd-<id>` cgroup v2
/// naming.
fn extract_container_id(content: &str) -> Option<String> {
    for line in content.lines() {
        if let Some(idx) = line.find("/docker/") {
            let rest = &line[idx + "/docker/".len()..];
            let id = take_hex_prefix(rest);
            if !id.is_empty() {
                return Some(id);
            }
        }
        if let Some(idx) = line.find("cri-containerd-") {
            let rest = &line[idx + "cri-containerd-".len()..];
            let id = take_hex_prefix(rest);
            if !id.is_empty() {
                return Some(id);
            }
        }
    }
    None
}

fn take_hex_prefix(s: &str) -> String {
    s.chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_classic_docker_cgroup_path() {
        let content = "12:devices:/docker/abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789\n";
        let id = extract_container_id(content).unwrap();
        assert!(id.starts_with("abcdef0123456789"));
    }

    #[test]
    fn extracts_containerd_cgroup_path() {
        let content = "0::/kubepods/besteffort/pod123/cri-containerd-fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210.scope\n";
        let id = extract_container_id(content).unwrap();
        assert!(id.starts_with("fedcba9876543210"));
    }

    #[test]
    fn returns_none_when_no_match() {
        let content = "0::/user.slice/user-1000.slice\n";
        assert!(extract_container_id(content).is_none());
    }

    #[test]
    fn bidirectional_prefix_match() {
        assert!(Resolver::matches("abcdef0123", "abcdef"));
        assert!(Resolver::matches("abcdef", "abcdef0123"));
        assert!(!Resolver::matches("abcdef", "123456"));
    }
}
