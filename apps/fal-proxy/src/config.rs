/// Proxy settings read from the environment
use gateway::config::DEFAULT_UPSTREAM_BASE;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address
    pub addr: String,

    /// Server-held key used when the caller sends none
    pub fallback_key: Option<String>,

    /// Base URL that path-suffix targets are resolved against
    pub upstream_base: String,

    /// Hosts (and their subdomains) an explicit target may point at. The
    /// upstream base host is always allowed.
    pub allowed_hosts: Vec<String>,
}

pub const DEFAULT_ALLOWED_HOSTS: [&str; 2] = ["fal.run", "fal.ai"];

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3333".to_string(),
            fallback_key: None,
            upstream_base: DEFAULT_UPSTREAM_BASE.to_string(),
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Self {
            addr: non_empty("FAL_PROXY_ADDR").unwrap_or(defaults.addr),
            fallback_key: non_empty("FAL_KEY"),
            upstream_base: non_empty("FAL_UPSTREAM_BASE").unwrap_or(defaults.upstream_base),
            allowed_hosts: non_empty("FAL_ALLOWED_HOSTS")
                .map(|list| {
                    list.split(',')
                        .map(|h| h.trim().to_ascii_lowercase())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.allowed_hosts),
        }
    }

    pub fn host_allowed(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let base_host = reqwest::Url::parse(&self.upstream_base)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase));

        base_host
            .iter()
            .chain(self.allowed_hosts.iter())
            .any(|allowed| host == *allowed || host.ends_with(&format!(".{}", allowed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_without_env() {
        let config = ProxyConfig::from_lookup(|_| None);
        assert_eq!(config.addr, "127.0.0.1:3333");
        assert_eq!(config.fallback_key, None);
        assert_eq!(config.upstream_base, DEFAULT_UPSTREAM_BASE);
        assert_eq!(config.allowed_hosts, vec!["fal.run", "fal.ai"]);
    }

    #[test]
    fn test_host_allowed() {
        let config = ProxyConfig::default();
        assert!(config.host_allowed("queue.fal.run"));
        assert!(config.host_allowed("fal.run"));
        assert!(config.host_allowed("v3.FAL.media.fal.ai"));
        assert!(!config.host_allowed("evil.example"));
        assert!(!config.host_allowed("notfal.run"));
        assert!(!config.host_allowed("fal.run.evil.example"));

        let local = ProxyConfig {
            upstream_base: "http://127.0.0.1:9000".to_string(),
            allowed_hosts: Vec::new(),
            ..ProxyConfig::default()
        };
        assert!(local.host_allowed("127.0.0.1"));
        assert!(!local.host_allowed("queue.fal.run"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FAL_KEY", "server-key"),
            ("FAL_PROXY_ADDR", "0.0.0.0:8080"),
            ("FAL_UPSTREAM_BASE", "  "),
            ("FAL_ALLOWED_HOSTS", "fal.run, Staging.Example ,"),
        ]
        .into_iter()
        .collect();

        let config = ProxyConfig::from_lookup(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.fallback_key.as_deref(), Some("server-key"));
        assert_eq!(config.addr, "0.0.0.0:8080");
        assert_eq!(config.upstream_base, DEFAULT_UPSTREAM_BASE);
        assert_eq!(config.allowed_hosts, vec!["fal.run", "staging.example"]);
    }
}
