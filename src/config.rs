use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Environment variable holding the preferred listen port
pub const PORT_ENV: &str = "PORT";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// API reverse proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Static site configuration
    #[serde(default)]
    pub site: SiteConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Preferred listen port (default: 3000, overridden by $PORT)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Ports tried in order when the preferred port is taken
    #[serde(default = "default_fallback_ports")]
    pub fallback_ports: Vec<u16>,
}

impl ServerConfig {
    /// Preferred port followed by the fallbacks, in probe order
    pub fn candidate_ports(&self) -> Vec<u16> {
        let mut ports = Vec::with_capacity(self.fallback_ports.len() + 1);
        ports.push(self.port);
        ports.extend(self.fallback_ports.iter().copied());
        ports
    }

    pub fn bind_ip(&self) -> anyhow::Result<IpAddr> {
        self.bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            fallback_ports: default_fallback_ports(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Path prefix forwarded to the upstream (default: /api)
    #[serde(default = "default_api_prefix")]
    pub prefix: String,

    /// Upstream host (default: 127.0.0.1)
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Upstream port (default: 5000)
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,

    /// Path probed once at startup to report upstream readiness
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl ProxyConfig {
    pub fn upstream_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self.upstream_host.parse().map_err(|e| {
            anyhow::anyhow!("Invalid upstream host '{}': {}", self.upstream_host, e)
        })?;
        Ok(SocketAddr::new(ip, self.upstream_port))
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            prefix: default_api_prefix(),
            upstream_host: default_upstream_host(),
            upstream_port: default_upstream_port(),
            health_path: default_health_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    /// Build directories tried in order; the first with an index.html wins
    #[serde(default = "default_site_candidates")]
    pub candidates: Vec<PathBuf>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            candidates: default_site_candidates(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

fn default_fallback_ports() -> Vec<u16> {
    vec![3001, 3002]
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_upstream_port() -> u16 {
    5000
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_site_candidates() -> Vec<PathBuf> {
    // Root build first, then the nested frontend build, then a plain public dir
    vec![
        PathBuf::from("build"),
        PathBuf::from("frontend/build"),
        PathBuf::from("public"),
    ]
}

impl GatewayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Override the preferred port with a raw `$PORT` value. Unset and empty
    /// values leave the configured port alone.
    pub fn apply_port_override(&mut self, raw: Option<&str>) -> anyhow::Result<()> {
        if let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) {
            let port: u16 = raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {} value '{}': {}", PORT_ENV, raw, e))?;
            self.server.port = port;
        }
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        let port = std::env::var(PORT_ENV).ok();
        self.apply_port_override(port.as_deref())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.bind.parse::<IpAddr>().is_err() {
            errors.push(format!("server.bind '{}' is not an IP address", self.server.bind));
        }

        if !self.proxy.prefix.starts_with('/') {
            errors.push(format!("proxy.prefix '{}' must start with '/'", self.proxy.prefix));
        }

        if self.proxy.upstream_host.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "proxy.upstream_host '{}' is not an IP address",
                self.proxy.upstream_host
            ));
        }

        if self.proxy.upstream_port == 0 {
            errors.push("proxy.upstream_port must be greater than 0".to_string());
        }

        if self.site.candidates.is_empty() {
            errors.push("site.candidates must list at least one directory".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
port = 8080
fallback_ports = [8081]

[proxy]
prefix = "/backend"
upstream_host = "10.0.0.5"
upstream_port = 9000

[site]
candidates = ["dist", "www"]
"#;

        let config: GatewayConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.candidate_ports(), vec![8080, 8081]);
        assert_eq!(config.proxy.prefix, "/backend");
        assert_eq!(config.proxy.upstream_addr().unwrap().to_string(), "10.0.0.5:9000");
        assert_eq!(
            config.site.candidates,
            vec![PathBuf::from("dist"), PathBuf::from("www")]
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.candidate_ports(), vec![3000, 3001, 3002]);
        assert_eq!(config.proxy.prefix, "/api");
        assert_eq!(config.proxy.upstream_addr().unwrap().to_string(), "127.0.0.1:5000");
        assert_eq!(config.proxy.health_path, "/health");
        assert_eq!(config.site.candidates.len(), 3);
        assert_eq!(config.site.candidates[0], PathBuf::from("build"));
    }

    #[test]
    fn test_example_config_matches_defaults() {
        let config: GatewayConfig = toml::from_str(include_str!("../gateway.example.toml")).unwrap();
        config.validate().unwrap();

        let defaults = GatewayConfig::default();
        assert_eq!(config.server.candidate_ports(), defaults.server.candidate_ports());
        assert_eq!(config.proxy.upstream_addr().unwrap(), defaults.proxy.upstream_addr().unwrap());
        assert_eq!(config.site.candidates, defaults.site.candidates);
    }

    #[test]
    fn test_port_override() {
        let mut config = GatewayConfig::default();
        config.apply_port_override(Some("4000")).unwrap();
        assert_eq!(config.server.candidate_ports(), vec![4000, 3001, 3002]);

        config.apply_port_override(None).unwrap();
        assert_eq!(config.server.port, 4000);
    }

    #[test]
    fn test_empty_port_is_unset() {
        let mut config = GatewayConfig::default();
        config.apply_port_override(Some("")).unwrap();
        config.apply_port_override(Some("  ")).unwrap();
        assert_eq!(config.server.candidate_ports(), vec![3000, 3001, 3002]);
    }

    #[test]
    fn test_port_override_rejects_garbage() {
        let mut config = GatewayConfig::default();
        assert!(config.apply_port_override(Some("http")).is_err());
        assert!(config.apply_port_override(Some("70000")).is_err());
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let toml = r#"
[server]
bind = "not-an-ip"

[proxy]
prefix = "api"
upstream_port = 0
"#;
        let config: GatewayConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("server.bind"), "{}", err);
        assert!(err.contains("proxy.prefix"), "{}", err);
        assert!(err.contains("proxy.upstream_port"), "{}", err);
    }

    #[test]
    fn test_upstream_addr() {
        let proxy = ProxyConfig::default();
        let addr = proxy.upstream_addr().unwrap();
        assert_eq!(addr, "127.0.0.1:5000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[server]\nport = 3100\n").unwrap();

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 3100);
        assert_eq!(config.server.fallback_ports, vec![3001, 3002]);
    }
}
