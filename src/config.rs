use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub strict: bool,
    pub hostname: Option<String>,
    pub logger: Logger,

    pub listen_addr: String,
    pub backend_url: String,

    /// Only requests matching both restrict_route_regexp and restrict_method
    /// are cached. An empty list matches anything.
    pub restrict_route_regexp: Vec<String>,
    pub restrict_method: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub backend_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub cache_error_ttl: Duration,

    pub groupcache_port: u16,
    pub groupcache_size_bytes: u64,

    pub purge_expired: bool,
    #[serde(with = "humantime_serde")]
    pub purge_interval: Duration,

    /// Static peer addresses handed to discovery. Cloud discoverers plug in
    /// through the PeerSource trait instead.
    pub peers: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub discovery_interval: Duration,
    pub force_single_task: bool,
    pub advertise_ip: String,

    pub health_addr: String,
    pub health_path: String,
    pub metrics_addr: String,
    pub metrics_path: String,

    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strict: false,
            hostname: None,
            logger: Logger::default(),
            listen_addr: ":8080".to_string(),
            backend_url: "http://127.0.0.1:9000".to_string(),
            restrict_route_regexp: Vec::new(),
            restrict_method: Vec::new(),
            backend_timeout: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(300),
            cache_error_ttl: Duration::from_secs(60),
            groupcache_port: 5000,
            groupcache_size_bytes: 100_000_000,
            purge_expired: true,
            purge_interval: Duration::from_secs(60),
            peers: Vec::new(),
            discovery_interval: Duration::from_secs(20),
            force_single_task: false,
            advertise_ip: "127.0.0.1".to_string(),
            health_addr: ":8888".to_string(),
            health_path: "/health".to_string(),
            metrics_addr: ":3000".to_string(),
            metrics_path: "/metrics".to_string(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(anyhow!("listen_addr is required"));
        }
        let backend: http::Uri = self
            .backend_url
            .parse()
            .with_context(|| format!("backend_url: '{}'", self.backend_url))?;
        if backend.scheme_str().is_none() || backend.authority().is_none() {
            return Err(anyhow!(
                "backend_url must carry scheme and host: '{}'",
                self.backend_url
            ));
        }
        if self.groupcache_port == 0 {
            return Err(anyhow!("groupcache_port is required"));
        }
        if self.groupcache_size_bytes == 0 {
            return Err(anyhow!("groupcache_size_bytes must be positive"));
        }
        Ok(())
    }

    /// Address peers use to reach this instance's cache port.
    pub fn advertise_addr(&self) -> String {
        format!("{}:{}", self.advertise_ip, self.groupcache_port)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Logger {
    pub level: String,
    pub path: String,
    pub max_size: u64,
    pub max_backups: u64,
}

pub fn load(path: &Path) -> Result<(Config, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Config = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}
