use crate::supervisor::ProxyCommand;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Process configuration for routekeeper
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Well-known file locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// External proxy process settings
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API (default: 8080)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Static bearer token granting every capability.
    /// If neither this nor `auth_url` is set, a random token is generated at startup and logged.
    pub admin_token: Option<String>,

    /// Base URL of the external authorization service
    pub auth_url: Option<String>,

    /// Timeout for authorization lookups in seconds (default: 5)
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
}

impl ServerConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            auth_url: None,
            auth_timeout_secs: default_auth_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Routing state file (must exist at startup)
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Directory the proxy includes generated files from
    #[serde(default = "default_conf_dir")]
    pub conf_dir: PathBuf,

    /// Stem of the aggregate entry point file inside `conf_dir`
    #[serde(default = "default_aggregate_name")]
    pub aggregate_name: String,

    /// Top-level proxy configuration file
    #[serde(default = "default_main_config")]
    pub main_config: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            conf_dir: default_conf_dir(),
            aggregate_name: default_aggregate_name(),
            main_config: default_main_config(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Command that runs the proxy in the foreground
    #[serde(default = "default_start_command")]
    pub start_command: String,

    /// Command that signals the running proxy to reload
    #[serde(default = "default_reload_command")]
    pub reload_command: String,

    /// Port generated server blocks listen on (default: 80)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Maximum time a reload may take in seconds (default: 10)
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL at shutdown (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Write the top-level proxy configuration at startup (default: true)
    #[serde(default = "default_true")]
    pub write_main_config: bool,
}

impl ProxyConfig {
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            start_command: default_start_command(),
            reload_command: default_reload_command(),
            listen_port: default_listen_port(),
            reload_timeout_secs: default_reload_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            write_main_config: true,
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    8080
}

fn default_auth_timeout() -> u64 {
    5
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/etc/loadmanager/state/routekeeper.state")
}

fn default_conf_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/conf.d")
}

fn default_aggregate_name() -> String {
    "routekeeper".to_string()
}

fn default_main_config() -> PathBuf {
    PathBuf::from("/etc/nginx/nginx.conf")
}

fn default_start_command() -> String {
    "nginx -g 'daemon off;'".to_string()
}

fn default_reload_command() -> String {
    "nginx -s reload".to_string()
}

fn default_listen_port() -> u16 {
    80
}

fn default_reload_timeout() -> u64 {
    10
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration; a missing file means all defaults
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config: Config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No configuration file, using defaults");
                Config::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = ProxyCommand::parse(&self.proxy.start_command) {
            errors.push(format!("proxy.start_command: {}", e));
        }
        if let Err(e) = ProxyCommand::parse(&self.proxy.reload_command) {
            errors.push(format!("proxy.reload_command: {}", e));
        }
        if self.proxy.listen_port == 0 {
            errors.push("proxy.listen_port must be greater than 0".to_string());
        }
        if self.proxy.reload_timeout_secs == 0 {
            errors.push("proxy.reload_timeout_secs must be greater than 0".to_string());
        }
        if self.paths.aggregate_name.is_empty()
            || self.paths.aggregate_name.contains(['/', '\\'])
        {
            errors.push(format!(
                "paths.aggregate_name '{}' must be a plain file stem",
                self.paths.aggregate_name
            ));
        }
        if let Some(url) = &self.server.auth_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("server.auth_url '{}' must be an http(s) URL", url));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
