use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_error_pages_dir() -> PathBuf {
    PathBuf::from("error_pages")
}

fn default_expiry_time() -> u64 {
    20
}

fn default_client_timeout() -> u64 {
    30
}

fn default_origin_connect_timeout() -> u64 {
    5
}

fn default_origin_timeout() -> u64 {
    60
}

fn default_max_header_line_size() -> usize {
    8 * 1024
}

fn default_max_header_lines() -> usize {
    64
}

fn default_cache_max_entry_size() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}

fn default_max_connections() -> usize {
    64
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_error_pages_dir")]
    pub error_pages_dir: PathBuf,
    /// Seconds after which a stored entry must be revalidated.
    #[serde(default = "default_expiry_time")]
    pub expiry_time: u64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_origin_connect_timeout")]
    pub origin_connect_timeout: u64,
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout: u64,
    #[serde(default = "default_max_header_line_size")]
    pub max_header_line_size: usize,
    #[serde(default = "default_max_header_lines")]
    pub max_header_lines: usize,
    #[serde(default = "default_cache_max_entry_size")]
    pub cache_max_entry_size: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cache_dir: default_cache_dir(),
            error_pages_dir: default_error_pages_dir(),
            expiry_time: default_expiry_time(),
            client_timeout: default_client_timeout(),
            origin_connect_timeout: default_origin_connect_timeout(),
            origin_timeout: default_origin_timeout(),
            max_header_line_size: default_max_header_line_size(),
            max_header_lines: default_max_header_lines(),
            cache_max_entry_size: default_cache_max_entry_size(),
            max_connections: default_max_connections(),
            log: default_log_format(),
            metrics_listen: None,
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("CACHEPROXY")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        if let Some(listen) = cli.listen {
            settings.listen = listen;
        }
        if let Some(log) = cli.log {
            settings.log = log;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_time)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn origin_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_connect_timeout)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout)
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

/// An explicit `--config` must exist; otherwise the first default location present is used,
/// and running without any file is allowed.
fn resolve_config_path(cli: &Cli) -> Result<Option<PathBuf>> {
    if let Some(path) = cli.config.as_deref() {
        if !path.exists() {
            bail!("configuration file {} does not exist", path.display());
        }
        return Ok(Some(path.to_path_buf()));
    }

    Ok(default_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists()))
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/cacheproxy/cacheproxy.toml"),
        PathBuf::from("cacheproxy.toml"),
    ]
}

impl Settings {
    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.cache_dir = absolutize(&self.cache_dir, base_dir);
        self.error_pages_dir = absolutize(&self.error_pages_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.expiry_time > 0,
            "expiry_time must be greater than 0 seconds (got {})",
            self.expiry_time
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.origin_connect_timeout > 0,
            "origin_connect_timeout must be greater than 0 seconds (got {})",
            self.origin_connect_timeout
        );
        ensure!(
            self.origin_timeout > 0,
            "origin_timeout must be greater than 0 seconds (got {})",
            self.origin_timeout
        );
        ensure!(
            self.max_header_line_size > 0,
            "max_header_line_size must be greater than 0 (got {})",
            self.max_header_line_size
        );
        ensure!(
            self.max_header_lines > 0,
            "max_header_lines must be greater than 0 (got {})",
            self.max_header_lines
        );
        ensure!(
            self.cache_max_entry_size > 0,
            "cache_max_entry_size must be greater than 0 (got {})",
            self.cache_max_entry_size
        );
        ensure!(
            self.max_connections > 0,
            "max_connections must be at least 1 (got {})",
            self.max_connections
        );
        if let Some(metrics) = self.metrics_listen {
            ensure!(
                self.listen.port() == 0 || metrics != self.listen,
                "metrics_listen must differ from listen ({metrics})"
            );
        }
        Ok(())
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
