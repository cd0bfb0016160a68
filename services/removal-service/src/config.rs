use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::quota::{DEFAULT_API_MONTHLY_LIMIT, DEFAULT_PACING_FLOOR};

pub const DEFAULT_REMOTE_API_URL: &str = "https://api.remove.bg/v1.0";
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RemovalServiceConfig {
    pub server_host: String,
    pub server_port: u16,
    pub data_dir: PathBuf,
    pub api_monthly_limit: u64,
    pub pacing_floor: u64,
    pub remote_api_url: String,
    pub remote_api_key: Option<String>,
    pub remote_timeout_secs: u64,
    pub local_command: Option<String>,
    pub local_timeout_secs: u64,
    pub max_file_size: usize,
    pub log_level: String,
}

impl Default for RemovalServiceConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 3003,
            data_dir: PathBuf::from("data/removal"),
            api_monthly_limit: DEFAULT_API_MONTHLY_LIMIT,
            pacing_floor: DEFAULT_PACING_FLOOR,
            remote_api_url: DEFAULT_REMOTE_API_URL.to_string(),
            remote_api_key: None,
            remote_timeout_secs: 30,
            local_command: None,
            local_timeout_secs: 120,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl RemovalServiceConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(host) = env::var("REMOVAL_HOST") {
            cfg.server_host = host;
        }
        if let Ok(port) = env::var("REMOVAL_PORT") {
            cfg.server_port = port.parse().context("REMOVAL_PORT must be a valid u16")?;
        }
        if let Ok(dir) = env::var("REMOVAL_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(limit) = env::var("API_MONTHLY_LIMIT") {
            cfg.api_monthly_limit = limit
                .parse()
                .context("API_MONTHLY_LIMIT must be a positive integer")?;
        }
        if let Ok(floor) = env::var("PACING_FLOOR") {
            cfg.pacing_floor = floor
                .parse()
                .context("PACING_FLOOR must be a non-negative integer")?;
        }
        if let Ok(url) = env::var("REMOVE_BG_API_URL") {
            cfg.remote_api_url = url;
        }
        if let Ok(key) = env::var("REMOVE_BG_API_KEY") {
            cfg.remote_api_key = Some(key).filter(|key| !key.trim().is_empty());
        }
        if let Ok(timeout) = env::var("REMOTE_TIMEOUT_SECS") {
            cfg.remote_timeout_secs = timeout
                .parse()
                .context("REMOTE_TIMEOUT_SECS must be a positive integer")?;
        }
        if let Ok(command) = env::var("LOCAL_REMOVER_COMMAND") {
            cfg.local_command = Some(command).filter(|command| !command.trim().is_empty());
        }
        if let Ok(timeout) = env::var("LOCAL_TIMEOUT_SECS") {
            cfg.local_timeout_secs = timeout
                .parse()
                .context("LOCAL_TIMEOUT_SECS must be a positive integer")?;
        }
        if let Ok(size) = env::var("MAX_FILE_SIZE") {
            cfg.max_file_size = size
                .parse()
                .context("MAX_FILE_SIZE must be a positive integer")?;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            cfg.log_level = level;
        }

        cfg.validate()?;
        ensure_directory(&cfg.data_dir)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_monthly_limit == 0 {
            anyhow::bail!("API_MONTHLY_LIMIT must be greater than zero");
        }
        if self.remote_timeout_secs == 0 {
            anyhow::bail!("REMOTE_TIMEOUT_SECS must be greater than zero");
        }
        if self.local_timeout_secs == 0 {
            anyhow::bail!("LOCAL_TIMEOUT_SECS must be greater than zero");
        }
        if self.max_file_size == 0 {
            anyhow::bail!("MAX_FILE_SIZE must be greater than zero");
        }
        if !self.remote_api_url.starts_with("http://") && !self.remote_api_url.starts_with("https://")
        {
            anyhow::bail!("REMOVE_BG_API_URL must start with http:// or https://");
        }

        Ok(())
    }

    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn ensure_directory(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            anyhow::bail!("{} exists but is not a directory", path.display());
        }
    } else {
        fs::create_dir_all(path)
            .with_context(|| format!("unable to create data directory {}", path.display()))?;
    }
    Ok(())
}

pub fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => anyhow::bail!("invalid boolean value {value}"),
    }
}
