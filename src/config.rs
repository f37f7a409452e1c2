// src/config.rs
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Result, RunnerError};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const DEFAULT_SOCKET_PORT: u16 = 8000;

/// Which remote execution transport the playground talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Judge0,
    Socket,
}

impl std::str::FromStr for Transport {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "judge0" | "http" => Ok(Transport::Judge0),
            "socket" | "ws" | "websocket" => Ok(Transport::Socket),
            other => Err(RunnerError::Config(format!(
                "Unknown transport '{}'. Expected 'judge0' or 'socket'.",
                other
            ))),
        }
    }
}

/// Configuration for the Judge0 request/poll service.
#[derive(Debug, Clone)]
pub struct Judge0Config {
    pub api_base: String,
    pub api_key: Option<String>,
    pub api_host: Option<String>,
}

/// Configuration for the duplex execution server.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub host: String,
    pub port: u16,
    pub reconnect_delay: Duration,
}

impl SocketConfig {
    pub fn url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
        }
    }
}

/// Configuration for the hosted backend that stores course progress.
#[derive(Debug, Clone)]
pub struct ProgressStoreConfig {
    pub api_base: String,
    pub anon_key: String,
}

/// High-level application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub transport: Transport,
    pub judge0: Option<Judge0Config>,
    pub socket: Option<SocketConfig>,
    pub poll: PollPolicy,
    pub progress: Option<ProgressStoreConfig>,
}

/// Optional overlay file. Every key is optional and wins over the environment.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct FileConfig {
    #[serde(default)]
    pub transport: Option<Transport>,

    #[serde(default)]
    pub judge0_api: Option<String>,

    #[serde(default)]
    pub judge0_key: Option<String>,

    #[serde(default)]
    pub judge0_host: Option<String>,

    #[serde(default)]
    pub socket_host: Option<String>,

    #[serde(default)]
    pub socket_port: Option<u16>,

    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    #[serde(default)]
    pub poll_max_attempts: Option<u32>,

    #[serde(default)]
    pub reconnect_delay_ms: Option<u64>,
}

impl FileConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// `PYLAB_CONFIG` if set, otherwise `<config dir>/pylab/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("PYLAB_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("pylab").join("config.toml"))
    }
}

impl AppConfig {
    /// Load configuration from environment variables, applying the overlay
    /// file when one exists at the default location.
    pub fn from_env() -> Result<Self> {
        let overlay = match FileConfig::default_path() {
            Some(path) if path.exists() => {
                log::info!("Loading config overlay from {}", path.display());
                FileConfig::load(&path)?
            }
            _ => FileConfig::default(),
        };
        Self::from_sources(|key| std::env::var(key).ok(), overlay)
    }

    /// Builds the configuration from a variable lookup and an overlay.
    /// Split out from `from_env` so it can be driven without touching the
    /// process environment.
    pub fn from_sources<F>(lookup: F, overlay: FileConfig) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let transport = match overlay.transport {
            Some(t) => t,
            None => match lookup("PYLAB_TRANSPORT") {
                Some(raw) => raw.parse()?,
                None => Transport::Judge0,
            },
        };

        let judge0 = overlay
            .judge0_api
            .clone()
            .or_else(|| lookup("JUDGE0_API"))
            .map(|api_base| Judge0Config {
                api_base: api_base.trim_end_matches('/').to_string(),
                api_key: overlay.judge0_key.clone().or_else(|| lookup("JUDGE0_KEY")),
                api_host: overlay.judge0_host.clone().or_else(|| lookup("JUDGE0_HOST")),
            });

        let reconnect_delay_ms = match overlay.reconnect_delay_ms {
            Some(ms) => ms,
            None => parse_var(&lookup, "PYLAB_RECONNECT_DELAY_MS")?
                .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
        };

        let socket = match overlay.socket_host.clone().or_else(|| lookup("PYLAB_SOCKET_HOST")) {
            Some(host) => {
                let port = match overlay.socket_port {
                    Some(port) => port,
                    None => parse_var(&lookup, "PYLAB_SOCKET_PORT")?.unwrap_or(DEFAULT_SOCKET_PORT),
                };
                Some(SocketConfig {
                    host,
                    port,
                    reconnect_delay: Duration::from_millis(reconnect_delay_ms),
                })
            }
            None => None,
        };

        let interval_ms = match overlay.poll_interval_ms {
            Some(ms) => ms,
            None => parse_var(&lookup, "PYLAB_POLL_INTERVAL_MS")?.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        };
        let max_attempts = match overlay.poll_max_attempts {
            Some(n) => n,
            None => parse_var(&lookup, "PYLAB_POLL_MAX_ATTEMPTS")?
                .unwrap_or(DEFAULT_POLL_MAX_ATTEMPTS),
        };
        if max_attempts == 0 {
            return Err(RunnerError::Config(
                "PYLAB_POLL_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let progress = match (lookup("SUPABASE_URL"), lookup("SUPABASE_ANON_KEY")) {
            (Some(api_base), Some(anon_key)) => Some(ProgressStoreConfig {
                api_base: api_base.trim_end_matches('/').to_string(),
                anon_key,
            }),
            _ => None,
        };

        match transport {
            Transport::Judge0 if judge0.is_none() => {
                return Err(RunnerError::Config(
                    "Judge0 transport selected but JUDGE0_API is not set.".to_string(),
                ));
            }
            Transport::Socket if socket.is_none() => {
                return Err(RunnerError::Config(
                    "Socket transport selected but PYLAB_SOCKET_HOST is not set.".to_string(),
                ));
            }
            _ => {}
        }

        Ok(AppConfig {
            transport,
            judge0,
            socket,
            poll: PollPolicy {
                interval: Duration::from_millis(interval_ms),
                max_attempts,
            },
            progress,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RunnerError::Config(format!("{} has an invalid value: '{}'", key, raw))),
        None => Ok(None),
    }
}
