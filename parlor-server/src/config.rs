//! Server configuration: compiled-in defaults merged with an optional TOML
//! file and CLI overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).unwrap_or(Self {
            http: HttpConfig::default(),
            session: SessionConfig::default(),
        })
    }
}

impl ServerConfig {
    pub fn merge(&mut self, other: &Self) {
        self.http.merge(&other.http);
        self.session.merge(&other.session);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub interface: String,
    pub port: u16,
}

impl HttpConfig {
    fn merge(&mut self, other: &Self) {
        if !other.interface.is_empty() {
            self.interface.clone_from(&other.interface);
        }
        if other.port > 0 {
            self.port = other.port;
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            interface: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a suspended poll waits before resolving with the retry
    /// status.
    pub poll_timeout_secs: u64,
    /// How often expired sessions are swept out of the store.
    pub sweep_interval_secs: u64,
}

impl SessionConfig {
    fn merge(&mut self, other: &Self) {
        if other.poll_timeout_secs > 0 {
            self.poll_timeout_secs = other.poll_timeout_secs;
        }
        if other.sweep_interval_secs > 0 {
            self.sweep_interval_secs = other.sweep_interval_secs;
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 45,
            sweep_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.session.poll_timeout_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }
}

pub struct ConfigManager {
    path: PathBuf,
    config: ServerConfig,
}

impl ConfigManager {
    pub fn load() -> Result<Self> {
        let path = default_config_path()?;
        Self::load_with_path(path)
    }

    pub fn load_with_path<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let mut config = ServerConfig::default();

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            let user_config: ServerConfig = toml::from_str(&contents)
                .with_context(|| format!("invalid config at {}", path.display()))?;
            config.merge(&user_config);
        }

        Ok(Self { path, config })
    }

    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base =
        dirs::config_dir().ok_or_else(|| anyhow!("unable to determine configuration directory"))?;
    Ok(base.join("parlor").join("config.toml"))
}
