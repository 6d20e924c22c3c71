//! ---
//! mqb_section: "01-core-functionality"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Shared configuration and tracing primitives."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_transport_kind() -> String {
    "in_memory".to_owned()
}

fn default_store_directory() -> PathBuf {
    PathBuf::from("target/subscriptions")
}

fn default_dups_ok_batch() -> usize {
    32
}

fn default_receive_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for a bridge process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Client identity used for durable subscriptions.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`BridgeConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedBridgeConfig {
    pub config: BridgeConfig,
    pub source: PathBuf,
}

impl BridgeConfig {
    pub const ENV_CONFIG_PATH: &str = "MQBRIDGE_CONFIG";

    /// Load configuration from disk, respecting the `MQBRIDGE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedBridgeConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedBridgeConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedBridgeConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<BridgeConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if let Some(client_id) = &self.client_id {
            if client_id.trim().is_empty() {
                return Err(anyhow!("client_id must not be blank"));
            }
        }
        if self.transport.kind.trim().is_empty() {
            return Err(anyhow!("transport.kind must name a registered transport"));
        }
        if self.session.dups_ok_batch == 0 {
            return Err(anyhow!("session.dups_ok_batch must be at least 1"));
        }
        self.store.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for BridgeConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: BridgeConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_kind")]
    pub kind: String,
    /// Samples each topic retains for replay into new durable queues.
    #[serde(default)]
    pub history_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            history_depth: 0,
        }
    }
}

/// Backing medium for durable subscription records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_store_directory")]
    pub directory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            directory: default_store_directory(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kind == StoreKind::File && self.directory.as_os_str().is_empty() {
            return Err(anyhow!("store.directory is required for the file store"));
        }
        if self.kind == StoreKind::File && self.directory.is_file() {
            return Err(anyhow!(
                "store.directory {} is a file, expected a directory",
                self.directory.display()
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Deliveries a DUPS_OK session accumulates before acknowledging them.
    #[serde(default = "default_dups_ok_batch")]
    pub dups_ok_batch: usize,
    /// Wait applied by tools that poll consumers with a timeout.
    #[serde(default = "default_receive_timeout", rename = "receive_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub receive_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dups_ok_batch: default_dups_ok_batch(),
            receive_timeout: default_receive_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: BridgeConfig = "".parse().unwrap();
        assert!(config.client_id.is_none());
        assert_eq!(config.transport.kind, "in_memory");
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert_eq!(config.session.dups_ok_batch, 32);
        assert_eq!(config.session.receive_timeout, Duration::from_secs(1));
        assert!(config.metrics.enabled);
    }

    #[test]
    fn full_document_parses() {
        let config: BridgeConfig = r#"
            client_id = "orders-service"

            [transport]
            kind = "in_memory"
            history_depth = 16

            [store]
            kind = "file"
            directory = "/var/lib/mqbridge/subscriptions"

            [session]
            dups_ok_batch = 8
            receive_timeout_ms = 250

            [logging]
            format = "pretty"
            file_prefix = "bridge"

            [metrics]
            enabled = false
        "#
        .parse()
        .unwrap();

        assert_eq!(config.client_id.as_deref(), Some("orders-service"));
        assert_eq!(config.transport.history_depth, 16);
        assert_eq!(config.store.kind, StoreKind::File);
        assert_eq!(config.session.dups_ok_batch, 8);
        assert_eq!(config.session.receive_timeout, Duration::from_millis(250));
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!("[session]\ndups_ok_batch = 0".parse::<BridgeConfig>().is_err());
        assert!("client_id = \"  \"".parse::<BridgeConfig>().is_err());
        assert!("[transport]\nkind = \"\"".parse::<BridgeConfig>().is_err());
        assert!("[store]\nkind = \"file\"\ndirectory = \"\"".parse::<BridgeConfig>().is_err());
    }

    #[test]
    fn load_reads_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        fs::write(&path, "client_id = \"from-file\"").unwrap();
        let missing = dir.path().join("missing.toml");

        let loaded = BridgeConfig::load_with_source(&[missing.clone(), path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.client_id.as_deref(), Some("from-file"));

        assert!(BridgeConfig::load(&[missing]).is_err());
    }
}
