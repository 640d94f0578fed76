// src/config.rs
//
// Configuration file parsing.
// A TOML file describes the dataspace connection and the transfer settings;
// the dataspace fields can be overridden from the environment.

use crate::connectors::{EdcConnector, NoAuth, StaticToken};
use crate::engine::SettlePolicy;
use crate::error::ConnectorError;
use crate::workspace::{FilenameSource, Workspace};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_BASE_URL: &str = "DS_URL";
pub const ENV_CONNECTOR_NAME: &str = "CONNECTOR_NAME";
pub const ENV_TOKEN: &str = "DS_TOKEN";

// =============================================================================
// Configuration Types
// =============================================================================

/// Root configuration structure.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub dataspace: DataspaceConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Global configuration settings.
#[derive(Debug, Default, Deserialize)]
pub struct GlobalConfig {
    /// Log level, used when RUST_LOG is not set
    pub log_level: Option<String>,
}

/// Where the dataspace lives and how to talk to it.
#[derive(Clone, Deserialize)]
pub struct DataspaceConfig {
    /// Dataspace base URL (DS_URL)
    pub base_url: Option<String>,
    /// Name of our connector instance (CONNECTOR_NAME)
    pub connector_name: Option<String>,
    /// Bearer token for the management API (DS_TOKEN)
    pub token: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for DataspaceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            connector_name: None,
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// Keep the token out of debug output.
impl fmt::Debug for DataspaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataspaceConfig")
            .field("base_url", &self.base_url)
            .field("connector_name", &self.connector_name)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Transfer and workspace settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Workspace root directory
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Wait before rechecking for a negotiated credential
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    /// Number of rechecks after a negotiation
    #[serde(default = "default_settle_attempts")]
    pub settle_attempts: u32,
    /// Growth of the wait between rechecks
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Payload file name when the offer names none
    #[serde(default)]
    pub filename_source: FilenameSource,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            settle_delay_secs: default_settle_delay_secs(),
            settle_attempts: default_settle_attempts(),
            backoff_factor: default_backoff_factor(),
            filename_source: FilenameSource::default(),
        }
    }
}

fn default_workspace() -> PathBuf {
    PathBuf::from("./workspace")
}

fn default_settle_delay_secs() -> u64 {
    5
}

fn default_settle_attempts() -> u32 {
    1
}

fn default_backoff_factor() -> f64 {
    1.0
}

// =============================================================================
// Configuration Loading
// =============================================================================

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, String> {
        let config: Config = toml::from_str(s).map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.dataspace.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be positive".to_string());
        }
        if self.transfer.settle_attempts == 0 {
            return Err("settle_attempts must be at least 1".to_string());
        }
        if !self.transfer.backoff_factor.is_finite() || self.transfer.backoff_factor < 1.0 {
            return Err("backoff_factor must be a number >= 1.0".to_string());
        }
        Ok(())
    }

    /// Applies DS_URL, CONNECTOR_NAME and DS_TOKEN from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup; non-empty values win over the file.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = lookup(ENV_BASE_URL) {
            self.dataspace.base_url = Some(url);
        }
        if let Some(name) = lookup(ENV_CONNECTOR_NAME) {
            self.dataspace.connector_name = Some(name);
        }
        if let Some(token) = lookup(ENV_TOKEN) {
            self.dataspace.token = Some(token);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.dataspace.request_timeout_secs)
    }

    pub fn settle_policy(&self) -> SettlePolicy {
        SettlePolicy::new(
            Duration::from_secs(self.transfer.settle_delay_secs),
            self.transfer.settle_attempts,
            self.transfer.backoff_factor,
        )
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::new(self.transfer.workspace.clone())
            .with_filename_source(self.transfer.filename_source)
    }

    /// Builds the HTTP connector. Base URL and connector name are required.
    pub fn build_connector(&self) -> Result<EdcConnector, ConnectorError> {
        let base_url = self.dataspace.base_url.as_deref().ok_or_else(|| {
            ConnectorError::Config(format!("dataspace.base_url is not set (or {})", ENV_BASE_URL))
        })?;
        let connector_name = self.dataspace.connector_name.as_deref().ok_or_else(|| {
            ConnectorError::Config(format!(
                "dataspace.connector_name is not set (or {})",
                ENV_CONNECTOR_NAME
            ))
        })?;

        let tokens = match &self.dataspace.token {
            Some(token) => StaticToken::bearer(token).shared(),
            None => NoAuth.shared(),
        };

        EdcConnector::new(base_url, connector_name, self.request_timeout(), tokens)
    }
}

// =============================================================================
// Default Configuration
// =============================================================================

/// Returns a default configuration string for documentation.
pub fn default_config_template() -> &'static str {
    r#"# Edge Connector Configuration
#
# Dataspace connection and transfer settings.
# DS_URL, CONNECTOR_NAME and DS_TOKEN override the [dataspace] values.

[global]
# Used when RUST_LOG is not set
log_level = "info"

[dataspace]
base_url = "https://dataspace.example.org"
connector_name = "my-connector"
# token = "..."
request_timeout_secs = 30

[transfer]
# Kits land in <workspace>/<provider>-<kit>/
workspace = "./workspace"

# Wait after starting a negotiation before looking for the credential again
settle_delay_secs = 5

# Rechecks after a negotiation; with backoff_factor > 1.0 each wait grows
settle_attempts = 1
backoff_factor = 1.0

# Payload name when the offer has no default_file_name:
# "kit_name" or "content_disposition" (falls back to the kit name)
filename_source = "kit_name"
"#
}

// =============================================================================
// Tests
// =============================================================================
