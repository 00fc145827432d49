// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Loading [`PublisherConfig`] documents from disk.
//!
//! The format follows the file extension: `.yaml`/`.yml`, `.toml` or
//! `.json`. After parsing, engine tunables can be overridden from the
//! environment:
//!
//! ```text
//! OPCPUB_SESSION_TIMEOUT=20s
//! OPCPUB_SESSION_CONNECT_WAIT=5s
//! OPCPUB_KEEP_ALIVE_DISCONNECT_THRESHOLD=3
//! OPCPUB_FETCH_DISPLAY_NAME=true
//! OPCPUB_MAX_NODE_ATTEMPTS=10
//! ```

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::PublisherConfig;
use crate::error::{ConfigurationError, PublisherResult};

// =============================================================================
// ConfigFormat
// =============================================================================

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML.
    Yaml,
    /// TOML.
    Toml,
    /// JSON.
    Json,
}

impl ConfigFormat {
    /// Picks the format from a file extension.
    pub fn from_path(path: &Path) -> PublisherResult<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        match extension.as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            _ => Err(ConfigurationError::UnsupportedFormat { extension }.into()),
        }
    }
}

// =============================================================================
// ConfigLoader
// =============================================================================

/// Loads and validates publisher configuration.
///
/// ```no_run
/// use opcpub_engine::settings::ConfigLoader;
///
/// let config = ConfigLoader::new().load("publishednodes.yaml").unwrap();
/// println!("{} endpoints", config.endpoints.len());
/// ```
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    env_prefix: String,
    env_overrides: bool,
}

impl ConfigLoader {
    /// Creates a loader with the `OPCPUB` prefix and overrides enabled.
    pub fn new() -> Self {
        Self {
            env_prefix: "OPCPUB".to_string(),
            env_overrides: true,
        }
    }

    /// Sets the environment variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Enables or disables environment overrides.
    pub fn with_env_overrides(mut self, enabled: bool) -> Self {
        self.env_overrides = enabled;
        self
    }

    /// Loads a configuration file.
    pub fn load(&self, path: impl AsRef<Path>) -> PublisherResult<PublisherConfig> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading publisher configuration");

        if !path.exists() {
            return Err(ConfigurationError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = self.load_from_str(&content, ConfigFormat::from_path(path)?)?;
        debug!(
            endpoints = config.endpoints.len(),
            nodes = config.endpoints.iter().map(|e| e.nodes.len()).sum::<usize>(),
            "Publisher configuration loaded"
        );
        Ok(config)
    }

    /// Parses, applies overrides and validates a document.
    pub fn load_from_str(
        &self,
        content: &str,
        format: ConfigFormat,
    ) -> PublisherResult<PublisherConfig> {
        let mut config: PublisherConfig = parse_str(content, format)?;
        if self.env_overrides {
            self.apply_env_overrides(&mut config)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&self, config: &mut PublisherConfig) -> PublisherResult<()> {
        let engine = &mut config.engine;
        if let Some(v) = self.env_duration("SESSION_TIMEOUT")? {
            engine.session_timeout = v;
        }
        if let Some(v) = self.env_parse("MAX_BACKOFF_STEPS")? {
            engine.max_backoff_steps = v;
        }
        if let Some(v) = self.env_duration("SESSION_CONNECT_WAIT")? {
            engine.session_connect_wait = v;
        }
        if let Some(v) = self.env_duration("KEEP_ALIVE_INTERVAL")? {
            engine.keep_alive_interval = v;
        }
        if let Some(v) = self.env_parse("KEEP_ALIVE_DISCONNECT_THRESHOLD")? {
            engine.keep_alive_disconnect_threshold = v;
        }
        if let Some(v) = self.env_duration("DEFAULT_PUBLISHING_INTERVAL")? {
            engine.default_publishing_interval = v;
        }
        if let Some(v) = self.env_duration("DEFAULT_SAMPLING_INTERVAL")? {
            engine.default_sampling_interval = v;
        }
        if let Some(v) = self.env_var("FETCH_DISPLAY_NAME") {
            engine.fetch_display_name = parse_bool(&v);
        }
        if let Some(v) = self.env_parse("MAX_NODE_ATTEMPTS")? {
            engine.max_node_attempts = Some(v);
        }
        Ok(())
    }

    fn env_name(&self, key: &str) -> String {
        format!("{}_{}", self.env_prefix, key)
    }

    fn env_var(&self, key: &str) -> Option<String> {
        env::var(self.env_name(key)).ok()
    }

    fn env_parse<T: FromStr>(&self, key: &str) -> PublisherResult<Option<T>> {
        self.env_var(key)
            .map(|v| {
                v.trim().parse().map_err(|_| {
                    ConfigurationError::invalid_env_var(self.env_name(key), "expected a number")
                        .into()
                })
            })
            .transpose()
    }

    fn env_duration(&self, key: &str) -> PublisherResult<Option<Duration>> {
        self.env_var(key)
            .map(|v| {
                humantime::parse_duration(v.trim()).map_err(|e| {
                    ConfigurationError::invalid_env_var(self.env_name(key), e.to_string()).into()
                })
            })
            .transpose()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_str<T: DeserializeOwned>(content: &str, format: ConfigFormat) -> PublisherResult<T> {
    match format {
        ConfigFormat::Yaml => yaml_parse(content),
        ConfigFormat::Toml => {
            toml::from_str(content).map_err(|e| ConfigurationError::parse(e.to_string()).into())
        }
        ConfigFormat::Json => serde_json::from_str(content)
            .map_err(|e| ConfigurationError::parse(e.to_string()).into()),
    }
}

/// YAML goes through the `config` crate.
fn yaml_parse<T: DeserializeOwned>(content: &str) -> PublisherResult<T> {
    let document = ::config::Config::builder()
        .add_source(::config::File::from_str(content, ::config::FileFormat::Yaml))
        .build()
        .map_err(|e| ConfigurationError::parse(e.to_string()))?;

    document
        .try_deserialize()
        .map_err(|e| ConfigurationError::parse(e.to_string()).into())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on" | "enabled"
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const YAML: &str = r#"
engine:
  session_timeout: 5s
  max_backoff_steps: 3
endpoints:
  - endpoint_id: line-1
    endpoint_url: opc.tcp://line1:4840
    use_security: false
    nodes:
      - id: ns=2;s=Temperature
        publishing_interval: 1s
      - id: nsu=http://acme.com/UA;i=1001
        heartbeat_interval: 30s
"#;

    const TOML: &str = r#"
[engine]
session_connect_wait = "2s"

[[endpoints]]
endpoint_id = "line-2"
endpoint_url = "opc.tcp://line2:4840"
auth_mode = "username_password"

[endpoints.credential]
encrypted_username = "dXNlcg=="
encrypted_password = "cGFzcw=="

[[endpoints.nodes]]
id = "i=2258"
"#;

    fn loader() -> ConfigLoader {
        ConfigLoader::new().with_env_overrides(false)
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        file.write_all(YAML.as_bytes()).unwrap();

        let config = loader().load(file.path()).unwrap();
        assert_eq!(config.engine.session_timeout, Duration::from_secs(5));
        assert_eq!(config.engine.max_backoff_steps, 3);
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].use_security, Some(false));
        assert_eq!(config.endpoints[0].nodes.len(), 2);
        assert_eq!(
            config.endpoints[0].nodes[1].heartbeat_interval,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_load_toml_from_str() {
        let config = loader().load_from_str(TOML, ConfigFormat::Toml).unwrap();
        assert_eq!(config.engine.session_connect_wait, Duration::from_secs(2));
        assert!(config.endpoints[0].credential.is_some());
    }

    #[test]
    fn test_load_json_from_str() {
        let json = r#"{ "endpoints": [ { "endpoint_id": "a", "endpoint_url": "opc.tcp://a:4840" } ] }"#;
        let config = loader().load_from_str(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.engine, super::super::EngineConfig::default());
        assert!(config.endpoints[0].nodes.is_empty());
    }

    #[test]
    fn test_missing_credential_fails_validation() {
        let json = r#"{ "endpoints": [ { "endpoint_id": "a", "endpoint_url": "opc.tcp://a:4840", "auth_mode": "username_password" } ] }"#;
        assert!(loader().load_from_str(json, ConfigFormat::Json).is_err());
    }

    #[test]
    fn test_config_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.TOML")).unwrap(), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")).unwrap(), ConfigFormat::Json);
        assert!(ConfigFormat::from_path(Path::new("a.ini")).is_err());
    }

    #[test]
    fn test_file_not_found() {
        let err = loader().load("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_env_overrides() {
        let prefix = "OPCPUB_LOADER_TEST";
        env::set_var(format!("{prefix}_SESSION_TIMEOUT"), "7s");
        env::set_var(format!("{prefix}_MAX_NODE_ATTEMPTS"), "4");
        env::set_var(format!("{prefix}_FETCH_DISPLAY_NAME"), "yes");

        let config = ConfigLoader::new()
            .with_env_prefix(prefix)
            .load_from_str("{}", ConfigFormat::Json)
            .unwrap();
        assert_eq!(config.engine.session_timeout, Duration::from_secs(7));
        assert_eq!(config.engine.max_node_attempts, Some(4));
        assert!(config.engine.fetch_display_name);

        env::set_var(format!("{prefix}_MAX_BACKOFF_STEPS"), "many");
        assert!(ConfigLoader::new()
            .with_env_prefix(prefix)
            .load_from_str("{}", ConfigFormat::Json)
            .is_err());

        for key in ["SESSION_TIMEOUT", "MAX_NODE_ATTEMPTS", "FETCH_DISPLAY_NAME", "MAX_BACKOFF_STEPS"] {
            env::remove_var(format!("{prefix}_{key}"));
        }
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("off"));
    }
}
