// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Endpoint and node configuration, the shape of the published-nodes file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::EngineConfig;
use crate::error::{ConfigurationError, PublisherResult};
use crate::types::{AuthMode, CredentialRef, SecurityMode};

/// Full configuration document: engine tunables plus endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Engine tunables.
    pub engine: EngineConfig,
    /// Endpoints and their nodes.
    pub endpoints: Vec<EndpointConfig>,
}

impl PublisherConfig {
    /// Validates engine settings and endpoint entries.
    pub fn validate(&self) -> PublisherResult<()> {
        self.engine.validate()?;
        for endpoint in &self.endpoints {
            endpoint.validate()?;
        }
        Ok(())
    }
}

/// One endpoint with its security settings and nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Stable endpoint key, compared case-insensitively.
    pub endpoint_id: String,

    /// Endpoint (discovery) url.
    pub endpoint_url: String,

    /// `Some(false)` explicitly allows unsecured endpoints.
    #[serde(default)]
    pub use_security: Option<bool>,

    /// Required message security mode.
    #[serde(default)]
    pub security_mode: Option<SecurityMode>,

    /// Required security policy uri.
    #[serde(default)]
    pub security_profile_uri: Option<String>,

    /// Authentication mode.
    #[serde(default)]
    pub auth_mode: AuthMode,

    /// Credential for `UsernamePassword`.
    #[serde(default)]
    pub credential: Option<CredentialRef>,

    /// Nodes to publish.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl EndpointConfig {
    /// Creates an anonymous endpoint without nodes.
    pub fn new(endpoint_id: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            endpoint_url: endpoint_url.into(),
            use_security: None,
            security_mode: None,
            security_profile_uri: None,
            auth_mode: AuthMode::Anonymous,
            credential: None,
            nodes: Vec::new(),
        }
    }

    /// Adds a node.
    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    /// Returns `true` if `endpoint_id` names this endpoint.
    pub fn has_id(&self, endpoint_id: &str) -> bool {
        self.endpoint_id.eq_ignore_ascii_case(endpoint_id)
    }

    /// Checks the fields that make a session impossible to construct.
    pub fn validate(&self) -> PublisherResult<()> {
        if self.endpoint_id.trim().is_empty() {
            return Err(ConfigurationError::invalid_value("endpoint_id", "must not be empty").into());
        }
        if self.endpoint_url.trim().is_empty() {
            return Err(
                ConfigurationError::invalid_value("endpoint_url", "must not be empty").into(),
            );
        }
        if self.auth_mode == AuthMode::UsernamePassword && self.credential.is_none() {
            return Err(ConfigurationError::missing_credential(&self.endpoint_id).into());
        }
        Ok(())
    }
}

/// A node to publish with optional per-node overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node id in `ns=` or `nsu=` form.
    pub id: String,

    /// Requested publishing interval.
    #[serde(default, with = "super::humantime_serde::option")]
    pub publishing_interval: Option<Duration>,

    /// Requested sampling interval.
    #[serde(default, with = "super::humantime_serde::option")]
    pub sampling_interval: Option<Duration>,

    /// Display name override.
    #[serde(default)]
    pub display_name: Option<String>,

    /// Heartbeat interval.
    #[serde(default, with = "super::humantime_serde::option")]
    pub heartbeat_interval: Option<Duration>,

    /// Drop the first notification after monitoring starts.
    #[serde(default)]
    pub skip_first: Option<bool>,
}

impl NodeConfig {
    /// Creates a node entry without overrides.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            publishing_interval: None,
            sampling_interval: None,
            display_name: None,
            heartbeat_interval: None,
            skip_first: None,
        }
    }

    /// Sets the publishing interval.
    pub fn publishing(mut self, interval: Duration) -> Self {
        self.publishing_interval = Some(interval);
        self
    }

    /// Sets the sampling interval.
    pub fn sampling(mut self, interval: Duration) -> Self {
        self.sampling_interval = Some(interval);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credential_rejected() {
        let mut endpoint = EndpointConfig::new("plc", "opc.tcp://plc:4840");
        endpoint.auth_mode = AuthMode::UsernamePassword;
        let err = endpoint.validate().unwrap_err();
        assert!(err.to_string().contains("plc"));

        endpoint.credential = Some(CredentialRef {
            encrypted_username: "u".into(),
            encrypted_password: "p".into(),
        });
        assert!(endpoint.validate().is_ok());
    }

    #[test]
    fn test_node_overrides_deserialize() {
        let node: NodeConfig = serde_json::from_str(
            r#"{ "id": "ns=2;s=A", "publishing_interval": "500ms", "skip_first": true }"#,
        )
        .unwrap();
        assert_eq!(node.publishing_interval, Some(Duration::from_millis(500)));
        assert_eq!(node.sampling_interval, None);
        assert_eq!(node.skip_first, Some(true));
    }

    #[test]
    fn test_endpoint_id_case_insensitive() {
        let endpoint = EndpointConfig::new("Line-1", "opc.tcp://a:4840");
        assert!(endpoint.has_id("line-1"));
        assert!(!endpoint.has_id("line-2"));
    }
}
