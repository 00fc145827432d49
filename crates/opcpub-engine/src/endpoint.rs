// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Endpoint selection.
//!
//! Given the endpoints a server offers, pick the one a session connects to:
//!
//! 1. keep endpoints whose url has the same scheme as the configured url
//! 2. keep those matching the configured security mode and profile
//! 3. if nothing matched, or `use_security` is set explicitly, keep instead
//!    the endpoints that are secure unless security was explicitly disabled
//! 4. pick the highest security level among the remaining candidates, the
//!    first one on ties

use crate::capability::EndpointDescriptor;
use crate::error::{ConnectionError, PublisherResult};
use crate::types::SecurityMode;

/// Security preferences of a configured endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityRequirements<'a> {
    /// `Some(false)` allows unsecured endpoints, `Some(true)` requires security.
    pub use_security: Option<bool>,
    /// Required security mode.
    pub security_mode: Option<SecurityMode>,
    /// Required security policy uri.
    pub security_profile_uri: Option<&'a str>,
}

impl SecurityRequirements<'_> {
    fn matches(&self, endpoint: &EndpointDescriptor) -> bool {
        let mode = self
            .security_mode
            .is_some_and(|mode| mode == endpoint.security_mode);
        let profile = self
            .security_profile_uri
            .map_or(true, |uri| uri.eq_ignore_ascii_case(&endpoint.security_policy_uri));
        mode && profile
    }

    fn acceptable(&self, endpoint: &EndpointDescriptor) -> bool {
        !self.use_security.unwrap_or(true) || !endpoint.security_mode.is_none()
    }
}

/// Returns the url to run discovery against.
///
/// HTTPS endpoints serve discovery on a `/discovery` path.
pub fn discovery_url(endpoint_url: &str) -> String {
    let is_https = endpoint_url
        .get(..6)
        .is_some_and(|s| s.eq_ignore_ascii_case("https:"));
    if is_https && !endpoint_url.trim_end_matches('/').ends_with("/discovery") {
        format!("{}/discovery", endpoint_url.trim_end_matches('/'))
    } else {
        endpoint_url.to_string()
    }
}

fn scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(scheme, _)| scheme)
}

/// Selects the endpoint to connect to.
pub fn select_endpoint(
    endpoint_url: &str,
    endpoints: &[EndpointDescriptor],
    requirements: &SecurityRequirements<'_>,
) -> PublisherResult<EndpointDescriptor> {
    let wanted_scheme = scheme(endpoint_url);
    let candidates: Vec<&EndpointDescriptor> = endpoints
        .iter()
        .filter(|e| scheme(&e.endpoint_url).eq_ignore_ascii_case(wanted_scheme))
        .collect();
    if candidates.is_empty() {
        return Err(ConnectionError::endpoint_not_found(endpoint_url).into());
    }

    let mut matching: Vec<&EndpointDescriptor> = candidates
        .iter()
        .copied()
        .filter(|e| requirements.matches(e))
        .collect();
    if matching.is_empty() || requirements.use_security.is_some() {
        matching = candidates
            .iter()
            .copied()
            .filter(|e| requirements.acceptable(e))
            .collect();
    }

    // Highest level wins, the earliest entry on ties.
    let mut best: Option<&EndpointDescriptor> = None;
    for endpoint in matching {
        if best.map_or(true, |b| endpoint.security_level > b.security_level) {
            best = Some(endpoint);
        }
    }

    best.cloned().ok_or_else(|| {
        let mode = requirements
            .security_mode
            .map_or_else(|| "secure".to_string(), |m| m.to_string());
        ConnectionError::no_suitable_endpoint(endpoint_url, mode).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";
    const BASIC256: &str = "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256";
    const AES: &str = "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss";

    fn ep(url: &str, mode: SecurityMode, policy: &str, level: u8) -> EndpointDescriptor {
        EndpointDescriptor {
            endpoint_url: url.to_string(),
            security_mode: mode,
            security_policy_uri: policy.to_string(),
            security_level: level,
        }
    }

    fn offered() -> Vec<EndpointDescriptor> {
        vec![
            ep("opc.tcp://srv:4840", SecurityMode::None, NONE, 0),
            ep("opc.tcp://srv:4840", SecurityMode::Sign, BASIC256, 10),
            ep("opc.tcp://srv:4840", SecurityMode::SignAndEncrypt, BASIC256, 20),
            ep("opc.tcp://srv:4840", SecurityMode::SignAndEncrypt, AES, 30),
            ep("https://srv:4843", SecurityMode::SignAndEncrypt, AES, 99),
        ]
    }

    #[test]
    fn test_discovery_url() {
        assert_eq!(discovery_url("https://srv:4843"), "https://srv:4843/discovery");
        assert_eq!(discovery_url("https://srv:4843/discovery"), "https://srv:4843/discovery");
        assert_eq!(discovery_url("opc.tcp://srv:4840"), "opc.tcp://srv:4840");
    }

    #[test]
    fn test_default_prefers_highest_secure_level() {
        let chosen = select_endpoint("opc.tcp://srv:4840", &offered(), &SecurityRequirements::default())
            .unwrap();
        assert_eq!(chosen.security_level, 30);
    }

    #[test]
    fn test_mode_and_profile_filter_restricts_choice() {
        let req = SecurityRequirements {
            security_mode: Some(SecurityMode::SignAndEncrypt),
            security_profile_uri: Some(BASIC256),
            ..Default::default()
        };
        let chosen = select_endpoint("opc.tcp://srv:4840", &offered(), &req).unwrap();
        // The level-30 endpoint uses another policy and must not win.
        assert_eq!(chosen.security_level, 20);
        assert_eq!(chosen.security_policy_uri, BASIC256);
    }

    #[test]
    fn test_explicitly_unsecured() {
        let req = SecurityRequirements {
            use_security: Some(false),
            ..Default::default()
        };
        // All candidates are acceptable, the highest level still wins.
        let chosen = select_endpoint("opc.tcp://srv:4840", &offered(), &req).unwrap();
        assert_eq!(chosen.security_level, 30);

        let only_none = vec![ep("opc.tcp://srv:4840", SecurityMode::None, NONE, 0)];
        assert!(select_endpoint("opc.tcp://srv:4840", &only_none, &req).is_ok());
        assert!(select_endpoint("opc.tcp://srv:4840", &only_none, &SecurityRequirements::default())
            .is_err());
    }

    #[test]
    fn test_use_security_overrides_match() {
        let req = SecurityRequirements {
            use_security: Some(true),
            security_mode: Some(SecurityMode::Sign),
            ..Default::default()
        };
        let chosen = select_endpoint("opc.tcp://srv:4840", &offered(), &req).unwrap();
        assert_eq!(chosen.security_level, 30);
    }

    #[test]
    fn test_ties_resolve_to_first() {
        let endpoints = vec![
            ep("opc.tcp://a", SecurityMode::Sign, BASIC256, 5),
            ep("opc.tcp://b", SecurityMode::Sign, AES, 5),
        ];
        let chosen = select_endpoint("opc.tcp://a", &endpoints, &SecurityRequirements::default())
            .unwrap();
        assert_eq!(chosen.endpoint_url, "opc.tcp://a");
    }

    #[test]
    fn test_no_endpoint_for_scheme() {
        let err = select_endpoint("opc.wss://srv", &offered(), &SecurityRequirements::default())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::PublisherError::Connection(ConnectionError::EndpointNotFound { .. })
        ));
    }
}
