// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Core value types shared across the engine.
//!
//! Node identifiers come in two configured forms: the index-qualified
//! `ns=<index>;<type>=<value>` form and the namespace-uri-qualified
//! `nsu=<uri>;<type>=<value>` form. Only the first can be handed to the
//! stack; the second has to be resolved against the namespace array of a
//! connected session first. [`ConfiguredNodeId`] keeps whichever form was
//! configured and resolves it on demand.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{ConfigurationError, NodeError, PublisherError, PublisherResult};

// =============================================================================
// StatusCode
// =============================================================================

/// Service or value status code as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    /// Good.
    pub const GOOD: Self = Self(0x0000_0000);
    /// An internal error occurred.
    pub const BAD_INTERNAL_ERROR: Self = Self(0x8002_0000);
    /// A low level communication error occurred.
    pub const BAD_COMMUNICATION_ERROR: Self = Self(0x8005_0000);
    /// The operation timed out.
    pub const BAD_TIMEOUT: Self = Self(0x800A_0000);
    /// The server is not connected.
    pub const BAD_SERVER_NOT_CONNECTED: Self = Self(0x800D_0000);
    /// The user identity token was rejected.
    pub const BAD_IDENTITY_TOKEN_REJECTED: Self = Self(0x8021_0000);
    /// The session id is not valid.
    pub const BAD_SESSION_ID_INVALID: Self = Self(0x8025_0000);
    /// The session was closed by the client.
    pub const BAD_SESSION_CLOSED: Self = Self(0x8026_0000);
    /// The session cannot be used because it has not been activated.
    pub const BAD_SESSION_NOT_ACTIVATED: Self = Self(0x8027_0000);
    /// The subscription id is not valid.
    pub const BAD_SUBSCRIPTION_ID_INVALID: Self = Self(0x8028_0000);
    /// The syntax of the node id is not valid.
    pub const BAD_NODE_ID_INVALID: Self = Self(0x8033_0000);
    /// The node id refers to a node that does not exist.
    pub const BAD_NODE_ID_UNKNOWN: Self = Self(0x8034_0000);
    /// The network connection has been closed.
    pub const BAD_CONNECTION_CLOSED: Self = Self(0x80AE_0000);

    /// Returns `true` for a good status.
    #[inline]
    pub const fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// Returns `true` for an uncertain status.
    #[inline]
    pub const fn is_uncertain(&self) -> bool {
        self.0 & 0xC000_0000 == 0x4000_0000
    }

    /// Returns `true` for a bad status.
    #[inline]
    pub const fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Returns the symbolic name for well-known codes.
    pub fn name(&self) -> &'static str {
        match *self {
            Self::GOOD => "Good",
            Self::BAD_INTERNAL_ERROR => "BadInternalError",
            Self::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            Self::BAD_TIMEOUT => "BadTimeout",
            Self::BAD_SERVER_NOT_CONNECTED => "BadServerNotConnected",
            Self::BAD_IDENTITY_TOKEN_REJECTED => "BadIdentityTokenRejected",
            Self::BAD_SESSION_ID_INVALID => "BadSessionIdInvalid",
            Self::BAD_SESSION_CLOSED => "BadSessionClosed",
            Self::BAD_SESSION_NOT_ACTIVATED => "BadSessionNotActivated",
            Self::BAD_SUBSCRIPTION_ID_INVALID => "BadSubscriptionIdInvalid",
            Self::BAD_NODE_ID_INVALID => "BadNodeIdInvalid",
            Self::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            Self::BAD_CONNECTION_CLOSED => "BadConnectionClosed",
            s if s.is_good() => "Good",
            s if s.is_uncertain() => "Uncertain",
            _ => "Bad",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.0)
    }
}

// =============================================================================
// NodeIdentifier
// =============================================================================

/// The identifier part of a node id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeIdentifier {
    /// Numeric identifier.
    Numeric(u32),
    /// String identifier.
    String(String),
    /// GUID identifier.
    Guid(Uuid),
    /// Opaque identifier.
    Opaque(Vec<u8>),
}

impl NodeIdentifier {
    /// Parses the `i=`, `s=`, `g=` or `b=` part of a node id.
    fn parse(text: &str, original: &str) -> PublisherResult<Self> {
        if let Some(id) = text.strip_prefix("i=") {
            let value = id.parse().map_err(|_| {
                PublisherError::invalid_node_id(original, "Invalid numeric identifier")
            })?;
            Ok(Self::Numeric(value))
        } else if let Some(id) = text.strip_prefix("s=") {
            Ok(Self::String(id.to_string()))
        } else if let Some(id) = text.strip_prefix("g=") {
            let uuid = Uuid::parse_str(id).map_err(|e| {
                PublisherError::invalid_node_id(original, format!("Invalid GUID: {e}"))
            })?;
            Ok(Self::Guid(uuid))
        } else if let Some(id) = text.strip_prefix("b=") {
            let bytes = BASE64.decode(id).map_err(|e| {
                PublisherError::invalid_node_id(original, format!("Invalid base64: {e}"))
            })?;
            Ok(Self::Opaque(bytes))
        } else {
            Err(PublisherError::invalid_node_id(
                original,
                "Unknown identifier type. Expected i=, s=, g=, or b=",
            ))
        }
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "i={v}"),
            Self::String(v) => write!(f, "s={v}"),
            Self::Guid(v) => write!(f, "g={v}"),
            Self::Opaque(v) => write!(f, "b={}", BASE64.encode(v)),
        }
    }
}

// =============================================================================
// NodeId
// =============================================================================

/// A node id qualified by namespace index.
///
/// ```
/// use opcpub_engine::types::NodeId;
///
/// let parsed: NodeId = "ns=2;s=Line1.Temperature".parse().unwrap();
/// assert_eq!(parsed, NodeId::string(2, "Line1.Temperature"));
/// assert_eq!(NodeId::numeric(0, 2258).to_string(), "i=2258");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    /// Namespace index (0 = standard namespace).
    pub namespace_index: u16,
    /// The identifier.
    pub identifier: NodeIdentifier,
}

impl NodeId {
    /// The node id of the server's namespace array variable.
    pub const NAMESPACE_ARRAY: NodeId = NodeId {
        namespace_index: 0,
        identifier: NodeIdentifier::Numeric(2255),
    };

    /// Creates a numeric node id.
    #[inline]
    pub fn numeric(namespace_index: u16, value: u32) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Numeric(value),
        }
    }

    /// Creates a string node id.
    #[inline]
    pub fn string(namespace_index: u16, value: impl Into<String>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::String(value.into()),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace_index == 0 {
            write!(f, "{}", self.identifier)
        } else {
            write!(f, "ns={};{}", self.namespace_index, self.identifier)
        }
    }
}

impl FromStr for NodeId {
    type Err = PublisherError;

    /// Parses `ns=<index>;<id>` or a bare `<id>` in namespace 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (namespace_index, identifier_part) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, id) = rest.split_once(';').ok_or_else(|| {
                    PublisherError::invalid_node_id(s, "Missing identifier after namespace")
                })?;
                let ns: u16 = ns
                    .parse()
                    .map_err(|_| PublisherError::invalid_node_id(s, "Invalid namespace index"))?;
                (ns, id)
            }
            None => (0, s),
        };

        Ok(Self {
            namespace_index,
            identifier: NodeIdentifier::parse(identifier_part, s)?,
        })
    }
}

// =============================================================================
// ExpandedNodeId
// =============================================================================

/// A node id qualified by namespace uri (`nsu=<uri>;<id>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpandedNodeId {
    /// Namespace uri.
    pub namespace_uri: String,
    /// The identifier.
    pub identifier: NodeIdentifier,
}

impl ExpandedNodeId {
    /// Resolves the namespace uri to an index using the session's table.
    pub fn resolve(&self, namespaces: &NamespaceTable) -> PublisherResult<NodeId> {
        let namespace_index = namespaces
            .index_of(&self.namespace_uri)
            .ok_or_else(|| NodeError::unknown_namespace(&self.namespace_uri))?;
        Ok(NodeId {
            namespace_index,
            identifier: self.identifier.clone(),
        })
    }
}

impl fmt::Display for ExpandedNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nsu={};{}", self.namespace_uri, self.identifier)
    }
}

impl FromStr for ExpandedNodeId {
    type Err = PublisherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let rest = s
            .strip_prefix("nsu=")
            .ok_or_else(|| PublisherError::invalid_node_id(s, "Expected nsu= prefix"))?;
        // The identifier starts at the first ';' followed by an identifier type,
        // string identifiers may contain ';' themselves.
        let split = rest
            .match_indices(';')
            .map(|(index, _)| index)
            .find(|&index| {
                let tail = &rest[index + 1..];
                ["i=", "s=", "g=", "b="].iter().any(|p| tail.starts_with(p))
            })
            .ok_or_else(|| PublisherError::invalid_node_id(s, "Missing identifier after namespace"))?;
        let (uri, id) = (&rest[..split], &rest[split + 1..]);
        if uri.is_empty() {
            return Err(PublisherError::invalid_node_id(s, "Empty namespace uri"));
        }
        Ok(Self {
            namespace_uri: uri.to_string(),
            identifier: NodeIdentifier::parse(id, s)?,
        })
    }
}

// =============================================================================
// ConfiguredNodeId
// =============================================================================

/// A node id in the form it was configured.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConfiguredNodeId {
    /// Namespace index form.
    NodeId(NodeId),
    /// Namespace uri form.
    Expanded(ExpandedNodeId),
}

impl ConfiguredNodeId {
    /// Returns `true` if the id needs a namespace table to be resolved.
    pub fn is_expanded(&self) -> bool {
        matches!(self, Self::Expanded(_))
    }

    /// Resolves to a stack node id.
    pub fn resolve(&self, namespaces: &NamespaceTable) -> PublisherResult<NodeId> {
        match self {
            Self::NodeId(id) => Ok(id.clone()),
            Self::Expanded(id) => id.resolve(namespaces),
        }
    }

    /// Returns `true` if both ids name the same node on a server with the
    /// given namespace table.
    ///
    /// Ids that cannot be resolved only match when they are literally equal.
    pub fn same_node(&self, other: &ConfiguredNodeId, namespaces: &NamespaceTable) -> bool {
        if self == other {
            return true;
        }
        match (self.resolve(namespaces), other.resolve(namespaces)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ConfiguredNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeId(id) => id.fmt(f),
            Self::Expanded(id) => id.fmt(f),
        }
    }
}

impl FromStr for ConfiguredNodeId {
    type Err = PublisherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim_start().starts_with("nsu=") {
            s.parse().map(Self::Expanded)
        } else {
            s.parse().map(Self::NodeId)
        }
    }
}

impl Serialize for ConfiguredNodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConfiguredNodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// NamespaceTable
// =============================================================================

/// The namespace array of a connected server, index = namespace index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceTable {
    uris: Vec<String>,
}

impl NamespaceTable {
    /// Creates a table from the server's namespace array.
    pub fn new(uris: Vec<String>) -> Self {
        Self { uris }
    }

    /// Returns the index of a namespace uri.
    pub fn index_of(&self, uri: &str) -> Option<u16> {
        self.uris
            .iter()
            .position(|u| u == uri)
            .and_then(|i| u16::try_from(i).ok())
    }

    /// Returns the uri at a namespace index.
    pub fn uri(&self, index: u16) -> Option<&str> {
        self.uris.get(index as usize).map(String::as_str)
    }

    /// Returns the number of namespaces.
    pub fn len(&self) -> usize {
        self.uris.len()
    }

    /// Returns `true` if the table is empty, which means it was never read.
    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    /// Iterates `(index, uri)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.uris.iter().map(String::as_str).enumerate()
    }
}

// =============================================================================
// SecurityMode
// =============================================================================

/// Message security mode of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SecurityMode {
    /// Messages are neither signed nor encrypted.
    #[default]
    None,
    /// Messages are signed.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl SecurityMode {
    /// Returns the wire value.
    pub const fn value(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Sign => 2,
            Self::SignAndEncrypt => 3,
        }
    }

    /// Returns `true` if this mode provides no security.
    #[inline]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns the display name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SecurityMode {
    type Err = PublisherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "sign" => Ok(Self::Sign),
            "signandencrypt" => Ok(Self::SignAndEncrypt),
            _ => Err(ConfigurationError::invalid_security_mode(s).into()),
        }
    }
}

// =============================================================================
// AuthMode / CredentialRef
// =============================================================================

/// How the session authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Anonymous identity.
    #[default]
    Anonymous,
    /// User name and password.
    UsernamePassword,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::UsernamePassword => f.write_str("UsernamePassword"),
        }
    }
}

/// Encrypted user credential.
///
/// The engine never decrypts it; the stack adapter receives it as part of
/// the user identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    /// Encrypted user name.
    pub encrypted_username: String,
    /// Encrypted password.
    pub encrypted_password: String,
}

impl fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRef").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse_forms() {
        assert_eq!("i=2258".parse::<NodeId>().unwrap(), NodeId::numeric(0, 2258));
        assert_eq!(
            "ns=3;s=Boiler#1.Temp".parse::<NodeId>().unwrap(),
            NodeId::string(3, "Boiler#1.Temp")
        );
        let guid: NodeId = "ns=1;g=550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        assert!(matches!(guid.identifier, NodeIdentifier::Guid(_)));
        let opaque: NodeId = "ns=1;b=SGVsbG8=".parse().unwrap();
        assert_eq!(opaque.identifier, NodeIdentifier::Opaque(b"Hello".to_vec()));
    }

    #[test]
    fn test_node_id_parse_errors() {
        assert!("ns=x;i=1".parse::<NodeId>().is_err());
        assert!("ns=2".parse::<NodeId>().is_err());
        assert!("ns=2;q=1".parse::<NodeId>().is_err());
        assert!("i=abc".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId::string(2, "A").to_string(), "ns=2;s=A");
        assert_eq!(NodeId::numeric(0, 85).to_string(), "i=85");
    }

    #[test]
    fn test_expanded_node_id_parse_and_resolve() {
        let id: ExpandedNodeId = "nsu=http://acme.com/UA;s=Pump.Speed".parse().unwrap();
        assert_eq!(id.namespace_uri, "http://acme.com/UA");

        let table = NamespaceTable::new(vec![
            "http://opcfoundation.org/UA/".into(),
            "urn:server".into(),
            "http://acme.com/UA".into(),
        ]);
        assert_eq!(id.resolve(&table).unwrap(), NodeId::string(2, "Pump.Speed"));

        let empty = NamespaceTable::default();
        let err = id.resolve(&empty).unwrap_err();
        assert!(err.is_node_error());
    }

    #[test]
    fn test_configured_node_id_same_node() {
        let table = NamespaceTable::new(vec!["ua".into(), "urn:a".into(), "urn:b".into()]);
        let plain: ConfiguredNodeId = "ns=2;i=7".parse().unwrap();
        let expanded: ConfiguredNodeId = "nsu=urn:b;i=7".parse().unwrap();
        let other: ConfiguredNodeId = "nsu=urn:a;i=7".parse().unwrap();

        assert!(expanded.is_expanded());
        assert!(plain.same_node(&expanded, &table));
        assert!(!plain.same_node(&other, &table));
        // Without a namespace table the two forms cannot be compared.
        assert!(!plain.same_node(&expanded, &NamespaceTable::default()));
        assert!(plain.same_node(&plain.clone(), &NamespaceTable::default()));
    }

    #[test]
    fn test_string_identifier_with_semicolon() {
        let expanded: ConfiguredNodeId = "nsu=urn:x;s=a;b".parse().unwrap();
        assert_eq!(expanded.to_string(), "nsu=urn:x;s=a;b");
        let ConfiguredNodeId::Expanded(ref inner) = expanded else {
            panic!("expected the namespace uri form");
        };
        assert_eq!(inner.namespace_uri, "urn:x");
        assert_eq!(inner.identifier, NodeIdentifier::String("a;b".into()));

        let plain: ConfiguredNodeId = "ns=1;s=a;b".parse().unwrap();
        let table = NamespaceTable::new(vec!["ua".into(), "urn:x".into()]);
        assert!(plain.same_node(&expanded, &table));

        assert!("nsu=urn:x;q=1".parse::<ExpandedNodeId>().is_err());
    }

    #[test]
    fn test_configured_node_id_serde() {
        let id: ConfiguredNodeId = serde_json::from_str("\"nsu=urn:x;s=A\"").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"nsu=urn:x;s=A\"");
        assert!(serde_json::from_str::<ConfiguredNodeId>("\"bogus\"").is_err());
    }

    #[test]
    fn test_status_code_classes() {
        assert!(StatusCode::GOOD.is_good());
        assert!(StatusCode::BAD_TIMEOUT.is_bad());
        assert!(StatusCode(0x4000_0000).is_uncertain());
        assert_eq!(StatusCode::BAD_NODE_ID_UNKNOWN.name(), "BadNodeIdUnknown");
        assert_eq!(
            StatusCode::BAD_TIMEOUT.to_string(),
            "BadTimeout (0x800A0000)"
        );
    }

    #[test]
    fn test_security_mode_parse() {
        assert_eq!("SignAndEncrypt".parse::<SecurityMode>().unwrap(), SecurityMode::SignAndEncrypt);
        assert_eq!("sign".parse::<SecurityMode>().unwrap(), SecurityMode::Sign);
        assert!("bogus".parse::<SecurityMode>().is_err());
    }

    #[test]
    fn test_credential_debug_hides_secret() {
        let cred = CredentialRef {
            encrypted_username: "dXNlcg==".into(),
            encrypted_password: "c2VjcmV0".into(),
        };
        assert!(!format!("{cred:?}").contains("c2VjcmV0"));
    }
}
