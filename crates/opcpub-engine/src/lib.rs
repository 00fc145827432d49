// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session, subscription and monitored-item reconciliation for an OPC UA
//! telemetry publisher.
//!
//! The engine keeps one session per configured endpoint, groups the nodes of
//! a session into subscriptions by publishing interval and drives every
//! session towards its configured state from a dedicated reconciliation
//! loop. Data changes are turned into [`TelemetryMessage`]s and handed to a
//! [`NotificationSink`].
//!
//! # Features
//!
//! - Connection with a connect timeout growing per failure up to a cap
//! - Keep-alive supervision with a configurable miss threshold
//! - Batched monitored item creation with per-node failure accounting
//! - Namespace URI resolution for expanded node ids
//! - Heartbeats, skip-first and status code suppression per item
//! - Versioned configuration snapshots
//!
//! # Ownership
//!
//! ```text
//! SessionRegistry
//! └── Session            one per endpoint id, own lock and loop
//!     └── Subscription   one per publishing interval
//!         └── MonitoredItem
//! ```
//!
//! The OPC UA client stack is reached only through the traits in
//! [`capability`].
//!
//! # Error Handling
//!
//! ```text
//! PublisherError
//! ├── Connection    - Endpoint discovery and session creation
//! ├── Session       - Session lifecycle
//! ├── Subscription  - Subscription and monitored item service calls
//! ├── Node          - Node id parsing and resolution
//! ├── Configuration - Invalid settings
//! └── Timeout       - Operation timeouts
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod capability;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod monitored_item;
pub mod registry;
pub mod sequence;
pub mod session;
pub mod settings;
pub mod subscription;
pub mod types;

pub use capability::{
    ChannelSink, DataChange, EndpointDescriptor, KeepAliveEvent, MonitoredItemRequest,
    MonitoredItemResult, MonitoringMode, NotificationHandler, NotificationSink, StackResult,
    TelemetryMessage, UaConnection, UaStack, UaSubscription, UserIdentity,
};

pub use error::{
    ConfigurationError, ConnectionError, ErrorCode, ErrorSeverity, NodeError, PublisherError,
    PublisherResult, SessionError, StackError, SubscriptionError, TimeoutError,
};

pub use logging::{init_logging, LogFormat};

pub use monitored_item::{MonitoredItem, MonitoredItemState, NodeSettings};

pub use registry::{ConfigVersion, RegistryCounters, SessionRegistry, SnapshotFilter};

pub use session::{
    KeepAliveOutcome, MonitorResult, Session, SessionCounts, SessionState, SessionStats,
    SessionStatsSnapshot,
};

pub use settings::{
    ConfigFormat, ConfigLoader, EndpointConfig, EngineConfig, EngineConfigBuilder, NodeConfig,
    PublisherConfig,
};

pub use subscription::Subscription;

pub use types::{
    AuthMode, ConfiguredNodeId, CredentialRef, ExpandedNodeId, NamespaceTable, NodeId,
    NodeIdentifier, SecurityMode, StatusCode,
};
