// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The boundary between the engine and a protocol stack.
//!
//! The engine never talks to the network itself. Everything it needs from
//! a client stack is expressed by the traits in this module:
//!
//! ```text
//! UaStack            discovery and connect
//! └── UaConnection   one live session: namespaces, reads, keep-alive
//!     └── UaSubscription   items, publishing mode, apply, delete
//!
//! NotificationHandler   stack -> engine, one per monitored item
//! NotificationSink      engine -> telemetry transport
//! ```
//!
//! A concrete stack is an adapter implementing these traits; the tests use
//! an in-memory mock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StackError;
use crate::types::{CredentialRef, NodeId, SecurityMode, StatusCode};

/// Result of a stack call.
pub type StackResult<T> = Result<T, StackError>;

// =============================================================================
// Stack Traits
// =============================================================================

/// Discovery and connection.
#[async_trait]
pub trait UaStack: Send + Sync {
    /// Lists the endpoints offered at a discovery url.
    async fn get_endpoints(&self, discovery_url: &str) -> StackResult<Vec<EndpointDescriptor>>;

    /// Creates and activates a session on the selected endpoint.
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
        identity: &UserIdentity,
    ) -> StackResult<Arc<dyn UaConnection>>;
}

/// A live session.
#[async_trait]
pub trait UaConnection: Send + Sync {
    /// Starts delivering keep-alive events at `interval`.
    ///
    /// The stack drops the sender when keep-alives are unsubscribed or the
    /// connection closes.
    fn subscribe_keep_alive(&self, interval: Duration) -> mpsc::UnboundedReceiver<KeepAliveEvent>;

    /// Stops delivering keep-alive events.
    fn unsubscribe_keep_alive(&self);

    /// Reads the server's namespace array.
    async fn read_namespace_array(&self) -> StackResult<Vec<String>>;

    /// Reads the DisplayName attribute of a node.
    async fn read_display_name(&self, node_id: &NodeId) -> StackResult<String>;

    /// Creates a subscription; the returned handle carries the revised interval.
    async fn create_subscription(
        &self,
        publishing_interval: Duration,
    ) -> StackResult<Box<dyn UaSubscription>>;

    /// Closes the session.
    async fn close(&self) -> StackResult<()>;
}

/// A server-side subscription.
///
/// `add_item` and `remove_item` only stage changes; they reach the server
/// with `apply_changes`.
#[async_trait]
pub trait UaSubscription: Send + Sync {
    /// Server-assigned subscription id.
    fn id(&self) -> u32;

    /// Publishing interval revised by the server.
    fn revised_publishing_interval(&self) -> Duration;

    /// Stages a new monitored item.
    fn add_item(&mut self, request: MonitoredItemRequest, handler: Arc<dyn NotificationHandler>);

    /// Stages removal of a monitored item.
    fn remove_item(&mut self, client_handle: u32);

    /// Enables or disables publishing.
    async fn set_publishing_mode(&mut self, enabled: bool) -> StackResult<()>;

    /// Sends staged changes; returns one result per newly created item.
    async fn apply_changes(&mut self) -> StackResult<Vec<MonitoredItemResult>>;

    /// Deletes the subscription on the server.
    async fn delete(&mut self) -> StackResult<()>;
}

/// Receives value changes of one monitored item.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Called for every data change notification.
    async fn on_data_change(&self, change: DataChange);
}

/// Receives telemetry produced by the engine.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Publishes one message.
    async fn publish(&self, message: TelemetryMessage);
}

// =============================================================================
// Descriptors and Requests
// =============================================================================

/// An endpoint offered by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Endpoint url.
    pub endpoint_url: String,
    /// Message security mode.
    pub security_mode: SecurityMode,
    /// Security policy uri.
    pub security_policy_uri: String,
    /// Relative security level, higher is stronger.
    pub security_level: u8,
}

/// Identity presented when activating a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserIdentity {
    /// No user.
    Anonymous,
    /// User name and password, still encrypted.
    UserName(CredentialRef),
}

/// Monitoring mode of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MonitoringMode {
    /// Not sampled.
    Disabled,
    /// Sampled but not reported.
    Sampling,
    /// Sampled and reported.
    #[default]
    Reporting,
}

/// Attribute id of the Value attribute.
pub const ATTRIBUTE_VALUE: u32 = 13;

/// Parameters of a monitored item to create.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemRequest {
    /// Engine-assigned handle, unique within the session.
    pub client_handle: u32,
    /// Node to monitor.
    pub node_id: NodeId,
    /// Attribute to monitor.
    pub attribute_id: u32,
    /// Requested sampling interval.
    pub sampling_interval: Duration,
    /// Server-side queue size.
    pub queue_size: u32,
    /// Discard the oldest value on queue overflow.
    pub discard_oldest: bool,
    /// Display name.
    pub display_name: String,
    /// Monitoring mode.
    pub monitoring_mode: MonitoringMode,
}

/// Outcome of creating one monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemResult {
    /// Handle from the request.
    pub client_handle: u32,
    /// Creation status.
    pub status: StatusCode,
    /// Sampling interval revised by the server.
    pub revised_sampling_interval: Duration,
}

/// A keep-alive observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveEvent {
    /// Status of the keep-alive.
    pub status: StatusCode,
}

impl KeepAliveEvent {
    /// A good keep-alive.
    pub const fn good() -> Self {
        Self {
            status: StatusCode::GOOD,
        }
    }

    /// A failed keep-alive.
    pub const fn bad(status: StatusCode) -> Self {
        Self { status }
    }
}

/// A value change reported by the stack.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    /// New value.
    pub value: serde_json::Value,
    /// Value status.
    pub status: StatusCode,
    /// Source timestamp.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Server timestamp.
    pub server_timestamp: Option<DateTime<Utc>>,
    /// Sequence number of the notification message.
    pub sequence_number: u32,
}

/// Telemetry for one value change or heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    /// Endpoint url of the session.
    pub endpoint_url: String,
    /// Node id as used on the session.
    pub node_id: String,
    /// Namespace uri form of the node id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded_node_id: Option<String>,
    /// Display name.
    pub display_name: String,
    /// Value.
    pub value: serde_json::Value,
    /// Value status.
    pub status: StatusCode,
    /// Source timestamp.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Server timestamp.
    pub server_timestamp: Option<DateTime<Utc>>,
    /// `true` when re-sent by the heartbeat.
    #[serde(default)]
    pub heartbeat: bool,
}

// =============================================================================
// ChannelSink
// =============================================================================

/// A sink forwarding telemetry into a bounded channel.
///
/// Publishing never waits: a message that finds the channel full or closed
/// is dropped and counted.
pub struct ChannelSink {
    sender: mpsc::Sender<TelemetryMessage>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Creates a sink over an existing sender.
    pub fn new(sender: mpsc::Sender<TelemetryMessage>) -> Self {
        Self {
            sender,
            dropped: AtomicU64::new(0),
        }
    }

    /// Creates a sink and the receiving end.
    pub fn with_channel(capacity: usize) -> (Self, mpsc::Receiver<TelemetryMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Messages lost because the channel was full or the receiver was gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSink")
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn publish(&self, message: TelemetryMessage) {
        if let Err(e) = self.sender.try_send(message) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if matches!(e, mpsc::error::TrySendError::Full(_)) {
                tracing::warn!(dropped = total, "Telemetry channel full, message dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> TelemetryMessage {
        TelemetryMessage {
            endpoint_url: "opc.tcp://a:4840".into(),
            node_id: "ns=2;s=A".into(),
            expanded_node_id: None,
            display_name: "A".into(),
            value: serde_json::json!(42),
            status: StatusCode::GOOD,
            source_timestamp: None,
            server_timestamp: None,
            heartbeat: false,
        }
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::with_channel(4);
        sink.publish(message()).await;
        assert_eq!(rx.recv().await.unwrap().value, serde_json::json!(42));
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_channel_sink_counts_drops_when_full() {
        let (sink, mut rx) = ChannelSink::with_channel(1);
        sink.publish(message()).await;
        sink.publish(message()).await;
        assert_eq!(sink.dropped(), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_channel_sink_counts_drops_after_close() {
        let (sink, rx) = ChannelSink::with_channel(1);
        drop(rx);
        sink.publish(message()).await;
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_telemetry_message_serializes_without_empty_expanded_id() {
        let json = serde_json::to_string(&message()).unwrap();
        assert!(!json.contains("expanded_node_id"));
        assert!(json.contains("\"status\":0"));
    }
}
