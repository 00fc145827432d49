// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Monitored items and their notification path.
//!
//! A [`MonitoredItem`] is the engine-side record of one configured node. It
//! lives in exactly one subscription and moves through these states:
//!
//! ```text
//!   UnmonitoredNamespaceUpdateRequested ──┐
//!                                         ▼
//!                 ┌──────────────── Unmonitored ◄──── disconnect / bad result
//!                 │ good apply result     ▲
//!                 ▼                       │
//!             Monitored ──────────────────┘
//!                 │
//!                 ▼ removal request
//!          RemovalRequested ──► dropped by the next stop-monitoring pass
//! ```
//!
//! When an item is armed, an [`ItemNotifier`] is created and handed to the
//! stack. It turns data changes into [`TelemetryMessage`]s, applies the
//! skip-first and status suppression rules, and drives the optional
//! heartbeat task that re-sends the last value.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::capability::{
    DataChange, MonitoredItemRequest, MonitoringMode, NotificationHandler, NotificationSink,
    TelemetryMessage, ATTRIBUTE_VALUE,
};
use crate::sequence::SequenceTracker;
use crate::settings::{EngineConfig, NodeConfig, MAX_HEARTBEAT_INTERVAL};
use crate::types::{ConfiguredNodeId, NamespaceTable, NodeId, StatusCode};

// =============================================================================
// MonitoredItemState
// =============================================================================

/// Lifecycle state of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MonitoredItemState {
    /// Waiting to be created on the server.
    #[default]
    Unmonitored,
    /// Waiting for the namespace table before it can be resolved.
    UnmonitoredNamespaceUpdateRequested,
    /// Created on the server.
    Monitored,
    /// Waiting to be removed.
    RemovalRequested,
}

impl MonitoredItemState {
    /// Returns `true` if the next monitor pass should pick the item up.
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::Unmonitored | Self::UnmonitoredNamespaceUpdateRequested
        )
    }
}

impl fmt::Display for MonitoredItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmonitored => write!(f, "Unmonitored"),
            Self::UnmonitoredNamespaceUpdateRequested => {
                write!(f, "UnmonitoredNamespaceUpdateRequested")
            }
            Self::Monitored => write!(f, "Monitored"),
            Self::RemovalRequested => write!(f, "RemovalRequested"),
        }
    }
}

// =============================================================================
// NodeSettings
// =============================================================================

/// Per-node overrides given when a node is added.
///
/// `None` means "use the engine default"; only values given here are
/// reported back by configuration snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSettings {
    /// Publishing interval of the subscription hosting the node.
    pub publishing_interval: Option<Duration>,
    /// Sampling interval.
    pub sampling_interval: Option<Duration>,
    /// Display name.
    pub display_name: Option<String>,
    /// Heartbeat interval, zero disables.
    pub heartbeat_interval: Option<Duration>,
    /// Drop the first notification.
    pub skip_first: Option<bool>,
}

impl NodeSettings {
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

    /// Sets the display name.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the heartbeat interval.
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Sets the skip-first flag.
    pub fn skip_first(mut self, skip: bool) -> Self {
        self.skip_first = Some(skip);
        self
    }
}

impl From<&NodeConfig> for NodeSettings {
    fn from(node: &NodeConfig) -> Self {
        Self {
            publishing_interval: node.publishing_interval,
            sampling_interval: node.sampling_interval,
            display_name: node.display_name.clone(),
            heartbeat_interval: node.heartbeat_interval,
            skip_first: node.skip_first,
        }
    }
}

// =============================================================================
// MonitoredItem
// =============================================================================

/// Everything needed to hand an item to the stack.
pub(crate) struct ArmContext<'a> {
    pub endpoint_url: &'a str,
    pub node_id: NodeId,
    pub display_name: String,
    pub sink: Arc<dyn NotificationSink>,
    pub sequence: Arc<SequenceTracker>,
    pub config: &'a EngineConfig,
    pub stream: String,
    pub cancel: &'a CancellationToken,
}

/// Engine-side record of one configured node.
pub struct MonitoredItem {
    client_handle: u32,
    configured_id: ConfiguredNodeId,
    pub(crate) state: MonitoredItemState,

    display_name: Option<String>,
    display_name_from_config: bool,
    requested_sampling: Duration,
    sampling_from_config: bool,
    pub(crate) revised_sampling: Option<Duration>,
    heartbeat_interval: Duration,
    heartbeat_from_config: bool,
    skip_first: bool,
    skip_first_from_config: bool,
    queue_size: u32,

    pub(crate) failed_attempts: u32,
    notifier: Option<Arc<ItemNotifier>>,
    heartbeat_cancel: Option<CancellationToken>,
}

impl MonitoredItem {
    /// Creates an item from its configured id and overrides.
    pub fn new(
        client_handle: u32,
        configured_id: ConfiguredNodeId,
        settings: &NodeSettings,
        config: &EngineConfig,
    ) -> Self {
        let display_name = settings
            .display_name
            .clone()
            .filter(|name| !name.trim().is_empty());
        let heartbeat_interval = settings
            .heartbeat_interval
            .unwrap_or(config.default_heartbeat_interval)
            .min(MAX_HEARTBEAT_INTERVAL);
        let state = if configured_id.is_expanded() {
            MonitoredItemState::UnmonitoredNamespaceUpdateRequested
        } else {
            MonitoredItemState::Unmonitored
        };

        Self {
            client_handle,
            configured_id,
            state,
            display_name_from_config: display_name.is_some(),
            display_name,
            requested_sampling: settings
                .sampling_interval
                .unwrap_or(config.default_sampling_interval),
            sampling_from_config: settings.sampling_interval.is_some(),
            revised_sampling: None,
            heartbeat_interval,
            heartbeat_from_config: settings.heartbeat_interval.is_some(),
            skip_first: settings.skip_first.unwrap_or(config.default_skip_first),
            skip_first_from_config: settings.skip_first.is_some(),
            queue_size: config.queue_size,
            failed_attempts: 0,
            notifier: None,
            heartbeat_cancel: None,
        }
    }

    /// Session-unique client handle.
    pub fn client_handle(&self) -> u32 {
        self.client_handle
    }

    /// Node id as configured.
    pub fn configured_id(&self) -> &ConfiguredNodeId {
        &self.configured_id
    }

    /// Current state.
    pub fn state(&self) -> MonitoredItemState {
        self.state
    }

    /// Configured display name, if any.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Requested sampling interval.
    pub fn requested_sampling_interval(&self) -> Duration {
        self.requested_sampling
    }

    /// Sampling interval revised by the server, once monitored.
    pub fn revised_sampling_interval(&self) -> Option<Duration> {
        self.revised_sampling
    }

    /// Heartbeat interval, zero when disabled.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Failed monitoring attempts since the item was last monitored.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Returns `true` if this item monitors `node_id`.
    ///
    /// Items waiting for removal monitor nothing.
    pub fn is_monitoring(&self, node_id: &ConfiguredNodeId, namespaces: &NamespaceTable) -> bool {
        self.state != MonitoredItemState::RemovalRequested
            && self.configured_id.same_node(node_id, namespaces)
    }

    pub(crate) fn request(&self, node_id: NodeId, display_name: String) -> MonitoredItemRequest {
        MonitoredItemRequest {
            client_handle: self.client_handle,
            node_id,
            attribute_id: ATTRIBUTE_VALUE,
            sampling_interval: self.requested_sampling,
            queue_size: self.queue_size,
            discard_oldest: true,
            display_name,
            monitoring_mode: MonitoringMode::Reporting,
        }
    }

    /// Creates the notifier and starts the heartbeat task.
    ///
    /// Re-arming replaces a previous notifier.
    pub(crate) fn arm(&mut self, ctx: ArmContext<'_>) -> Arc<ItemNotifier> {
        self.disarm();

        let expanded_node_id = match &self.configured_id {
            ConfiguredNodeId::Expanded(id) => Some(id.to_string()),
            ConfiguredNodeId::NodeId(_) => None,
        };
        let heartbeat = (!self.heartbeat_interval.is_zero()).then(|| Heartbeat {
            interval: self.heartbeat_interval,
            last: Mutex::new(None),
            recharge: Notify::new(),
        });

        let notifier = Arc::new(ItemNotifier {
            endpoint_url: ctx.endpoint_url.to_string(),
            node_id: ctx.node_id.to_string(),
            expanded_node_id,
            display_name: ctx.display_name,
            skip_next: AtomicBool::new(self.skip_first),
            suppressed: ctx.config.suppressed_status_codes.clone(),
            sink: ctx.sink,
            sequence: ctx.sequence,
            stream: ctx.stream,
            heartbeat,
            published: AtomicU64::new(0),
        });

        if notifier.heartbeat.is_some() {
            let cancel = ctx.cancel.child_token();
            tokio::spawn(run_heartbeat(Arc::clone(&notifier), cancel.clone()));
            self.heartbeat_cancel = Some(cancel);
        }

        self.notifier = Some(Arc::clone(&notifier));
        notifier
    }

    /// Stops the heartbeat and drops the notifier.
    pub(crate) fn disarm(&mut self) {
        if let Some(cancel) = self.heartbeat_cancel.take() {
            cancel.cancel();
        }
        self.notifier = None;
    }

    pub(crate) fn mark_monitored(&mut self, revised_sampling: Duration) {
        self.state = MonitoredItemState::Monitored;
        self.revised_sampling = Some(revised_sampling);
        self.failed_attempts = 0;
    }

    /// Returns to `Unmonitored` after the session went away.
    pub(crate) fn reset(&mut self) {
        self.disarm();
        self.revised_sampling = None;
        if self.state == MonitoredItemState::Monitored {
            self.state = MonitoredItemState::Unmonitored;
        }
    }

    /// The node entry a configuration snapshot reports for this item.
    pub fn to_node_config(&self, publishing_interval: Option<Duration>) -> NodeConfig {
        NodeConfig {
            id: self.configured_id.to_string(),
            publishing_interval,
            sampling_interval: self.sampling_from_config.then_some(self.requested_sampling),
            display_name: self
                .display_name_from_config
                .then(|| self.display_name.clone())
                .flatten(),
            heartbeat_interval: self.heartbeat_from_config.then_some(self.heartbeat_interval),
            skip_first: self.skip_first_from_config.then_some(self.skip_first),
        }
    }
}

impl Drop for MonitoredItem {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl fmt::Debug for MonitoredItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoredItem")
            .field("client_handle", &self.client_handle)
            .field("configured_id", &self.configured_id.to_string())
            .field("state", &self.state)
            .field("requested_sampling", &self.requested_sampling)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("failed_attempts", &self.failed_attempts)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// ItemNotifier
// =============================================================================

struct Heartbeat {
    interval: Duration,
    last: Mutex<Option<TelemetryMessage>>,
    recharge: Notify,
}

/// Turns data changes of one item into telemetry.
pub struct ItemNotifier {
    endpoint_url: String,
    node_id: String,
    expanded_node_id: Option<String>,
    display_name: String,
    skip_next: AtomicBool,
    suppressed: Vec<StatusCode>,
    sink: Arc<dyn NotificationSink>,
    sequence: Arc<SequenceTracker>,
    stream: String,
    heartbeat: Option<Heartbeat>,
    published: AtomicU64,
}

impl ItemNotifier {
    /// Messages handed to the sink, heartbeats included.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn message(&self, change: DataChange) -> TelemetryMessage {
        TelemetryMessage {
            endpoint_url: self.endpoint_url.clone(),
            node_id: self.node_id.clone(),
            expanded_node_id: self.expanded_node_id.clone(),
            display_name: self.display_name.clone(),
            value: change.value,
            status: change.status,
            source_timestamp: change.source_timestamp,
            server_timestamp: change.server_timestamp,
            heartbeat: false,
        }
    }

    async fn publish(&self, message: TelemetryMessage) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.sink.publish(message).await;
    }

    async fn send_heartbeat(&self) {
        let Some(heartbeat) = &self.heartbeat else {
            return;
        };
        let message = {
            let mut last = heartbeat.last.lock();
            let Some(message) = last.as_mut() else {
                tracing::warn!(node_id = %self.node_id, "No message available for heartbeat");
                return;
            };
            if let (Some(ts), Ok(step)) = (
                message.source_timestamp,
                chrono::Duration::from_std(heartbeat.interval),
            ) {
                message.source_timestamp = Some(ts + step);
            }
            let mut copy = message.clone();
            copy.heartbeat = true;
            copy
        };
        tracing::debug!(
            node_id = %self.node_id,
            source_timestamp = ?message.source_timestamp,
            "Heartbeat message enqueued"
        );
        self.publish(message).await;
    }
}

#[async_trait]
impl NotificationHandler for ItemNotifier {
    async fn on_data_change(&self, change: DataChange) {
        self.sequence.observe(change.sequence_number, &self.stream);

        if self.suppressed.contains(&change.status) {
            tracing::debug!(
                node_id = %self.node_id,
                status = %change.status,
                "Filtered notification with suppressed status"
            );
            return;
        }

        let mut message = self.message(change);

        if let Some(heartbeat) = &self.heartbeat {
            {
                let mut last = heartbeat.last.lock();
                let previous = last.as_ref().and_then(|m| m.source_timestamp);
                if let (Some(previous), Some(current)) = (previous, message.source_timestamp) {
                    // The heartbeat may already have advanced past the new value.
                    if previous >= current {
                        tracing::warn!(
                            node_id = %self.node_id,
                            "Heartbeat timestamp ahead of new value, adjusting"
                        );
                        message.source_timestamp =
                            Some(previous + chrono::Duration::milliseconds(1));
                    }
                }
                *last = Some(message.clone());
            }
            heartbeat.recharge.notify_one();
        }

        if self.skip_next.swap(false, Ordering::AcqRel) {
            tracing::debug!(node_id = %self.node_id, "Skipping first telemetry event");
            return;
        }
        self.publish(message).await;
    }
}

impl fmt::Debug for ItemNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemNotifier")
            .field("node_id", &self.node_id)
            .field("display_name", &self.display_name)
            .field("published", &self.published())
            .finish_non_exhaustive()
    }
}

/// Re-sends the last value whenever no new value arrived for one interval.
async fn run_heartbeat(notifier: Arc<ItemNotifier>, cancel: CancellationToken) {
    let Some(heartbeat) = &notifier.heartbeat else {
        return;
    };

    // Nothing to repeat before the first value.
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = heartbeat.recharge.notified() => {}
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = heartbeat.recharge.notified() => continue,
            _ = tokio::time::sleep(heartbeat.interval) => notifier.send_heartbeat().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ChannelSink;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn change(value: i64, seq: u32, second: u32) -> DataChange {
        DataChange {
            value: json!(value),
            status: StatusCode::GOOD,
            source_timestamp: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, second).unwrap()),
            server_timestamp: None,
            sequence_number: seq,
        }
    }

    fn arm(
        item: &mut MonitoredItem,
        config: &EngineConfig,
        sink: Arc<dyn NotificationSink>,
        cancel: &CancellationToken,
    ) -> Arc<ItemNotifier> {
        item.arm(ArmContext {
            endpoint_url: "opc.tcp://plc:4840",
            node_id: NodeId::string(2, "A"),
            display_name: "A".into(),
            sink,
            sequence: Arc::new(SequenceTracker::new()),
            config,
            stream: "test".into(),
            cancel,
        })
    }

    #[test]
    fn test_expanded_id_waits_for_namespaces() {
        let id: ConfiguredNodeId = "nsu=urn:x;s=A".parse().unwrap();
        let item = MonitoredItem::new(1, id, &NodeSettings::default(), &config());
        assert_eq!(item.state(), MonitoredItemState::UnmonitoredNamespaceUpdateRequested);
        assert!(item.state().is_pending());
    }

    #[test]
    fn test_defaults_and_overrides() {
        let cfg = EngineConfig::builder()
            .default_sampling_interval(Duration::from_millis(250))
            .build()
            .unwrap();
        let id: ConfiguredNodeId = "ns=2;s=A".parse().unwrap();

        let item = MonitoredItem::new(1, id.clone(), &NodeSettings::default(), &cfg);
        assert_eq!(item.requested_sampling_interval(), Duration::from_millis(250));
        assert_eq!(item.heartbeat_interval(), Duration::ZERO);
        let node = item.to_node_config(None);
        assert_eq!(node.sampling_interval, None);
        assert_eq!(node.display_name, None);

        let settings = NodeSettings::default()
            .sampling(Duration::from_secs(2))
            .display_name("Pump")
            .heartbeat(Duration::from_secs(100_000))
            .skip_first(true);
        let item = MonitoredItem::new(2, id, &settings, &cfg);
        assert_eq!(item.heartbeat_interval(), MAX_HEARTBEAT_INTERVAL);
        let node = item.to_node_config(Some(Duration::from_secs(1)));
        assert_eq!(node.sampling_interval, Some(Duration::from_secs(2)));
        assert_eq!(node.display_name.as_deref(), Some("Pump"));
        assert_eq!(node.skip_first, Some(true));
        assert_eq!(node.publishing_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_removal_requested_monitors_nothing() {
        let id: ConfiguredNodeId = "ns=2;s=A".parse().unwrap();
        let mut item = MonitoredItem::new(1, id.clone(), &NodeSettings::default(), &config());
        assert!(item.is_monitoring(&id, &NamespaceTable::default()));
        item.state = MonitoredItemState::RemovalRequested;
        assert!(!item.is_monitoring(&id, &NamespaceTable::default()));
    }

    #[tokio::test]
    async fn test_skip_first_drops_one_notification() {
        let (sink, mut rx) = ChannelSink::with_channel(8);
        let cancel = CancellationToken::new();
        let cfg = config();
        let id: ConfiguredNodeId = "ns=2;s=A".parse().unwrap();
        let mut item = MonitoredItem::new(1, id, &NodeSettings::default().skip_first(true), &cfg);
        let notifier = arm(&mut item, &cfg, Arc::new(sink), &cancel);

        notifier.on_data_change(change(1, 1, 0)).await;
        notifier.on_data_change(change(2, 2, 1)).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.value, json!(2));
        assert!(rx.try_recv().is_err());
        assert_eq!(notifier.published(), 1);
    }

    #[tokio::test]
    async fn test_suppressed_status_is_dropped() {
        let (sink, mut rx) = ChannelSink::with_channel(8);
        let cancel = CancellationToken::new();
        let cfg = EngineConfig::builder()
            .suppress_status(StatusCode::BAD_NODE_ID_UNKNOWN)
            .build()
            .unwrap();
        let id: ConfiguredNodeId = "ns=2;s=A".parse().unwrap();
        let mut item = MonitoredItem::new(1, id, &NodeSettings::default(), &cfg);
        let notifier = arm(&mut item, &cfg, Arc::new(sink), &cancel);

        let mut bad = change(1, 1, 0);
        bad.status = StatusCode::BAD_NODE_ID_UNKNOWN;
        notifier.on_data_change(bad).await;
        notifier.on_data_change(change(2, 2, 1)).await;

        assert_eq!(rx.recv().await.unwrap().value, json!(2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_resends_last_value() {
        let (sink, mut rx) = ChannelSink::with_channel(16);
        let cancel = CancellationToken::new();
        let cfg = config();
        let id: ConfiguredNodeId = "ns=2;s=A".parse().unwrap();
        let settings = NodeSettings::default().heartbeat(Duration::from_secs(5));
        let mut item = MonitoredItem::new(1, id, &settings, &cfg);
        let notifier = arm(&mut item, &cfg, Arc::new(sink), &cancel);

        notifier.on_data_change(change(7, 1, 0)).await;
        let value = rx.recv().await.unwrap();
        assert!(!value.heartbeat);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        let beat = rx.recv().await.unwrap();
        assert!(beat.heartbeat);
        assert_eq!(beat.value, json!(7));
        assert_eq!(
            beat.source_timestamp.unwrap() - value.source_timestamp.unwrap(),
            chrono::Duration::seconds(5)
        );

        item.disarm();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_timestamps_increasing() {
        let (sink, mut rx) = ChannelSink::with_channel(8);
        let cancel = CancellationToken::new();
        let cfg = config();
        let id: ConfiguredNodeId = "ns=2;s=A".parse().unwrap();
        let settings = NodeSettings::default().heartbeat(Duration::from_secs(3600));
        let mut item = MonitoredItem::new(1, id, &settings, &cfg);
        let notifier = arm(&mut item, &cfg, Arc::new(sink), &cancel);

        notifier.on_data_change(change(1, 1, 10)).await;
        notifier.on_data_change(change(2, 2, 10)).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.source_timestamp > first.source_timestamp);
        cancel.cancel();
    }
}
