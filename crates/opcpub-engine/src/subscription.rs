// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Engine-side subscriptions.
//!
//! A session keeps at most one subscription per requested publishing
//! interval. The subscription owns its items; the server-side counterpart
//! is created lazily by the first monitor pass and dropped on disconnect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::UaSubscription;
use crate::monitored_item::{MonitoredItem, MonitoredItemState};
use crate::sequence::SequenceTracker;
use crate::types::{ConfiguredNodeId, NamespaceTable};

/// A group of monitored items sharing one publishing interval.
pub struct Subscription {
    requested_publishing_interval: Duration,
    publishing_from_config: bool,
    pub(crate) actual_publishing_interval: Option<Duration>,
    pub(crate) items: Vec<MonitoredItem>,
    pub(crate) handle: Option<Box<dyn UaSubscription>>,
    sequence: Arc<SequenceTracker>,
}

impl Subscription {
    /// Creates an empty subscription without a server counterpart.
    pub fn new(requested_publishing_interval: Duration, publishing_from_config: bool) -> Self {
        Self {
            requested_publishing_interval,
            publishing_from_config,
            actual_publishing_interval: None,
            items: Vec::new(),
            handle: None,
            sequence: Arc::new(SequenceTracker::new()),
        }
    }

    /// Publishing interval the subscription was created for.
    pub fn requested_publishing_interval(&self) -> Duration {
        self.requested_publishing_interval
    }

    /// Publishing interval revised by the server, while connected.
    pub fn actual_publishing_interval(&self) -> Option<Duration> {
        self.actual_publishing_interval
    }

    /// The publishing interval reported by configuration snapshots.
    pub(crate) fn configured_publishing_interval(&self) -> Option<Duration> {
        self.publishing_from_config
            .then_some(self.requested_publishing_interval)
    }

    /// Items of the subscription.
    pub fn items(&self) -> &[MonitoredItem] {
        &self.items
    }

    /// Sequence tracker shared by the items' notifiers.
    pub fn sequence(&self) -> &Arc<SequenceTracker> {
        &self.sequence
    }

    /// Returns `true` if the server-side subscription exists.
    pub fn is_created(&self) -> bool {
        self.handle.is_some()
    }

    /// Returns `true` if any non-removed item monitors `node_id`.
    pub fn monitors(&self, node_id: &ConfiguredNodeId, namespaces: &NamespaceTable) -> bool {
        self.items
            .iter()
            .any(|item| item.is_monitoring(node_id, namespaces))
    }

    /// Tags every item monitoring `node_id` for removal; returns how many.
    pub(crate) fn request_removal(
        &mut self,
        node_id: &ConfiguredNodeId,
        namespaces: &NamespaceTable,
    ) -> usize {
        let mut tagged = 0;
        for item in self
            .items
            .iter_mut()
            .filter(|item| item.is_monitoring(node_id, namespaces))
        {
            item.state = MonitoredItemState::RemovalRequested;
            tagged += 1;
        }
        tagged
    }

    /// Removes and returns the items tagged for removal.
    pub(crate) fn take_removal_requested(&mut self) -> Vec<MonitoredItem> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| item.state == MonitoredItemState::RemovalRequested);
        self.items = kept;
        removed
    }

    /// Forgets the server counterpart after the session went away.
    pub(crate) fn reset_after_disconnect(&mut self) {
        self.handle = None;
        self.actual_publishing_interval = None;
        self.sequence.reset();
        for item in &mut self.items {
            item.reset();
        }
    }

    /// Number of items in `state`.
    pub fn count_in(&self, state: MonitoredItemState) -> usize {
        self.items.iter().filter(|item| item.state == state).count()
    }

    /// Number of items still waiting to be monitored.
    pub fn pending_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.state.is_pending())
            .count()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("requested_publishing_interval", &self.requested_publishing_interval)
            .field("actual_publishing_interval", &self.actual_publishing_interval)
            .field("server_id", &self.handle.as_ref().map(|h| h.id()))
            .field("items", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitored_item::NodeSettings;
    use crate::settings::EngineConfig;

    fn item(handle: u32, id: &str) -> MonitoredItem {
        MonitoredItem::new(
            handle,
            id.parse().unwrap(),
            &NodeSettings::default(),
            &EngineConfig::default(),
        )
    }

    #[test]
    fn test_removal_partition() {
        let mut sub = Subscription::new(Duration::from_secs(1), false);
        sub.items.push(item(1, "ns=2;s=A"));
        sub.items.push(item(2, "ns=2;s=B"));
        sub.items.push(item(3, "ns=2;s=A"));

        let target: ConfiguredNodeId = "ns=2;s=A".parse().unwrap();
        assert_eq!(sub.request_removal(&target, &NamespaceTable::default()), 2);
        assert!(!sub.monitors(&target, &NamespaceTable::default()));
        assert_eq!(sub.count_in(MonitoredItemState::RemovalRequested), 2);

        let removed = sub.take_removal_requested();
        assert_eq!(removed.len(), 2);
        assert_eq!(sub.items().len(), 1);
        assert_eq!(sub.items()[0].client_handle(), 2);
    }

    #[test]
    fn test_reset_returns_monitored_items_to_pending() {
        let mut sub = Subscription::new(Duration::from_secs(1), true);
        let mut monitored = item(1, "ns=2;s=A");
        monitored.mark_monitored(Duration::from_millis(500));
        sub.items.push(monitored);
        sub.actual_publishing_interval = Some(Duration::from_secs(1));

        sub.reset_after_disconnect();
        assert_eq!(sub.pending_count(), 1);
        assert_eq!(sub.actual_publishing_interval(), None);
        assert_eq!(sub.items()[0].revised_sampling_interval(), None);
        assert_eq!(sub.configured_publishing_interval(), Some(Duration::from_secs(1)));
    }
}
