// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The session registry.
//!
//! [`SessionRegistry`] is the composition root of the engine. It is built
//! once from an [`EngineConfig`] (or a whole [`PublisherConfig`]), a stack
//! adapter and a telemetry sink, and owns every session.
//!
//! # Locking
//!
//! The registry lock guards the session list. Cross-session operations take
//! it first and then lock one session at a time, never two at once.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use opcpub_engine::{ChannelSink, ConfigLoader, SessionRegistry};
//!
//! let config = ConfigLoader::new().load("publishednodes.yaml")?;
//! let (sink, mut telemetry) = ChannelSink::with_channel(10_000);
//! let registry = SessionRegistry::from_config(config, Arc::new(MyStack::new()), Arc::new(sink))?;
//! registry.start().await;
//!
//! while let Some(message) = telemetry.recv().await {
//!     forward(message).await;
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capability::{NotificationSink, UaStack};
use crate::error::PublisherResult;
use crate::monitored_item::NodeSettings;
use crate::session::{MonitorResult, Session, SessionContext};
use crate::settings::{EndpointConfig, EngineConfig, PublisherConfig};
use crate::types::ConfiguredNodeId;

// =============================================================================
// ConfigVersion
// =============================================================================

/// Counter bumped on every structural change of the published configuration.
///
/// Consumers compare values to detect "something changed"; the order of
/// bumps across sessions carries no meaning.
#[derive(Debug, Default)]
pub struct ConfigVersion(AtomicU64);

impl ConfigVersion {
    /// Creates a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter and returns the new value.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// Counters and Snapshot Filter
// =============================================================================

/// Aggregated counts over all sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCounters {
    /// Configured sessions.
    pub sessions: usize,
    /// Connected sessions.
    pub connected_sessions: usize,
    /// Configured subscriptions.
    pub subscriptions: usize,
    /// Subscriptions created on a server.
    pub connected_subscriptions: usize,
    /// Items not tagged for removal.
    pub configured_items: usize,
    /// Monitored items.
    pub monitored_items: usize,
    /// Items waiting for removal.
    pub pending_removal_items: usize,
}

/// Selects the sessions included in a configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    /// Only this endpoint id, compared case-insensitively.
    pub endpoint_id: Option<String>,
    /// Only this endpoint url, compared case-insensitively.
    pub endpoint_url: Option<String>,
    /// Include items tagged for removal.
    pub include_pending_removal: bool,
}

impl SnapshotFilter {
    fn matches(&self, session: &Session) -> bool {
        let id = self
            .endpoint_id
            .as_deref()
            .map_or(true, |id| session.endpoint_id().eq_ignore_ascii_case(id));
        let url = self
            .endpoint_url
            .as_deref()
            .map_or(true, |url| session.endpoint_url().eq_ignore_ascii_case(url));
        id && url
    }
}

// =============================================================================
// SessionRegistry
// =============================================================================

struct RegistryShared {
    config: Arc<EngineConfig>,
    stack: Arc<dyn UaStack>,
    sink: Arc<dyn NotificationSink>,
    version: Arc<ConfigVersion>,
    sessions: Mutex<Vec<Arc<Session>>>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Owns all sessions and their reconciliation loops.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

/// Collaborators shared by all sessions, before the registry exists.
struct Parts {
    config: Arc<EngineConfig>,
    stack: Arc<dyn UaStack>,
    sink: Arc<dyn NotificationSink>,
    version: Arc<ConfigVersion>,
    cancel: CancellationToken,
}

impl Parts {
    fn new(
        config: EngineConfig,
        stack: Arc<dyn UaStack>,
        sink: Arc<dyn NotificationSink>,
    ) -> PublisherResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            stack,
            sink,
            version: Arc::new(ConfigVersion::new()),
            cancel: CancellationToken::new(),
        })
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            config: Arc::clone(&self.config),
            stack: Arc::clone(&self.stack),
            sink: Arc::clone(&self.sink),
            version: Arc::clone(&self.version),
            cancel: self.cancel.child_token(),
        }
    }

    fn into_registry(self, sessions: Vec<Session>) -> SessionRegistry {
        SessionRegistry {
            shared: Arc::new(RegistryShared {
                config: self.config,
                stack: self.stack,
                sink: self.sink,
                version: self.version,
                sessions: Mutex::new(sessions.into_iter().map(Arc::new).collect()),
                cancel: self.cancel,
                tasks: parking_lot::Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }
}

/// Adds the nodes of `endpoint` to `session`; returns how many were new.
fn seed_nodes(session: &mut Session, endpoint: &EndpointConfig) -> PublisherResult<usize> {
    let mut added = 0;
    for node in &endpoint.nodes {
        let node_id = match node.id.parse::<ConfiguredNodeId>() {
            Ok(node_id) => node_id,
            Err(e) => {
                e.log(&format!("skipping node on endpoint {}", endpoint.endpoint_id));
                continue;
            }
        };
        if session.seed_node(node_id, &NodeSettings::from(node))? {
            added += 1;
        }
    }
    Ok(added)
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(
        config: EngineConfig,
        stack: Arc<dyn UaStack>,
        sink: Arc<dyn NotificationSink>,
    ) -> PublisherResult<Self> {
        Ok(Parts::new(config, stack, sink)?.into_registry(Vec::new()))
    }

    /// Creates a registry with one session per distinct endpoint id.
    ///
    /// Entries repeating an endpoint id are merged into the first one.
    /// Unparsable node ids are skipped with a warning. An endpoint that
    /// cannot be used at all, such as user name authentication without a
    /// credential, fails the whole construction.
    pub fn from_config(
        config: PublisherConfig,
        stack: Arc<dyn UaStack>,
        sink: Arc<dyn NotificationSink>,
    ) -> PublisherResult<Self> {
        let parts = Parts::new(config.engine, stack, sink)?;
        let mut sessions: Vec<Session> = Vec::new();

        for endpoint in &config.endpoints {
            endpoint.validate()?;
            let existing = sessions
                .iter()
                .position(|s| s.endpoint_id().eq_ignore_ascii_case(&endpoint.endpoint_id));
            let position = match existing {
                Some(position) => {
                    if !sessions[position]
                        .endpoint_url()
                        .eq_ignore_ascii_case(&endpoint.endpoint_url)
                    {
                        tracing::warn!(
                            endpoint_id = %endpoint.endpoint_id,
                            kept = %sessions[position].endpoint_url(),
                            ignored = %endpoint.endpoint_url,
                            "Endpoint id repeated with a different url, merging nodes"
                        );
                    }
                    position
                }
                None => {
                    sessions.push(Session::new(endpoint, parts.session_context())?);
                    sessions.len() - 1
                }
            };
            let added = seed_nodes(&mut sessions[position], endpoint)?;
            tracing::info!(
                endpoint_id = %endpoint.endpoint_id,
                endpoint = %endpoint.endpoint_url,
                nodes = added,
                "Loaded endpoint configuration"
            );
        }

        Ok(parts.into_registry(sessions))
    }

    /// Loads one more endpoint entry.
    ///
    /// Nodes of an already known endpoint id are added to its session.
    /// Returns the number of new items.
    pub async fn load_endpoint(&self, endpoint: &EndpointConfig) -> PublisherResult<usize> {
        endpoint.validate()?;
        let mut sessions = self.shared.sessions.lock().await;

        if let Some(session) = sessions
            .iter()
            .find(|s| s.endpoint_id().eq_ignore_ascii_case(&endpoint.endpoint_id))
        {
            let mut added = 0;
            for node in &endpoint.nodes {
                let node_id = match node.id.parse::<ConfiguredNodeId>() {
                    Ok(node_id) => node_id,
                    Err(e) => {
                        e.log(&format!("skipping node on endpoint {}", endpoint.endpoint_id));
                        continue;
                    }
                };
                if session
                    .add_node_for_monitoring(&node_id, &NodeSettings::from(node))
                    .await
                    == MonitorResult::Accepted
                {
                    added += 1;
                }
            }
            return Ok(added);
        }

        let parts = Parts {
            config: Arc::clone(&self.shared.config),
            stack: Arc::clone(&self.shared.stack),
            sink: Arc::clone(&self.shared.sink),
            version: Arc::clone(&self.shared.version),
            cancel: self.shared.cancel.clone(),
        };
        let mut session = Session::new(endpoint, parts.session_context())?;
        let added = seed_nodes(&mut session, endpoint)?;
        let session = Arc::new(session);
        sessions.push(Arc::clone(&session));
        if self.shared.started.load(Ordering::Acquire) {
            self.spawn_loop(session);
        }
        Ok(added)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts one reconciliation loop per session.
    ///
    /// Must be called from within a tokio runtime. Calling it again is a
    /// no-op.
    pub async fn start(&self) {
        let sessions = self.shared.sessions.lock().await;
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        for session in sessions.iter() {
            self.spawn_loop(Arc::clone(session));
        }
        tracing::info!(sessions = sessions.len(), "Session registry started");
    }

    fn spawn_loop(&self, session: Arc<Session>) {
        let registry: Weak<RegistryShared> = Arc::downgrade(&self.shared);
        session.wake();
        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                while session.wait_for_work().await {
                    session.reconcile().await;
                    if session.is_cancelled() {
                        break;
                    }
                    let Some(shared) = registry.upgrade() else {
                        break;
                    };
                    SessionRegistry { shared }.remove_unused_sessions().await;
                }
                tracing::debug!(endpoint = %session.endpoint_url(), "Session loop stopped");
            })
        };
        self.shared.tasks.lock().push(task);
    }

    /// Shuts every session down and waits for the loops to stop.
    pub async fn shutdown(&self) {
        let sessions = self.shared.sessions.lock().await.clone();
        for session in &sessions {
            session.shutdown().await;
        }
        self.shared.cancel.cancel();

        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "Session loop panicked");
                }
            }
        }
        self.shared.sessions.lock().await.clear();
        tracing::info!(sessions = sessions.len(), "Session registry shut down");
    }

    async fn lock_sessions(&self) -> Option<MutexGuard<'_, Vec<Arc<Session>>>> {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => None,
            guard = self.shared.sessions.lock() => Some(guard),
        }
    }

    /// Shuts down and drops sessions without subscriptions; returns how many.
    pub async fn remove_unused_sessions(&self) -> usize {
        let Some(mut sessions) = self.lock_sessions().await else {
            return 0;
        };

        let mut unused = Vec::new();
        for session in sessions.iter() {
            if session.is_unused().await {
                unused.push(Arc::clone(session));
            }
        }
        if unused.is_empty() {
            return 0;
        }

        sessions.retain(|s| !unused.iter().any(|u| Arc::ptr_eq(s, u)));
        for session in &unused {
            tracing::info!(endpoint = %session.endpoint_url(), "Removing unused session");
            session.shutdown().await;
        }
        self.shared.version.bump();
        unused.len()
    }

    // =========================================================================
    // Mutation API
    // =========================================================================

    /// Adds a node to the session of `endpoint_id`.
    ///
    /// Sessions are only created by loading configuration; an unknown
    /// endpoint id yields `Gone`.
    pub async fn add_node_for_monitoring(
        &self,
        endpoint_id: &str,
        node_id: &ConfiguredNodeId,
        settings: &NodeSettings,
    ) -> MonitorResult {
        let Some(sessions) = self.lock_sessions().await else {
            return MonitorResult::Gone;
        };
        let Some(session) = sessions
            .iter()
            .find(|s| s.endpoint_id().eq_ignore_ascii_case(endpoint_id))
        else {
            tracing::warn!(endpoint_id, node_id = %node_id, "No session for endpoint");
            return MonitorResult::Gone;
        };
        session.add_node_for_monitoring(node_id, settings).await
    }

    /// Tags `node_id` on the session of `endpoint_id` for removal.
    ///
    /// Nothing is published on an unknown endpoint, so that yields `Ok`.
    pub async fn request_monitor_item_removal(
        &self,
        endpoint_id: &str,
        node_id: &ConfiguredNodeId,
    ) -> MonitorResult {
        let Some(sessions) = self.lock_sessions().await else {
            return MonitorResult::Gone;
        };
        match sessions
            .iter()
            .find(|s| s.endpoint_id().eq_ignore_ascii_case(endpoint_id))
        {
            Some(session) => session.request_monitor_item_removal(node_id).await,
            None => MonitorResult::Ok,
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns `true` if `node_id` is published on the selected endpoint.
    ///
    /// The endpoint is selected by id when one is given, else by url; with
    /// neither, all sessions are searched.
    pub async fn is_node_published(
        &self,
        node_id: &ConfiguredNodeId,
        endpoint_url: Option<&str>,
        endpoint_id: Option<&str>,
    ) -> bool {
        let Some(sessions) = self.lock_sessions().await else {
            return false;
        };
        let endpoint_id = endpoint_id.filter(|id| !id.is_empty());
        for session in sessions.iter() {
            let selected = match (endpoint_id, endpoint_url) {
                (Some(id), _) => session.endpoint_id().eq_ignore_ascii_case(id),
                (None, Some(url)) => session.endpoint_url().eq_ignore_ascii_case(url),
                (None, None) => true,
            };
            if selected && session.is_node_published(node_id).await {
                return true;
            }
        }
        false
    }

    /// Aggregated session, subscription and item counts.
    pub async fn counters(&self) -> RegistryCounters {
        let Some(sessions) = self.lock_sessions().await else {
            return RegistryCounters::default();
        };
        let mut counters = RegistryCounters {
            sessions: sessions.len(),
            ..RegistryCounters::default()
        };
        for session in sessions.iter() {
            let Some(counts) = session.counts().await else {
                continue;
            };
            if counts.connected {
                counters.connected_sessions += 1;
            }
            counters.subscriptions += counts.subscriptions;
            counters.connected_subscriptions += counts.connected_subscriptions;
            counters.configured_items += counts.configured_items;
            counters.monitored_items += counts.monitored_items;
            counters.pending_removal_items += counts.pending_removal_items;
        }
        counters
    }

    /// Current configuration version.
    pub fn configuration_version(&self) -> u64 {
        self.shared.version.get()
    }

    /// Returns the published configuration and the version it reflects.
    ///
    /// The version is read while the registry lock is still held.
    pub async fn get_configuration_snapshot(
        &self,
        filter: &SnapshotFilter,
    ) -> (Vec<EndpointConfig>, u64) {
        let Some(sessions) = self.lock_sessions().await else {
            return (Vec::new(), self.shared.version.get());
        };
        let mut entries = Vec::new();
        for session in sessions.iter().filter(|s| filter.matches(s)) {
            if let Some(entry) = session.snapshot(filter.include_pending_removal).await {
                entries.push(entry);
            }
        }
        (entries, self.shared.version.get())
    }

    /// The session of `endpoint_id`.
    pub async fn session(&self, endpoint_id: &str) -> Option<Arc<Session>> {
        self.lock_sessions()
            .await?
            .iter()
            .find(|s| s.endpoint_id().eq_ignore_ascii_case(endpoint_id))
            .cloned()
    }

    /// All sessions.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock_sessions()
            .await
            .map(|sessions| sessions.clone())
            .unwrap_or_default()
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("version", &self.configuration_version())
            .field("started", &self.shared.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_version_bumps() {
        let version = ConfigVersion::new();
        assert_eq!(version.get(), 0);
        assert_eq!(version.bump(), 1);
        assert_eq!(version.bump(), 2);
        assert_eq!(version.get(), 2);
    }

    #[test]
    fn test_snapshot_filter_default_selects_all() {
        let filter = SnapshotFilter::default();
        assert!(filter.endpoint_id.is_none());
        assert!(!filter.include_pending_removal);
    }
}
