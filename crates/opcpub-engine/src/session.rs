// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Sessions and their reconciliation steps.
//!
//! A [`Session`] owns everything published on one endpoint. Its state,
//! subscriptions and items live behind one async mutex; every mutation
//! happens while holding it. Waiting for the lock is bounded by the
//! session's cancellation token: a cancelled session reports "not locked"
//! instead of blocking.
//!
//! # Reconciliation
//!
//! The registry runs one loop per session. Each pass executes, in order:
//!
//! ```text
//! connect_session            Disconnected -> Connecting -> Connected
//! monitor_nodes              create subscriptions, add pending items
//! stop_monitoring            drop items tagged for removal
//! remove_unused_subscriptions
//! ```
//!
//! Each step takes the lock on its own and is best effort: an error is
//! logged and the next step still runs. Connecting releases the lock for
//! the network round trips; the monitor pass keeps it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;

use crate::capability::{
    KeepAliveEvent, MonitoredItemResult, NotificationSink, StackResult, UaConnection, UaStack,
    UaSubscription, UserIdentity,
};
use crate::endpoint::{discovery_url, select_endpoint, SecurityRequirements};
use crate::error::{
    NodeError, PublisherError, PublisherResult, SessionError, StackError, SubscriptionError,
    TimeoutError,
};
use crate::monitored_item::{ArmContext, MonitoredItem, MonitoredItemState, NodeSettings};
use crate::registry::ConfigVersion;
use crate::settings::{EndpointConfig, EngineConfig};
use crate::subscription::Subscription;
use crate::types::{
    AuthMode, ConfiguredNodeId, CredentialRef, NamespaceTable, NodeId, SecurityMode, StatusCode,
};

// =============================================================================
// SessionState
// =============================================================================

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No connection.
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and usable.
    Connected,
}

impl SessionState {
    /// Returns `true` if the session is connected.
    #[inline]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of a mutation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorResult {
    /// The change was recorded and the reconciliation loop was woken.
    Accepted,
    /// Nothing to do.
    Ok,
    /// The session or endpoint is gone or shutting down.
    Gone,
    /// The request could not be processed.
    InternalServerError,
}

impl MonitorResult {
    /// HTTP status equivalent, for method handlers.
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Accepted => 202,
            Self::Ok => 200,
            Self::Gone => 410,
            Self::InternalServerError => 500,
        }
    }

    /// Returns `true` for `Accepted` and `Ok`.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Accepted | Self::Ok)
    }
}

impl fmt::Display for MonitorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "Accepted"),
            Self::Ok => write!(f, "OK"),
            Self::Gone => write!(f, "Gone"),
            Self::InternalServerError => write!(f, "InternalServerError"),
        }
    }
}

/// What a keep-alive event did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveOutcome {
    /// The event arrived after shutdown or while not connected.
    Ignored,
    /// Good status.
    Healthy,
    /// Bad status, with the consecutive miss count.
    Missed(u32),
    /// The threshold was reached and a disconnect was started.
    DisconnectTriggered,
}

// =============================================================================
// SessionStats
// =============================================================================

/// Session statistics.
#[derive(Debug, Default)]
pub struct SessionStats {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    keep_alive_misses: AtomicU64,
    internal_disconnects: AtomicU64,
    items_monitored: AtomicU64,
    node_failures: AtomicU64,
}

impl SessionStats {
    /// Creates zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_keep_alive_miss(&self) {
        self.keep_alive_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_internal_disconnect(&self) {
        self.internal_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn record_items_monitored(&self, count: u64) {
        self.items_monitored.fetch_add(count, Ordering::Relaxed);
    }

    fn record_node_failure(&self) {
        self.node_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy.
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            keep_alive_misses: self.keep_alive_misses.load(Ordering::Relaxed),
            internal_disconnects: self.internal_disconnects.load(Ordering::Relaxed),
            items_monitored: self.items_monitored.load(Ordering::Relaxed),
            node_failures: self.node_failures.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatsSnapshot {
    /// Connection attempts started.
    pub connect_attempts: u64,
    /// Connection attempts that failed.
    pub connect_failures: u64,
    /// Bad keep-alives observed.
    pub keep_alive_misses: u64,
    /// Disconnects forced by keep-alive loss or invalidation.
    pub internal_disconnects: u64,
    /// Items that reached `Monitored`, counting re-monitoring.
    pub items_monitored: u64,
    /// Per-node failures.
    pub node_failures: u64,
}

/// Item and subscription counts of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    /// `true` if the session is connected.
    pub connected: bool,
    /// Subscriptions.
    pub subscriptions: usize,
    /// Subscriptions created on the server.
    pub connected_subscriptions: usize,
    /// Items not tagged for removal.
    pub configured_items: usize,
    /// Items in `Monitored`.
    pub monitored_items: usize,
    /// Items in `RemovalRequested`.
    pub pending_removal_items: usize,
}

// =============================================================================
// Session
// =============================================================================

/// Shared collaborators handed to every session.
pub(crate) struct SessionContext {
    pub config: Arc<EngineConfig>,
    pub stack: Arc<dyn UaStack>,
    pub sink: Arc<dyn NotificationSink>,
    pub version: Arc<ConfigVersion>,
    pub cancel: CancellationToken,
}

struct SessionInner {
    state: SessionState,
    unsuccessful_connections: u32,
    connection: Option<Arc<dyn UaConnection>>,
    // Empty unless connected.
    namespaces: NamespaceTable,
    subscriptions: Vec<Subscription>,
    next_client_handle: u32,
}

impl SessionInner {
    fn is_published(&self, node_id: &ConfiguredNodeId) -> bool {
        self.subscriptions
            .iter()
            .any(|s| s.monitors(node_id, &self.namespaces))
    }

    /// Adds an item unless the node is already published; returns `true` if added.
    fn insert_node(
        &mut self,
        endpoint_id: &str,
        node_id: ConfiguredNodeId,
        settings: &NodeSettings,
        config: &EngineConfig,
    ) -> PublisherResult<bool> {
        if self.is_published(&node_id) {
            return Ok(false);
        }

        let client_handle = self.next_client_handle;
        self.next_client_handle = client_handle.checked_add(1).ok_or_else(|| {
            PublisherError::session(SessionError::HandlesExhausted {
                endpoint_id: endpoint_id.to_string(),
            })
        })?;

        let interval = settings
            .publishing_interval
            .unwrap_or(config.default_publishing_interval);
        let position = match self
            .subscriptions
            .iter()
            .position(|s| s.requested_publishing_interval() == interval)
        {
            Some(position) => position,
            None => {
                tracing::info!(
                    endpoint_id = endpoint_id,
                    publishing_interval = ?interval,
                    "Creating subscription for new publishing interval"
                );
                self.subscriptions.push(Subscription::new(
                    interval,
                    settings.publishing_interval.is_some(),
                ));
                self.subscriptions.len() - 1
            }
        };
        self.subscriptions[position]
            .items
            .push(MonitoredItem::new(client_handle, node_id, settings, config));
        Ok(true)
    }
}

/// Everything published on one endpoint.
pub struct Session {
    endpoint_id: String,
    endpoint_url: String,
    use_security: Option<bool>,
    security_mode: Option<SecurityMode>,
    security_profile_uri: Option<String>,
    auth_mode: AuthMode,
    credential: Option<CredentialRef>,

    config: Arc<EngineConfig>,
    stack: Arc<dyn UaStack>,
    sink: Arc<dyn NotificationSink>,
    version: Arc<ConfigVersion>,

    inner: Mutex<SessionInner>,
    state: AtomicU8,
    wake: Notify,
    cancel: CancellationToken,
    shutdown_requested: AtomicBool,
    missed_keep_alives: AtomicU32,
    disconnect_pending: AtomicBool,
    /// Incremented on every connect and disconnect.
    connection_generation: AtomicU64,
    stats: SessionStats,
}

impl Session {
    /// Creates a disconnected session without nodes.
    ///
    /// Fails if the endpoint cannot be used at all, e.g. a user name
    /// authentication without a credential.
    pub(crate) fn new(endpoint: &EndpointConfig, ctx: SessionContext) -> PublisherResult<Self> {
        endpoint.validate()?;
        Ok(Self {
            endpoint_id: endpoint.endpoint_id.clone(),
            endpoint_url: endpoint.endpoint_url.clone(),
            use_security: endpoint.use_security,
            security_mode: endpoint.security_mode,
            security_profile_uri: endpoint.security_profile_uri.clone(),
            auth_mode: endpoint.auth_mode,
            credential: endpoint.credential.clone(),
            config: ctx.config,
            stack: ctx.stack,
            sink: ctx.sink,
            version: ctx.version,
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                unsuccessful_connections: 0,
                connection: None,
                namespaces: NamespaceTable::default(),
                subscriptions: Vec::new(),
                next_client_handle: 1,
            }),
            state: AtomicU8::new(SessionState::Disconnected.as_u8()),
            wake: Notify::new(),
            cancel: ctx.cancel,
            shutdown_requested: AtomicBool::new(false),
            missed_keep_alives: AtomicU32::new(0),
            disconnect_pending: AtomicBool::new(false),
            connection_generation: AtomicU64::new(0),
            stats: SessionStats::new(),
        })
    }

    /// Adds a node while the session is still exclusively owned.
    pub(crate) fn seed_node(
        &mut self,
        node_id: ConfiguredNodeId,
        settings: &NodeSettings,
    ) -> PublisherResult<bool> {
        let added = self.inner.get_mut().insert_node(
            &self.endpoint_id,
            node_id,
            settings,
            &self.config,
        )?;
        if added {
            self.version.bump();
        }
        Ok(added)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Endpoint id.
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Endpoint url.
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Current state, readable without the lock.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Consecutive bad keep-alives.
    pub fn missed_keep_alives(&self) -> u32 {
        self.missed_keep_alives.load(Ordering::Relaxed)
    }

    /// Number of connects and disconnects so far.
    pub fn connection_generation(&self) -> u64 {
        self.connection_generation.load(Ordering::Acquire)
    }

    /// Failed connection attempts since the last success.
    pub async fn unsuccessful_connection_count(&self) -> Option<u32> {
        self.lock().await.map(|inner| inner.unsuccessful_connections)
    }

    /// Statistics.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Returns `true` once shutdown has started.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Returns `true` once the session is cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // =========================================================================
    // Locking and Signaling
    // =========================================================================

    /// Acquires the session lock unless the session is cancelled first.
    async fn lock(&self) -> Option<MutexGuard<'_, SessionInner>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            guard = self.inner.lock() => Some(guard),
        }
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        inner.state = state;
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Requests a reconciliation pass. Multiple requests before the loop
    /// wakes collapse into one.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Waits for a wake request or the connect wait interval.
    ///
    /// Returns `false` once the session is cancelled; cancellation wins over
    /// a pending wake.
    pub async fn wait_for_work(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = self.wake.notified() => true,
            _ = tokio::time::sleep(self.config.session_connect_wait) => true,
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Runs one reconciliation pass over this session.
    pub async fn reconcile(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.connect_session().await {
            e.log(&format!("connect {}", self.endpoint_url));
        }
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.monitor_nodes().await {
            e.log(&format!("monitor {}", self.endpoint_url));
        }
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.stop_monitoring().await {
            e.log(&format!("stop monitoring {}", self.endpoint_url));
        }
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.remove_unused_subscriptions().await {
            e.log(&format!("remove subscriptions {}", self.endpoint_url));
        }
    }

    /// Connects if disconnected.
    ///
    /// The lock is released while talking to the server.
    pub async fn connect_session(self: &Arc<Self>) -> PublisherResult<()> {
        let unsuccessful = {
            let Some(mut inner) = self.lock().await else {
                return Ok(());
            };
            if self.is_shutdown_requested() || inner.state != SessionState::Disconnected {
                return Ok(());
            }
            self.set_state(&mut inner, SessionState::Connecting);
            inner.unsuccessful_connections
        };

        self.stats.record_connect_attempt();
        let result = self.open_connection(unsuccessful).await;

        let Some(mut guard) = self.lock().await else {
            if let Ok((connection, _)) = result {
                let _ = connection.close().await;
            }
            return Ok(());
        };
        let inner = &mut *guard;

        match result {
            Err(e) => {
                inner.unsuccessful_connections = inner.unsuccessful_connections.saturating_add(1);
                self.set_state(inner, SessionState::Disconnected);
                self.stats.record_connect_failure();
                tracing::warn!(
                    endpoint = %self.endpoint_url,
                    failures = inner.unsuccessful_connections,
                    next_timeout = ?self.config.connect_timeout_for(inner.unsuccessful_connections),
                    "Session creation failed {} time(s)",
                    inner.unsuccessful_connections
                );
                Err(e)
            }
            Ok((connection, namespaces)) => {
                if self.is_shutdown_requested() {
                    let _ = connection.close().await;
                    self.set_state(inner, SessionState::Disconnected);
                    return Ok(());
                }

                inner.unsuccessful_connections = 0;
                inner.namespaces = NamespaceTable::new(namespaces);
                for (index, uri) in inner.namespaces.iter() {
                    tracing::debug!(endpoint = %self.endpoint_url, index, uri, "Namespace");
                }

                let events = connection.subscribe_keep_alive(self.config.keep_alive_interval);
                inner.connection = Some(connection);
                self.missed_keep_alives.store(0, Ordering::Relaxed);
                self.disconnect_pending.store(false, Ordering::Release);
                let generation = self.connection_generation.fetch_add(1, Ordering::AcqRel) + 1;
                self.set_state(inner, SessionState::Connected);
                self.spawn_keep_alive_watcher(events, generation);

                tracing::info!(
                    endpoint = %self.endpoint_url,
                    namespaces = inner.namespaces.len(),
                    "Session connected"
                );
                Ok(())
            }
        }
    }

    async fn open_connection(
        &self,
        unsuccessful: u32,
    ) -> PublisherResult<(Arc<dyn UaConnection>, Vec<String>)> {
        let discovery = discovery_url(&self.endpoint_url);
        let endpoints = self.stack.get_endpoints(&discovery).await?;
        let requirements = SecurityRequirements {
            use_security: self.use_security,
            security_mode: self.security_mode,
            security_profile_uri: self.security_profile_uri.as_deref(),
        };
        let selected = select_endpoint(&self.endpoint_url, &endpoints, &requirements)?;
        let identity = self.identity()?;
        let timeout = self.config.connect_timeout_for(unsuccessful);

        tracing::info!(
            endpoint = %self.endpoint_url,
            selected = %selected.endpoint_url,
            security_mode = %selected.security_mode,
            security_policy = %selected.security_policy_uri,
            timeout = ?timeout,
            "Creating session"
        );

        let connection =
            match tokio::time::timeout(timeout, self.stack.connect(&selected, timeout, &identity))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(TimeoutError::connect(&self.endpoint_url, timeout).into()),
            };

        match connection.read_namespace_array().await {
            Ok(namespaces) => Ok((connection, namespaces)),
            Err(e) => {
                let _ = connection.close().await;
                Err(e.into())
            }
        }
    }

    fn identity(&self) -> PublisherResult<UserIdentity> {
        match self.auth_mode {
            AuthMode::Anonymous => Ok(UserIdentity::Anonymous),
            AuthMode::UsernamePassword => self
                .credential
                .clone()
                .map(UserIdentity::UserName)
                .ok_or_else(|| PublisherError::missing_credential(&self.endpoint_id)),
        }
    }

    /// Watches the keep-alive channel of one connection. The watcher stops
    /// once the session has moved on to another connection.
    fn spawn_keep_alive_watcher(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<KeepAliveEvent>,
        generation: u64,
    ) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let (Some(event), Some(session)) = (event, weak.upgrade()) else {
                    break;
                };
                if session.connection_generation() != generation {
                    tracing::debug!(
                        endpoint = %session.endpoint_url,
                        generation,
                        "Keep-alive channel of a closed connection, stopping watcher"
                    );
                    break;
                }
                session.handle_keep_alive(event);
            }
        });
    }

    /// Creates pending items on the server.
    pub async fn monitor_nodes(&self) -> PublisherResult<()> {
        let Some(mut guard) = self.lock().await else {
            return Ok(());
        };
        if self.is_shutdown_requested() || guard.state != SessionState::Connected {
            return Ok(());
        }
        let inner = &mut *guard;

        let result = self.monitor_locked(inner).await;
        if let Err(e) = &result {
            if e.invalidates_session() {
                tracing::warn!(
                    endpoint = %self.endpoint_url,
                    error = %e,
                    "Session invalidated by server, disconnecting"
                );
                self.internal_disconnect_locked(inner).await;
            }
        }
        result
    }

    async fn monitor_locked(&self, inner: &mut SessionInner) -> PublisherResult<()> {
        let Some(connection) = inner.connection.clone() else {
            return Err(PublisherError::not_connected());
        };
        let SessionInner {
            namespaces,
            subscriptions,
            ..
        } = inner;

        for subscription in subscriptions.iter_mut() {
            if self.cancel.is_cancelled() {
                break;
            }
            if subscription.pending_count() == 0 {
                continue;
            }

            if subscription.handle.is_none() {
                let interval = subscription.requested_publishing_interval();
                let handle = match connection.create_subscription(interval).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        let error = PublisherError::from(e.clone());
                        if error.invalidates_session() {
                            return Err(error);
                        }
                        PublisherError::subscription(SubscriptionError::creation_failed(
                            interval, e.message,
                        ))
                        .log(&self.endpoint_url);
                        continue;
                    }
                };
                let revised = handle.revised_publishing_interval();
                if revised != interval {
                    tracing::info!(
                        endpoint = %self.endpoint_url,
                        requested = ?interval,
                        revised = ?revised,
                        "Publishing interval revised by server"
                    );
                }
                subscription.actual_publishing_interval = Some(revised);
                subscription.handle = Some(handle);
            }

            self.monitor_subscription(&connection, namespaces, subscription)
                .await?;
        }
        Ok(())
    }

    async fn monitor_subscription(
        &self,
        connection: &Arc<dyn UaConnection>,
        namespaces: &NamespaceTable,
        subscription: &mut Subscription,
    ) -> PublisherResult<()> {
        let sequence = Arc::clone(subscription.sequence());
        let Some(handle) = subscription.handle.as_mut() else {
            return Ok(());
        };
        let stream = format!("{}#{}", self.endpoint_id, handle.id());
        let items = &mut subscription.items;

        let candidates: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.state.is_pending())
            .map(|(index, _)| index)
            .collect();

        let mut staged: Vec<usize> = Vec::new();
        let mut monitored = 0usize;

        for index in candidates {
            if self.cancel.is_cancelled() {
                for &index in &staged {
                    items[index].disarm();
                }
                return Ok(());
            }

            let item = &mut items[index];
            if item.state == MonitoredItemState::UnmonitoredNamespaceUpdateRequested {
                item.state = MonitoredItemState::Unmonitored;
            }

            let node_id = match item.configured_id().resolve(namespaces) {
                Ok(node_id) => node_id,
                Err(e) => {
                    self.record_node_failure(item, e);
                    continue;
                }
            };

            let display_name = self.display_name_for(connection, item, &node_id).await?;

            let request = item.request(node_id.clone(), display_name.clone());
            let notifier = item.arm(ArmContext {
                endpoint_url: &self.endpoint_url,
                node_id,
                display_name,
                sink: Arc::clone(&self.sink),
                sequence: Arc::clone(&sequence),
                config: &self.config,
                stream: stream.clone(),
                cancel: &self.cancel,
            });
            handle.add_item(request, notifier);
            staged.push(index);

            if staged.len() >= self.config.apply_batch_size {
                monitored += self.apply_batch(&mut **handle, items, &mut staged).await?;
            }
        }

        if !staged.is_empty() {
            monitored += self.apply_batch(&mut **handle, items, &mut staged).await?;
        }

        if monitored > 0 {
            tracing::info!(
                endpoint = %self.endpoint_url,
                subscription = handle.id(),
                monitored,
                "Now monitoring items"
            );
        }
        Ok(())
    }

    /// Configured name, else the server's DisplayName when enabled, else the id.
    async fn display_name_for(
        &self,
        connection: &Arc<dyn UaConnection>,
        item: &MonitoredItem,
        node_id: &NodeId,
    ) -> PublisherResult<String> {
        if let Some(name) = item.display_name() {
            return Ok(name.to_string());
        }
        if !self.config.fetch_display_name {
            return Ok(item.configured_id().to_string());
        }
        match connection.read_display_name(node_id).await {
            Ok(name) if !name.is_empty() => Ok(name),
            Ok(_) => Ok(item.configured_id().to_string()),
            Err(e) => {
                let error = PublisherError::from(e);
                if error.invalidates_session() {
                    return Err(error);
                }
                tracing::debug!(
                    node_id = %node_id,
                    error = %error,
                    "Display name not readable, using node id"
                );
                Ok(item.configured_id().to_string())
            }
        }
    }

    async fn commit(handle: &mut dyn UaSubscription) -> StackResult<Vec<MonitoredItemResult>> {
        handle.set_publishing_mode(true).await?;
        handle.apply_changes().await
    }

    /// Applies the staged items; returns how many became monitored.
    async fn apply_batch(
        &self,
        handle: &mut dyn UaSubscription,
        items: &mut [MonitoredItem],
        staged: &mut Vec<usize>,
    ) -> PublisherResult<usize> {
        let batch = std::mem::take(staged);

        let results = match Self::commit(handle).await {
            Ok(results) => results,
            Err(e) => {
                for &index in &batch {
                    handle.remove_item(items[index].client_handle());
                    items[index].disarm();
                }
                return Err(e.into());
            }
        };
        let by_handle: HashMap<u32, &MonitoredItemResult> =
            results.iter().map(|r| (r.client_handle, r)).collect();

        let mut monitored = 0;
        let mut invalidated: Option<PublisherError> = None;
        for index in batch {
            let item = &mut items[index];
            match by_handle.get(&item.client_handle()) {
                Some(result) if result.status.is_good() => {
                    if result.revised_sampling_interval != item.requested_sampling_interval() {
                        tracing::debug!(
                            node_id = %item.configured_id(),
                            requested = ?item.requested_sampling_interval(),
                            revised = ?result.revised_sampling_interval,
                            "Sampling interval revised by server"
                        );
                    }
                    item.mark_monitored(result.revised_sampling_interval);
                    monitored += 1;
                }
                other => {
                    let status = other.map_or(StatusCode::BAD_INTERNAL_ERROR, |r| r.status);
                    handle.remove_item(item.client_handle());
                    item.disarm();
                    let error: PublisherError =
                        StackError::new(status, item.configured_id().to_string()).into();
                    if error.invalidates_session() {
                        invalidated = Some(error);
                    } else {
                        self.record_node_failure(item, error);
                    }
                }
            }
        }

        // Items of this batch are live on the server even if a later batch fails.
        if monitored > 0 {
            self.version.bump();
            self.stats.record_items_monitored(monitored as u64);
        }

        match invalidated {
            Some(error) => Err(error),
            None => Ok(monitored),
        }
    }

    fn record_node_failure(&self, item: &mut MonitoredItem, error: PublisherError) {
        item.failed_attempts = item.failed_attempts.saturating_add(1);
        self.stats.record_node_failure();
        error.log(&format!("monitor {} on {}", item.configured_id(), self.endpoint_url));

        if let Some(limit) = self.config.max_node_attempts {
            if item.failed_attempts >= limit {
                item.state = MonitoredItemState::RemovalRequested;
                PublisherError::node(NodeError::AttemptsExhausted {
                    node_id: item.configured_id().to_string(),
                    attempts: item.failed_attempts,
                })
                .log(&self.endpoint_url);
            }
        }
    }

    /// Removes items tagged for removal from the server and the session.
    pub async fn stop_monitoring(&self) -> PublisherResult<()> {
        let Some(mut guard) = self.lock().await else {
            return Ok(());
        };
        let inner = &mut *guard;
        let connected = inner.state == SessionState::Connected;

        let mut removed_total = 0;
        for subscription in &mut inner.subscriptions {
            let removed = subscription.take_removal_requested();
            if removed.is_empty() {
                continue;
            }
            if let (true, Some(handle)) = (connected, subscription.handle.as_mut()) {
                let on_server: Vec<u32> = removed
                    .iter()
                    .filter(|item| item.revised_sampling_interval().is_some())
                    .map(MonitoredItem::client_handle)
                    .collect();
                if !on_server.is_empty() {
                    for client_handle in on_server {
                        handle.remove_item(client_handle);
                    }
                    if let Err(e) = handle.apply_changes().await {
                        tracing::debug!(
                            endpoint = %self.endpoint_url,
                            error = %e,
                            "Removing items failed, ignored"
                        );
                    }
                }
            }
            for item in &removed {
                tracing::info!(
                    endpoint = %self.endpoint_url,
                    node_id = %item.configured_id(),
                    "Stopped monitoring node"
                );
            }
            removed_total += removed.len();
        }

        if removed_total > 0 {
            self.version.bump();
        }
        Ok(())
    }

    /// Deletes subscriptions without items.
    pub async fn remove_unused_subscriptions(&self) -> PublisherResult<()> {
        let Some(mut guard) = self.lock().await else {
            return Ok(());
        };
        let inner = &mut *guard;
        let connected = inner.state == SessionState::Connected;

        let (unused, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.subscriptions)
            .into_iter()
            .partition(|s| s.items().is_empty());
        inner.subscriptions = kept;

        for mut subscription in unused {
            if let (true, Some(mut handle)) = (connected, subscription.handle.take()) {
                if let Err(e) = handle.delete().await {
                    tracing::debug!(
                        endpoint = %self.endpoint_url,
                        error = %e,
                        "Deleting subscription failed, ignored"
                    );
                }
            }
            tracing::info!(
                endpoint = %self.endpoint_url,
                publishing_interval = ?subscription.requested_publishing_interval(),
                "Removed unused subscription"
            );
            self.version.bump();
        }
        Ok(())
    }

    // =========================================================================
    // Disconnect and Keep-Alive
    // =========================================================================

    /// Tears down the connection; items return to `Unmonitored`.
    pub async fn disconnect(&self) {
        if let Some(mut guard) = self.lock().await {
            self.internal_disconnect_locked(&mut guard).await;
        }
    }

    async fn internal_disconnect_locked(&self, inner: &mut SessionInner) {
        let had_monitored = inner
            .subscriptions
            .iter()
            .any(|s| s.count_in(MonitoredItemState::Monitored) > 0);

        for subscription in &mut inner.subscriptions {
            if let Some(mut handle) = subscription.handle.take() {
                // The session may already be invalid on the server.
                let _ = handle.delete().await;
            }
            subscription.reset_after_disconnect();
        }
        if let Some(connection) = inner.connection.take() {
            connection.unsubscribe_keep_alive();
            let _ = connection.close().await;
        }
        inner.namespaces = NamespaceTable::default();
        self.set_state(inner, SessionState::Disconnected);
        self.connection_generation.fetch_add(1, Ordering::AcqRel);
        self.missed_keep_alives.store(0, Ordering::Relaxed);
        self.stats.record_internal_disconnect();
        if had_monitored {
            self.version.bump();
        }
        tracing::info!(endpoint = %self.endpoint_url, "Session disconnected");
    }

    /// Processes one keep-alive event.
    pub fn handle_keep_alive(self: &Arc<Self>, event: KeepAliveEvent) -> KeepAliveOutcome {
        if self.cancel.is_cancelled() || self.is_shutdown_requested() {
            return KeepAliveOutcome::Ignored;
        }

        if event.status.is_good() {
            let previous = self.missed_keep_alives.swap(0, Ordering::Relaxed);
            if previous > 0 {
                tracing::info!(
                    endpoint = %self.endpoint_url,
                    missed = previous,
                    "Keep-alive recovered"
                );
            }
            return KeepAliveOutcome::Healthy;
        }

        if self.state() != SessionState::Connected {
            return KeepAliveOutcome::Ignored;
        }

        let missed = self.missed_keep_alives.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.record_keep_alive_miss();
        tracing::warn!(
            endpoint = %self.endpoint_url,
            status = %event.status,
            missed,
            "Bad keep-alive"
        );

        if missed >= self.config.keep_alive_disconnect_threshold
            && !self.disconnect_pending.swap(true, Ordering::AcqRel)
        {
            PublisherError::session(SessionError::KeepAliveLost { missed })
                .log(&self.endpoint_url);
            let session = Arc::clone(self);
            tokio::spawn(async move {
                session.disconnect().await;
                session.wake();
            });
            return KeepAliveOutcome::DisconnectTriggered;
        }
        KeepAliveOutcome::Missed(missed)
    }

    // =========================================================================
    // Mutation API
    // =========================================================================

    /// Adds a node to the subscription for its publishing interval.
    ///
    /// Returns `Ok` without changes if the node is already published.
    pub async fn add_node_for_monitoring(
        &self,
        node_id: &ConfiguredNodeId,
        settings: &NodeSettings,
    ) -> MonitorResult {
        if self.is_shutdown_requested() {
            return MonitorResult::Gone;
        }
        let Some(mut inner) = self.lock().await else {
            return MonitorResult::Gone;
        };
        if self.is_shutdown_requested() {
            return MonitorResult::Gone;
        }

        match inner.insert_node(&self.endpoint_id, node_id.clone(), settings, &self.config) {
            Ok(true) => {
                drop(inner);
                self.version.bump();
                self.wake();
                tracing::debug!(
                    endpoint = %self.endpoint_url,
                    node_id = %node_id,
                    "Added node for monitoring"
                );
                MonitorResult::Accepted
            }
            Ok(false) => {
                tracing::debug!(
                    endpoint = %self.endpoint_url,
                    node_id = %node_id,
                    "Node already monitored"
                );
                MonitorResult::Ok
            }
            Err(e) => {
                e.log(&format!("add {node_id} on {}", self.endpoint_url));
                MonitorResult::InternalServerError
            }
        }
    }

    /// Tags every item publishing `node_id` for removal.
    pub async fn request_monitor_item_removal(&self, node_id: &ConfiguredNodeId) -> MonitorResult {
        if self.is_shutdown_requested() {
            return MonitorResult::Gone;
        }
        let Some(mut guard) = self.lock().await else {
            return MonitorResult::Gone;
        };

        if !guard.is_published(node_id) {
            tracing::info!(
                endpoint = %self.endpoint_url,
                node_id = %node_id,
                "Node is not monitored"
            );
            return MonitorResult::Ok;
        }

        let SessionInner {
            namespaces,
            subscriptions,
            ..
        } = &mut *guard;
        let tagged: usize = subscriptions
            .iter_mut()
            .map(|s| s.request_removal(node_id, &*namespaces))
            .sum();
        drop(guard);

        tracing::info!(
            endpoint = %self.endpoint_url,
            node_id = %node_id,
            tagged,
            "Node tagged to stop monitoring"
        );
        self.version.bump();
        self.wake();
        MonitorResult::Accepted
    }

    /// Returns `true` if an item not tagged for removal publishes `node_id`.
    pub async fn is_node_published(&self, node_id: &ConfiguredNodeId) -> bool {
        match self.lock().await {
            Some(inner) => inner.is_published(node_id),
            None => false,
        }
    }

    /// Item and subscription counts, `None` if the session is cancelled.
    pub async fn counts(&self) -> Option<SessionCounts> {
        let inner = self.lock().await?;
        let mut counts = SessionCounts {
            connected: inner.state.is_connected(),
            subscriptions: inner.subscriptions.len(),
            ..SessionCounts::default()
        };
        for subscription in &inner.subscriptions {
            if subscription.is_created() {
                counts.connected_subscriptions += 1;
            }
            let removal = subscription.count_in(MonitoredItemState::RemovalRequested);
            counts.pending_removal_items += removal;
            counts.configured_items += subscription.items().len() - removal;
            counts.monitored_items += subscription.count_in(MonitoredItemState::Monitored);
        }
        Some(counts)
    }

    /// Returns the endpoint entry describing this session's nodes.
    pub async fn snapshot(&self, include_pending_removal: bool) -> Option<EndpointConfig> {
        let inner = self.lock().await?;
        let mut entry = EndpointConfig::new(&self.endpoint_id, &self.endpoint_url);
        entry.use_security = self.use_security;
        entry.security_mode = self.security_mode;
        entry.security_profile_uri = self.security_profile_uri.clone();
        entry.auth_mode = self.auth_mode;
        entry.credential = self.credential.clone();

        for subscription in &inner.subscriptions {
            let publishing = subscription.configured_publishing_interval();
            entry.nodes.extend(
                subscription
                    .items()
                    .iter()
                    .filter(|item| {
                        include_pending_removal
                            || item.state() != MonitoredItemState::RemovalRequested
                    })
                    .map(|item| item.to_node_config(publishing)),
            );
        }
        Some(entry)
    }

    /// Returns `true` if the session has no subscriptions left.
    pub async fn is_unused(&self) -> bool {
        match self.lock().await {
            Some(inner) => inner.subscriptions.is_empty(),
            None => true,
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Removes everything from the server, closes the connection and
    /// cancels the session.
    pub async fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if let Some(connection) = inner.connection.take() {
                for subscription in &mut inner.subscriptions {
                    let Some(mut handle) = subscription.handle.take() else {
                        continue;
                    };
                    let monitored: Vec<u32> = subscription
                        .items()
                        .iter()
                        .filter(|item| item.revised_sampling_interval().is_some())
                        .map(MonitoredItem::client_handle)
                        .collect();
                    for client_handle in monitored {
                        handle.remove_item(client_handle);
                    }
                    let _ = handle.apply_changes().await;
                    let _ = handle.delete().await;
                }
                connection.unsubscribe_keep_alive();
                let _ = connection.close().await;
            }
            for subscription in &mut inner.subscriptions {
                subscription.reset_after_disconnect();
            }
            inner.namespaces = NamespaceTable::default();
            self.set_state(inner, SessionState::Disconnected);
        }

        self.cancel.cancel();
        tracing::info!(endpoint = %self.endpoint_url, "Session shut down");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint_id", &self.endpoint_id)
            .field("endpoint_url", &self.endpoint_url)
            .field("state", &self.state())
            .field("missed_keep_alives", &self.missed_keep_alives())
            .field("shutdown_requested", &self.is_shutdown_requested())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_result_http_status() {
        assert_eq!(MonitorResult::Accepted.http_status(), 202);
        assert_eq!(MonitorResult::Ok.http_status(), 200);
        assert_eq!(MonitorResult::Gone.http_status(), 410);
        assert_eq!(MonitorResult::InternalServerError.http_status(), 500);
        assert!(MonitorResult::Ok.is_success());
        assert!(!MonitorResult::Gone.is_success());
    }

    #[test]
    fn test_state_round_trips_through_mirror() {
        for state in [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Connected,
        ] {
            assert_eq!(SessionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(SessionState::default().to_string(), "Disconnected");
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = SessionStats::new();
        stats.record_connect_attempt();
        stats.record_connect_failure();
        stats.record_items_monitored(3);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connect_attempts, 1);
        assert_eq!(snapshot.connect_failures, 1);
        assert_eq!(snapshot.items_monitored, 3);
    }
}
