//! Cluster change event handling
//!
//! Provides event-driven notifications for membership and leadership
//! changes, consumed by the owning process to update routing and
//! coordinator references.

use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use tessera_api::model::NodeData;
use tessera_common::now_millis;

/// Type of cluster change event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEventKind {
    /// A node was seen for the first time
    NodeConnected,
    /// A node stayed silent beyond the inactivity window and was evicted
    NodeDisconnected,
    /// A node became (or was learned to be) the group leader
    LeaderElected,
}

impl std::fmt::Display for ClusterEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterEventKind::NodeConnected => write!(f, "NODE_CONNECTED"),
            ClusterEventKind::NodeDisconnected => write!(f, "NODE_DISCONNECTED"),
            ClusterEventKind::LeaderElected => write!(f, "LEADER_ELECTED"),
        }
    }
}

/// Cluster change event
#[derive(Clone, Debug)]
pub struct ClusterEvent {
    /// Type of change
    pub kind: ClusterEventKind,
    /// The affected node
    pub node: NodeData,
    /// Timestamp of the event
    pub timestamp: i64,
}

impl ClusterEvent {
    pub fn node_connected(node: NodeData) -> Self {
        Self {
            kind: ClusterEventKind::NodeConnected,
            node,
            timestamp: now_millis(),
        }
    }

    pub fn node_disconnected(node: NodeData) -> Self {
        Self {
            kind: ClusterEventKind::NodeDisconnected,
            node,
            timestamp: now_millis(),
        }
    }

    pub fn leader_elected(node: NodeData) -> Self {
        Self {
            kind: ClusterEventKind::LeaderElected,
            node,
            timestamp: now_millis(),
        }
    }
}

/// Trait for handling cluster change events
#[async_trait::async_trait]
pub trait ClusterEventListener: Send + Sync {
    /// Called when a cluster change event occurs
    async fn on_cluster_event(&self, event: &ClusterEvent);
}

/// Cluster event publisher
/// Manages subscriptions and broadcasts events to listeners
pub struct ClusterEventPublisher {
    /// Broadcast sender for events
    broadcast_tx: broadcast::Sender<ClusterEvent>,
    /// Registered listeners
    listeners: Arc<RwLock<Vec<Arc<dyn ClusterEventListener>>>>,
    /// Whether the publisher is running
    running: Arc<RwLock<bool>>,
}

impl ClusterEventPublisher {
    /// Create a new event publisher
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size);
        Self {
            broadcast_tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the event publisher
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        info!("Starting cluster event publisher");
    }

    /// Stop the event publisher
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopped cluster event publisher");
    }

    /// Register a listener for cluster change events
    pub async fn register_listener(&self, listener: Arc<dyn ClusterEventListener>) {
        let mut listeners = self.listeners.write().await;
        listeners.push(listener);
        debug!("Registered cluster event listener, total: {}", listeners.len());
    }

    /// Publish a cluster change event
    pub async fn publish(&self, event: ClusterEvent) {
        let is_running = *self.running.read().await;
        if !is_running {
            return;
        }

        info!(
            "Publishing cluster event: {} for {}",
            event.kind, event.node.identity
        );

        // Broadcast to subscribers
        let _ = self.broadcast_tx.send(event.clone());

        // Notify listeners
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_cluster_event(&event).await;
        }
    }

    /// Subscribe to cluster change events
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.broadcast_tx.subscribe()
    }
}

/// A simple logging listener for debugging
pub struct LoggingClusterEventListener;

#[async_trait::async_trait]
impl ClusterEventListener for LoggingClusterEventListener {
    async fn on_cluster_event(&self, event: &ClusterEvent) {
        match event.kind {
            ClusterEventKind::NodeConnected => {
                info!("[ClusterEvent] Node connected: {}", event.node);
            }
            ClusterEventKind::NodeDisconnected => {
                info!("[ClusterEvent] Node disconnected: {}", event.node);
            }
            ClusterEventKind::LeaderElected => {
                info!(
                    "[ClusterEvent] Leader elected: {} at term {}",
                    event.node.identity, event.node.term
                );
            }
        }
    }
}
