//! Plugin lifecycle events
//!
//! The plugin manager reports every registry transition to the host agent
//! through an [`EventBus`]. Events are immutable facts; each carries the
//! plugin id, a timestamp, optional JSON data and an optional error message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

/// Type of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginEventType {
    Registered,
    Unregistered,
    Enabled,
    Disabled,
    Updated,
    Error,
}

impl PluginEventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Unregistered => "unregistered",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Updated => "updated",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for PluginEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A plugin lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// Plugin this event relates to
    pub plugin_id: String,
    /// Type of event
    pub event_type: PluginEventType,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// Event payload
    pub data: Option<serde_json::Value>,
    /// Error message for failed operations
    pub error: Option<String>,
}

impl PluginEvent {
    /// Create a new event
    pub fn new(plugin_id: impl Into<String>, event_type: PluginEventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            plugin_id: plugin_id.into(),
            event_type,
            timestamp: Utc::now(),
            data: None,
            error: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Create an error event
    pub fn error(plugin_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(plugin_id, PluginEventType::Error).with_error(error)
    }
}

/// Sink for lifecycle events supplied by the host agent
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event
    async fn publish(&self, event: PluginEvent) -> Result<()>;

    /// Publish multiple events in order
    async fn publish_all(&self, events: Vec<PluginEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// A simple in-memory event store for recording events
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<PluginEvent>>,
}

impl InMemoryEventStore {
    /// Create a new in-memory event store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an event
    pub fn store(&self, event: PluginEvent) {
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    /// Get events for a plugin
    pub fn events_for(&self, plugin_id: &str) -> Vec<PluginEvent> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    /// Get events by type
    pub fn events_by_type(&self, event_type: PluginEventType) -> Vec<PluginEvent> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Get all events
    pub fn all_events(&self) -> Vec<PluginEvent> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Clear all events
    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl EventBus for InMemoryEventStore {
    async fn publish(&self, event: PluginEvent) -> Result<()> {
        self.store(event);
        Ok(())
    }
}

/// Fan-out bus backed by a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<PluginEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: PluginEvent) -> Result<()> {
        // No subscribers is not a failure
        if self.sender.send(event).is_err() {
            tracing::trace!("Lifecycle event dropped: no subscribers");
        }
        Ok(())
    }
}

/// Bus that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventBus;

#[async_trait]
impl EventBus for NoopEventBus {
    async fn publish(&self, _event: PluginEvent) -> Result<()> {
        Ok(())
    }
}
