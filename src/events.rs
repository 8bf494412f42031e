//! Lifecycle notifications.
//!
//! Every state-changing operation emits a [`CoordinationEvent`] through the
//! shared [`EventManager`]. Subscribers get a broadcast receiver; a bounded
//! buffer of recent events is kept for inspection.

use crate::adhesive::AdhesiveKind;
use crate::flow::FlowVerb;
use crate::resource::{ResourceCategory, ResourceState};
use crate::types::{ActorId, BindingId, EdgeId, FieldId, ResourceId, ScopeId, UniqueId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

/// Unique event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub UniqueId);

impl EventId {
    pub fn new() -> Self {
        Self(UniqueId::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "evt_{}", self.0)
    }
}

/// Event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventType {
    // ═══════════════════════════════════════════════════════
    // REGISTRY
    // ═══════════════════════════════════════════════════════
    ResourceRegistered { category: ResourceCategory },
    ResourceDeregistered,
    StateChanged { from: ResourceState, to: ResourceState },

    // ═══════════════════════════════════════════════════════
    // FIELD
    // ═══════════════════════════════════════════════════════
    FieldEntered { field: FieldId },
    FieldExited { field: FieldId },
    Attracted { other: ResourceId },
    AttractionBroken { other: ResourceId },
    Repelled { other: ResourceId },
    RepelRefused { other: ResourceId },
    Locked { holder: ResourceId },
    Unlocked { holder: ResourceId },
    ChatOpened { partner: ResourceId },
    ChatClosed { partner: ResourceId },

    // ═══════════════════════════════════════════════════════
    // BINDINGS
    // ═══════════════════════════════════════════════════════
    BindingCreated {
        binding: BindingId,
        actor: ActorId,
        kind: AdhesiveKind,
    },
    BindingReleased { binding: BindingId },
    ResultPublished { digest: String },

    // ═══════════════════════════════════════════════════════
    // FLOWS
    // ═══════════════════════════════════════════════════════
    FlowDeclared {
        edge: EdgeId,
        to: ScopeId,
        verb: FlowVerb,
    },
    FlowReplaced {
        edge: EdgeId,
        to: ScopeId,
        previous: FlowVerb,
        verb: FlowVerb,
    },
    FlowConflict {
        to: ScopeId,
        existing: FlowVerb,
        attempted: FlowVerb,
    },
    FlowTornDown { edge: EdgeId, to: ScopeId },
    ResultPushed { to: ScopeId },
    TransferCompleted { from: ScopeId },
    TransferFailed { from: ScopeId, error_code: String },
}

impl EventType {
    /// Stable snake_case name, matching the serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResourceRegistered { .. } => "resource_registered",
            Self::ResourceDeregistered => "resource_deregistered",
            Self::StateChanged { .. } => "state_changed",
            Self::FieldEntered { .. } => "field_entered",
            Self::FieldExited { .. } => "field_exited",
            Self::Attracted { .. } => "attracted",
            Self::AttractionBroken { .. } => "attraction_broken",
            Self::Repelled { .. } => "repelled",
            Self::RepelRefused { .. } => "repel_refused",
            Self::Locked { .. } => "locked",
            Self::Unlocked { .. } => "unlocked",
            Self::ChatOpened { .. } => "chat_opened",
            Self::ChatClosed { .. } => "chat_closed",
            Self::BindingCreated { .. } => "binding_created",
            Self::BindingReleased { .. } => "binding_released",
            Self::ResultPublished { .. } => "result_published",
            Self::FlowDeclared { .. } => "flow_declared",
            Self::FlowReplaced { .. } => "flow_replaced",
            Self::FlowConflict { .. } => "flow_conflict",
            Self::FlowTornDown { .. } => "flow_torn_down",
            Self::ResultPushed { .. } => "result_pushed",
            Self::TransferCompleted { .. } => "transfer_completed",
            Self::TransferFailed { .. } => "transfer_failed",
        }
    }
}

/// An emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub id: EventId,

    #[serde(flatten)]
    pub event_type: EventType,

    pub timestamp: DateTime<Utc>,

    /// Resource the event is about (if any).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceId>,

    /// Scope the event happened in (if any).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeId>,
}

impl CoordinationEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            timestamp: Utc::now(),
            resource: None,
            scope: None,
        }
    }

    pub fn for_resource(mut self, resource: ResourceId) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn in_scope(mut self, scope: impl Into<ScopeId>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn state_changed(resource: ResourceId, from: ResourceState, to: ResourceState) -> Self {
        Self::new(EventType::StateChanged { from, to }).for_resource(resource)
    }

    pub fn name(&self) -> &'static str {
        self.event_type.name()
    }
}

/// Filter for picking events out of a stream or the recent buffer.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub resource: Option<ResourceId>,
    pub scope: Option<ScopeId>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_resource(mut self, resource: ResourceId) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn in_scope(mut self, scope: impl Into<ScopeId>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn of_type(mut self, name: impl Into<String>) -> Self {
        self.event_types
            .get_or_insert_with(Vec::new)
            .push(name.into());
        self
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &CoordinationEvent) -> bool {
        if let Some(resource) = &self.resource {
            if event.resource.as_ref() != Some(resource) {
                return false;
            }
        }

        if let Some(scope) = &self.scope {
            if event.scope.as_ref() != Some(scope) {
                return false;
            }
        }

        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.name()) {
                return false;
            }
        }

        true
    }
}

/// Event receiver (broadcast channel).
pub type EventReceiver = broadcast::Receiver<CoordinationEvent>;

/// Event sender (broadcast channel).
pub type EventSender = broadcast::Sender<CoordinationEvent>;

/// Broadcast fan-out plus a bounded recent-events buffer.
pub struct EventManager {
    sender: EventSender,
    recent: Mutex<VecDeque<CoordinationEvent>>,
    max_recent: usize,
}

impl EventManager {
    pub fn new(capacity: usize, max_recent: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            recent: Mutex::new(VecDeque::with_capacity(max_recent)),
            max_recent,
        }
    }

    pub fn emit(&self, event: CoordinationEvent) {
        tracing::trace!(event = event.name(), resource = ?event.resource, "emit");
        {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            recent.push_back(event.clone());
            while recent.len() > self.max_recent {
                recent.pop_front();
            }
        }

        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<CoordinationEvent> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent first, filtered.
    pub fn recent_matching(&self, filter: &EventFilter, limit: usize) -> Vec<CoordinationEvent> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256, 100)
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("max_recent", &self.max_recent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_filter() {
        let r = ResourceId::new();
        let event = CoordinationEvent::new(EventType::ResourceDeregistered).for_resource(r);

        assert!(EventFilter::new().for_resource(r).matches(&event));
        assert!(!EventFilter::new().for_resource(ResourceId::new()).matches(&event));
        assert!(EventFilter::new()
            .of_type("resource_deregistered")
            .matches(&event));
        assert!(!EventFilter::new().of_type("locked").matches(&event));
    }

    #[test]
    fn test_recent_is_bounded() {
        let manager = EventManager::new(8, 3);
        for _ in 0..5 {
            manager.emit(CoordinationEvent::new(EventType::ResourceDeregistered));
        }
        assert_eq!(manager.recent(10).len(), 3);
    }

    #[tokio::test]
    async fn test_subscriber_receives() {
        let manager = EventManager::default();
        let mut rx = manager.subscribe();
        let r = ResourceId::new();
        manager.emit(CoordinationEvent::state_changed(
            r,
            ResourceState::Idle,
            ResourceState::Active,
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.resource, Some(r));
        assert_eq!(event.name(), "state_changed");
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = CoordinationEvent::new(EventType::Locked {
            holder: ResourceId::new(),
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"locked\""));
    }
}
