//! Resources and their state machine.
//!
//! A resource is the atomic shareable unit: a tool handle, a result payload,
//! or a model's attention. Its mutable part lives in [`ResourceData`], which
//! is only ever touched under the owning slot's mutex (see `registry`).
//!
//! ```text
//!            attract                 attract (other)
//!   IDLE ────────────────▶ ACTIVE ───────────────────▶ SHARED
//!    ▲  ▲                    │  ▲                         │
//!    │  │ unlock / release   │  │ break                   │ break
//!    │  └──── LOCKED ◀───────┘  └─────────────────────────┘
//!    │
//!    └── release / field exit / transfer done ── CHATTING, PULLING, PUSHING
//! ```

use crate::adhesive::AdhesiveKind;
use crate::errors::{CoordResult, CoordinationError};
use crate::types::{FieldId, ResourceId, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

/// States a resource can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    /// Not in use. Initial state.
    Idle,
    /// Attracted to exactly one other resource.
    Active,
    /// Attracted to several resources at once.
    Shared,
    /// Exclusively held; other attraction and flow requests fail fast.
    Locked,
    /// In a direct actor-to-actor channel; tool attraction suppressed.
    Chatting,
    /// Receiving a one-directional transfer.
    Pulling,
    /// Sending a one-directional transfer.
    Pushing,
}

impl ResourceState {
    /// States from which a lock, chat, or transfer may start.
    pub fn is_quiescent(&self) -> bool {
        matches!(self, Self::Idle | Self::Active)
    }

    /// States driven purely by the attraction count.
    pub fn is_attraction_driven(&self) -> bool {
        matches!(self, Self::Idle | Self::Active | Self::Shared)
    }

    /// States that revert to a remembered prior state when they end.
    pub fn is_interim(&self) -> bool {
        matches!(self, Self::Chatting | Self::Pulling | Self::Pushing)
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Active => "ACTIVE",
            Self::Shared => "SHARED",
            Self::Locked => "LOCKED",
            Self::Chatting => "CHATTING",
            Self::Pulling => "PULLING",
            Self::Pushing => "PUSHING",
        };
        write!(f, "{}", s)
    }
}

/// What kind of thing a resource is. Open set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    Tool,
    Model,
    Data,
    Custom(String),
}

impl ResourceCategory {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tool => "tool",
            Self::Model => "model",
            Self::Data => "data",
            Self::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for ResourceCategory {
    fn from(s: &str) -> Self {
        match s {
            "tool" => Self::Tool,
            "model" => Self::Model,
            "data" => Self::Data,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// Usage metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub use_count: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Default for ResourceMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            last_used: None,
            use_count: 0,
            tags: BTreeSet::new(),
        }
    }
}

/// Point-in-time copy of a resource, safe to hand out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub category: ResourceCategory,
    pub state: ResourceState,
    pub owning_field: Option<FieldId>,
    pub attracted_to: BTreeSet<ResourceId>,
    pub repelled_from: BTreeSet<ResourceId>,
    pub lock_holder: Option<ResourceId>,
    pub adhesive: Option<AdhesiveKind>,
    pub chat_partner: Option<ResourceId>,
    pub metadata: ResourceMetadata,
}

/// One entry in the transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionLog {
    pub resource: ResourceId,
    pub from: ResourceState,
    pub to: ResourceState,
    pub timestamp: Timestamp,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransitionLog {
    pub fn ok(resource: ResourceId, from: ResourceState, to: ResourceState) -> Self {
        Self {
            resource,
            from,
            to,
            timestamp: Timestamp::now(),
            success: true,
            error: None,
        }
    }

    pub fn rejected(
        resource: ResourceId,
        from: ResourceState,
        to: ResourceState,
        error: &CoordinationError,
    ) -> Self {
        Self {
            resource,
            from,
            to,
            timestamp: Timestamp::now(),
            success: false,
            error: Some(error.message.clone()),
        }
    }
}

/// Mutable resource state. Guarded by the slot mutex.
#[derive(Debug)]
pub(crate) struct ResourceData {
    pub id: ResourceId,
    pub name: Option<String>,
    pub category: ResourceCategory,
    pub state: ResourceState,
    pub owning_field: Option<FieldId>,
    pub attracted_to: BTreeSet<ResourceId>,
    pub repelled_from: BTreeSet<ResourceId>,
    pub lock_holder: Option<ResourceId>,
    pub adhesive: Option<AdhesiveKind>,
    pub resume_state: Option<ResourceState>,
    pub chat_partner: Option<ResourceId>,
    pub chat_requests: BTreeSet<ResourceId>,
    pub metadata: ResourceMetadata,
    /// Cancelled whenever the resource leaves its field.
    pub membership_token: CancellationToken,
}

impl ResourceData {
    pub fn new(
        id: ResourceId,
        name: Option<String>,
        category: ResourceCategory,
        state: ResourceState,
    ) -> Self {
        Self {
            id,
            name,
            category,
            state,
            owning_field: None,
            attracted_to: BTreeSet::new(),
            repelled_from: BTreeSet::new(),
            lock_holder: None,
            adhesive: None,
            resume_state: None,
            chat_partner: None,
            chat_requests: BTreeSet::new(),
            metadata: ResourceMetadata::default(),
            membership_token: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            id: self.id,
            name: self.name.clone(),
            category: self.category.clone(),
            state: self.state,
            owning_field: self.owning_field,
            attracted_to: self.attracted_to.clone(),
            repelled_from: self.repelled_from.clone(),
            lock_holder: self.lock_holder,
            adhesive: self.adhesive,
            chat_partner: self.chat_partner,
            metadata: self.metadata.clone(),
        }
    }

    /// TAPE-bound resources never share.
    pub fn can_share(&self) -> bool {
        self.adhesive.map_or(true, |kind| kind.permits_sharing())
    }

    /// Move to `to`, returning the log entry when the state actually changed.
    pub fn set_state(&mut self, to: ResourceState) -> Option<TransitionLog> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some(TransitionLog::ok(self.id, from, to))
    }

    /// State implied by the attraction count (for attraction-driven states).
    pub fn attraction_state(&self) -> ResourceState {
        match self.attracted_to.len() {
            0 => ResourceState::Idle,
            1 => ResourceState::Active,
            _ => ResourceState::Shared,
        }
    }

    /// Re-derive the state after attraction bookkeeping changed. Locked and
    /// interim states are left alone.
    pub fn settle(&mut self) -> Option<TransitionLog> {
        if self.state.is_attraction_driven() {
            let next = self.attraction_state();
            self.set_state(next)
        } else {
            None
        }
    }

    /// Guards for attracting `other` to this resource.
    ///
    /// Returns `Ok(false)` when the pair is already attracted (no-op).
    pub fn check_attract(&self, other: ResourceId) -> CoordResult<bool> {
        if self.state == ResourceState::Locked && self.lock_holder != Some(other) {
            return Err(CoordinationError::contention(self.id, self.lock_holder));
        }
        if self.attracted_to.contains(&other) {
            return Ok(false);
        }
        let target = if self.attracted_to.is_empty() {
            ResourceState::Active
        } else {
            ResourceState::Shared
        };
        if self.repelled_from.contains(&other) {
            return Err(CoordinationError::invalid_transition(
                self.id,
                self.state,
                target,
                format!("repelled from {}", other),
            ));
        }
        // PULLING/PUSHING keep counting attractions; the transfer guard
        // settles the state when it drops.
        if self.state == ResourceState::Chatting {
            return Err(CoordinationError::invalid_transition(
                self.id,
                self.state,
                target,
                "chat channel suppresses tool attraction",
            ));
        }
        if target == ResourceState::Shared
            && self.state != ResourceState::Locked
            && !self.can_share()
        {
            return Err(CoordinationError::invalid_transition(
                self.id,
                self.state,
                ResourceState::Shared,
                "tape-bound resources cannot be shared",
            ));
        }
        Ok(true)
    }

    pub fn touch(&mut self) {
        self.metadata.last_used = Some(Utc::now());
        self.metadata.use_count += 1;
    }

    /// Forced cleanup: drop every relationship except repulsions and return
    /// to IDLE. Returns the ids whose attraction bookkeeping must be undone on
    /// the other side.
    pub fn reset(&mut self) -> (Vec<ResourceId>, Option<TransitionLog>) {
        let peers: Vec<ResourceId> = self.attracted_to.iter().copied().collect();
        self.attracted_to.clear();
        self.lock_holder = None;
        self.resume_state = None;
        self.chat_partner = None;
        self.chat_requests.clear();
        let log = self.set_state(ResourceState::Idle);
        (peers, log)
    }
}
