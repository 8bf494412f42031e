//! Teams: named groupings of actors and tools backed by exactly one field.
//!
//! A team also holds the GLUE shared-result map (what its members have
//! published) and an inbox of results pushed to it from other scopes.

use crate::adhesive::{AdhesiveKind, ToolResult};
use crate::errors::{CoordResult, CoordinationError};
use crate::field::Field;
use crate::types::{ActorId, FieldId, ResourceId, ScopeId, TeamId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Accumulated GLUE context for one tool within a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedResult {
    pub tool: ResourceId,
    pub latest: ToolResult,
    pub published_by: ActorId,
    pub updated_at: Timestamp,
    /// Oldest first. Consecutive identical results are stored once.
    pub history: Vec<ToolResult>,
}

/// A result pushed into this team from another scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub from: ScopeId,
    pub tool: ResourceId,
    pub result: ToolResult,
    pub received_at: Timestamp,
}

/// Team membership as declared by a collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamDeclaration {
    pub name: String,
    pub lead: ActorId,
    #[serde(default)]
    pub members: Vec<ActorId>,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub tool: ResourceId,
    pub default_kind: AdhesiveKind,
}

#[derive(Default)]
struct TeamState {
    members: BTreeSet<ActorId>,
    tools: BTreeMap<ResourceId, AdhesiveKind>,
    shared: HashMap<ResourceId, SharedResult>,
    inbox: HashMap<ResourceId, InboxEntry>,
}

struct TeamInner {
    id: TeamId,
    name: String,
    lead: ActorId,
    field: Field,
    state: Mutex<TeamState>,
    changed: Notify,
    history_limit: usize,
}

/// Cheaply cloneable handle to a team.
#[derive(Clone)]
pub struct Team {
    inner: Arc<TeamInner>,
}

impl Team {
    /// Create a team over `field`. The lead joins the field and the team.
    pub fn new(
        name: impl Into<String>,
        lead: ActorId,
        field: Field,
        history_limit: usize,
    ) -> CoordResult<Self> {
        field.add_resource(lead)?;
        let mut state = TeamState::default();
        state.members.insert(lead);

        let team = Self {
            inner: Arc::new(TeamInner {
                id: TeamId::new(),
                name: name.into(),
                lead,
                field,
                state: Mutex::new(state),
                changed: Notify::new(),
                history_limit: history_limit.max(1),
            }),
        };
        info!(team = %team.inner.id, name = %team.inner.name, lead = %lead, "team created");
        Ok(team)
    }

    pub fn id(&self) -> TeamId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn lead(&self) -> ActorId {
        self.inner.lead
    }

    pub fn field(&self) -> &Field {
        &self.inner.field
    }

    pub fn field_id(&self) -> FieldId {
        self.inner.field.id()
    }

    pub fn scope_id(&self) -> ScopeId {
        ScopeId::Team(self.inner.id)
    }

    /// Scope ids that refer to this team: the team itself and its field.
    pub fn aliases(&self) -> [ScopeId; 2] {
        [self.scope_id(), ScopeId::Field(self.field_id())]
    }

    // ═══════════════════════════════════════════════════════
    // MEMBERSHIP
    // ═══════════════════════════════════════════════════════

    pub fn members(&self) -> Vec<ActorId> {
        self.state().members.iter().copied().collect()
    }

    pub fn is_member(&self, actor: ActorId) -> bool {
        self.state().members.contains(&actor)
    }

    /// Add an actor. The actor also joins the team's field.
    pub fn add_member(&self, actor: ActorId) -> CoordResult<()> {
        self.inner.field.add_resource(actor)?;
        if self.state().members.insert(actor) {
            debug!(team = %self.inner.id, actor = %actor, "member added");
        }
        Ok(())
    }

    /// Remove an actor, forcing it out of the team's field.
    pub fn remove_member(&self, actor: ActorId) -> CoordResult<()> {
        if actor == self.inner.lead {
            return Err(CoordinationError::invalid_input(format!(
                "{} leads team '{}' and cannot be removed",
                actor, self.inner.name
            )));
        }
        if !self.state().members.remove(&actor) {
            return Err(self.not_a_member(actor));
        }
        self.inner.field.remove_resource(actor)?;
        debug!(team = %self.inner.id, actor = %actor, "member removed");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════
    // TOOLS
    // ═══════════════════════════════════════════════════════

    /// Bind a tool to this team with its default adhesive kind. The tool joins
    /// the team's field and takes on the kind for sharing decisions.
    ///
    /// A tool already in the field by some other route (a member, or a
    /// `FieldScope` entry) is rejected: the team must own its membership.
    pub fn add_tool(&self, tool: ResourceId, default_kind: AdhesiveKind) -> CoordResult<()> {
        let inserted = self.inner.field.insert_member(tool)?;
        if !inserted && !self.has_tool(tool) {
            return Err(CoordinationError::membership(format!(
                "Tool {} is already in field '{}' outside team '{}'",
                tool,
                self.inner.field.name(),
                self.inner.name
            ))
            .with_context("team", self.inner.id.to_string()));
        }
        self.inner.field.registry().slot(tool)?.lock().adhesive = Some(default_kind);
        self.state().tools.insert(tool, default_kind);
        debug!(team = %self.inner.id, tool = %tool, kind = %default_kind, "tool added");
        Ok(())
    }

    pub fn remove_tool(&self, tool: ResourceId) -> CoordResult<()> {
        let removed = {
            let mut state = self.state();
            state.shared.remove(&tool);
            state.tools.remove(&tool)
        };
        if removed.is_none() {
            return Err(CoordinationError::membership(format!(
                "Tool {} is not bound to team '{}'",
                tool, self.inner.name
            )));
        }
        self.inner.field.remove_resource(tool)?;
        self.inner.field.registry().slot(tool)?.lock().adhesive = None;
        Ok(())
    }

    /// Clear the adhesive kind this team stamped on each of its tools.
    pub(crate) fn release_tools(&self) {
        let registry = self.inner.field.registry();
        for (tool, _) in self.tools() {
            if let Ok(slot) = registry.slot(tool) {
                slot.lock().adhesive = None;
            }
        }
    }

    pub fn tools(&self) -> Vec<(ResourceId, AdhesiveKind)> {
        self.state().tools.iter().map(|(t, k)| (*t, *k)).collect()
    }

    pub fn has_tool(&self, tool: ResourceId) -> bool {
        self.state().tools.contains_key(&tool)
    }

    /// The tool's declared default kind, if the tool is bound here.
    pub fn tool_default(&self, tool: ResourceId) -> Option<AdhesiveKind> {
        self.state().tools.get(&tool).copied()
    }

    // ═══════════════════════════════════════════════════════
    // SHARED RESULTS & INBOX
    // ═══════════════════════════════════════════════════════

    pub fn shared_result(&self, tool: ResourceId) -> Option<SharedResult> {
        self.state().shared.get(&tool).cloned()
    }

    pub fn latest(&self, tool: ResourceId) -> Option<ToolResult> {
        self.state().shared.get(&tool).map(|s| s.latest.clone())
    }

    pub fn shared_results(&self) -> Vec<SharedResult> {
        self.state().shared.values().cloned().collect()
    }

    pub fn inbox(&self, tool: ResourceId) -> Option<InboxEntry> {
        self.state().inbox.get(&tool).cloned()
    }

    pub fn inbox_entries(&self) -> Vec<InboxEntry> {
        self.state().inbox.values().cloned().collect()
    }

    /// Record a GLUE publication. Returns false when the result repeats the
    /// current latest one and nothing was appended.
    pub(crate) fn publish(&self, tool: ResourceId, actor: ActorId, result: ToolResult) -> bool {
        let appended = {
            let mut state = self.state();
            match state.shared.get_mut(&tool) {
                Some(shared) if shared.latest.digest == result.digest => {
                    shared.published_by = actor;
                    shared.updated_at = Timestamp::now();
                    false
                }
                Some(shared) => {
                    shared.history.push(result.clone());
                    if shared.history.len() > self.inner.history_limit {
                        let excess = shared.history.len() - self.inner.history_limit;
                        shared.history.drain(..excess);
                    }
                    shared.latest = result;
                    shared.published_by = actor;
                    shared.updated_at = Timestamp::now();
                    true
                }
                None => {
                    state.shared.insert(
                        tool,
                        SharedResult {
                            tool,
                            latest: result.clone(),
                            published_by: actor,
                            updated_at: Timestamp::now(),
                            history: vec![result],
                        },
                    );
                    true
                }
            }
        };
        self.inner.changed.notify_waiters();
        appended
    }

    /// Drop one published result (by digest) from a tool's history.
    pub(crate) fn retract(&self, tool: ResourceId, digest: &str) {
        let mut state = self.state();
        let emptied = match state.shared.get_mut(&tool) {
            Some(shared) => {
                shared.history.retain(|r| r.digest != digest);
                match shared.history.last() {
                    Some(last) => {
                        shared.latest = last.clone();
                        false
                    }
                    None => true,
                }
            }
            None => false,
        };
        if emptied {
            state.shared.remove(&tool);
        }
    }

    pub(crate) fn deliver(&self, from: ScopeId, tool: ResourceId, result: ToolResult) {
        self.state().inbox.insert(
            tool,
            InboxEntry {
                from,
                tool,
                result,
                received_at: Timestamp::now(),
            },
        );
        self.inner.changed.notify_waiters();
    }

    /// Future that completes on the next publish or delivery. Create it
    /// before checking for a result so a concurrent update is not missed.
    pub(crate) fn changed(&self) -> Notified<'_> {
        self.inner.changed.notified()
    }

    /// Forget all published and delivered results.
    pub(crate) fn clear_results(&self) {
        let mut state = self.state();
        state.shared.clear();
        state.inbox.clear();
    }

    fn not_a_member(&self, actor: ActorId) -> CoordinationError {
        CoordinationError::membership(format!(
            "{} is not a member of team '{}'",
            actor, self.inner.name
        ))
        .with_context("team", self.inner.id.to_string())
    }

    pub(crate) fn check_member(&self, actor: ActorId) -> CoordResult<()> {
        if self.is_member(actor) {
            Ok(())
        } else {
            Err(self.not_a_member(actor))
        }
    }

    fn state(&self) -> MutexGuard<'_, TeamState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Team")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("lead", &self.inner.lead)
            .field("field", &self.inner.field.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use crate::events::EventManager;
    use crate::registry::Registry;
    use crate::resource::{ResourceCategory, ResourceState};
    use serde_json::json;

    fn team() -> (Registry, Team) {
        let registry = Registry::new(Arc::new(EventManager::default()), 64);
        let lead = registry
            .register(ResourceCategory::Model, ResourceState::Idle)
            .unwrap()
            .id();
        let field = Field::new("research", registry.clone());
        let team = Team::new("research", lead, field, 3).unwrap();
        (registry, team)
    }

    #[test]
    fn test_lead_joins_field() {
        let (_registry, team) = team();
        assert!(team.is_member(team.lead()));
        assert!(team.field().contains(team.lead()));
        assert_eq!(
            team.remove_member(team.lead()).unwrap_err().code,
            ErrorCode::InvalidInput
        );
    }

    #[test]
    fn test_tool_takes_default_kind() {
        let (registry, team) = team();
        let tool = registry
            .register(ResourceCategory::Tool, ResourceState::Idle)
            .unwrap();
        team.add_tool(tool.id(), AdhesiveKind::Tape).unwrap();

        assert!(team.field().contains(tool.id()));
        assert_eq!(team.tool_default(tool.id()), Some(AdhesiveKind::Tape));
        assert_eq!(tool.snapshot().adhesive, Some(AdhesiveKind::Tape));

        team.remove_tool(tool.id()).unwrap();
        assert!(!team.has_tool(tool.id()));
        assert_eq!(tool.snapshot().adhesive, None);
    }

    #[test]
    fn test_tool_entered_elsewhere_is_rejected() {
        let (registry, team) = team();
        let tool = registry
            .register(ResourceCategory::Tool, ResourceState::Idle)
            .unwrap()
            .id();
        let scope = team.field().enter(tool).unwrap();

        let err = team.add_tool(tool, AdhesiveKind::Glue).unwrap_err();
        assert_eq!(err.code, ErrorCode::Membership);
        assert!(!team.has_tool(tool));
        assert_eq!(registry.get(tool).unwrap().snapshot().adhesive, None);

        drop(scope);
        assert!(!team.field().contains(tool));
        team.add_tool(tool, AdhesiveKind::Glue).unwrap();
        // re-declaring an owned tool updates its kind
        team.add_tool(tool, AdhesiveKind::Velcro).unwrap();
        assert_eq!(team.tool_default(tool), Some(AdhesiveKind::Velcro));
    }

    #[test]
    fn test_publish_dedupes_and_caps_history() {
        let (registry, team) = team();
        let tool = registry
            .register(ResourceCategory::Tool, ResourceState::Idle)
            .unwrap()
            .id();
        let lead = team.lead();

        assert!(team.publish(tool, lead, ToolResult::new(json!(1))));
        assert!(!team.publish(tool, lead, ToolResult::new(json!(1))));
        for n in 2..=5 {
            team.publish(tool, lead, ToolResult::new(json!(n)));
        }

        let shared = team.shared_result(tool).unwrap();
        assert_eq!(shared.history.len(), 3);
        assert_eq!(shared.latest.payload, json!(5));
        assert_eq!(shared.history[0].payload, json!(3));
    }

    #[test]
    fn test_retract_falls_back_to_previous() {
        let (registry, team) = team();
        let tool = registry
            .register(ResourceCategory::Tool, ResourceState::Idle)
            .unwrap()
            .id();
        let first = ToolResult::new(json!("a"));
        let second = ToolResult::new(json!("b"));
        team.publish(tool, team.lead(), first.clone());
        team.publish(tool, team.lead(), second.clone());

        team.retract(tool, &second.digest);
        assert_eq!(team.latest(tool).unwrap(), first);
        team.retract(tool, &first.digest);
        assert!(team.latest(tool).is_none());
    }

    #[tokio::test]
    async fn test_delivery_wakes_waiter() {
        let (registry, team) = team();
        let tool = registry
            .register(ResourceCategory::Tool, ResourceState::Idle)
            .unwrap()
            .id();

        let changed = team.changed();
        let from = ScopeId::Team(TeamId::new());
        team.deliver(from, tool, ToolResult::new(json!({"hits": 3})));
        changed.await;

        let entry = team.inbox(tool).unwrap();
        assert_eq!(entry.from, from);
    }
}
