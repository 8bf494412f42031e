//! Adhesive bindings: how long and how widely a tool result persists.
//!
//! | Kind   | Visible to            | Lives until                          |
//! |--------|-----------------------|--------------------------------------|
//! | GLUE   | every team member     | team teardown or explicit release    |
//! | VELCRO | the invoking actor    | the actor's session ends or is reset |
//! | TAPE   | the invoking actor    | the first read                       |
//!
//! A tool carries a default kind declared by its team. A call may override it
//! with a weaker kind only (GLUE > VELCRO > TAPE).

use crate::errors::{CoordResult, CoordinationError};
use crate::events::{CoordinationEvent, EventManager, EventType};
use crate::team::Team;
use crate::types::{ActorId, BindingId, ResourceId, TeamId, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Persistence class of a tool result. Ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdhesiveKind {
    Tape,
    Velcro,
    Glue,
}

impl AdhesiveKind {
    /// Whether a resource bound with this kind may be SHARED.
    pub fn permits_sharing(&self) -> bool {
        !matches!(self, Self::Tape)
    }

    pub fn scope(&self) -> BindingScope {
        match self {
            Self::Glue => BindingScope::TeamLifetime,
            Self::Velcro => BindingScope::SessionLifetime,
            Self::Tape => BindingScope::SingleUse,
        }
    }

    /// Pick the kind for one call. `requested` may weaken `default` but never
    /// strengthen it.
    pub fn resolve(default: Self, requested: Option<Self>) -> CoordResult<Self> {
        match requested {
            None => Ok(default),
            Some(kind) if kind <= default => Ok(kind),
            Some(kind) => Err(CoordinationError::invalid_input(format!(
                "Cannot override default {} with stronger kind {}",
                default, kind
            ))
            .with_context("default", default)
            .with_context("requested", kind)),
        }
    }
}

impl std::fmt::Display for AdhesiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Glue => "GLUE",
            Self::Velcro => "VELCRO",
            Self::Tape => "TAPE",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AdhesiveKind {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "glue" => Ok(Self::Glue),
            "velcro" => Ok(Self::Velcro),
            "tape" => Ok(Self::Tape),
            other => Err(CoordinationError::invalid_input(format!(
                "Unknown adhesive kind '{}'",
                other
            ))),
        }
    }
}

/// When a binding expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingScope {
    TeamLifetime,
    SessionLifetime,
    SingleUse,
}

/// Handle to a tool's output. The payload itself is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub payload: serde_json::Value,
    /// BLAKE3 of the serialized payload, hex-encoded.
    pub digest: String,
    pub produced_at: DateTime<Utc>,
}

impl ToolResult {
    pub fn new(payload: impl Into<serde_json::Value>) -> Self {
        let payload = payload.into();
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        Self {
            digest: hex::encode(blake3::hash(&bytes).as_bytes()),
            payload,
            produced_at: Utc::now(),
        }
    }

    /// Whether two results carry the same content.
    pub fn same_content(&self, other: &ToolResult) -> bool {
        self.digest == other.digest
    }
}

/// Completion event handed over by the tool-execution layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCompletion {
    pub actor: ActorId,
    pub tool: ResourceId,
    pub result: ToolResult,
    pub default_kind: AdhesiveKind,
}

/// The policy record for one `(actor, tool, result)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdhesiveBinding {
    pub id: BindingId,
    pub actor: ActorId,
    pub tool: ResourceId,
    pub team: TeamId,
    pub kind: AdhesiveKind,
    /// Content digest of the bound result.
    pub result_ref: String,
    pub created_at: Timestamp,
    pub expires_with: BindingScope,
}

/// Returned to the caller when a binding is created.
#[derive(Debug, Clone)]
pub struct BindingHandle {
    binding: AdhesiveBinding,
    result: ToolResult,
}

impl BindingHandle {
    pub fn id(&self) -> BindingId {
        self.binding.id
    }

    pub fn kind(&self) -> AdhesiveKind {
        self.binding.kind
    }

    pub fn binding(&self) -> &AdhesiveBinding {
        &self.binding
    }

    /// The result as handed back to the invoking actor.
    pub fn result(&self) -> &ToolResult {
        &self.result
    }
}

/// What a successful read returns.
#[derive(Debug, Clone)]
pub struct BindingView {
    pub binding: AdhesiveBinding,
    pub result: ToolResult,
    /// Accumulated context, oldest first: the team's history for GLUE, the
    /// actor's session history for VELCRO, just the result for TAPE.
    pub context: Vec<ToolResult>,
}

struct BindingRecord {
    binding: AdhesiveBinding,
    result: ToolResult,
}

#[derive(Default)]
struct EngineState {
    bindings: HashMap<BindingId, BindingRecord>,
    /// VELCRO context: actor -> tool -> history.
    sessions: HashMap<ActorId, HashMap<ResourceId, Vec<ToolResult>>>,
}

/// Creates, reads and expires bindings.
pub struct BindingEngine {
    state: Mutex<EngineState>,
    events: Arc<EventManager>,
    history_limit: usize,
}

impl BindingEngine {
    pub fn new(events: Arc<EventManager>, history_limit: usize) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            events,
            history_limit: history_limit.max(1),
        }
    }

    /// Bind a completed tool call's result.
    ///
    /// The actor must be a member of `team` and the tool must be bound to it
    /// and still inside the team's field.
    /// GLUE additionally publishes to the team's shared-result map.
    pub fn bind(
        &self,
        team: &Team,
        actor: ActorId,
        tool: ResourceId,
        result: ToolResult,
        requested: Option<AdhesiveKind>,
    ) -> CoordResult<BindingHandle> {
        team.check_member(actor)?;
        let default = team.tool_default(tool).ok_or_else(|| {
            CoordinationError::membership(format!(
                "Tool {} is not bound to team '{}'",
                tool,
                team.name()
            ))
        })?;
        if !team.field().contains(tool) {
            return Err(CoordinationError::membership(format!(
                "Tool {} has left the field of team '{}'",
                tool,
                team.name()
            )));
        }
        let kind = AdhesiveKind::resolve(default, requested)?;

        let binding = AdhesiveBinding {
            id: BindingId::new(),
            actor,
            tool,
            team: team.id(),
            kind,
            result_ref: result.digest.clone(),
            created_at: Timestamp::now(),
            expires_with: kind.scope(),
        };

        match kind {
            AdhesiveKind::Glue => {
                if team.publish(tool, actor, result.clone()) {
                    self.events.emit(
                        CoordinationEvent::new(EventType::ResultPublished {
                            digest: result.digest.clone(),
                        })
                        .for_resource(tool)
                        .in_scope(team.id()),
                    );
                }
            }
            AdhesiveKind::Velcro => {
                let mut state = self.state();
                let history = state
                    .sessions
                    .entry(actor)
                    .or_default()
                    .entry(tool)
                    .or_default();
                append_distinct(history, result.clone(), self.history_limit);
            }
            AdhesiveKind::Tape => {}
        }

        self.state().bindings.insert(
            binding.id,
            BindingRecord {
                binding: binding.clone(),
                result: result.clone(),
            },
        );

        info!(binding = %binding.id, actor = %actor, tool = %tool, kind = %kind, "binding created");
        self.events.emit(
            CoordinationEvent::new(EventType::BindingCreated {
                binding: binding.id,
                actor,
                kind,
            })
            .for_resource(tool)
            .in_scope(team.id()),
        );
        Ok(BindingHandle { binding, result })
    }

    pub fn binding(&self, id: BindingId) -> Option<AdhesiveBinding> {
        self.state().bindings.get(&id).map(|r| r.binding.clone())
    }

    pub fn bindings_for(&self, actor: ActorId) -> Vec<AdhesiveBinding> {
        self.state()
            .bindings
            .values()
            .filter(|r| r.binding.actor == actor)
            .map(|r| r.binding.clone())
            .collect()
    }

    /// Read a binding as `reader`.
    ///
    /// GLUE: any current member of the binding's team. VELCRO and TAPE: the
    /// invoking actor only. A TAPE binding is consumed by its first read.
    pub fn read(&self, id: BindingId, reader: ActorId, team: &Team) -> CoordResult<BindingView> {
        let mut state = self.state();
        let record = state
            .bindings
            .get(&id)
            .ok_or_else(|| CoordinationError::binding_gone(id))?;
        let binding = &record.binding;
        if binding.team != team.id() {
            return Err(CoordinationError::invalid_input(format!(
                "Binding {} belongs to {}, not {}",
                id,
                binding.team,
                team.id()
            )));
        }

        match binding.kind {
            AdhesiveKind::Glue => {
                team.check_member(reader)?;
                let context = team
                    .shared_result(binding.tool)
                    .map(|s| s.history)
                    .unwrap_or_else(|| vec![record.result.clone()]);
                Ok(BindingView {
                    binding: binding.clone(),
                    result: record.result.clone(),
                    context,
                })
            }
            AdhesiveKind::Velcro => {
                check_owner(binding, reader)?;
                let context = state
                    .sessions
                    .get(&binding.actor)
                    .and_then(|tools| tools.get(&binding.tool))
                    .cloned()
                    .unwrap_or_default();
                Ok(BindingView {
                    binding: binding.clone(),
                    result: record.result.clone(),
                    context,
                })
            }
            AdhesiveKind::Tape => {
                check_owner(binding, reader)?;
                let BindingRecord { binding, result } = state
                    .bindings
                    .remove(&id)
                    .ok_or_else(|| CoordinationError::binding_gone(id))?;
                drop(state);
                debug!(binding = %id, "tape binding consumed");
                self.events.emit(
                    CoordinationEvent::new(EventType::BindingReleased { binding: id })
                        .for_resource(binding.tool),
                );
                Ok(BindingView {
                    binding,
                    context: vec![result.clone()],
                    result,
                })
            }
        }
    }

    /// Explicitly release a binding. Releasing a GLUE binding withdraws its
    /// result from the team's shared history.
    pub fn release(&self, id: BindingId, team: Option<&Team>) -> CoordResult<AdhesiveBinding> {
        let record = self
            .state()
            .bindings
            .remove(&id)
            .ok_or_else(|| CoordinationError::binding_gone(id))?;
        let binding = record.binding;
        if binding.kind == AdhesiveKind::Glue {
            if let Some(team) = team.filter(|t| t.id() == binding.team) {
                team.retract(binding.tool, &binding.result_ref);
            }
        }
        info!(binding = %id, kind = %binding.kind, "binding released");
        self.events.emit(
            CoordinationEvent::new(EventType::BindingReleased { binding: id })
                .for_resource(binding.tool),
        );
        Ok(binding)
    }

    /// Forget an actor's VELCRO context for one tool.
    pub fn reset_context(&self, actor: ActorId, tool: ResourceId) {
        if let Some(tools) = self.state().sessions.get_mut(&actor) {
            tools.remove(&tool);
        }
    }

    /// End an actor's session: every VELCRO and TAPE binding it holds goes
    /// away along with its accumulated context. Returns how many bindings
    /// were dropped.
    pub fn end_session(&self, actor: ActorId) -> usize {
        let dropped: Vec<BindingId> = {
            let mut state = self.state();
            state.sessions.remove(&actor);
            let ids: Vec<BindingId> = state
                .bindings
                .values()
                .filter(|r| r.binding.actor == actor && r.binding.kind != AdhesiveKind::Glue)
                .map(|r| r.binding.id)
                .collect();
            for id in &ids {
                state.bindings.remove(id);
            }
            ids
        };
        for id in &dropped {
            self.events
                .emit(CoordinationEvent::new(EventType::BindingReleased { binding: *id }));
        }
        info!(actor = %actor, dropped = dropped.len(), "session ended");
        dropped.len()
    }

    /// Drop every binding created in `team` and the session context its tools
    /// accumulated, and clear the team's shared results.
    pub fn teardown_team(&self, team: &Team) -> usize {
        let tools: Vec<ResourceId> = team.tools().into_iter().map(|(t, _)| t).collect();
        let dropped = {
            let mut state = self.state();
            let before = state.bindings.len();
            state.bindings.retain(|_, r| r.binding.team != team.id());
            for per_actor in state.sessions.values_mut() {
                for tool in &tools {
                    per_actor.remove(tool);
                }
            }
            before - state.bindings.len()
        };
        team.clear_results();
        info!(team = %team.id(), dropped, "team bindings torn down");
        dropped
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for BindingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingEngine")
            .field("bindings", &self.state().bindings.len())
            .finish()
    }
}

fn check_owner(binding: &AdhesiveBinding, reader: ActorId) -> CoordResult<()> {
    if binding.actor == reader {
        Ok(())
    } else {
        Err(CoordinationError::membership(format!(
            "{} binding {} is private to {}",
            binding.kind, binding.id, binding.actor
        )))
    }
}

/// Concatenate into a context history, skipping a repeat of the last entry.
fn append_distinct(history: &mut Vec<ToolResult>, result: ToolResult, limit: usize) {
    if history.last().is_some_and(|last| last.same_content(&result)) {
        return;
    }
    history.push(result);
    if history.len() > limit {
        let excess = history.len() - limit;
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use crate::field::Field;
    use crate::registry::Registry;
    use crate::resource::{ResourceCategory, ResourceState};
    use serde_json::json;

    struct Fixture {
        engine: BindingEngine,
        team: Team,
        lead: ActorId,
        peer: ActorId,
        tool: ResourceId,
    }

    fn fixture(default: AdhesiveKind) -> Fixture {
        let events = Arc::new(EventManager::default());
        let registry = Registry::new(events.clone(), 64);
        let model = || {
            registry
                .register(ResourceCategory::Model, ResourceState::Idle)
                .unwrap()
                .id()
        };
        let lead = model();
        let peer = model();
        let tool = registry
            .register(ResourceCategory::Tool, ResourceState::Idle)
            .unwrap()
            .id();
        let team = Team::new("research", lead, Field::new("research", registry.clone()), 8).unwrap();
        team.add_member(peer).unwrap();
        team.add_tool(tool, default).unwrap();
        Fixture {
            engine: BindingEngine::new(events, 8),
            team,
            lead,
            peer,
            tool,
        }
    }

    #[test]
    fn test_kind_ordering_and_resolve() {
        assert!(AdhesiveKind::Glue > AdhesiveKind::Velcro);
        assert!(AdhesiveKind::Velcro > AdhesiveKind::Tape);
        assert_eq!(
            AdhesiveKind::resolve(AdhesiveKind::Glue, Some(AdhesiveKind::Tape)).unwrap(),
            AdhesiveKind::Tape
        );
        assert_eq!(
            AdhesiveKind::resolve(AdhesiveKind::Velcro, None).unwrap(),
            AdhesiveKind::Velcro
        );
        let err = AdhesiveKind::resolve(AdhesiveKind::Velcro, Some(AdhesiveKind::Glue)).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert_eq!("velcro".parse::<AdhesiveKind>().unwrap(), AdhesiveKind::Velcro);
    }

    #[test]
    fn test_digest_is_content_based() {
        let a = ToolResult::new(json!({"q": "rust"}));
        let b = ToolResult::new(json!({"q": "rust"}));
        assert!(a.same_content(&b));
        assert_eq!(a.digest.len(), 64);
        assert!(!a.same_content(&ToolResult::new(json!({"q": "go"}))));
    }

    #[test]
    fn test_glue_visible_to_team_members() {
        let f = fixture(AdhesiveKind::Glue);
        let handle = f
            .engine
            .bind(&f.team, f.lead, f.tool, ToolResult::new(json!("hits")), None)
            .unwrap();
        assert_eq!(handle.kind(), AdhesiveKind::Glue);
        assert_eq!(handle.binding().expires_with, BindingScope::TeamLifetime);
        assert!(f.team.latest(f.tool).is_some());

        let view = f.engine.read(handle.id(), f.peer, &f.team).unwrap();
        assert_eq!(view.result.payload, json!("hits"));

        let outsider = ActorId::new();
        let err = f.engine.read(handle.id(), outsider, &f.team).unwrap_err();
        assert_eq!(err.code, ErrorCode::Membership);
    }

    #[test]
    fn test_bind_requires_tool_in_team_field() {
        let f = fixture(AdhesiveKind::Glue);
        f.team.field().remove_resource(f.tool).unwrap();
        assert!(f.team.has_tool(f.tool));

        let err = f
            .engine
            .bind(&f.team, f.lead, f.tool, ToolResult::new(json!("hits")), None)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Membership);
        assert!(f.team.latest(f.tool).is_none());
        assert!(f.engine.bindings_for(f.lead).is_empty());
    }

    #[test]
    fn test_velcro_private_and_merged() {
        let f = fixture(AdhesiveKind::Glue);
        f.engine
            .bind(&f.team, f.lead, f.tool, ToolResult::new(json!("one")), Some(AdhesiveKind::Velcro))
            .unwrap();
        let second = f
            .engine
            .bind(&f.team, f.lead, f.tool, ToolResult::new(json!("two")), Some(AdhesiveKind::Velcro))
            .unwrap();

        let view = f.engine.read(second.id(), f.lead, &f.team).unwrap();
        let payloads: Vec<_> = view.context.iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![json!("one"), json!("two")]);
        assert!(f.team.latest(f.tool).is_none());

        let err = f.engine.read(second.id(), f.peer, &f.team).unwrap_err();
        assert_eq!(err.code, ErrorCode::Membership);

        assert_eq!(f.engine.end_session(f.lead), 2);
        assert_eq!(
            f.engine.read(second.id(), f.lead, &f.team).unwrap_err().code,
            ErrorCode::Membership
        );
    }

    #[test]
    fn test_tape_single_read() {
        let f = fixture(AdhesiveKind::Tape);
        let handle = f
            .engine
            .bind(&f.team, f.lead, f.tool, ToolResult::new(json!("once")), None)
            .unwrap();

        assert_eq!(
            f.engine.read(handle.id(), f.peer, &f.team).unwrap_err().code,
            ErrorCode::Membership
        );
        let view = f.engine.read(handle.id(), f.lead, &f.team).unwrap();
        assert_eq!(view.result.payload, json!("once"));

        let err = f.engine.read(handle.id(), f.lead, &f.team).unwrap_err();
        assert_eq!(err.code, ErrorCode::Membership);
        assert!(err.message.contains("no longer exists"));
    }

    #[test]
    fn test_stronger_override_rejected() {
        let f = fixture(AdhesiveKind::Velcro);
        let err = f
            .engine
            .bind(&f.team, f.lead, f.tool, ToolResult::new(json!(1)), Some(AdhesiveKind::Glue))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[test]
    fn test_release_glue_withdraws_result() {
        let f = fixture(AdhesiveKind::Glue);
        let handle = f
            .engine
            .bind(&f.team, f.lead, f.tool, ToolResult::new(json!("x")), None)
            .unwrap();
        f.engine.release(handle.id(), Some(&f.team)).unwrap();
        assert!(f.team.latest(f.tool).is_none());
        assert!(f.engine.release(handle.id(), Some(&f.team)).is_err());
    }

    #[test]
    fn test_teardown_team() {
        let f = fixture(AdhesiveKind::Glue);
        f.engine
            .bind(&f.team, f.lead, f.tool, ToolResult::new(json!("x")), None)
            .unwrap();
        f.engine
            .bind(&f.team, f.peer, f.tool, ToolResult::new(json!("y")), Some(AdhesiveKind::Velcro))
            .unwrap();
        assert_eq!(f.engine.teardown_team(&f.team), 2);
        assert!(f.team.shared_results().is_empty());
        assert!(f.engine.bindings_for(f.peer).is_empty());
    }
}
