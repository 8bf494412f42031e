//! The `Coordinator`: one entry point over registry, fields, teams, bindings
//! and flows.
//!
//! Collaborators register resources, declare teams and flows, feed tool
//! completions in, and ask for cross-scope transfers. Everything else in the
//! crate is reachable from here.

use crate::adhesive::{AdhesiveKind, BindingEngine, BindingHandle, BindingView, ToolCompletion, ToolResult};
use crate::config::CoordinatorConfig;
use crate::errors::{CoordResult, CoordinationError};
use crate::events::{CoordinationEvent, EventFilter, EventManager, EventReceiver, EventType};
use crate::field::{Field, RepelOutcome, TransferDirection};
use crate::flow::{FlowController, FlowDeclaration, FlowEdge, FlowEdgeHandle, FlowVerb, TransferRoute};
use crate::registry::{Registry, ResourceHandle, ResourceQuery};
use crate::resource::{ResourceCategory, ResourceSnapshot, ResourceState, TransitionLog};
use crate::rules::RuleSet;
use crate::team::{Team, TeamDeclaration};
use crate::types::{ActorId, BindingId, FieldId, ResourceId, ScopeId, TeamId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Facade over the coordination core.
pub struct Coordinator {
    config: CoordinatorConfig,
    events: Arc<EventManager>,
    registry: Registry,
    fields: RwLock<HashMap<FieldId, Field>>,
    teams: RwLock<HashMap<TeamId, Team>>,
    bindings: BindingEngine,
    flows: FlowController,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> CoordResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// Defaults plus any `ADHESIVE_FIELD_*` environment overrides.
    pub fn from_env() -> CoordResult<Self> {
        Self::new(CoordinatorConfig::from_env())
    }

    fn build(config: CoordinatorConfig) -> Self {
        let events = Arc::new(EventManager::new(
            config.event_capacity,
            config.recent_events,
        ));
        Self {
            registry: Registry::new(events.clone(), config.transition_history),
            bindings: BindingEngine::new(events.clone(), config.session_history),
            flows: FlowController::new(events.clone()),
            fields: RwLock::new(HashMap::new()),
            teams: RwLock::new(HashMap::new()),
            events,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn bindings(&self) -> &BindingEngine {
        &self.bindings
    }

    pub fn flows(&self) -> &FlowController {
        &self.flows
    }

    // ═══════════════════════════════════════════════════════
    // RESOURCES
    // ═══════════════════════════════════════════════════════

    pub fn register_resource(
        &self,
        category: ResourceCategory,
        initial_state: ResourceState,
    ) -> CoordResult<ResourceHandle> {
        self.registry.register(category, initial_state)
    }

    pub fn register_named(
        &self,
        name: impl Into<String>,
        category: ResourceCategory,
        initial_state: ResourceState,
    ) -> CoordResult<ResourceHandle> {
        self.registry.register_named(name, category, initial_state)
    }

    pub fn deregister(&self, resource: ResourceId) -> CoordResult<ResourceSnapshot> {
        self.registry.deregister(resource)
    }

    pub fn resource(&self, resource: ResourceId) -> CoordResult<ResourceHandle> {
        self.registry.get(resource)
    }

    pub fn find(&self, query: &ResourceQuery) -> Vec<ResourceSnapshot> {
        self.registry.find(query)
    }

    pub fn history(&self, resource: Option<ResourceId>) -> Vec<TransitionLog> {
        self.registry.history(resource)
    }

    // ═══════════════════════════════════════════════════════
    // FIELDS
    // ═══════════════════════════════════════════════════════

    pub fn create_field(&self, name: impl Into<String>) -> Field {
        self.create_field_with_rules(name, RuleSet::new())
    }

    pub fn create_field_with_rules(&self, name: impl Into<String>, rules: RuleSet) -> Field {
        let field = Field::with_rules(name, rules, self.registry.clone());
        self.track_field(field.clone());
        field
    }

    /// Child of `parent`, starting from a snapshot of its rules.
    pub fn child_field(&self, parent: FieldId, name: impl Into<String>) -> CoordResult<Field> {
        let child = self.field(parent)?.child(name);
        self.track_field(child.clone());
        Ok(child)
    }

    pub fn field(&self, id: FieldId) -> CoordResult<Field> {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| CoordinationError::not_found(format!("Field {}", id)))
    }

    /// The field a resource currently belongs to.
    pub fn field_of(&self, resource: ResourceId) -> CoordResult<Field> {
        let owning = self.registry.get(resource)?.owning_field().ok_or_else(|| {
            CoordinationError::membership(format!("Resource {} is not in any field", resource))
        })?;
        self.field(owning)
    }

    /// Close a bare field, forcing every member out. Fields backing a team go
    /// away with [`Coordinator::teardown_team`] instead.
    pub fn close_field(&self, id: FieldId) -> CoordResult<Vec<ResourceSnapshot>> {
        if let Some(team) = self.team_backed_by(id) {
            return Err(CoordinationError::invalid_input(format!(
                "Field {} backs team '{}'",
                id,
                team.name()
            )));
        }
        let field = self
            .fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or_else(|| CoordinationError::not_found(format!("Field {}", id)))?;
        self.flows.tear_down_scope(&[ScopeId::Field(id)]);
        Ok(field.close())
    }

    fn track_field(&self, field: Field) {
        self.fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(field.id(), field);
    }

    // ═══════════════════════════════════════════════════════
    // ATTRACTION / LOCKING
    // ═══════════════════════════════════════════════════════

    pub fn attract(&self, a: ResourceId, b: ResourceId) -> CoordResult<()> {
        self.field_of(a)?.attract(a, b)
    }

    pub fn repel(&self, a: ResourceId, b: ResourceId) -> CoordResult<RepelOutcome> {
        self.field_of(a)?.repel(a, b)
    }

    pub fn lock(&self, resource: ResourceId, holder: ResourceId) -> CoordResult<()> {
        self.field_of(resource)?.lock(resource, holder)
    }

    pub fn unlock(&self, resource: ResourceId, holder: ResourceId) -> CoordResult<()> {
        self.field_of(resource)?.unlock(resource, holder)
    }

    pub fn release(&self, resource: ResourceId, by: ResourceId) -> CoordResult<ResourceSnapshot> {
        self.field_of(resource)?.release(resource, by)
    }

    // ═══════════════════════════════════════════════════════
    // TEAMS
    // ═══════════════════════════════════════════════════════

    /// Create a team (and its backing field) led by `lead`.
    pub fn create_team(&self, name: impl Into<String>, lead: ActorId) -> CoordResult<Team> {
        let name = name.into();
        let mut teams = self.teams.write().unwrap_or_else(PoisonError::into_inner);
        if teams.values().any(|t| t.name() == name) {
            return Err(CoordinationError::already_exists(format!("Team '{}'", name)));
        }

        let field = Field::new(format!("team:{}", name), self.registry.clone());
        let team = Team::new(name, lead, field.clone(), self.config.session_history)?;
        self.track_field(field);
        teams.insert(team.id(), team.clone());
        Ok(team)
    }

    /// Build a team from a collaborator's declaration. Nothing is left behind
    /// if any part of it is rejected.
    pub fn declare_team(&self, declaration: TeamDeclaration) -> CoordResult<Team> {
        let team = self.create_team(declaration.name, declaration.lead)?;
        let populated = declaration
            .members
            .iter()
            .try_for_each(|actor| team.add_member(*actor))
            .and_then(|_| {
                declaration
                    .tools
                    .iter()
                    .try_for_each(|t| team.add_tool(t.tool, t.default_kind))
            });
        if let Err(e) = populated {
            warn!(team = %team.id(), error = %e, "team declaration rejected");
            self.teardown_team(team.id())?;
            return Err(e);
        }
        Ok(team)
    }

    pub fn team(&self, id: TeamId) -> CoordResult<Team> {
        self.teams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| CoordinationError::not_found(format!("Team {}", id)))
    }

    pub fn team_by_name(&self, name: &str) -> CoordResult<Team> {
        self.teams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|t| t.name() == name)
            .cloned()
            .ok_or_else(|| CoordinationError::not_found(format!("Team '{}'", name)))
    }

    pub fn teams(&self) -> Vec<Team> {
        self.teams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Tear a team down: its bindings, shared results, flow edges and field
    /// all go. Members are forced back to IDLE.
    pub fn teardown_team(&self, id: TeamId) -> CoordResult<()> {
        let team = self
            .teams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or_else(|| CoordinationError::not_found(format!("Team {}", id)))?;

        self.bindings.teardown_team(&team);
        let edges = self.flows.tear_down_scope(&team.aliases());
        let members = team.field().close();
        team.release_tools();
        self.fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&team.field_id());
        info!(team = %id, edges, members = members.len(), "team torn down");
        Ok(())
    }

    fn team_backed_by(&self, field: FieldId) -> Option<Team> {
        self.teams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|t| t.field_id() == field)
            .cloned()
    }

    fn team_owning(&self, tool: ResourceId) -> CoordResult<Team> {
        self.teams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|t| t.has_tool(tool))
            .cloned()
            .ok_or_else(|| CoordinationError::not_found(format!("No team owns tool {}", tool)))
    }

    /// The team a scope id refers to, if any.
    fn team_for_scope(&self, scope: ScopeId) -> Option<Team> {
        match scope {
            ScopeId::Team(id) => self.team(id).ok(),
            ScopeId::Field(id) => self.team_backed_by(id),
        }
    }

    /// The id a scope is recorded under: a team's backing field maps to the
    /// team, anything else must exist as is.
    fn canonical(&self, scope: ScopeId) -> CoordResult<ScopeId> {
        if let Some(team) = self.team_for_scope(scope) {
            return Ok(team.scope_id());
        }
        match scope {
            ScopeId::Team(id) => Err(CoordinationError::not_found(format!("Team {}", id))),
            ScopeId::Field(id) => self.field(id).map(|_| scope),
        }
    }

    /// Every scope id naming the same thing as `scope`.
    fn aliases(&self, scope: ScopeId) -> CoordResult<Vec<ScopeId>> {
        match self.team_for_scope(scope) {
            Some(team) => Ok(team.aliases().to_vec()),
            None => self.canonical(scope).map(|s| vec![s]),
        }
    }

    // ═══════════════════════════════════════════════════════
    // BINDINGS
    // ═══════════════════════════════════════════════════════

    /// Bind a tool result with an explicit kind. The kind may not be stronger
    /// than the tool's team default.
    pub fn bind_tool_result(
        &self,
        team: TeamId,
        actor: ActorId,
        tool: ResourceId,
        result: ToolResult,
        kind: AdhesiveKind,
    ) -> CoordResult<BindingHandle> {
        let team = self.team(team)?;
        let handle = self.bindings.bind(&team, actor, tool, result, Some(kind))?;
        if handle.kind() == AdhesiveKind::Glue {
            self.push_downstream(&team, tool, handle.result());
        }
        Ok(handle)
    }

    /// Consume a completion event from the tool-execution layer. Without an
    /// override the completion's own default kind is requested.
    pub fn on_tool_completed(
        &self,
        team: TeamId,
        completion: ToolCompletion,
        override_kind: Option<AdhesiveKind>,
    ) -> CoordResult<BindingHandle> {
        let kind = override_kind.unwrap_or(completion.default_kind);
        debug!(actor = %completion.actor, tool = %completion.tool, kind = %kind, "tool completed");
        self.bind_tool_result(team, completion.actor, completion.tool, completion.result, kind)
    }

    pub fn read_binding(&self, binding: BindingId, reader: ActorId) -> CoordResult<BindingView> {
        let record = self
            .bindings
            .binding(binding)
            .ok_or_else(|| CoordinationError::binding_gone(binding))?;
        let team = self.team(record.team)?;
        self.bindings.read(binding, reader, &team)
    }

    pub fn release_binding(&self, binding: BindingId) -> CoordResult<()> {
        let team = self
            .bindings
            .binding(binding)
            .and_then(|b| self.team(b.team).ok());
        self.bindings.release(binding, team.as_ref()).map(|_| ())
    }

    pub fn end_session(&self, actor: ActorId) -> usize {
        self.bindings.end_session(actor)
    }

    /// Deliver a fresh GLUE result to every PUSH destination of `source`.
    fn push_downstream(&self, source: &Team, tool: ResourceId, result: &ToolResult) {
        for dest in self.flows.push_destinations(&source.aliases()) {
            match self.team_for_scope(dest) {
                Some(team) => {
                    team.deliver(source.scope_id(), tool, result.clone());
                    debug!(from = %source.id(), to = %dest, tool = %tool, "result pushed");
                    self.events.emit(
                        CoordinationEvent::new(EventType::ResultPushed { to: dest })
                            .for_resource(tool)
                            .in_scope(source.scope_id()),
                    );
                }
                None => debug!(to = %dest, "push destination has no inbox"),
            }
        }
    }

    // ═══════════════════════════════════════════════════════
    // FLOWS
    // ═══════════════════════════════════════════════════════

    /// Declare a flow edge. A newly effective PUSH edge immediately delivers
    /// what the source has already published.
    ///
    /// A team and its backing field are the same scope; edges are always
    /// recorded against the team.
    pub fn declare_flow(
        &self,
        from: ScopeId,
        to: ScopeId,
        verb: FlowVerb,
    ) -> CoordResult<FlowDeclaration> {
        let from = self.canonical(from)?;
        let to = self.canonical(to)?;
        let declaration = self.flows.declare(from, to, verb)?;

        if verb == FlowVerb::Push && !declaration.is_conflict() {
            if let (Some(source), Some(dest)) = (self.team_for_scope(from), self.team_for_scope(to)) {
                for shared in source.shared_results() {
                    dest.deliver(source.scope_id(), shared.tool, shared.latest);
                }
            }
        }
        Ok(declaration)
    }

    pub fn tear_down_flow(&self, from: ScopeId, to: ScopeId) -> CoordResult<FlowEdgeHandle> {
        self.flows.tear_down(self.canonical(from)?, self.canonical(to)?)
    }

    pub fn flow_edges(&self) -> Vec<FlowEdge> {
        self.flows.edges()
    }

    /// Fetch `tool`'s result on behalf of scope `dest`.
    ///
    /// The tool's owning team is the source. REPEL between the scopes fails
    /// with `BlockedFlow`, no edge with `UndeclaredFlow`. Over PUSH the
    /// request reads `dest`'s inbox; over PULL or a channel it reads the
    /// source's latest shared result. Either way it waits up to the configured
    /// pull timeout, and is cancelled if the tool leaves its field meanwhile.
    pub async fn request_transfer(&self, dest: ScopeId, tool: ResourceId) -> CoordResult<ToolResult> {
        let source = self.team_owning(tool)?;
        let dest_aliases = self.aliases(dest)?;

        if dest_aliases.contains(&source.scope_id()) {
            return source.latest(tool).ok_or_else(|| {
                CoordinationError::not_found(format!("Published result for tool {}", tool))
            });
        }

        let route = match self.flows.resolve(&dest_aliases, &source.aliases()) {
            Ok(route) => route,
            Err(e) => {
                self.transfer_failed(&source, dest, tool, &e);
                return Err(e);
            }
        };

        let outcome = match (route, self.team_for_scope(dest)) {
            (TransferRoute::Push(_), Some(inbox)) => {
                self.await_result(&source, tool, TransferDirection::Push, &inbox, || {
                    inbox.inbox(tool).map(|entry| entry.result)
                })
                .await
            }
            // Bare fields have no inbox; a push into one is observed as the
            // source's latest publication.
            _ => {
                self.await_result(&source, tool, TransferDirection::Pull, &source, || {
                    source.latest(tool)
                })
                .await
            }
        };

        match &outcome {
            Ok(result) => {
                info!(from = %source.id(), to = %dest, tool = %tool, digest = %result.digest, "transfer completed");
                self.events.emit(
                    CoordinationEvent::new(EventType::TransferCompleted {
                        from: source.scope_id(),
                    })
                    .for_resource(tool)
                    .in_scope(dest),
                );
            }
            Err(e) => self.transfer_failed(&source, dest, tool, e),
        }
        outcome
    }

    async fn await_result<F>(
        &self,
        source: &Team,
        tool: ResourceId,
        direction: TransferDirection,
        watched: &Team,
        fetch: F,
    ) -> CoordResult<ToolResult>
    where
        F: Fn() -> Option<ToolResult>,
    {
        let guard = source.field().begin_transfer(tool, direction)?;
        let timeout = self.config.pull_timeout_duration();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let changed = watched.changed();
            if let Some(result) = fetch() {
                return Ok(result);
            }
            tokio::select! {
                _ = changed => {}
                _ = guard.cancelled() => {
                    return Err(CoordinationError::cancelled(format!(
                        "Tool {} left its field while a transfer was pending",
                        tool
                    )));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(CoordinationError::timeout(
                        format!("Transfer of tool {}", tool),
                        timeout,
                    ));
                }
            }
        }
    }

    fn transfer_failed(&self, source: &Team, dest: ScopeId, tool: ResourceId, error: &CoordinationError) {
        warn!(from = %source.id(), to = %dest, tool = %tool, code = %error.code, "transfer failed");
        self.events.emit(
            CoordinationEvent::new(EventType::TransferFailed {
                from: source.scope_id(),
                error_code: error.code.to_string(),
            })
            .for_resource(tool)
            .in_scope(dest),
        );
    }

    // ═══════════════════════════════════════════════════════
    // EVENTS
    // ═══════════════════════════════════════════════════════

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Most recent first.
    pub fn recent_events(&self, limit: usize) -> Vec<CoordinationEvent> {
        self.events.recent(limit)
    }

    pub fn recent_events_matching(&self, filter: &EventFilter, limit: usize) -> Vec<CoordinationEvent> {
        self.events.recent_matching(filter, limit)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::build(CoordinatorConfig::default())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("resources", &self.registry.len())
            .field("teams", &self.teams().len())
            .field("flows", &self.flows)
            .finish()
    }
}
