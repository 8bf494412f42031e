//! Fields: bounded contexts of member resources plus the rules between them.
//!
//! A field owns membership, evaluates attraction/repulsion, drives the
//! per-resource state machine, and guarantees cleanup of scoped entries.
//!
//! Lock order is always: field membership mutex, then resource mutexes in
//! `ResourceId` order. Neither is ever held across an `.await`.

use crate::errors::{CoordResult, CoordinationError, ErrorCode};
use crate::events::{CoordinationEvent, EventType};
use crate::registry::{lock_pair, Registry, ResourceSlot};
use crate::resource::{ResourceData, ResourceSnapshot, ResourceState, TransitionLog};
use crate::rules::{FieldRule, RuleSet, RuleSubject, RuleVerb};
use crate::types::{FieldId, ResourceId, ScopeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a `repel` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepelOutcome {
    /// Repulsion recorded; any attraction between the pair was torn down.
    Applied,
    /// The pair shares an open chat channel, which outranks repulsion.
    RefusedByChannel,
}

/// Result of a `request_chat` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    /// Waiting for the other side to opt in.
    Pending,
    /// Both sides opted in; both are now CHATTING.
    Open,
}

/// Direction of an in-flight one-way transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Pull,
    Push,
}

impl TransferDirection {
    fn state(&self) -> ResourceState {
        match self {
            Self::Pull => ResourceState::Pulling,
            Self::Push => ResourceState::Pushing,
        }
    }
}

struct FieldInner {
    id: FieldId,
    name: String,
    parent: Option<FieldId>,
    rules: RwLock<RuleSet>,
    members: Mutex<BTreeSet<ResourceId>>,
    registry: Registry,
}

/// Cheaply cloneable handle to a field.
#[derive(Clone)]
pub struct Field {
    inner: Arc<FieldInner>,
}

impl Field {
    pub fn new(name: impl Into<String>, registry: Registry) -> Self {
        Self::build(name.into(), None, RuleSet::new(), registry)
    }

    pub fn with_rules(name: impl Into<String>, rules: RuleSet, registry: Registry) -> Self {
        Self::build(name.into(), None, rules, registry)
    }

    fn build(name: String, parent: Option<FieldId>, rules: RuleSet, registry: Registry) -> Self {
        let id = FieldId::new();
        debug!(field = %id, name = %name, parent = ?parent, rules = rules.len(), "field created");
        Self {
            inner: Arc::new(FieldInner {
                id,
                name,
                parent,
                rules: RwLock::new(rules),
                members: Mutex::new(BTreeSet::new()),
                registry,
            }),
        }
    }

    /// Create a child field. The child gets a copy of this field's rules as
    /// they are right now; later changes on either side stay local.
    pub fn child(&self, name: impl Into<String>) -> Field {
        let snapshot = self.rules();
        Self::build(
            name.into(),
            Some(self.inner.id),
            snapshot,
            self.inner.registry.clone(),
        )
    }

    pub fn id(&self) -> FieldId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<FieldId> {
        self.inner.parent
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    fn scope_id(&self) -> ScopeId {
        ScopeId::Field(self.inner.id)
    }

    // ═══════════════════════════════════════════════════════
    // RULES
    // ═══════════════════════════════════════════════════════

    pub fn rules(&self) -> RuleSet {
        self.inner
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_rule(&self, rule: FieldRule) {
        debug!(field = %self.inner.id, rule = %rule.name, verb = ?rule.verb, "rule added");
        self.inner
            .rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule);
    }

    pub fn remove_rule(&self, name: &str) -> usize {
        self.inner
            .rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    fn rule_verdict(&self, a: &ResourceData, b: &ResourceData) -> Option<(String, RuleVerb)> {
        let rules = self
            .inner
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        rules
            .evaluate(&RuleSubject::from(a), &RuleSubject::from(b))
            .map(|rule| (rule.name.clone(), rule.verb))
    }

    // ═══════════════════════════════════════════════════════
    // MEMBERSHIP
    // ═══════════════════════════════════════════════════════

    pub fn members(&self) -> Vec<ResourceId> {
        self.members_guard().iter().copied().collect()
    }

    pub fn contains(&self, resource: ResourceId) -> bool {
        self.members_guard().contains(&resource)
    }

    pub fn len(&self) -> usize {
        self.members_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn members_guard(&self) -> MutexGuard<'_, BTreeSet<ResourceId>> {
        self.inner
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a resource. Adding a resource that is already a member is a no-op;
    /// a resource owned by a different field is rejected.
    pub fn add_resource(&self, resource: ResourceId) -> CoordResult<()> {
        self.insert_member(resource).map(|_| ())
    }

    /// Returns whether the resource was newly added.
    pub(crate) fn insert_member(&self, resource: ResourceId) -> CoordResult<bool> {
        let slot = self.inner.registry.slot(resource)?;
        let mut members = self.members_guard();
        {
            let mut data = slot.lock();
            match data.owning_field {
                Some(field) if field == self.inner.id => return Ok(false),
                Some(field) => {
                    return Err(CoordinationError::membership(format!(
                        "Resource {} already belongs to {}",
                        resource, field
                    ))
                    .with_context("field", field.to_string()));
                }
                None => {
                    data.owning_field = Some(self.inner.id);
                    data.membership_token = CancellationToken::new();
                }
            }
        }
        members.insert(resource);
        drop(members);

        info!(field = %self.inner.id, resource = %resource, "resource entered field");
        self.emit(CoordinationEvent::new(EventType::FieldEntered { field: self.inner.id })
            .for_resource(resource));
        Ok(true)
    }

    /// Remove a resource, forcing it back to IDLE whatever its state.
    ///
    /// Attractions, chat channels and locks it holds on other members are
    /// torn down. Pending transfers involving it are cancelled.
    pub fn remove_resource(&self, resource: ResourceId) -> CoordResult<ResourceSnapshot> {
        let slot = self.inner.registry.slot(resource)?;
        let mut members = self.members_guard();
        let mut logs = Vec::new();

        let (peers, partner, snapshot) = {
            let mut data = slot.lock();
            if data.owning_field != Some(self.inner.id) {
                return Err(self.not_a_member(resource));
            }
            let partner = data.chat_partner;
            data.owning_field = None;
            data.membership_token.cancel();
            let (peers, log) = data.reset();
            logs.extend(log);
            (peers, partner, data.snapshot())
        };
        members.remove(&resource);

        for peer in &peers {
            self.detach_peer(*peer, resource, &mut logs);
        }
        if let Some(partner) = partner {
            self.detach_chat_partner(partner, resource, &mut logs);
        }
        for member in members.iter() {
            self.release_lock_held_by(*member, resource, &mut logs);
        }
        drop(members);

        self.inner.registry.record(logs);
        info!(
            field = %self.inner.id,
            resource = %resource,
            torn_down = peers.len(),
            "resource exited field"
        );
        self.emit(CoordinationEvent::new(EventType::FieldExited { field: self.inner.id })
            .for_resource(resource));
        Ok(snapshot)
    }

    /// Remove every member. Used when the field (or its team) is torn down.
    pub fn close(&self) -> Vec<ResourceSnapshot> {
        self.members()
            .into_iter()
            .filter_map(|r| match self.remove_resource(r) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(field = %self.inner.id, resource = %r, error = %e, "close: removal failed");
                    None
                }
            })
            .collect()
    }

    /// Enter a resource for the lifetime of the returned scope.
    pub fn enter(&self, resource: ResourceId) -> CoordResult<FieldScope> {
        let mut scope = self.scope();
        scope.enter(resource)?;
        Ok(scope)
    }

    /// Same as [`Field::remove_resource`].
    pub fn exit(&self, resource: ResourceId) -> CoordResult<ResourceSnapshot> {
        self.remove_resource(resource)
    }

    /// Open an empty scope. Resources entered through it are removed when it
    /// is dropped, including on early return or when the owning future is
    /// cancelled.
    pub fn scope(&self) -> FieldScope {
        FieldScope {
            field: self.clone(),
            entered: Vec::new(),
        }
    }

    // ═══════════════════════════════════════════════════════
    // ATTRACTION / REPULSION
    // ═══════════════════════════════════════════════════════

    /// Attract two member resources.
    ///
    /// Drives IDLE -> ACTIVE -> SHARED on both sides. Fails with
    /// `Contention` if either is locked by someone else, and with
    /// `InvalidTransition` on repulsion, a repel rule, a chat in progress,
    /// or a TAPE-bound resource that would have to be shared. A resource
    /// mid-transfer stays PULLING/PUSHING until its guard drops.
    pub fn attract(&self, a: ResourceId, b: ResourceId) -> CoordResult<()> {
        let (sa, sb) = self.pair(a, b)?;
        let mut logs = Vec::new();
        {
            let (mut ga, mut gb) = lock_pair(&sa, &sb);
            self.check_members(&ga, &gb)?;

            if let Some((rule, RuleVerb::Repel)) = self.rule_verdict(&ga, &gb) {
                let to = attraction_target(&ga);
                let err = CoordinationError::invalid_transition(
                    a,
                    ga.state,
                    to,
                    format!("repel rule '{}' applies", rule),
                );
                logs.push(TransitionLog::rejected(a, ga.state, to, &err));
                drop((ga, gb));
                self.inner.registry.record(logs);
                return Err(err);
            }

            let fresh_a = match ga.check_attract(b) {
                Ok(fresh) => fresh,
                Err(err) => {
                    logs.push(rejection(&ga, &err));
                    drop((ga, gb));
                    self.inner.registry.record(logs);
                    return Err(err);
                }
            };
            let fresh_b = match gb.check_attract(a) {
                Ok(fresh) => fresh,
                Err(err) => {
                    logs.push(rejection(&gb, &err));
                    drop((ga, gb));
                    self.inner.registry.record(logs);
                    return Err(err);
                }
            };
            if !fresh_a && !fresh_b {
                return Ok(());
            }

            ga.attracted_to.insert(b);
            gb.attracted_to.insert(a);
            ga.touch();
            gb.touch();
            logs.extend(ga.settle());
            logs.extend(gb.settle());
        }

        self.inner.registry.record(logs);
        debug!(field = %self.inner.id, a = %a, b = %b, "attracted");
        self.emit(CoordinationEvent::new(EventType::Attracted { other: b }).for_resource(a));
        self.emit(CoordinationEvent::new(EventType::Attracted { other: a }).for_resource(b));
        Ok(())
    }

    /// Tear down an attraction between two members. No-op if none exists.
    pub fn break_attraction(&self, a: ResourceId, b: ResourceId) -> CoordResult<()> {
        let (sa, sb) = self.pair(a, b)?;
        let mut logs = Vec::new();
        let broke = {
            let (mut ga, mut gb) = lock_pair(&sa, &sb);
            self.check_members(&ga, &gb)?;
            let broke = ga.attracted_to.remove(&b) | gb.attracted_to.remove(&a);
            logs.extend(ga.settle());
            logs.extend(gb.settle());
            broke
        };
        self.inner.registry.record(logs);
        if broke {
            self.emit(
                CoordinationEvent::new(EventType::AttractionBroken { other: b }).for_resource(a),
            );
        }
        Ok(())
    }

    /// Record a symmetric repulsion. Existing attraction is torn down unless
    /// the pair shares an open chat channel, in which case the request is
    /// refused without error.
    pub fn repel(&self, a: ResourceId, b: ResourceId) -> CoordResult<RepelOutcome> {
        let (sa, sb) = self.pair(a, b)?;
        let mut logs = Vec::new();
        {
            let (mut ga, mut gb) = lock_pair(&sa, &sb);
            self.check_members(&ga, &gb)?;

            if ga.chat_partner == Some(b) {
                drop((ga, gb));
                warn!(field = %self.inner.id, a = %a, b = %b, "repel refused: open chat channel");
                self.emit(
                    CoordinationEvent::new(EventType::RepelRefused { other: b }).for_resource(a),
                );
                return Ok(RepelOutcome::RefusedByChannel);
            }

            ga.repelled_from.insert(b);
            gb.repelled_from.insert(a);
            ga.chat_requests.remove(&b);
            gb.chat_requests.remove(&a);
            if ga.attracted_to.remove(&b) | gb.attracted_to.remove(&a) {
                logs.extend(ga.settle());
                logs.extend(gb.settle());
            }
        }
        self.inner.registry.record(logs);
        debug!(field = %self.inner.id, a = %a, b = %b, "repelled");
        self.emit(CoordinationEvent::new(EventType::Repelled { other: b }).for_resource(a));
        Ok(RepelOutcome::Applied)
    }

    /// Drop a recorded repulsion between two members.
    pub fn clear_repulsion(&self, a: ResourceId, b: ResourceId) -> CoordResult<()> {
        let (sa, sb) = self.pair(a, b)?;
        let (mut ga, mut gb) = lock_pair(&sa, &sb);
        self.check_members(&ga, &gb)?;
        ga.repelled_from.remove(&b);
        gb.repelled_from.remove(&a);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════
    // LOCKING
    // ═══════════════════════════════════════════════════════

    /// Lock `resource` for `holder`. Attractions to anything but the holder
    /// are broken. Re-locking by the current holder is a no-op.
    pub fn lock(&self, resource: ResourceId, holder: ResourceId) -> CoordResult<()> {
        let (sr, sh) = self.pair(resource, holder)?;
        let mut logs = Vec::new();
        let dropped: Vec<ResourceId> = {
            let (mut gr, gh) = lock_pair(&sr, &sh);
            self.check_members(&gr, &gh)?;

            if gr.state == ResourceState::Locked {
                if gr.lock_holder == Some(holder) {
                    return Ok(());
                }
                return Err(CoordinationError::contention(resource, gr.lock_holder));
            }
            if !gr.state.is_quiescent() {
                let err = CoordinationError::invalid_transition(
                    resource,
                    gr.state,
                    ResourceState::Locked,
                    "only IDLE or ACTIVE resources can be locked",
                );
                logs.push(TransitionLog::rejected(
                    resource,
                    gr.state,
                    ResourceState::Locked,
                    &err,
                ));
                drop((gr, gh));
                self.inner.registry.record(logs);
                return Err(err);
            }

            let dropped: Vec<ResourceId> = gr
                .attracted_to
                .iter()
                .copied()
                .filter(|peer| *peer != holder)
                .collect();
            for peer in &dropped {
                gr.attracted_to.remove(peer);
            }
            gr.lock_holder = Some(holder);
            gr.touch();
            logs.extend(gr.set_state(ResourceState::Locked));
            dropped
        };

        for peer in &dropped {
            self.detach_peer(*peer, resource, &mut logs);
        }
        self.inner.registry.record(logs);
        info!(field = %self.inner.id, resource = %resource, holder = %holder, "locked");
        self.emit(CoordinationEvent::new(EventType::Locked { holder }).for_resource(resource));
        Ok(())
    }

    /// Unlock. Only the holder may unlock.
    pub fn unlock(&self, resource: ResourceId, holder: ResourceId) -> CoordResult<()> {
        let slot = self.inner.registry.slot(resource)?;
        let log = {
            let mut data = slot.lock();
            if data.owning_field != Some(self.inner.id) {
                return Err(self.not_a_member(resource));
            }
            if data.state != ResourceState::Locked {
                let to = data.attraction_state();
                return Err(CoordinationError::invalid_transition(
                    resource,
                    data.state,
                    to,
                    "resource is not locked",
                ));
            }
            if data.lock_holder != Some(holder) {
                return Err(CoordinationError::contention(resource, data.lock_holder));
            }
            data.lock_holder = None;
            let next = data.attraction_state();
            data.set_state(next)
        };
        self.inner.registry.record(log);
        info!(field = %self.inner.id, resource = %resource, holder = %holder, "unlocked");
        self.emit(CoordinationEvent::new(EventType::Unlocked { holder }).for_resource(resource));
        Ok(())
    }

    /// Explicit release back to IDLE. A locked resource can only be released
    /// by its holder.
    pub fn release(&self, resource: ResourceId, by: ResourceId) -> CoordResult<ResourceSnapshot> {
        let slot = self.inner.registry.slot(resource)?;
        let mut logs = Vec::new();
        let (peers, partner, snapshot) = {
            let mut data = slot.lock();
            if data.owning_field != Some(self.inner.id) {
                return Err(self.not_a_member(resource));
            }
            if data.state == ResourceState::Locked && data.lock_holder != Some(by) {
                return Err(CoordinationError::contention(resource, data.lock_holder));
            }
            let partner = data.chat_partner;
            let (peers, log) = data.reset();
            logs.extend(log);
            (peers, partner, data.snapshot())
        };
        for peer in &peers {
            self.detach_peer(*peer, resource, &mut logs);
        }
        if let Some(partner) = partner {
            self.detach_chat_partner(partner, resource, &mut logs);
        }
        self.inner.registry.record(logs);
        debug!(field = %self.inner.id, resource = %resource, "released");
        Ok(snapshot)
    }

    // ═══════════════════════════════════════════════════════
    // CHAT CHANNELS
    // ═══════════════════════════════════════════════════════

    /// Opt `a` into a direct channel with `b`. The channel opens (both go
    /// CHATTING) once `b` has opted into `a` as well.
    pub fn request_chat(&self, a: ResourceId, b: ResourceId) -> CoordResult<ChatStatus> {
        let (sa, sb) = self.pair(a, b)?;
        let mut logs = Vec::new();
        let status = {
            let (mut ga, mut gb) = lock_pair(&sa, &sb);
            self.check_members(&ga, &gb)?;
            if ga.chat_partner == Some(b) {
                return Ok(ChatStatus::Open);
            }
            for data in [&*ga, &*gb] {
                check_can_chat(data)?;
            }
            if ga.repelled_from.contains(&b) {
                return Err(CoordinationError::invalid_transition(
                    a,
                    ga.state,
                    ResourceState::Chatting,
                    format!("repelled from {}", b),
                ));
            }

            if gb.chat_requests.contains(&a) {
                for (data, partner) in [(&mut *ga, b), (&mut *gb, a)] {
                    data.chat_requests.remove(&partner);
                    data.resume_state = Some(data.state);
                    data.chat_partner = Some(partner);
                    logs.extend(data.set_state(ResourceState::Chatting));
                }
                ChatStatus::Open
            } else {
                ga.chat_requests.insert(b);
                ChatStatus::Pending
            }
        };
        self.inner.registry.record(logs);
        if status == ChatStatus::Open {
            info!(field = %self.inner.id, a = %a, b = %b, "chat opened");
            self.emit(CoordinationEvent::new(EventType::ChatOpened { partner: b }).for_resource(a));
        }
        Ok(status)
    }

    /// Close a chat channel, restoring both sides.
    pub fn end_chat(&self, a: ResourceId, b: ResourceId) -> CoordResult<()> {
        let (sa, sb) = self.pair(a, b)?;
        let mut logs = Vec::new();
        {
            let (mut ga, mut gb) = lock_pair(&sa, &sb);
            self.check_members(&ga, &gb)?;
            if ga.chat_partner != Some(b) {
                ga.chat_requests.remove(&b);
                return Err(CoordinationError::invalid_input(format!(
                    "{} has no open channel with {}",
                    a, b
                )));
            }
            for data in [&mut *ga, &mut *gb] {
                logs.extend(leave_chat(data));
            }
        }
        self.inner.registry.record(logs);
        info!(field = %self.inner.id, a = %a, b = %b, "chat closed");
        self.emit(CoordinationEvent::new(EventType::ChatClosed { partner: b }).for_resource(a));
        Ok(())
    }

    // ═══════════════════════════════════════════════════════
    // TRANSFERS
    // ═══════════════════════════════════════════════════════

    /// Mark a member as carrying a one-way transfer.
    ///
    /// Fails with `Contention` if the resource is locked. IDLE/ACTIVE
    /// resources move to PULLING/PUSHING until the guard drops; a resource
    /// already SHARED, chatting, or mid-transfer is left as is.
    pub fn begin_transfer(
        &self,
        resource: ResourceId,
        direction: TransferDirection,
    ) -> CoordResult<TransferGuard> {
        let slot = self.inner.registry.slot(resource)?;
        let (marked, token, log) = {
            let mut data = slot.lock();
            if data.owning_field != Some(self.inner.id) {
                return Err(self.not_a_member(resource));
            }
            if data.state == ResourceState::Locked {
                return Err(CoordinationError::contention(resource, data.lock_holder));
            }
            let token = data.membership_token.clone();
            if data.state.is_quiescent() {
                data.resume_state = Some(data.state);
                data.touch();
                let log = data.set_state(direction.state());
                (true, token, log)
            } else {
                (false, token, None)
            }
        };
        self.inner.registry.record(log);
        Ok(TransferGuard {
            registry: self.inner.registry.clone(),
            slot,
            state: direction.state(),
            marked,
            token,
        })
    }

    // ═══════════════════════════════════════════════════════
    // HELPERS
    // ═══════════════════════════════════════════════════════

    fn pair(
        &self,
        a: ResourceId,
        b: ResourceId,
    ) -> CoordResult<(Arc<ResourceSlot>, Arc<ResourceSlot>)> {
        if a == b {
            return Err(CoordinationError::invalid_input(format!(
                "{} cannot pair with itself",
                a
            )));
        }
        Ok((self.inner.registry.slot(a)?, self.inner.registry.slot(b)?))
    }

    fn check_members(&self, a: &ResourceData, b: &ResourceData) -> CoordResult<()> {
        for data in [a, b] {
            if data.owning_field != Some(self.inner.id) {
                return Err(self.not_a_member(data.id));
            }
        }
        Ok(())
    }

    fn not_a_member(&self, resource: ResourceId) -> CoordinationError {
        CoordinationError::membership(format!(
            "Resource {} is not a member of field '{}'",
            resource, self.inner.name
        ))
        .with_context("field", self.inner.id.to_string())
    }

    /// Undo `gone`'s side of an attraction on `peer`.
    fn detach_peer(&self, peer: ResourceId, gone: ResourceId, logs: &mut Vec<TransitionLog>) {
        let Ok(slot) = self.inner.registry.slot(peer) else {
            return;
        };
        let mut data = slot.lock();
        if data.attracted_to.remove(&gone) {
            logs.extend(data.settle());
            drop(data);
            self.emit(
                CoordinationEvent::new(EventType::AttractionBroken { other: gone })
                    .for_resource(peer),
            );
        }
    }

    fn detach_chat_partner(
        &self,
        partner: ResourceId,
        gone: ResourceId,
        logs: &mut Vec<TransitionLog>,
    ) {
        let Ok(slot) = self.inner.registry.slot(partner) else {
            return;
        };
        let mut data = slot.lock();
        data.chat_requests.remove(&gone);
        if data.chat_partner == Some(gone) {
            logs.extend(leave_chat(&mut data));
        }
    }

    fn release_lock_held_by(
        &self,
        member: ResourceId,
        holder: ResourceId,
        logs: &mut Vec<TransitionLog>,
    ) {
        let Ok(slot) = self.inner.registry.slot(member) else {
            return;
        };
        let mut data = slot.lock();
        if data.state == ResourceState::Locked && data.lock_holder == Some(holder) {
            data.lock_holder = None;
            let next = data.attraction_state();
            logs.extend(data.set_state(next));
            drop(data);
            self.emit(
                CoordinationEvent::new(EventType::Unlocked { holder }).for_resource(member),
            );
        }
    }

    fn emit(&self, event: CoordinationEvent) {
        self.inner
            .registry
            .events()
            .emit(event.in_scope(self.scope_id()));
    }
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("parent", &self.inner.parent)
            .field("members", &self.len())
            .finish()
    }
}

fn attraction_target(data: &ResourceData) -> ResourceState {
    if data.attracted_to.is_empty() {
        ResourceState::Active
    } else {
        ResourceState::Shared
    }
}

fn rejection(data: &ResourceData, err: &CoordinationError) -> TransitionLog {
    TransitionLog::rejected(data.id, data.state, attraction_target(data), err)
}

fn check_can_chat(data: &ResourceData) -> CoordResult<()> {
    match data.state {
        ResourceState::Locked => Err(CoordinationError::contention(data.id, data.lock_holder)),
        s if s.is_quiescent() => Ok(()),
        s => Err(CoordinationError::invalid_transition(
            data.id,
            s,
            ResourceState::Chatting,
            "only IDLE or ACTIVE resources can chat",
        )),
    }
}

fn leave_chat(data: &mut ResourceData) -> Option<TransitionLog> {
    data.chat_partner = None;
    data.resume_state = None;
    if data.state == ResourceState::Chatting {
        let next = data.attraction_state();
        data.set_state(next)
    } else {
        None
    }
}

/// RAII scope over a field. Everything entered through the scope is removed
/// from the field (and forced back to IDLE) when the scope ends.
pub struct FieldScope {
    field: Field,
    entered: Vec<ResourceId>,
}

impl FieldScope {
    pub fn field(&self) -> &Field {
        &self.field
    }

    /// Add a resource to the field for the rest of this scope. A resource
    /// that was already a member before the scope opened is not tracked and
    /// stays behind afterwards.
    pub fn enter(&mut self, resource: ResourceId) -> CoordResult<()> {
        if self.field.insert_member(resource)? {
            self.entered.push(resource);
        }
        Ok(())
    }

    /// Remove a resource before the scope ends.
    pub fn exit(&mut self, resource: ResourceId) -> CoordResult<ResourceSnapshot> {
        let snapshot = self.field.remove_resource(resource)?;
        self.entered.retain(|r| *r != resource);
        Ok(snapshot)
    }

    /// Resources this scope will clean up.
    pub fn entered(&self) -> &[ResourceId] {
        &self.entered
    }

    /// End the scope now. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for FieldScope {
    fn drop(&mut self) {
        for resource in self.entered.drain(..).rev() {
            match self.field.remove_resource(resource) {
                Ok(_) => {}
                // Already gone (exited elsewhere or deregistered).
                Err(e) if e.is(ErrorCode::Membership) || e.is(ErrorCode::NotFound) => {}
                Err(e) => {
                    warn!(field = %self.field.id(), resource = %resource, error = %e, "scope cleanup failed");
                }
            }
        }
    }
}

/// Holds a resource in PULLING/PUSHING for the duration of a transfer.
pub struct TransferGuard {
    registry: Registry,
    slot: Arc<ResourceSlot>,
    state: ResourceState,
    marked: bool,
    token: CancellationToken,
}

impl TransferGuard {
    pub fn resource(&self) -> ResourceId {
        self.slot.id
    }

    /// Whether this guard moved the resource into a transfer state.
    pub fn is_marked(&self) -> bool {
        self.marked
    }

    /// Resolves when the resource leaves its field.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if !self.marked {
            return;
        }
        let log = {
            let mut data = self.slot.lock();
            if data.state != self.state {
                // Released or removed mid-transfer; already settled.
                return;
            }
            let resume = data.resume_state.take();
            let next = match resume {
                Some(s) if s.is_attraction_driven() => data.attraction_state(),
                Some(s) => s,
                None => data.attraction_state(),
            };
            data.set_state(next)
        };
        self.registry.record(log);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adhesive::AdhesiveKind;
    use crate::events::EventManager;
    use crate::resource::ResourceCategory;
    use crate::rules::Pattern;

    fn setup() -> (Registry, Field) {
        let registry = Registry::new(Arc::new(EventManager::default()), 64);
        let field = Field::new("workspace", registry.clone());
        (registry, field)
    }

    fn member(registry: &Registry, field: &Field, category: ResourceCategory) -> ResourceId {
        let r = registry.register(category, ResourceState::Idle).unwrap().id();
        field.add_resource(r).unwrap();
        r
    }

    fn state(registry: &Registry, r: ResourceId) -> ResourceState {
        registry.get(r).unwrap().state()
    }

    #[test]
    fn test_add_to_second_field_rejected() {
        let (registry, field) = setup();
        let other = Field::new("other", registry.clone());
        let r = member(&registry, &field, ResourceCategory::Tool);

        field.add_resource(r).unwrap();
        let err = other.add_resource(r).unwrap_err();
        assert_eq!(err.code, ErrorCode::Membership);
        assert_eq!(registry.get(r).unwrap().owning_field(), Some(field.id()));
    }

    #[test]
    fn test_attract_drives_idle_active_shared() {
        let (registry, field) = setup();
        let tool = member(&registry, &field, ResourceCategory::Tool);
        let m1 = member(&registry, &field, ResourceCategory::Model);
        let m2 = member(&registry, &field, ResourceCategory::Model);

        field.attract(m1, tool).unwrap();
        assert_eq!(state(&registry, tool), ResourceState::Active);
        assert_eq!(state(&registry, m1), ResourceState::Active);

        field.attract(m2, tool).unwrap();
        assert_eq!(state(&registry, tool), ResourceState::Shared);

        field.break_attraction(m1, tool).unwrap();
        assert_eq!(state(&registry, tool), ResourceState::Active);
        assert_eq!(state(&registry, m1), ResourceState::Idle);
    }

    #[test]
    fn test_attract_requires_membership() {
        let (registry, field) = setup();
        let inside = member(&registry, &field, ResourceCategory::Tool);
        let outside = registry
            .register(ResourceCategory::Model, ResourceState::Idle)
            .unwrap()
            .id();
        let err = field.attract(outside, inside).unwrap_err();
        assert_eq!(err.code, ErrorCode::Membership);
    }

    #[test]
    fn test_repel_tears_down_and_blocks() {
        let (registry, field) = setup();
        let a = member(&registry, &field, ResourceCategory::Model);
        let b = member(&registry, &field, ResourceCategory::Tool);

        field.attract(a, b).unwrap();
        assert_eq!(field.repel(a, b).unwrap(), RepelOutcome::Applied);
        assert_eq!(state(&registry, a), ResourceState::Idle);
        assert_eq!(state(&registry, b), ResourceState::Idle);

        let err = field.attract(b, a).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);

        field.clear_repulsion(a, b).unwrap();
        field.attract(a, b).unwrap();
    }

    #[test]
    fn test_repel_rule_blocks_attraction() {
        let (registry, field) = setup();
        field.add_rule(FieldRule::repel(
            "no-data-on-models",
            Pattern::Category(ResourceCategory::Data),
            Pattern::Category(ResourceCategory::Model),
        ));
        let m = member(&registry, &field, ResourceCategory::Model);
        let d = member(&registry, &field, ResourceCategory::Data);

        let err = field.attract(m, d).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);
        assert!(registry.history(Some(m)).iter().any(|l| !l.success));
    }

    #[test]
    fn test_child_rules_are_a_snapshot() {
        let (_registry, field) = setup();
        field.add_rule(FieldRule::repel("first", Pattern::Any, Pattern::Any));
        let child = field.child("child");
        assert_eq!(child.parent(), Some(field.id()));
        assert_eq!(child.rules().len(), 1);

        field.add_rule(FieldRule::repel("second", Pattern::Any, Pattern::Any));
        assert_eq!(child.rules().len(), 1);
        child.add_rule(FieldRule::attract("local", Pattern::Any, Pattern::Any));
        assert_eq!(field.rules().len(), 2);
    }

    #[test]
    fn test_lock_blocks_others_until_holder_unlocks() {
        let (registry, field) = setup();
        let tool = member(&registry, &field, ResourceCategory::Tool);
        let holder = member(&registry, &field, ResourceCategory::Model);
        let other = member(&registry, &field, ResourceCategory::Model);

        field.lock(tool, holder).unwrap();
        assert_eq!(state(&registry, tool), ResourceState::Locked);

        assert_eq!(field.attract(other, tool).unwrap_err().code, ErrorCode::Contention);
        assert_eq!(field.lock(tool, other).unwrap_err().code, ErrorCode::Contention);
        assert_eq!(field.unlock(tool, other).unwrap_err().code, ErrorCode::Contention);

        // holder may still attract, and re-lock is a no-op
        field.attract(holder, tool).unwrap();
        field.lock(tool, holder).unwrap();
        assert_eq!(state(&registry, tool), ResourceState::Locked);

        field.unlock(tool, holder).unwrap();
        assert_eq!(state(&registry, tool), ResourceState::Active);
        field.attract(other, tool).unwrap();
        assert_eq!(state(&registry, tool), ResourceState::Shared);
    }

    #[test]
    fn test_lock_breaks_other_attractions() {
        let (registry, field) = setup();
        let tool = member(&registry, &field, ResourceCategory::Tool);
        let holder = member(&registry, &field, ResourceCategory::Model);
        let other = member(&registry, &field, ResourceCategory::Model);

        field.attract(other, tool).unwrap();
        field.lock(tool, holder).unwrap();
        assert_eq!(state(&registry, other), ResourceState::Idle);
        assert!(registry.get(tool).unwrap().snapshot().attracted_to.is_empty());
    }

    #[test]
    fn test_shared_cannot_lock() {
        let (registry, field) = setup();
        let tool = member(&registry, &field, ResourceCategory::Tool);
        let m1 = member(&registry, &field, ResourceCategory::Model);
        let m2 = member(&registry, &field, ResourceCategory::Model);
        field.attract(m1, tool).unwrap();
        field.attract(m2, tool).unwrap();

        let err = field.lock(tool, m1).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);
    }

    #[test]
    fn test_tape_resource_cannot_share() {
        let (registry, field) = setup();
        let tool = member(&registry, &field, ResourceCategory::Tool);
        registry.slot(tool).unwrap().lock().adhesive = Some(AdhesiveKind::Tape);
        let m1 = member(&registry, &field, ResourceCategory::Model);
        let m2 = member(&registry, &field, ResourceCategory::Model);

        field.attract(m1, tool).unwrap();
        let err = field.attract(m2, tool).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);
        assert_eq!(state(&registry, tool), ResourceState::Active);
        assert_eq!(state(&registry, m2), ResourceState::Idle);
    }

    #[test]
    fn test_remove_forces_idle_from_any_state() {
        let (registry, field) = setup();
        let tool = member(&registry, &field, ResourceCategory::Tool);
        let holder = member(&registry, &field, ResourceCategory::Model);
        let peer = member(&registry, &field, ResourceCategory::Model);

        field.attract(peer, holder).unwrap();
        field.lock(tool, holder).unwrap();

        // removing the holder releases its lock and its attraction
        let snapshot = field.remove_resource(holder).unwrap();
        assert_eq!(snapshot.state, ResourceState::Idle);
        assert_eq!(snapshot.owning_field, None);
        assert_eq!(state(&registry, tool), ResourceState::Idle);
        assert_eq!(state(&registry, peer), ResourceState::Idle);
        assert!(!field.contains(holder));

        // a locked resource is forced back too
        field.add_resource(holder).unwrap();
        field.lock(tool, holder).unwrap();
        field.remove_resource(tool).unwrap();
        assert_eq!(state(&registry, tool), ResourceState::Idle);
        assert_eq!(registry.get(tool).unwrap().snapshot().lock_holder, None);
    }

    #[test]
    fn test_chat_requires_both_sides() {
        let (registry, field) = setup();
        let a = member(&registry, &field, ResourceCategory::Model);
        let b = member(&registry, &field, ResourceCategory::Model);
        let tool = member(&registry, &field, ResourceCategory::Tool);

        assert_eq!(field.request_chat(a, b).unwrap(), ChatStatus::Pending);
        assert_eq!(state(&registry, a), ResourceState::Idle);
        assert_eq!(field.request_chat(b, a).unwrap(), ChatStatus::Open);
        assert_eq!(state(&registry, a), ResourceState::Chatting);
        assert_eq!(state(&registry, b), ResourceState::Chatting);

        // tool attraction suppressed while chatting
        let err = field.attract(a, tool).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);

        // channel outranks repulsion
        assert_eq!(field.repel(a, b).unwrap(), RepelOutcome::RefusedByChannel);

        field.end_chat(a, b).unwrap();
        assert_eq!(state(&registry, a), ResourceState::Idle);
        assert_eq!(field.repel(a, b).unwrap(), RepelOutcome::Applied);
    }

    #[test]
    fn test_transfer_guard_reverts() {
        let (registry, field) = setup();
        let tool = member(&registry, &field, ResourceCategory::Tool);
        let m = member(&registry, &field, ResourceCategory::Model);
        field.attract(m, tool).unwrap();

        {
            let guard = field.begin_transfer(tool, TransferDirection::Pull).unwrap();
            assert!(guard.is_marked());
            assert_eq!(state(&registry, tool), ResourceState::Pulling);
        }
        assert_eq!(state(&registry, tool), ResourceState::Active);

        field.lock(tool, m).unwrap();
        let err = field.begin_transfer(tool, TransferDirection::Push).err().unwrap();
        assert_eq!(err.code, ErrorCode::Contention);
    }

    #[test]
    fn test_attract_during_transfer() {
        let (registry, field) = setup();
        let tool = member(&registry, &field, ResourceCategory::Tool);
        let m1 = member(&registry, &field, ResourceCategory::Model);
        let m2 = member(&registry, &field, ResourceCategory::Model);
        field.attract(m1, tool).unwrap();

        let guard = field.begin_transfer(tool, TransferDirection::Push).unwrap();
        field.attract(m2, tool).unwrap();
        assert_eq!(state(&registry, tool), ResourceState::Pushing);
        assert_eq!(state(&registry, m2), ResourceState::Active);

        drop(guard);
        assert_eq!(state(&registry, tool), ResourceState::Shared);
    }

    #[test]
    fn test_transfer_cancelled_by_removal() {
        let (registry, field) = setup();
        let tool = member(&registry, &field, ResourceCategory::Tool);
        let guard = field.begin_transfer(tool, TransferDirection::Push).unwrap();
        assert!(!guard.is_cancelled());

        field.remove_resource(tool).unwrap();
        assert!(guard.is_cancelled());
        drop(guard);
        assert_eq!(state(&registry, tool), ResourceState::Idle);
    }

    #[test]
    fn test_scope_cleans_up_on_drop() {
        let (registry, field) = setup();
        let existing = member(&registry, &field, ResourceCategory::Model);
        let tool = registry
            .register(ResourceCategory::Tool, ResourceState::Idle)
            .unwrap()
            .id();

        {
            let mut scope = field.scope();
            scope.enter(tool).unwrap();
            scope.enter(existing).unwrap();
            assert_eq!(scope.entered(), &[tool]);
            field.attract(existing, tool).unwrap();
            assert_eq!(state(&registry, tool), ResourceState::Active);
        }

        assert!(!field.contains(tool));
        assert!(field.contains(existing));
        assert_eq!(state(&registry, tool), ResourceState::Idle);
        assert_eq!(state(&registry, existing), ResourceState::Idle);
    }

    #[test]
    fn test_scope_cleans_up_on_error_path() {
        fn task(field: &Field, tool: ResourceId, holder: ResourceId) -> CoordResult<()> {
            let mut scope = field.enter(tool)?;
            scope.enter(holder)?;
            field.lock(tool, holder)?;
            Err(CoordinationError::internal("tool crashed"))
        }

        let (registry, field) = setup();
        let tool = registry.register(ResourceCategory::Tool, ResourceState::Idle).unwrap().id();
        let holder = registry.register(ResourceCategory::Model, ResourceState::Idle).unwrap().id();

        assert!(task(&field, tool, holder).is_err());
        assert!(field.is_empty());
        assert_eq!(state(&registry, tool), ResourceState::Idle);
    }
}
