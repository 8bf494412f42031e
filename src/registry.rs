//! Process-wide catalog of resources.
//!
//! The registry owns every resource slot. Fields, teams and the flow layer
//! only hold ids and resolve them here. Each slot carries its own mutex, so a
//! state transition is one short critical section on one (or, for pairwise
//! operations, two) resources.

use crate::errors::{CoordResult, CoordinationError};
use crate::events::{CoordinationEvent, EventManager, EventReceiver, EventType};
use crate::resource::{
    ResourceCategory, ResourceData, ResourceSnapshot, ResourceState, TransitionLog,
};
use crate::types::{FieldId, ResourceId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info};

/// One registered resource.
#[derive(Debug)]
pub(crate) struct ResourceSlot {
    pub id: ResourceId,
    pub category: ResourceCategory,
    data: Mutex<ResourceData>,
}

impl ResourceSlot {
    pub fn lock(&self) -> MutexGuard<'_, ResourceData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lock two distinct slots in id order, returning the guards as `(a, b)`.
pub(crate) fn lock_pair<'a>(
    a: &'a ResourceSlot,
    b: &'a ResourceSlot,
) -> (MutexGuard<'a, ResourceData>, MutexGuard<'a, ResourceData>) {
    debug_assert_ne!(a.id, b.id);
    if a.id < b.id {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}

/// Caller-facing handle to a registered resource.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    slot: Arc<ResourceSlot>,
}

impl ResourceHandle {
    pub fn id(&self) -> ResourceId {
        self.slot.id
    }

    pub fn category(&self) -> &ResourceCategory {
        &self.slot.category
    }

    pub fn name(&self) -> Option<String> {
        self.slot.lock().name.clone()
    }

    pub fn state(&self) -> ResourceState {
        self.slot.lock().state
    }

    pub fn owning_field(&self) -> Option<FieldId> {
        self.slot.lock().owning_field
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.slot.lock().snapshot()
    }

    pub fn add_tag(&self, tag: impl Into<String>) {
        self.slot.lock().metadata.tags.insert(tag.into());
    }
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.slot.id == other.slot.id
    }
}

impl Eq for ResourceHandle {}

/// Filter for [`Registry::find`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ResourceQuery {
    pub category: Option<ResourceCategory>,
    pub state: Option<ResourceState>,
    pub tag: Option<String>,
    pub field: Option<FieldId>,
}

impl ResourceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: ResourceCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn state(mut self, state: ResourceState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn in_field(mut self, field: FieldId) -> Self {
        self.field = Some(field);
        self
    }

    fn matches(&self, data: &ResourceData) -> bool {
        if let Some(category) = &self.category {
            if &data.category != category {
                return false;
            }
        }
        if let Some(state) = self.state {
            if data.state != state {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !data.metadata.tags.contains(tag) {
                return false;
            }
        }
        if let Some(field) = self.field {
            if data.owning_field != Some(field) {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct Catalog {
    slots: HashMap<ResourceId, Arc<ResourceSlot>>,
    names: HashMap<String, ResourceId>,
}

struct RegistryInner {
    catalog: RwLock<Catalog>,
    history: Mutex<VecDeque<TransitionLog>>,
    history_limit: usize,
    events: Arc<EventManager>,
}

/// Cheaply cloneable handle to the shared catalog.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(events: Arc<EventManager>, history_limit: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                catalog: RwLock::new(Catalog::default()),
                history: Mutex::new(VecDeque::new()),
                history_limit,
                events,
            }),
        }
    }

    /// Register an anonymous resource.
    ///
    /// Only `Idle` or `Active` are accepted as initial states; the others
    /// carry holder/partner bookkeeping that a bare registration cannot supply.
    pub fn register(
        &self,
        category: ResourceCategory,
        initial_state: ResourceState,
    ) -> CoordResult<ResourceHandle> {
        self.insert(None, category, initial_state)
    }

    /// Register a resource under a unique name.
    pub fn register_named(
        &self,
        name: impl Into<String>,
        category: ResourceCategory,
        initial_state: ResourceState,
    ) -> CoordResult<ResourceHandle> {
        self.insert(Some(name.into()), category, initial_state)
    }

    fn insert(
        &self,
        name: Option<String>,
        category: ResourceCategory,
        initial_state: ResourceState,
    ) -> CoordResult<ResourceHandle> {
        let id = ResourceId::new();
        if !initial_state.is_quiescent() {
            return Err(CoordinationError::invalid_transition(
                id,
                ResourceState::Idle,
                initial_state,
                "resources must start IDLE or ACTIVE",
            ));
        }

        let slot = Arc::new(ResourceSlot {
            id,
            category: category.clone(),
            data: Mutex::new(ResourceData::new(
                id,
                name.clone(),
                category.clone(),
                initial_state,
            )),
        });

        {
            let mut catalog = self.catalog_mut();
            if let Some(name) = &name {
                if catalog.names.contains_key(name) {
                    return Err(CoordinationError::already_exists(format!(
                        "Resource named '{}'",
                        name
                    )));
                }
                catalog.names.insert(name.clone(), id);
            }
            catalog.slots.insert(id, slot.clone());
        }

        info!(resource = %id, name = ?name, category = %category, "resource registered");
        self.inner.events.emit(
            CoordinationEvent::new(EventType::ResourceRegistered { category }).for_resource(id),
        );
        Ok(ResourceHandle { slot })
    }

    /// Remove a resource from the catalog.
    ///
    /// A resource still owned by a field must be removed from it first.
    pub fn deregister(&self, id: ResourceId) -> CoordResult<ResourceSnapshot> {
        let mut catalog = self.catalog_mut();
        let slot = catalog
            .slots
            .get(&id)
            .cloned()
            .ok_or_else(|| CoordinationError::not_found(format!("Resource {}", id)))?;

        let snapshot = {
            let data = slot.lock();
            if let Some(field) = data.owning_field {
                return Err(CoordinationError::membership(format!(
                    "Resource {} is still a member of {}",
                    id, field
                )));
            }
            data.membership_token.cancel();
            data.snapshot()
        };

        catalog.slots.remove(&id);
        if let Some(name) = &snapshot.name {
            catalog.names.remove(name);
        }
        drop(catalog);

        info!(resource = %id, "resource deregistered");
        self.inner
            .events
            .emit(CoordinationEvent::new(EventType::ResourceDeregistered).for_resource(id));
        Ok(snapshot)
    }

    pub fn get(&self, id: ResourceId) -> CoordResult<ResourceHandle> {
        self.slot(id).map(|slot| ResourceHandle { slot })
    }

    /// Look a resource up by its registered name.
    pub fn lookup(&self, name: &str) -> CoordResult<ResourceHandle> {
        let catalog = self.catalog();
        let id = catalog
            .names
            .get(name)
            .copied()
            .ok_or_else(|| CoordinationError::not_found(format!("Resource named '{}'", name)))?;
        catalog
            .slots
            .get(&id)
            .cloned()
            .map(|slot| ResourceHandle { slot })
            .ok_or_else(|| CoordinationError::internal(format!("name index points at missing {}", id)))
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.catalog().slots.contains_key(&id)
    }

    pub fn find(&self, query: &ResourceQuery) -> Vec<ResourceSnapshot> {
        let slots: Vec<Arc<ResourceSlot>> = self.catalog().slots.values().cloned().collect();
        let mut found: Vec<ResourceSnapshot> = slots
            .iter()
            .filter_map(|slot| {
                let data = slot.lock();
                if query.matches(&data) {
                    Some(data.snapshot())
                } else {
                    None
                }
            })
            .collect();
        found.sort_by_key(|s| s.metadata.created_at);
        found
    }

    pub fn by_category(&self, category: ResourceCategory) -> Vec<ResourceSnapshot> {
        self.find(&ResourceQuery::new().category(category))
    }

    pub fn by_state(&self, state: ResourceState) -> Vec<ResourceSnapshot> {
        self.find(&ResourceQuery::new().state(state))
    }

    pub fn len(&self) -> usize {
        self.catalog().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transition history, oldest first.
    pub fn history(&self, resource: Option<ResourceId>) -> Vec<TransitionLog> {
        let history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        history
            .iter()
            .filter(|log| resource.map_or(true, |r| log.resource == r))
            .cloned()
            .collect()
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.inner.events
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub(crate) fn slot(&self, id: ResourceId) -> CoordResult<Arc<ResourceSlot>> {
        self.catalog()
            .slots
            .get(&id)
            .cloned()
            .ok_or_else(|| CoordinationError::not_found(format!("Resource {}", id)))
    }

    /// Append transition logs and emit `StateChanged` for the successful ones.
    pub(crate) fn record<I>(&self, logs: I)
    where
        I: IntoIterator<Item = TransitionLog>,
    {
        let logs: Vec<TransitionLog> = logs.into_iter().collect();
        if logs.is_empty() {
            return;
        }
        {
            let mut history = self
                .inner
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for log in &logs {
                history.push_back(log.clone());
            }
            while history.len() > self.inner.history_limit {
                history.pop_front();
            }
        }
        for log in logs.into_iter().filter(|l| l.success) {
            debug!(resource = %log.resource, from = %log.from, to = %log.to, "state changed");
            self.inner.events.emit(CoordinationEvent::state_changed(
                log.resource,
                log.from,
                log.to,
            ));
        }
    }

    fn catalog(&self) -> std::sync::RwLockReadGuard<'_, Catalog> {
        self.inner
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn catalog_mut(&self) -> std::sync::RwLockWriteGuard<'_, Catalog> {
        self.inner
            .catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("resources", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    fn registry() -> Registry {
        Registry::new(Arc::new(EventManager::default()), 16)
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = registry();
        let search = reg
            .register_named("search", ResourceCategory::Tool, ResourceState::Idle)
            .unwrap();
        assert_eq!(reg.lookup("search").unwrap().id(), search.id());
        assert_eq!(reg.get(search.id()).unwrap().state(), ResourceState::Idle);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let reg = registry();
        reg.register_named("files", ResourceCategory::Tool, ResourceState::Idle)
            .unwrap();
        let err = reg
            .register_named("files", ResourceCategory::Tool, ResourceState::Idle)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);
    }

    #[test]
    fn test_initial_state_guard() {
        let reg = registry();
        assert!(reg
            .register(ResourceCategory::Data, ResourceState::Active)
            .is_ok());
        let err = reg
            .register(ResourceCategory::Data, ResourceState::Locked)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);
    }

    #[test]
    fn test_find_by_category_and_tag() {
        let reg = registry();
        let a = reg.register(ResourceCategory::Tool, ResourceState::Idle).unwrap();
        reg.register(ResourceCategory::Model, ResourceState::Idle).unwrap();
        a.add_tag("web");

        assert_eq!(reg.by_category(ResourceCategory::Tool).len(), 1);
        assert_eq!(reg.by_state(ResourceState::Idle).len(), 2);
        let tagged = reg.find(&ResourceQuery::new().tag("web"));
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id, a.id());
    }

    #[test]
    fn test_deregister() {
        let reg = registry();
        let r = reg
            .register_named("blob", ResourceCategory::Data, ResourceState::Idle)
            .unwrap();
        let snapshot = reg.deregister(r.id()).unwrap();
        assert_eq!(snapshot.name.as_deref(), Some("blob"));
        assert!(!reg.contains(r.id()));
        assert!(reg.lookup("blob").is_err());
        assert_eq!(reg.deregister(r.id()).unwrap_err().code, ErrorCode::NotFound);
    }

    #[test]
    fn test_history_is_bounded() {
        let reg = registry();
        let r = ResourceId::new();
        reg.record((0..40).map(|_| TransitionLog::ok(r, ResourceState::Idle, ResourceState::Active)));
        assert_eq!(reg.history(Some(r)).len(), 16);
        assert!(reg.history(Some(ResourceId::new())).is_empty());
    }

    #[test]
    fn test_registration_event() {
        let reg = registry();
        let r = reg.register(ResourceCategory::Tool, ResourceState::Idle).unwrap();
        let recent = reg.events().recent(1);
        assert_eq!(recent[0].name(), "resource_registered");
        assert_eq!(recent[0].resource, Some(r.id()));
    }
}
