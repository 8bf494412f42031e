//! Directional flow edges between scopes (teams or fields).
//!
//! Edges are keyed by the ordered pair `(source, destination)`. REPEL and
//! BIDIRECTIONAL are symmetric: an edge with either verb also governs the
//! reverse pair for precedence and for blocking.

use crate::errors::{CoordResult, CoordinationError};
use crate::events::{CoordinationEvent, EventManager, EventType};
use crate::types::{EdgeId, ScopeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Flow verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowVerb {
    /// `->` source delivers to the destination's inbox.
    Push,
    /// `<-` destination may request from the source.
    Pull,
    /// `<>` no transfer in either direction.
    Repel,
    /// `<->` standing two-way channel.
    Bidirectional,
}

impl FlowVerb {
    /// Precedence: BIDIRECTIONAL > REPEL > PUSH = PULL.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Push | Self::Pull => 0,
            Self::Repel => 1,
            Self::Bidirectional => 2,
        }
    }

    pub fn is_symmetric(&self) -> bool {
        matches!(self, Self::Repel | Self::Bidirectional)
    }
}

impl std::fmt::Display for FlowVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Push => "PUSH",
            Self::Pull => "PULL",
            Self::Repel => "REPEL",
            Self::Bidirectional => "BIDIRECTIONAL",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for FlowVerb {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" | "->" => Ok(Self::Push),
            "pull" | "<-" => Ok(Self::Pull),
            "repel" | "<>" => Ok(Self::Repel),
            "bidirectional" | "chat" | "<->" => Ok(Self::Bidirectional),
            other => Err(CoordinationError::invalid_input(format!(
                "Unknown flow verb '{}'",
                other
            ))),
        }
    }
}

/// A declared edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    pub id: EdgeId,
    pub from: ScopeId,
    pub to: ScopeId,
    pub direction: FlowVerb,
    pub established: bool,
    pub declared_at: Timestamp,
}

impl FlowEdge {
    pub fn handle(&self) -> FlowEdgeHandle {
        FlowEdgeHandle {
            id: self.id,
            from: self.from,
            to: self.to,
            direction: self.direction,
        }
    }
}

/// Lightweight reference to an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowEdgeHandle {
    pub id: EdgeId,
    pub from: ScopeId,
    pub to: ScopeId,
    pub direction: FlowVerb,
}

/// Outcome of [`FlowController::declare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDeclaration {
    /// No edge existed; the new one is in place.
    Established(FlowEdgeHandle),
    /// A lower-precedence edge was replaced.
    Replaced {
        edge: FlowEdgeHandle,
        previous: FlowVerb,
    },
    /// An equal-or-higher precedence edge already exists. Nothing changed.
    Conflict {
        existing: FlowEdgeHandle,
        attempted: FlowVerb,
    },
}

impl FlowDeclaration {
    /// The edge in force after the declaration.
    pub fn edge(&self) -> FlowEdgeHandle {
        match self {
            Self::Established(edge) | Self::Replaced { edge, .. } => *edge,
            Self::Conflict { existing, .. } => *existing,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// How a cross-scope request may be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRoute {
    /// The source delivers; the destination only reads its inbox.
    Push(FlowEdgeHandle),
    /// The destination requests from the source.
    Pull(FlowEdgeHandle),
    /// A two-way channel grants pull-style access in both directions.
    Channel(FlowEdgeHandle),
}

impl TransferRoute {
    pub fn edge(&self) -> FlowEdgeHandle {
        match self {
            Self::Push(edge) | Self::Pull(edge) | Self::Channel(edge) => *edge,
        }
    }
}

type EdgeKey = (ScopeId, ScopeId);

/// Holds every declared edge and resolves transfer requests against them.
pub struct FlowController {
    edges: RwLock<HashMap<EdgeKey, FlowEdge>>,
    events: Arc<EventManager>,
}

impl FlowController {
    pub fn new(events: Arc<EventManager>) -> Self {
        Self {
            edges: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Declare an edge from `from` (source) to `to` (destination).
    ///
    /// A higher-precedence verb replaces whatever governs the pair; an
    /// equal-or-lower one leaves things as they are and reports a conflict.
    pub fn declare(
        &self,
        from: ScopeId,
        to: ScopeId,
        verb: FlowVerb,
    ) -> CoordResult<FlowDeclaration> {
        if from == to {
            return Err(CoordinationError::invalid_input(format!(
                "A flow needs two distinct scopes, got {} twice",
                from
            )));
        }

        let mut edges = self.table_mut();
        let governing: Vec<EdgeKey> = governing_keys(&edges, from, to, verb);
        let strongest = governing
            .iter()
            .filter_map(|key| edges.get(key))
            .max_by_key(|edge| edge.direction.rank())
            .cloned();

        let edge = FlowEdge {
            id: EdgeId::new(),
            from,
            to,
            direction: verb,
            established: true,
            declared_at: Timestamp::now(),
        };

        let declaration = match strongest {
            Some(existing) if verb.rank() <= existing.direction.rank() => {
                FlowDeclaration::Conflict {
                    existing: existing.handle(),
                    attempted: verb,
                }
            }
            Some(existing) => {
                for key in &governing {
                    edges.remove(key);
                }
                let handle = edge.handle();
                edges.insert((from, to), edge);
                FlowDeclaration::Replaced {
                    edge: handle,
                    previous: existing.direction,
                }
            }
            None => {
                let handle = edge.handle();
                edges.insert((from, to), edge);
                FlowDeclaration::Established(handle)
            }
        };
        drop(edges);

        match &declaration {
            FlowDeclaration::Established(edge) => {
                info!(edge = %edge.id, from = %from, to = %to, verb = %verb, "flow declared");
                self.events.emit(
                    CoordinationEvent::new(EventType::FlowDeclared {
                        edge: edge.id,
                        to,
                        verb,
                    })
                    .in_scope(from),
                );
            }
            FlowDeclaration::Replaced { edge, previous } => {
                info!(edge = %edge.id, from = %from, to = %to, previous = %previous, verb = %verb, "flow replaced");
                self.events.emit(
                    CoordinationEvent::new(EventType::FlowReplaced {
                        edge: edge.id,
                        to,
                        previous: *previous,
                        verb,
                    })
                    .in_scope(from),
                );
            }
            FlowDeclaration::Conflict { existing, attempted } => {
                warn!(
                    from = %from,
                    to = %to,
                    existing = %existing.direction,
                    attempted = %attempted,
                    "flow declaration conflicts with existing edge"
                );
                self.events.emit(
                    CoordinationEvent::new(EventType::FlowConflict {
                        to,
                        existing: existing.direction,
                        attempted: *attempted,
                    })
                    .in_scope(from),
                );
            }
        }
        Ok(declaration)
    }

    /// Remove the edge governing `(from, to)`. A symmetric edge may be torn
    /// down from either side.
    pub fn tear_down(&self, from: ScopeId, to: ScopeId) -> CoordResult<FlowEdgeHandle> {
        let removed = {
            let mut edges = self.table_mut();
            match edges.remove(&(from, to)) {
                Some(edge) => Some(edge),
                None if edges
                    .get(&(to, from))
                    .is_some_and(|e| e.direction.is_symmetric()) =>
                {
                    edges.remove(&(to, from))
                }
                None => None,
            }
        };
        let edge = removed.ok_or_else(|| {
            CoordinationError::not_found(format!("Flow edge {} -> {}", from, to))
        })?;

        info!(edge = %edge.id, from = %edge.from, to = %edge.to, verb = %edge.direction, "flow torn down");
        self.events.emit(
            CoordinationEvent::new(EventType::FlowTornDown {
                edge: edge.id,
                to: edge.to,
            })
            .in_scope(edge.from),
        );
        Ok(edge.handle())
    }

    /// Remove every edge touching any of `scopes`.
    pub fn tear_down_scope(&self, scopes: &[ScopeId]) -> usize {
        let mut edges = self.table_mut();
        let before = edges.len();
        edges.retain(|(from, to), _| !scopes.contains(from) && !scopes.contains(to));
        before - edges.len()
    }

    pub fn edges(&self) -> Vec<FlowEdge> {
        self.table().values().cloned().collect()
    }

    /// The edge governing `(from, to)`, if any.
    pub fn edge_between(&self, from: ScopeId, to: ScopeId) -> Option<FlowEdge> {
        let edges = self.table();
        edges.get(&(from, to)).cloned().or_else(|| {
            edges
                .get(&(to, from))
                .filter(|e| e.direction.is_symmetric())
                .cloned()
        })
    }

    /// Resolve a request by `dest` for something owned by `source`.
    ///
    /// Both sides are given as alias lists (a team and its backing field
    /// name the same scope). REPEL anywhere between them blocks; otherwise
    /// PUSH from the source wins over PULL, and a BIDIRECTIONAL channel is
    /// the last resort. No edge at all is an error, never a default-allow.
    pub fn resolve(&self, dest: &[ScopeId], source: &[ScopeId]) -> CoordResult<TransferRoute> {
        let edges = self.table();
        let pairs = || {
            source
                .iter()
                .flat_map(|s| dest.iter().map(move |d| (*s, *d)))
        };
        let find = |verb: FlowVerb, symmetric: bool| {
            pairs().find_map(|(s, d)| {
                edges
                    .get(&(s, d))
                    .filter(|e| e.direction == verb)
                    .or_else(|| {
                        if symmetric {
                            edges.get(&(d, s)).filter(|e| e.direction == verb)
                        } else {
                            None
                        }
                    })
                    .map(FlowEdge::handle)
            })
        };

        let (from, to) = match (source.first(), dest.first()) {
            (Some(s), Some(d)) => (*s, *d),
            _ => return Err(CoordinationError::invalid_input("empty scope alias list")),
        };

        if let Some(edge) = find(FlowVerb::Repel, true) {
            debug!(edge = %edge.id, "transfer blocked by repel edge");
            return Err(CoordinationError::blocked_flow(from, to));
        }
        if let Some(edge) = find(FlowVerb::Push, false) {
            return Ok(TransferRoute::Push(edge));
        }
        if let Some(edge) = find(FlowVerb::Pull, false) {
            return Ok(TransferRoute::Pull(edge));
        }
        if let Some(edge) = find(FlowVerb::Bidirectional, true) {
            return Ok(TransferRoute::Channel(edge));
        }
        Err(CoordinationError::undeclared_flow(from, to))
    }

    /// Destinations of PUSH edges leaving any of `source`.
    pub fn push_destinations(&self, source: &[ScopeId]) -> Vec<ScopeId> {
        self.table()
            .values()
            .filter(|e| e.direction == FlowVerb::Push && source.contains(&e.from))
            .map(|e| e.to)
            .collect()
    }

    fn table(&self) -> RwLockReadGuard<'_, HashMap<EdgeKey, FlowEdge>> {
        self.edges.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn table_mut(&self) -> RwLockWriteGuard<'_, HashMap<EdgeKey, FlowEdge>> {
        self.edges.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("edges", &self.table().len())
            .finish()
    }
}

/// Keys of existing edges that a new `verb` edge on `(from, to)` competes
/// with: the forward edge, plus the reverse one when either side is symmetric.
fn governing_keys(
    edges: &HashMap<EdgeKey, FlowEdge>,
    from: ScopeId,
    to: ScopeId,
    verb: FlowVerb,
) -> Vec<EdgeKey> {
    let mut keys = Vec::with_capacity(2);
    if edges.contains_key(&(from, to)) {
        keys.push((from, to));
    }
    if let Some(reverse) = edges.get(&(to, from)) {
        if verb.is_symmetric() || reverse.direction.is_symmetric() {
            keys.push((to, from));
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use crate::types::{FieldId, TeamId};

    fn controller() -> FlowController {
        FlowController::new(Arc::new(EventManager::default()))
    }

    fn scopes() -> (ScopeId, ScopeId) {
        (ScopeId::Team(TeamId::new()), ScopeId::Team(TeamId::new()))
    }

    #[test]
    fn test_verb_parse_and_rank() {
        assert_eq!("<->".parse::<FlowVerb>().unwrap(), FlowVerb::Bidirectional);
        assert_eq!("PUSH".parse::<FlowVerb>().unwrap(), FlowVerb::Push);
        assert!(FlowVerb::Bidirectional.rank() > FlowVerb::Repel.rank());
        assert!(FlowVerb::Repel.rank() > FlowVerb::Push.rank());
        assert_eq!(FlowVerb::Push.rank(), FlowVerb::Pull.rank());
    }

    #[test]
    fn test_repel_after_bidirectional_conflicts() {
        let flows = controller();
        let (a, b) = scopes();
        assert!(matches!(
            flows.declare(a, b, FlowVerb::Bidirectional).unwrap(),
            FlowDeclaration::Established(_)
        ));
        let declared = flows.declare(b, a, FlowVerb::Repel).unwrap();
        assert!(declared.is_conflict());
        assert_eq!(
            flows.edge_between(a, b).unwrap().direction,
            FlowVerb::Bidirectional
        );
    }

    #[test]
    fn test_bidirectional_replaces_repel() {
        let flows = controller();
        let (a, b) = scopes();
        flows.declare(a, b, FlowVerb::Repel).unwrap();
        match flows.declare(b, a, FlowVerb::Bidirectional).unwrap() {
            FlowDeclaration::Replaced { previous, edge } => {
                assert_eq!(previous, FlowVerb::Repel);
                assert_eq!(edge.direction, FlowVerb::Bidirectional);
            }
            other => panic!("expected replacement, got {:?}", other),
        }
        assert_eq!(flows.edges().len(), 1);
    }

    #[test]
    fn test_equal_precedence_is_noop() {
        let flows = controller();
        let (a, b) = scopes();
        flows.declare(a, b, FlowVerb::Push).unwrap();
        let declared = flows.declare(a, b, FlowVerb::Pull).unwrap();
        assert!(declared.is_conflict());
        assert_eq!(flows.edge_between(a, b).unwrap().direction, FlowVerb::Push);
    }

    #[test]
    fn test_repel_replaces_reverse_push() {
        let flows = controller();
        let (a, b) = scopes();
        flows.declare(b, a, FlowVerb::Push).unwrap();
        flows.declare(a, b, FlowVerb::Repel).unwrap();
        assert_eq!(flows.edges().len(), 1);
        let err = flows.resolve(&[a], &[b]).unwrap_err();
        assert_eq!(err.code, ErrorCode::BlockedFlow);
    }

    #[test]
    fn test_resolve_routes() {
        let flows = controller();
        let (src, dst) = scopes();
        assert_eq!(
            flows.resolve(&[dst], &[src]).unwrap_err().code,
            ErrorCode::UndeclaredFlow
        );

        flows.declare(src, dst, FlowVerb::Pull).unwrap();
        assert!(matches!(flows.resolve(&[dst], &[src]).unwrap(), TransferRoute::Pull(_)));
        // PULL is one-way
        assert_eq!(
            flows.resolve(&[src], &[dst]).unwrap_err().code,
            ErrorCode::UndeclaredFlow
        );

        flows.tear_down(src, dst).unwrap();
        flows.declare(dst, src, FlowVerb::Bidirectional).unwrap();
        assert!(matches!(flows.resolve(&[dst], &[src]).unwrap(), TransferRoute::Channel(_)));
        assert!(matches!(flows.resolve(&[src], &[dst]).unwrap(), TransferRoute::Channel(_)));
    }

    #[test]
    fn test_resolve_through_aliases() {
        let flows = controller();
        let (src, dst) = scopes();
        let dst_field = ScopeId::Field(FieldId::new());
        flows.declare(src, dst_field, FlowVerb::Push).unwrap();

        let route = flows.resolve(&[dst, dst_field], &[src]).unwrap();
        assert!(matches!(route, TransferRoute::Push(_)));
        assert_eq!(flows.push_destinations(&[src]), vec![dst_field]);
    }

    #[test]
    fn test_tear_down_symmetric_from_either_side() {
        let flows = controller();
        let (a, b) = scopes();
        flows.declare(a, b, FlowVerb::Repel).unwrap();
        let handle = flows.tear_down(b, a).unwrap();
        assert_eq!(handle.direction, FlowVerb::Repel);
        assert!(flows.edges().is_empty());
        assert_eq!(flows.tear_down(a, b).unwrap_err().code, ErrorCode::NotFound);
    }

    #[test]
    fn test_self_edge_rejected() {
        let flows = controller();
        let (a, _) = scopes();
        assert_eq!(
            flows.declare(a, a, FlowVerb::Push).unwrap_err().code,
            ErrorCode::InvalidInput
        );
    }
}
