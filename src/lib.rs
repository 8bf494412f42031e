//! # Adhesive Field v0.2.0
//!
//! Resource coordination for agent teams.
//!
//! Independent actors (models, tools, teams) share, lock and exchange
//! data-bearing resources under explicit rules:
//!
//! - **Registry**: process-wide catalog of resources and their state machine
//! - **Field**: bounded context of member resources plus attraction/repulsion rules
//! - **Team**: named grouping of actors and tools backed by one field
//! - **Adhesive bindings**: GLUE / VELCRO / TAPE persistence of tool results
//! - **Flows**: PUSH / PULL / REPEL / BIDIRECTIONAL edges between scopes
//! - **Coordinator**: the facade collaborators talk to
//!
//! Failures come back to the caller as [`CoordinationError`]. Nothing in here
//! retries on its own.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! adhesive-field = "0.2"
//! ```
//!
//! ```rust,ignore
//! use adhesive_field::prelude::*;
//!
//! let coord = Coordinator::default();
//! let lead = coord.register_resource(ResourceCategory::Model, ResourceState::Idle)?.id();
//! let search = coord.register_resource(ResourceCategory::Tool, ResourceState::Idle)?.id();
//!
//! let research = coord.create_team("research", lead)?;
//! research.add_tool(search, AdhesiveKind::Glue)?;
//! let docs = coord.create_team("docs", writer)?;
//! coord.declare_flow(research.scope_id(), docs.scope_id(), FlowVerb::Push)?;
//!
//! coord.bind_tool_result(research.id(), lead, search, ToolResult::new(hits), AdhesiveKind::Glue)?;
//! let result = coord.request_transfer(docs.scope_id(), search).await?;
//! ```

pub mod adhesive;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod field;
pub mod flow;
pub mod registry;
pub mod resource;
pub mod rules;
pub mod team;
pub mod types;

// Re-export everything in prelude for convenience
pub mod prelude {
    pub use crate::adhesive::*;
    pub use crate::config::*;
    pub use crate::coordinator::*;
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::field::*;
    pub use crate::flow::*;
    pub use crate::registry::*;
    pub use crate::resource::*;
    pub use crate::rules::*;
    pub use crate::team::*;
    pub use crate::types::*;
}

// Also re-export at crate root
pub use prelude::*;
