//! Error type for every coordination operation.
//!
//! All failures are returned to the immediate caller. Nothing in this crate
//! retries on its own; `SuggestedAction::Retry` is advice for the caller.
//!
//! | Code | Raised when |
//! |------|-------------|
//! | `Contention` | attraction, lock or flow against a resource locked by someone else |
//! | `BlockedFlow` | a REPEL edge forbids the requested transfer |
//! | `UndeclaredFlow` | no edge at all between the requested scopes |
//! | `Timeout` | a pull/push wait elapsed without the source responding |
//! | `Membership` | resource, actor or binding not owned by the acting field/team |
//! | `InvalidTransition` | a state-machine guard rejected a transition |

use crate::resource::ResourceState;
use crate::types::{ResourceId, ScopeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Domain error for the coordination core.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct CoordinationError {
    /// Error code (machine-readable)
    pub code: ErrorCode,

    /// Severity level
    pub severity: Severity,

    /// Human-readable message
    pub message: String,

    /// Additional context (for debugging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, serde_json::Value>>,

    /// Is this recoverable by the caller?
    pub recoverable: bool,

    /// Suggested action for recovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<SuggestedAction>,
}

impl CoordinationError {
    /// Create a new error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: code.default_severity(),
            message: message.into(),
            context: None,
            recoverable: code.is_typically_recoverable(),
            suggested_action: None,
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let context = self.context.get_or_insert_with(HashMap::new);
        if let Ok(v) = serde_json::to_value(value) {
            context.insert(key.into(), v);
        }
        self
    }

    /// Set recoverable flag
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Set suggested action
    pub fn with_suggestion(mut self, action: SuggestedAction) -> Self {
        self.suggested_action = Some(action);
        self
    }

    /// Set severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Check the error code.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    /// Format for the orchestrating actor: what went wrong and what to try.
    pub fn to_actor_message(&self) -> String {
        let mut msg = format!("Error: {}", self.message);
        if let Some(ref action) = self.suggested_action {
            match action {
                SuggestedAction::Retry { after_ms } => {
                    msg.push_str(&format!(". Retry after {}ms", after_ms));
                }
                SuggestedAction::Alternative { description } => {
                    msg.push_str(&format!(". Try: {}", description));
                }
                SuggestedAction::DeclareFlow { from, to } => {
                    msg.push_str(&format!(". Declare a flow from {} to {}", from, to));
                }
                SuggestedAction::ReportBug => {
                    msg.push_str(". This may be a bug, please report it");
                }
            }
        }
        msg
    }

    // ═══════════════════════════════════════════════════════════
    // Constructors, one per failure kind
    // ═══════════════════════════════════════════════════════════

    /// Resource is locked by another holder.
    pub fn contention(resource: ResourceId, holder: Option<ResourceId>) -> Self {
        let mut err = Self::new(
            ErrorCode::Contention,
            format!("Resource {} is busy", resource),
        )
        .with_context("resource", resource.to_string())
        .with_suggestion(SuggestedAction::Retry { after_ms: 50 });
        if let Some(holder) = holder {
            err = err.with_context("holder", holder.to_string());
        }
        err
    }

    /// A REPEL edge forbids the transfer.
    pub fn blocked_flow(from: ScopeId, to: ScopeId) -> Self {
        Self::new(
            ErrorCode::BlockedFlow,
            format!("Flow between {} and {} is blocked by repulsion", from, to),
        )
        .with_context("from", from.to_string())
        .with_context("to", to.to_string())
    }

    /// No edge exists between the scopes.
    pub fn undeclared_flow(from: ScopeId, to: ScopeId) -> Self {
        Self::new(
            ErrorCode::UndeclaredFlow,
            format!("No flow declared from {} to {}", from, to),
        )
        .with_suggestion(SuggestedAction::DeclareFlow {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// A wait elapsed.
    pub fn timeout(what: impl Into<String>, waited: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("{} timed out after {}ms", what.into(), waited.as_millis()),
        )
        .with_suggestion(SuggestedAction::Retry {
            after_ms: waited.as_millis() as u64,
        })
    }

    /// Operation on something not owned by the acting field/team.
    pub fn membership(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Membership, message)
    }

    /// Binding was consumed, released, or expired.
    pub fn binding_gone(binding: impl std::fmt::Display) -> Self {
        Self::membership(format!("Binding {} no longer exists", binding))
            .with_suggestion(SuggestedAction::Alternative {
                description: "Invoke the tool again for a fresh result".into(),
            })
    }

    /// A guard rejected the transition.
    pub fn invalid_transition(
        resource: ResourceId,
        from: ResourceState,
        to: ResourceState,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCode::InvalidTransition,
            format!(
                "Resource {} cannot move {} -> {}: {}",
                resource,
                from,
                to,
                reason.into()
            ),
        )
        .with_context("from", from)
        .with_context("to", to)
    }

    /// Not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, format!("{} not found", what.into()))
    }

    /// Already exists error
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, format!("{} already exists", what.into()))
    }

    /// Invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// The awaited operation was cancelled by a membership change.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    /// Internal error (bug)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
            .with_severity(Severity::Fatal)
            .recoverable(false)
            .with_suggestion(SuggestedAction::ReportBug)
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Resource locked by another holder
    Contention,

    /// Repulsion forbids the transfer
    BlockedFlow,

    /// No flow edge between the scopes
    UndeclaredFlow,

    /// Wait elapsed without a response
    Timeout,

    /// Not owned by the acting field/team, or binding gone
    Membership,

    /// State-machine guard rejected the transition
    InvalidTransition,

    /// Unknown id
    NotFound,

    /// Duplicate registration
    AlreadyExists,

    /// Bad argument
    InvalidInput,

    /// Pending operation cancelled by a membership change
    Cancelled,

    /// Internal error (bug)
    Internal,
}

impl ErrorCode {
    /// Get default severity for this error code
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::Internal => Severity::Fatal,
            Self::Contention | Self::Timeout | Self::Cancelled => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Check if this error is typically recoverable
    pub fn is_typically_recoverable(&self) -> bool {
        match self {
            Self::Contention | Self::Timeout => true, // caller may retry
            Self::Cancelled => true,                  // caller may re-enter
            Self::UndeclaredFlow => true,             // fix declarations
            Self::NotFound | Self::AlreadyExists | Self::InvalidInput => true,
            Self::BlockedFlow | Self::Membership | Self::InvalidTransition => false,
            Self::Internal => false,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Contention => "CONTENTION",
            Self::BlockedFlow => "BLOCKED_FLOW",
            Self::UndeclaredFlow => "UNDECLARED_FLOW",
            Self::Timeout => "TIMEOUT",
            Self::Membership => "MEMBERSHIP",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

/// Severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational, not really an error
    Info,

    /// Transient, the caller is expected to retry or wait
    Warning,

    /// Operation failed
    Error,

    /// Core is in a bad state
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Suggested actions for error recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Retry the operation
    Retry {
        /// Milliseconds to wait before retry
        after_ms: u64,
    },

    /// Use a different approach
    Alternative {
        /// Description of the alternative
        description: String,
    },

    /// Declare the missing flow edge
    DeclareFlow { from: String, to: String },

    /// Contact support / report bug
    ReportBug,
}

impl From<serde_json::Error> for CoordinationError {
    fn from(e: serde_json::Error) -> Self {
        CoordinationError::invalid_input(format!("JSON error: {}", e))
    }
}

/// Result type alias for coordination operations
pub type CoordResult<T> = Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_is_recoverable_with_retry() {
        let res = ResourceId::new();
        let holder = ResourceId::new();
        let err = CoordinationError::contention(res, Some(holder));
        assert_eq!(err.code, ErrorCode::Contention);
        assert!(err.recoverable);
        assert_eq!(err.severity, Severity::Warning);
        assert!(matches!(
            err.suggested_action,
            Some(SuggestedAction::Retry { .. })
        ));
        let ctx = err.context.unwrap();
        assert_eq!(ctx.get("holder").unwrap(), &holder.to_string());
    }

    #[test]
    fn test_blocked_flow_not_recoverable() {
        let err = CoordinationError::blocked_flow(
            ScopeId::Team(crate::types::TeamId::new()),
            ScopeId::Team(crate::types::TeamId::new()),
        );
        assert!(!err.recoverable);
        assert!(err.message.contains("blocked"));
    }

    #[test]
    fn test_error_serialization() {
        let err = CoordinationError::membership("actor is not on the team");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("MEMBERSHIP"));

        let recovered: CoordinationError = serde_json::from_str(&json).unwrap();
        assert_eq!(recovered.code, ErrorCode::Membership);
    }

    #[test]
    fn test_actor_message_formatting() {
        let from = ScopeId::Team(crate::types::TeamId::new());
        let to = ScopeId::Team(crate::types::TeamId::new());
        let msg = CoordinationError::undeclared_flow(from, to).to_actor_message();
        assert!(msg.contains("No flow declared"));
        assert!(msg.contains("Declare a flow"));

        let msg = CoordinationError::timeout("pull", Duration::from_millis(250)).to_actor_message();
        assert!(msg.contains("Retry after 250ms"));
    }

    #[test]
    fn test_display_includes_code() {
        let err = CoordinationError::binding_gone("bind_x");
        assert!(err.to_string().starts_with("[MEMBERSHIP]"));
    }
}
