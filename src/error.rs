//! Error taxonomy for the dispatch core
//!
//! Component boundaries return `CoreError` so callers can match on the kind
//! instead of parsing strings. Every variant carries a stable code that is
//! safe to expose to clients.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced at component boundaries.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input violates a stated constraint.
    #[error("validation failed at '{field}': {message}")]
    Validation { field: String, message: String },

    /// Optimistic concurrency failure; reload and retry.
    #[error("version conflict on {entity} {id}")]
    VersionConflict { entity: &'static str, id: Uuid },

    /// Business precondition not met (e.g. order already assigned).
    #[error("conflict: {message}")]
    Conflict { message: String, ids: Vec<Uuid> },

    /// External provider failed or its circuit is open.
    #[error("provider '{provider}' unavailable: {message}")]
    ProviderUnavailable { provider: &'static str, message: String },

    /// Solver exhausted its budget without a feasible solution.
    #[error("solve budget exhausted")]
    BudgetExceeded,

    /// Work aborted due to caller cancel or deadline.
    #[error("cancelled")]
    Cancelled,

    /// Job lost its worker (process crash); must be resubmitted.
    #[error("job orphaned: no progress for {stale_seconds}s")]
    Orphaned { stale_seconds: u64 },

    /// Unexpected condition; logged with a correlation id.
    #[error("internal error [{correlation_id}]")]
    Internal { correlation_id: Uuid },
}

impl CoreError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    pub fn conflict(message: impl Into<String>, ids: Vec<Uuid>) -> Self {
        Self::Conflict { message: message.into(), ids }
    }

    pub fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        Self::ProviderUnavailable { provider, message: message.into() }
    }

    /// Wrap an unexpected error, logging it with a fresh correlation id.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        let correlation_id = Uuid::new_v4();
        tracing::error!(%correlation_id, "internal error: {}", err);
        Self::Internal { correlation_id }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::Conflict { .. } => "CONFLICT",
            Self::ProviderUnavailable { .. } => "PROVIDER_UNAVAILABLE",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::Cancelled => "CANCELLED",
            Self::Orphaned { .. } => "ORPHANED",
            Self::Internal { .. } => "INTERNAL",
        }
    }
}

/// Convenience alias used across the core.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(CoreError::validation("date", "missing").code(), "VALIDATION");
        assert_eq!(CoreError::BudgetExceeded.code(), "BUDGET_EXCEEDED");
        assert_eq!(CoreError::Cancelled.code(), "CANCELLED");
        assert_eq!(
            CoreError::VersionConflict { entity: "order", id: Uuid::nil() }.code(),
            "VERSION_CONFLICT"
        );
        assert_eq!(CoreError::Orphaned { stale_seconds: 900 }.code(), "ORPHANED");
        assert_eq!(
            CoreError::provider("routing", "circuit open").code(),
            "PROVIDER_UNAVAILABLE"
        );
    }

    #[test]
    fn test_conflict_carries_offending_ids() {
        let id = Uuid::new_v4();
        let err = CoreError::conflict("order already assigned", vec![id]);
        match err {
            CoreError::Conflict { ids, .. } => assert_eq!(ids, vec![id]),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_display_includes_field_path() {
        let err = CoreError::validation("orders[2].items", "at least one line item required");
        assert!(err.to_string().contains("orders[2].items"));
    }

    #[test]
    fn test_internal_hides_detail_behind_correlation_id() {
        let err = CoreError::internal("connection reset by peer");
        let shown = err.to_string();
        assert!(!shown.contains("connection reset"), "detail must not leak: {}", shown);
        assert_eq!(err.code(), "INTERNAL");
    }
}
