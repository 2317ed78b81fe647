//! Error taxonomy for scope and engine operations.
//!
//! Library APIs return [`ScopeError`] so callers can tell a bad argument from
//! a use-after-close without string matching.  Failures reported by the
//! native engine travel as [`DispatchError`].

use thiserror::Error;

use crate::handle::ResourceId;

/// Crate-wide result alias.
pub type Result<T, E = ScopeError> = std::result::Result<T, E>;

/// Errors surfaced by [`ResourceScope`](crate::ResourceScope) and the
/// resources it owns.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScopeError {
    /// A required shape or parameter was missing or out of range.
    /// Nothing was allocated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The scope (or array) was already closed.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The dispatch service rejected the call.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl ScopeError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn closed(what: &str) -> Self {
        Self::IllegalState(format!("{what} has been closed already"))
    }

    /// Returns `true` for [`ScopeError::IllegalState`].
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_))
    }

    /// Returns `true` for [`ScopeError::InvalidArgument`].
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

/// A failed call into the dispatch service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine call `{operation}` failed: {message}")]
pub struct DispatchError {
    /// Operation name or C entry point that failed.
    pub operation: String,
    /// Engine-provided detail.
    pub message: String,
}

impl DispatchError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// One resource that could not be released during a cascading close.
///
/// Collected into a [`CloseReport`](crate::scope::CloseReport) instead of
/// being raised, so the rest of the cascade still runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseFailure {
    pub resource: ResourceId,
    pub error: ScopeError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_converts() {
        let err: ScopeError = DispatchError::new("_zeros", "out of memory").into();
        assert!(matches!(err, ScopeError::Dispatch(_)));
        assert_eq!(
            err.to_string(),
            "engine call `_zeros` failed: out of memory"
        );
    }

    #[test]
    fn test_error_kind_predicates() {
        assert!(ScopeError::closed("scope").is_illegal_state());
        assert!(ScopeError::invalid("shape").is_invalid_argument());
        assert!(!ScopeError::invalid("shape").is_illegal_state());
        assert_eq!(
            ScopeError::closed("scope").to_string(),
            "illegal state: scope has been closed already"
        );
    }
}
