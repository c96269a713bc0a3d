use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// The phase in which an `AuditError` originated, per spec.md §7's error
/// kinds. Carried on every error so `onAuditErrorHandler` callers can branch
/// on it without downcasting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Configuration,
    PreFetch,
    Resolver,
    Diff,
    Enrichment,
    Emission,
    Cancelled,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Configuration => "configuration",
            Phase::PreFetch => "pre-fetch",
            Phase::Resolver => "resolver",
            Phase::Diff => "diff",
            Phase::Enrichment => "enrichment",
            Phase::Emission => "emission",
            Phase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Mirrors `exo-sql`'s `DatabaseError`: one enum for everything the engine
/// can fail on, each variant carrying enough to reconstruct a message and,
/// where applicable, a source error.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("[{phase}] configuration error: {message}")]
    Configuration { phase: Phase, message: String },

    #[error("[{phase}] pre-fetch failed: {message}")]
    PreFetch {
        phase: Phase,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[{phase}] aggregate resolver failed: {message}")]
    Resolver { phase: Phase, message: String },

    #[error("[{phase}] diff failed: {message}")]
    Diff { phase: Phase, message: String },

    #[error("[{phase}] enrichment failed: {message}")]
    Enrichment {
        phase: Phase,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[{phase}] emission failed: {message}")]
    Emission {
        phase: Phase,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[{phase}] the enclosing scope was cancelled")]
    Cancelled { phase: Phase },

    #[error("{0} {1}")]
    WithContext(String, #[source] Box<AuditError>),
}

impl AuditError {
    pub fn phase(&self) -> Phase {
        match self {
            AuditError::Configuration { phase, .. }
            | AuditError::PreFetch { phase, .. }
            | AuditError::Resolver { phase, .. }
            | AuditError::Diff { phase, .. }
            | AuditError::Enrichment { phase, .. }
            | AuditError::Emission { phase, .. }
            | AuditError::Cancelled { phase } => *phase,
            AuditError::WithContext(_, inner) => inner.phase(),
        }
    }

    pub fn with_context(self, context: impl Into<String>) -> AuditError {
        AuditError::WithContext(context.into(), Box::new(self))
    }
}

pub trait WithContext {
    fn with_context(self, context: impl Into<String>) -> Self;
}

impl<T> WithContext for Result<T, AuditError> {
    fn with_context(self, context: impl Into<String>) -> Result<T, AuditError> {
        self.map_err(|e| e.with_context(context))
    }
}

/// How a given error category (phase) should be handled, per spec.md §7.
#[derive(Clone)]
pub enum ErrorPolicy {
    /// Propagate, abort the whole call and its transaction.
    Throw,
    /// Warn and continue with a null/fallback.
    Log,
    /// Silent.
    Ignore,
    /// User-supplied handler; if it panics the strategy is not applied.
    Custom(Arc<dyn Fn(&AuditError) + Send + Sync>),
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Throw => write!(f, "Throw"),
            ErrorPolicy::Log => write!(f, "Log"),
            ErrorPolicy::Ignore => write!(f, "Ignore"),
            ErrorPolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl ErrorPolicy {
    /// Applies the policy to `err`, returning `Err` only when the call
    /// should abort. `context` is forwarded to the optional global handler
    /// described in spec.md §7 (`{phase, modelName, operation, params, error}`);
    /// here it's a pre-rendered description since `audit-core` doesn't know
    /// the original ORM's param shape.
    pub fn apply(&self, err: AuditError, context: &str) -> Result<(), AuditError> {
        match self {
            ErrorPolicy::Throw => Err(err),
            ErrorPolicy::Log => {
                tracing::warn!(phase = %err.phase(), context, error = %err, "audit error, continuing");
                Ok(())
            }
            ErrorPolicy::Ignore => {
                tracing::debug!(phase = %err.phase(), context, error = %err, "audit error, ignored");
                Ok(())
            }
            ErrorPolicy::Custom(handler) => {
                handler(&err);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_context_preserves_source_chain() {
        let err = AuditError::Resolver {
            phase: Phase::Resolver,
            message: "boom".into(),
        }
        .with_context("while resolving Post#1");
        assert_eq!(err.phase(), Phase::Resolver);
        assert!(err.to_string().contains("while resolving Post#1"));
    }

    #[test]
    fn log_policy_never_errors() {
        let err = AuditError::Diff {
            phase: Phase::Diff,
            message: "bad".into(),
        };
        assert!(ErrorPolicy::Log.apply(err, "ctx").is_ok());
    }

    #[test]
    fn throw_policy_propagates() {
        let err = AuditError::Diff {
            phase: Phase::Diff,
            message: "bad".into(),
        };
        assert!(ErrorPolicy::Throw.apply(err, "ctx").is_err());
    }
}
