//! The ambient, per-request state an audited call reads at every emission.
//!
//! Modeled after the scoped-override shape of `core-resolver`'s
//! `RequestContext` (`RequestContext::with_override` stacks a new context in
//! front of the current one for the lifetime of a block), but bound with
//! `tokio::task_local!` instead of being threaded as an explicit argument —
//! per spec.md §9, the ambient-context machinery is the one seam that must
//! keep "implicit value bound to the current scope" semantics, cancellation
//! included, rather than becoming a global singleton or a parameter every
//! function in the pipeline has to carry.

use std::future::Future;
use std::sync::Arc;

use audit_value::Value;

/// Who performed the action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub category: String,
    pub r#type: String,
    pub id: String,
    pub name: Option<String>,
}

/// The inbound request the mutation was made under, if any.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct RequestInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub path: Option<String>,
    pub method: Option<String>,
}

/// Ambient per-request state, entered at a request boundary and borrowed
/// for the lifetime of that scope (spec.md §3).
#[derive(Clone, Debug, PartialEq)]
pub struct AuditContext {
    pub actor: Actor,
    pub request: Option<RequestInfo>,
    pub metadata: Option<Value>,
}

tokio::task_local! {
    static CURRENT: Arc<AuditContext>;
}

impl AuditContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            request: None,
            metadata: None,
        }
    }

    pub fn with_request(mut self, request: RequestInfo) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Runs `fut` with `self` bound as the ambient context. A nested call to
    /// `scope` inside `fut` shadows this one for its own sub-scope and
    /// restores it on return, same as `RequestContext::with_override`
    /// stacking and unstacking overrides.
    pub async fn scope<F, T>(self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        CURRENT.scope(Arc::new(self), fut).await
    }

    /// The context for the currently-executing task, if one is in scope.
    /// Returns `None` for mutations run outside any `AuditContext::scope`
    /// block — spec.md §8's "no log without context" property relies on
    /// this returning `None` rather than some default actor.
    pub fn current() -> Option<Arc<AuditContext>> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }
}
