//! The audit-logging middleware core: walks a mutating call's nested
//! operations, pre-fetches before-states, diffs after the write runs,
//! resolves aggregate ids, enriches context in batches, and emits log rows.
//! Everything here is pure Rust plus the two injected collaborators
//! ([`schema::SchemaMetadata`], [`client::DbClient`]) and the log sink
//! ([`emitter::LogSink`]) — no concrete ORM binding lives in this crate.

pub mod after;
pub mod client;
pub mod config;
pub mod differ;
pub mod emitter;
pub mod enricher;
pub mod error;
pub mod interceptor;
pub mod model;
pub mod prefetch;
pub mod resolver;
pub mod schema;
pub mod walker;

pub use client::{BoxFuture, DbClient, ModelDelegate};
pub use config::{
    AggregateConfig, AggregateResolveFn, AggregateRoot, ActorEnricherConfig, AuditConfig,
    AuditConfigBuilder, AuditErrorHandler, DiffingConfig, EntityConfig, EntityConfigBuilder,
    ErrorHandlerContext, ErrorPolicies, HandlerOutcome, IdResolverFn, NestedOperationsConfig,
    PerformanceConfig, SecurityConfig,
};
pub use emitter::{EmitInput, LogSink};
pub use enricher::{ActorEnricherFn, EnricherErrorPolicy, EnricherSlot, EntityEnricherFn};
pub use error::{AuditError, ErrorPolicy, Phase, WithContext};
pub use interceptor::Interceptor;
pub use model::{Action, NestedOp, OperationCall, OperationKind, ResolvedId};
pub use schema::{ConstraintKind, RelationField, SchemaMetadata, UniqueConstraint};

pub use audit_context::{Actor, AuditContext, RequestInfo};
pub use audit_value::Value;
