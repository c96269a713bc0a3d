use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use audit_value::Value;

use crate::client::{BoxFuture, DbClient};
use crate::differ::RedactTransformer;
use crate::enricher::{ActorEnricherFn, EnricherErrorPolicy, EnricherSlot};
use crate::error::{AuditError, ErrorPolicy, Phase};

/// Extracts the self id of an already-fetched record. Pure, because the
/// self id is always a field already present on the record.
pub type IdResolverFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Resolves one declared aggregate root's id for a record, with access to
/// the base client for lookups that cross a relation (spec.md §4.5).
pub type AggregateResolveFn = Arc<
    dyn for<'a> Fn(&'a Value, &'a dyn DbClient) -> BoxFuture<'a, Result<Option<Value>, AuditError>>
        + Send
        + Sync,
>;

/// One additional aggregate root an entity is indexed under, beyond itself.
#[derive(Clone)]
pub struct AggregateRoot {
    pub category: String,
    pub r#type: String,
    pub resolve: AggregateResolveFn,
}

/// The registered configuration for one loggable model (spec.md §4.5).
#[derive(Clone)]
pub struct EntityConfig {
    pub entity_type: String,
    pub category: String,
    pub id_resolver: IdResolverFn,
    pub aggregates: Vec<AggregateRoot>,
    pub exclude_self: bool,
    pub exclude_fields: HashSet<String>,
    pub entity_context: Option<EnricherSlot>,
}

impl EntityConfig {
    pub fn builder(entity_type: impl Into<String>, id_resolver: IdResolverFn) -> EntityConfigBuilder {
        EntityConfigBuilder {
            entity_type: entity_type.into(),
            category: "model".to_string(),
            id_resolver,
            aggregates: Vec::new(),
            exclude_self: false,
            exclude_fields: HashSet::new(),
            entity_context: None,
        }
    }
}

pub struct EntityConfigBuilder {
    entity_type: String,
    category: String,
    id_resolver: IdResolverFn,
    aggregates: Vec<AggregateRoot>,
    exclude_self: bool,
    exclude_fields: HashSet<String>,
    entity_context: Option<EnricherSlot>,
}

impl EntityConfigBuilder {
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn aggregate(
        mut self,
        category: impl Into<String>,
        r#type: impl Into<String>,
        resolve: AggregateResolveFn,
    ) -> Self {
        self.aggregates.push(AggregateRoot {
            category: category.into(),
            r#type: r#type.into(),
            resolve,
        });
        self
    }

    pub fn exclude_self(mut self) -> Self {
        self.exclude_self = true;
        self
    }

    pub fn exclude_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn entity_context(mut self, slot: EnricherSlot) -> Self {
        self.entity_context = Some(slot);
        self
    }

    pub fn build(self) -> EntityConfig {
        EntityConfig {
            entity_type: self.entity_type,
            category: self.category,
            id_resolver: self.id_resolver,
            aggregates: self.aggregates,
            exclude_self: self.exclude_self,
            exclude_fields: self.exclude_fields,
            entity_context: self.entity_context,
        }
    }
}

/// The registered mapping of model name to entity config (spec.md §2 item 2).
/// Immutable and process-wide once built, same invariant as `AggregateConfig`
/// in spec.md §5.
#[derive(Clone, Default)]
pub struct AggregateConfig {
    entities: HashMap<String, EntityConfig>,
}

impl AggregateConfig {
    pub fn get(&self, model: &str) -> Option<&EntityConfig> {
        self.entities.get(model)
    }

    pub fn is_registered(&self, model: &str) -> bool {
        self.entities.contains_key(model)
    }

    pub fn models(&self) -> impl Iterator<Item = (&String, &EntityConfig)> {
        self.entities.iter()
    }
}

#[derive(Clone, Default)]
pub struct DiffingConfig {
    pub exclude_fields: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct SecurityConfig {
    pub redact_fields: Vec<String>,
    pub transformer: Option<Arc<RedactTransformer>>,
}

#[derive(Clone, Copy, Debug)]
pub struct PerformanceConfig {
    pub await_write: bool,
    pub sampling: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            await_write: true,
            sampling: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NestedOperationsConfig {
    pub update_fetch_before_operation: bool,
    pub delete_fetch_before_operation: bool,
}

impl Default for NestedOperationsConfig {
    fn default() -> Self {
        Self {
            update_fetch_before_operation: true,
            delete_fetch_before_operation: true,
        }
    }
}

#[derive(Clone, Default)]
pub struct ActorEnricherConfig {
    pub enricher: Option<ActorEnricherFn>,
    pub on_error: Option<EnricherErrorPolicy>,
}

/// Default `ErrorPolicy` per error category (spec.md §7). Per-call overrides
/// aren't modeled — the source doesn't expose them below the config level
/// either.
#[derive(Clone)]
pub struct ErrorPolicies {
    pub pre_fetch: ErrorPolicy,
    pub resolver: ErrorPolicy,
    pub diff: ErrorPolicy,
    pub emission_sync: ErrorPolicy,
}

impl Default for ErrorPolicies {
    fn default() -> Self {
        Self {
            pre_fetch: ErrorPolicy::Log,
            resolver: ErrorPolicy::Log,
            diff: ErrorPolicy::Log,
            emission_sync: ErrorPolicy::Throw,
        }
    }
}

/// Context handed to the optional global error handler (spec.md §7).
pub struct ErrorHandlerContext<'a> {
    pub phase: Phase,
    pub model_name: &'a str,
    pub operation: &'a str,
    pub error: &'a AuditError,
}

/// What the global handler decides once it's seen an error, overriding the
/// phase's default `ErrorPolicy` when it returns `Abort`.
pub enum HandlerOutcome {
    UseDefaultPolicy,
    Abort(AuditError),
}

pub type AuditErrorHandler = Arc<dyn Fn(&ErrorHandlerContext) -> HandlerOutcome + Send + Sync>;

/// The fully assembled, immutable engine configuration (spec.md §6.5).
#[derive(Clone)]
pub struct AuditConfig {
    pub aggregate_mapping: AggregateConfig,
    pub diffing: DiffingConfig,
    pub security: SecurityConfig,
    pub performance: PerformanceConfig,
    pub exclude_models: HashSet<String>,
    pub nested_operations: NestedOperationsConfig,
    pub context_enricher_actor: ActorEnricherConfig,
    /// `aggregateContextMap[aggregateType]` from spec.md §4.7, keyed by the
    /// aggregate's declared `type` (not the source model).
    pub aggregate_context: HashMap<String, EnricherSlot>,
    pub error_policies: ErrorPolicies,
    pub on_audit_error_handler: Option<AuditErrorHandler>,
}

impl AuditConfig {
    pub fn builder() -> AuditConfigBuilder {
        AuditConfigBuilder::default()
    }

    /// Applies the error-handler-then-policy precedence from spec.md §7:
    /// the global handler runs first (if configured) and can override the
    /// phase's default policy; otherwise the phase's policy decides whether
    /// the call aborts.
    pub fn handle(
        &self,
        phase: Phase,
        model_name: &str,
        operation: &str,
        err: AuditError,
    ) -> Result<(), AuditError> {
        if let Some(handler) = &self.on_audit_error_handler {
            let ctx = ErrorHandlerContext {
                phase,
                model_name,
                operation,
                error: &err,
            };
            if let HandlerOutcome::Abort(override_err) = handler(&ctx) {
                return Err(override_err);
            }
        }

        let policy = match phase {
            Phase::PreFetch => &self.error_policies.pre_fetch,
            Phase::Resolver => &self.error_policies.resolver,
            Phase::Diff => &self.error_policies.diff,
            Phase::Emission if self.performance.await_write => &self.error_policies.emission_sync,
            _ => &ErrorPolicy::Log,
        };
        policy.apply(err, &format!("{model_name}.{operation}"))
    }
}

#[derive(Default)]
pub struct AuditConfigBuilder {
    entities: HashMap<String, EntityConfig>,
    diffing: DiffingConfig,
    security: SecurityConfig,
    performance: Option<PerformanceConfig>,
    exclude_models: HashSet<String>,
    nested_operations: Option<NestedOperationsConfig>,
    context_enricher_actor: ActorEnricherConfig,
    aggregate_context: HashMap<String, EnricherSlot>,
    error_policies: Option<ErrorPolicies>,
    on_audit_error_handler: Option<AuditErrorHandler>,
}

impl AuditConfigBuilder {
    pub fn register(mut self, model: impl Into<String>, entity: EntityConfig) -> Self {
        self.entities.insert(model.into(), entity);
        self
    }

    pub fn exclude_fields_globally<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.diffing
            .exclude_fields
            .extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn redact_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.security.redact_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn redact_transformer(mut self, transformer: Arc<RedactTransformer>) -> Self {
        self.security.transformer = Some(transformer);
        self
    }

    pub fn performance(mut self, performance: PerformanceConfig) -> Self {
        self.performance = Some(performance);
        self
    }

    pub fn exclude_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_models.extend(models.into_iter().map(Into::into));
        self
    }

    pub fn nested_operations(mut self, config: NestedOperationsConfig) -> Self {
        self.nested_operations = Some(config);
        self
    }

    pub fn actor_enricher(mut self, enricher: ActorEnricherFn, on_error: EnricherErrorPolicy) -> Self {
        self.context_enricher_actor = ActorEnricherConfig {
            enricher: Some(enricher),
            on_error: Some(on_error),
        };
        self
    }

    pub fn aggregate_context(mut self, aggregate_type: impl Into<String>, slot: EnricherSlot) -> Self {
        self.aggregate_context.insert(aggregate_type.into(), slot);
        self
    }

    pub fn error_policies(mut self, policies: ErrorPolicies) -> Self {
        self.error_policies = Some(policies);
        self
    }

    pub fn on_audit_error(mut self, handler: AuditErrorHandler) -> Self {
        self.on_audit_error_handler = Some(handler);
        self
    }

    /// Validates the accumulated registrations and freezes them into an
    /// `AuditConfig`. Fails with `AuditError::Configuration` synchronously —
    /// spec.md §7 kind 1 is the one error category raised at build time
    /// rather than during a call.
    pub fn build(self) -> Result<AuditConfig, AuditError> {
        if self.performance.map(|p| p.sampling).unwrap_or(1.0) < 0.0 {
            return Err(AuditError::Configuration {
                phase: Phase::Configuration,
                message: "performance.sampling must be within [0, 1)".to_string(),
            });
        }

        for (model, entity) in &self.entities {
            if entity.entity_type.is_empty() {
                return Err(AuditError::Configuration {
                    phase: Phase::Configuration,
                    message: format!("entity config for {model} is missing a type"),
                });
            }
        }

        Ok(AuditConfig {
            aggregate_mapping: AggregateConfig {
                entities: self.entities,
            },
            diffing: self.diffing,
            security: self.security,
            performance: self.performance.unwrap_or_default(),
            exclude_models: self.exclude_models,
            nested_operations: self.nested_operations.unwrap_or_default(),
            context_enricher_actor: self.context_enricher_actor,
            aggregate_context: self.aggregate_context,
            error_policies: self.error_policies.unwrap_or_default(),
            on_audit_error_handler: self.on_audit_error_handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_rejects_missing_entity_type() {
        let id_resolver: IdResolverFn = Arc::new(|v: &Value| v.get("id").cloned());
        let entity = EntityConfigBuilder {
            entity_type: String::new(),
            category: "model".into(),
            id_resolver,
            aggregates: vec![],
            exclude_self: false,
            exclude_fields: HashSet::new(),
            entity_context: None,
        }
        .build();

        let err = AuditConfig::builder()
            .register("Post", entity)
            .build()
            .unwrap_err();
        assert_eq!(err.phase(), Phase::Configuration);
    }

    #[test]
    fn build_succeeds_with_valid_registration() {
        let id_resolver: IdResolverFn = Arc::new(|v: &Value| v.get("id").cloned());
        let entity = EntityConfig::builder("User", id_resolver).build();
        let config = AuditConfig::builder().register("User", entity).build().unwrap();
        assert!(config.aggregate_mapping.is_registered("User"));
        assert!(!config.aggregate_mapping.is_registered("Post"));
    }
}
