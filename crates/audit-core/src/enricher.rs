use std::collections::HashMap;
use std::sync::Arc;

use audit_context::Actor;
use audit_value::Value;
use indexmap::IndexMap;

use crate::client::{BoxFuture, DbClient};
use crate::error::{AuditError, Phase};
use crate::model::Action;

/// `fn(entities[], client, meta) -> contexts[]` from spec.md §4.7. Must
/// preserve the input length and order — the conformance suite checks this
/// directly by zipping the output back against the input batch.
pub type EntityEnricherFn = Arc<
    dyn for<'a> Fn(&'a [Value], &'a dyn DbClient, &'a EnrichMeta) -> BoxFuture<'a, Result<Vec<Value>, AuditError>>
        + Send
        + Sync,
>;

pub type ActorEnricherFn = Arc<
    dyn for<'a> Fn(&'a Actor, &'a dyn DbClient) -> BoxFuture<'a, Result<Value, AuditError>> + Send + Sync,
>;

/// What the intercepted call was, handed to enrichers as context (the
/// `meta` parameter in spec.md §4.7).
#[derive(Clone, Debug)]
pub struct EnrichMeta {
    pub model: String,
    pub action: Action,
}

/// Per-enricher error policy (spec.md §4.7): `fail` propagates and aborts
/// emission, `log` substitutes a fixed fallback and warns, `custom` derives
/// a fallback from the error.
#[derive(Clone)]
pub enum EnricherErrorPolicy {
    Fail,
    Log { fallback: Value },
    Custom(Arc<dyn Fn(&AuditError) -> Value + Send + Sync>),
}

impl EnricherErrorPolicy {
    fn recover(&self, err: AuditError) -> Result<Value, AuditError> {
        match self {
            EnricherErrorPolicy::Fail => Err(err),
            EnricherErrorPolicy::Log { fallback } => {
                tracing::warn!(phase = %err.phase(), error = %err, "enricher failed, using fallback");
                Ok(fallback.clone())
            }
            EnricherErrorPolicy::Custom(f) => Ok(f(&err)),
        }
    }
}

#[derive(Clone)]
pub struct EnricherSlot {
    pub enricher: EntityEnricherFn,
    pub on_error: EnricherErrorPolicy,
}

/// Everything the log emitter needs to attach context blobs, already
/// resolved for the whole call.
#[derive(Default)]
pub struct EnrichmentOutputs {
    /// model -> per-record context, same order as the batch it was built from.
    pub entity_contexts: HashMap<String, Vec<Value>>,
    /// aggregate type -> (aggregate id -> context).
    pub aggregate_contexts: HashMap<String, HashMap<String, Value>>,
    pub actor_context: Option<Value>,
}

/// Runs one call's entity-context enrichers. Called at most once per model
/// that appears in `records_by_model`, with the *entire* batch for that
/// model in one shot — never per-row — which is what keeps this N+1-free
/// (spec.md §4.7).
pub async fn enrich_entities(
    records_by_model: &IndexMap<String, Vec<Value>>,
    slots: &HashMap<String, EnricherSlot>,
    client: &dyn DbClient,
) -> Result<HashMap<String, Vec<Value>>, AuditError> {
    let mut out = HashMap::new();
    for (model, records) in records_by_model {
        let Some(slot) = slots.get(model) else {
            continue;
        };
        let meta = EnrichMeta {
            model: model.clone(),
            action: Action::Create, // placeholder action; callers needing the
                                     // real action per-record should not rely
                                     // on this field being authoritative for
                                     // mixed-action batches.
        };
        let contexts = match (slot.enricher)(records, client, &meta).await {
            Ok(contexts) => {
                if contexts.len() != records.len() {
                    return Err(AuditError::Enrichment {
                        phase: Phase::Enrichment,
                        message: format!(
                            "entity enricher for {model} returned {} contexts for {} records",
                            contexts.len(),
                            records.len()
                        ),
                        source: None,
                    });
                }
                contexts
            }
            Err(err) => match slot.on_error.recover(err) {
                Ok(fallback) => vec![fallback; records.len()],
                Err(err) => return Err(err),
            },
        };
        out.insert(model.clone(), contexts);
    }
    Ok(out)
}

/// Runs one call's aggregate-context enrichers, once per distinct aggregate
/// type present among the call's resolved aggregate roots.
pub async fn enrich_aggregates(
    roots_by_type: &IndexMap<String, Vec<String>>,
    slots: &HashMap<String, EnricherSlot>,
    client: &dyn DbClient,
) -> Result<HashMap<String, HashMap<String, Value>>, AuditError> {
    let mut out = HashMap::new();
    for (aggregate_type, ids) in roots_by_type {
        let Some(slot) = slots.get(aggregate_type) else {
            continue;
        };
        let values: Vec<Value> = ids.iter().map(|id| Value::Str(id.clone())).collect();
        let meta = EnrichMeta {
            model: aggregate_type.clone(),
            action: Action::Create,
        };
        let contexts = match (slot.enricher)(&values, client, &meta).await {
            Ok(contexts) if contexts.len() == ids.len() => contexts,
            Ok(contexts) => {
                return Err(AuditError::Enrichment {
                    phase: Phase::Enrichment,
                    message: format!(
                        "aggregate enricher for {aggregate_type} returned {} contexts for {} roots",
                        contexts.len(),
                        ids.len()
                    ),
                    source: None,
                });
            }
            Err(err) => match slot.on_error.recover(err) {
                Ok(fallback) => vec![fallback; ids.len()],
                Err(err) => return Err(err),
            },
        };
        let mut by_id = HashMap::new();
        for (id, ctx) in ids.iter().zip(contexts) {
            by_id.insert(id.clone(), ctx);
        }
        out.insert(aggregate_type.clone(), by_id);
    }
    Ok(out)
}

/// Runs the global actor enricher at most once per call, per spec.md §4.7.
pub async fn enrich_actor(
    actor: &Actor,
    enricher: Option<&ActorEnricherFn>,
    on_error: Option<&EnricherErrorPolicy>,
    client: &dyn DbClient,
) -> Result<Option<Value>, AuditError> {
    let Some(enricher) = enricher else {
        return Ok(None);
    };
    match enricher(actor, client).await {
        Ok(ctx) => Ok(Some(ctx)),
        Err(err) => match on_error.unwrap_or(&EnricherErrorPolicy::Fail).recover(err) {
            Ok(fallback) => Ok(Some(fallback)),
            Err(err) => Err(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopClient;

    #[async_trait::async_trait]
    impl DbClient for NoopClient {
        fn delegate(&self, _model: &str) -> Option<&dyn crate::client::ModelDelegate> {
            None
        }

        async fn transaction<'a>(
            &'a self,
            work: Box<
                dyn FnOnce(&'a dyn DbClient) -> BoxFuture<'a, Result<(), AuditError>> + Send + 'a,
            >,
        ) -> Result<(), AuditError> {
            work(self).await
        }
    }

    #[tokio::test]
    async fn entity_enricher_invoked_once_per_model_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let slot = EnricherSlot {
            enricher: Arc::new(move |records, _client, _meta| {
                let calls = calls_clone.clone();
                let records = records.to_vec();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(records.iter().map(|_| Value::Str("ctx".into())).collect())
                })
            }),
            on_error: EnricherErrorPolicy::Fail,
        };

        let mut slots = HashMap::new();
        slots.insert("Post".to_string(), slot);

        let mut batch = IndexMap::new();
        batch.insert(
            "Post".to_string(),
            vec![Value::Str("p1".into()), Value::Str("p2".into())],
        );

        let client = NoopClient;
        let out = enrich_entities(&batch, &slots, &client).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out["Post"].len(), 2);
    }

    #[tokio::test]
    async fn enricher_error_with_log_policy_substitutes_fallback() {
        let slot = EnricherSlot {
            enricher: Arc::new(|_records, _client, _meta| {
                Box::pin(async move {
                    Err(AuditError::Enrichment {
                        phase: Phase::Enrichment,
                        message: "boom".into(),
                        source: None,
                    })
                })
            }),
            on_error: EnricherErrorPolicy::Log {
                fallback: Value::Null,
            },
        };
        let mut slots = HashMap::new();
        slots.insert("Post".to_string(), slot);
        let mut batch = IndexMap::new();
        batch.insert("Post".to_string(), vec![Value::Str("p1".into())]);

        let client = NoopClient;
        let out = enrich_entities(&batch, &slots, &client).await.unwrap();
        assert_eq!(out["Post"], vec![Value::Null]);
    }
}
