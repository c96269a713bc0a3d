use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use audit_context::AuditContext;
use audit_value::Value;
use indexmap::IndexMap;

use crate::after::{self, AfterStates};
use crate::client::{BoxFuture, DbClient};
use crate::config::AuditConfig;
use crate::differ;
use crate::emitter::{self, EmitInput, LogSink};
use crate::enricher::{self, EnricherSlot};
use crate::error::{AuditError, Phase};
use crate::model::{Action, NestedOp, OperationCall, OperationKeyword, OperationKind, resolve_upsert_action};
use crate::prefetch::{self, PreFetchResult};
use crate::resolver;
use crate::schema::SchemaMetadata;

/// Wires the pre-fetcher, differ, resolver, enrichers and emitter into the
/// single pipeline a mutating call runs through (spec.md §4.1, §4.9).
pub struct Interceptor {
    config: Arc<AuditConfig>,
    schema: Arc<dyn SchemaMetadata>,
    sink: Arc<dyn LogSink>,
}

/// One (model, before, after, action) triple a diff and a set of aggregate
/// ids will be computed for. Built from the root call and every nested op
/// that actually ran.
struct Candidate {
    model: String,
    before: Option<Value>,
    after: Option<Value>,
    action: Action,
}

impl Interceptor {
    pub fn new(config: Arc<AuditConfig>, schema: Arc<dyn SchemaMetadata>, sink: Arc<dyn LogSink>) -> Self {
        Self { config, schema, sink }
    }

    /// Runs `execute` — the actual write — audited end to end. `execute`
    /// receives the same client used for pre-fetching, so implementations
    /// that enlist onto an open transaction see a consistent view
    /// throughout (spec.md §5).
    pub async fn intercept<'a, F>(
        &'a self,
        call: OperationCall,
        client: &'a dyn DbClient,
        execute: F,
    ) -> Result<Value, AuditError>
    where
        F: FnOnce(&'a dyn DbClient) -> BoxFuture<'a, Result<Value, AuditError>> + Send + 'a,
    {
        let Some(ctx) = AuditContext::current() else {
            return execute(client).await;
        };
        if self.config.exclude_models.contains(&call.model) {
            return execute(client).await;
        }
        if !resolver::is_loggable(&call.model, &self.config.aggregate_mapping) {
            return execute(client).await;
        }

        let pre = match prefetch::pre_fetch(
            &call,
            self.schema.as_ref(),
            client,
            &self.config.nested_operations,
        )
        .await
        {
            Ok(pre) => pre,
            Err(err) => {
                self.config.handle(Phase::PreFetch, &call.model, "pre-fetch", err)?;
                PreFetchResult::default()
            }
        };

        let result = execute(client).await?;

        let after = match after::collect_after_states(&call, &result, &pre.nested_ops, &pre.snapshots, client).await
        {
            Ok(a) => a,
            Err(err) => {
                self.config.handle(Phase::PreFetch, &call.model, "after-state", err)?;
                AfterStates::default()
            }
        };

        if let Err(err) = self.finish(&call, &ctx, &pre, &after, client).await {
            self.config.handle(err.phase(), &call.model, "finish", err)?;
        }

        Ok(result)
    }

    async fn finish(
        &self,
        call: &OperationCall,
        ctx: &AuditContext,
        pre: &PreFetchResult,
        after: &AfterStates,
        client: &dyn DbClient,
    ) -> Result<(), AuditError> {
        let candidates = collect_candidates(call, &pre.nested_ops, pre, after);

        let mut diffed = Vec::new();
        for candidate in candidates {
            let Some(entity) = self.config.aggregate_mapping.get(&candidate.model) else {
                continue;
            };
            if self.config.exclude_models.contains(&candidate.model) {
                continue;
            }

            let record = candidate.after.clone().or_else(|| candidate.before.clone());
            let Some(record) = record else { continue };

            let Some(raw_id) = (entity.id_resolver)(&record) else {
                tracing::debug!(model = %candidate.model, "id_resolver returned no id, skipping");
                continue;
            };
            let Ok(entity_id) = audit_value::normalize(&raw_id) else {
                tracing::debug!(model = %candidate.model, "entity id failed to normalize, skipping");
                continue;
            };

            let resolved_ids = resolver::resolve_ids(&candidate.model, &record, &self.config, client).await?;
            if resolved_ids.is_empty() {
                continue;
            }

            let mut exclude_fields = self.config.diffing.exclude_fields.clone();
            exclude_fields.extend(entity.exclude_fields.iter().cloned());

            let changes = match differ::diff(
                candidate.before.as_ref(),
                candidate.after.as_ref(),
                &exclude_fields,
                &self.config.security.redact_fields,
                self.config.security.transformer.as_deref(),
            ) {
                Ok(changes) => changes,
                Err(err) => {
                    self.config.handle(Phase::Diff, &candidate.model, "diff", err)?;
                    continue;
                }
            };

            if candidate.action == Action::Update && changes.is_none() {
                continue;
            }

            let before = redact_if_present(
                candidate.before.as_ref(),
                &self.config.security.redact_fields,
                self.config.security.transformer.as_deref(),
            )?;
            let after = redact_if_present(
                candidate.after.as_ref(),
                &self.config.security.redact_fields,
                self.config.security.transformer.as_deref(),
            )?;

            diffed.push((candidate.model.clone(), entity_id, record, resolved_ids, candidate.action, before, after, changes));
        }

        if diffed.is_empty() {
            return Ok(());
        }

        let mut records_by_model: IndexMap<String, Vec<Value>> = IndexMap::new();
        for (model, _, record, ..) in &diffed {
            records_by_model.entry(model.clone()).or_default().push(record.clone());
        }
        let entity_slots = self.entity_context_slots();
        let entity_contexts = enricher::enrich_entities(&records_by_model, &entity_slots, client).await?;
        let mut cursor: HashMap<String, usize> = HashMap::new();

        let mut roots_by_type: IndexMap<String, Vec<String>> = IndexMap::new();
        for (_, _, _, resolved_ids, ..) in &diffed {
            for id in resolved_ids {
                roots_by_type.entry(id.aggregate_type.clone()).or_default().push(id.aggregate_id.clone());
            }
        }
        let aggregate_contexts = enricher::enrich_aggregates(&roots_by_type, &self.config.aggregate_context, client).await?;

        let actor_context = enricher::enrich_actor(
            &ctx.actor,
            self.config.context_enricher_actor.enricher.as_ref(),
            self.config.context_enricher_actor.on_error.as_ref(),
            client,
        )
        .await?;

        let request_context = build_request_context(ctx);
        let created_at_unix_millis = now_unix_millis();

        let mut entries = Vec::new();
        for (model, entity_id, _record, resolved_ids, action, before, after, changes) in diffed {
            let entity_context = {
                let idx = cursor.entry(model.clone()).or_insert(0);
                let ctx = entity_contexts.get(&model).and_then(|v| v.get(*idx)).cloned();
                *idx += 1;
                ctx
            };
            let entity = self
                .config
                .aggregate_mapping
                .get(&model)
                .expect("checked above");

            let input = EmitInput {
                entity_category: entity.category.clone(),
                entity_type: entity.entity_type.clone(),
                entity_id,
                entity_context,
                resolved_ids,
                aggregate_contexts: aggregate_contexts.clone(),
                actor: ctx.actor.clone(),
                actor_context: actor_context.clone(),
                action,
                before,
                after,
                changes,
                request_context: request_context.clone(),
                created_at_unix_millis,
            };
            entries.extend(emitter::build_entries(input));
        }

        emitter::emit(entries, self.sink.clone(), &self.config.performance).await
    }

    fn entity_context_slots(&self) -> HashMap<String, EnricherSlot> {
        self.config
            .aggregate_mapping
            .models()
            .filter_map(|(model, cfg)| cfg.entity_context.clone().map(|slot| (model.clone(), slot)))
            .collect()
    }
}

fn redact_if_present(
    record: Option<&Value>,
    redact_fields: &[String],
    transformer: Option<&differ::RedactTransformer>,
) -> Result<Option<Value>, AuditError> {
    match record {
        Some(r) => Ok(Some(differ::redact_record(r, redact_fields, transformer)?)),
        None => Ok(None),
    }
}

fn build_request_context(ctx: &AuditContext) -> Option<Value> {
    let mut map = BTreeMap::new();
    if let Some(request) = &ctx.request {
        if let Some(v) = &request.ip_address {
            map.insert("ipAddress".to_string(), Value::Str(v.clone()));
        }
        if let Some(v) = &request.user_agent {
            map.insert("userAgent".to_string(), Value::Str(v.clone()));
        }
        if let Some(v) = &request.path {
            map.insert("path".to_string(), Value::Str(v.clone()));
        }
        if let Some(v) = &request.method {
            map.insert("method".to_string(), Value::Str(v.clone()));
        }
    }
    if let Some(metadata) = &ctx.metadata {
        map.insert("metadata".to_string(), metadata.clone());
    }
    if map.is_empty() { None } else { Some(Value::Map(map)) }
}

fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn zip_before_after(before: Vec<Value>, after: Vec<Value>) -> Vec<(Option<Value>, Option<Value>)> {
    let len = before.len().max(after.len());
    let mut before = before.into_iter();
    let mut after = after.into_iter();
    (0..len).map(|_| (before.next(), after.next())).collect()
}

fn root_candidate(call: &OperationCall, pre: &PreFetchResult, after: &AfterStates) -> Vec<Candidate> {
    match call.kind {
        OperationKind::Create => vec![Candidate {
            model: call.model.clone(),
            before: None,
            after: after.root_single.clone(),
            action: call.kind.base_action().expect("Create has a base action"),
        }],
        OperationKind::Update | OperationKind::Delete => {
            let before = pre.root_snapshot().and_then(|s| s.before.clone());
            vec![Candidate {
                model: call.model.clone(),
                before,
                after: after.root_single.clone(),
                action: call.kind.base_action().expect("Update/Delete have a base action"),
            }]
        }
        OperationKind::Upsert => {
            let existed = pre.existed("");
            vec![Candidate {
                model: call.model.clone(),
                before: pre.root_snapshot().and_then(|s| s.before.clone()),
                after: after.root_single.clone(),
                action: resolve_upsert_action(existed),
            }]
        }
        OperationKind::CreateMany => after
            .root_many
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|row| Candidate {
                model: call.model.clone(),
                before: None,
                after: Some(row),
                action: call.kind.base_action().expect("CreateMany has a base action"),
            })
            .collect(),
        OperationKind::UpdateMany | OperationKind::DeleteMany => {
            let before_rows = pre.batches.get("").cloned().unwrap_or_default();
            let after_rows = after.root_many.clone().unwrap_or_default();
            let action = call
                .kind
                .base_action()
                .expect("UpdateMany/DeleteMany have a base action");
            zip_before_after(before_rows, after_rows)
                .into_iter()
                .map(|(before, after)| Candidate {
                    model: call.model.clone(),
                    before,
                    after,
                    action,
                })
                .collect()
        }
        OperationKind::NestedOnly => vec![],
    }
}

fn nested_candidates(op: &NestedOp, pre: &PreFetchResult, after: &AfterStates) -> Vec<Candidate> {
    match op.operation {
        OperationKeyword::Connect => vec![],
        OperationKeyword::ConnectOrCreate => {
            if pre.existed(&op.path) {
                // Connected to an existing row: no log on the target entity.
                vec![]
            } else {
                vec![Candidate {
                    model: op.related_model.clone(),
                    before: None,
                    after: after.singles.get(&op.path).cloned().flatten(),
                    action: Action::Create,
                }]
            }
        }
        OperationKeyword::Create if op.is_list => after
            .many
            .get(&op.path)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|row| Candidate {
                model: op.related_model.clone(),
                before: None,
                after: Some(row),
                action: Action::Create,
            })
            .collect(),
        OperationKeyword::Create => vec![Candidate {
            model: op.related_model.clone(),
            before: None,
            after: after.singles.get(&op.path).cloned().flatten(),
            action: Action::Create,
        }],
        OperationKeyword::CreateMany => after
            .many
            .get(&op.path)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|row| Candidate {
                model: op.related_model.clone(),
                before: None,
                after: Some(row),
                action: Action::Create,
            })
            .collect(),
        OperationKeyword::Update => vec![Candidate {
            model: op.related_model.clone(),
            before: pre.snapshots.get(&op.path).and_then(|s| s.before.clone()),
            after: after.singles.get(&op.path).cloned().flatten(),
            action: Action::Update,
        }],
        OperationKeyword::Delete => vec![Candidate {
            model: op.related_model.clone(),
            before: pre.snapshots.get(&op.path).and_then(|s| s.before.clone()),
            after: None,
            action: Action::Delete,
        }],
        OperationKeyword::UpdateMany | OperationKeyword::DeleteMany => {
            let before_rows = pre.batches.get(&op.path).cloned().unwrap_or_default();
            let after_rows = after.many.get(&op.path).cloned().unwrap_or_default();
            let action = if op.operation == OperationKeyword::DeleteMany {
                Action::Delete
            } else {
                Action::Update
            };
            zip_before_after(before_rows, after_rows)
                .into_iter()
                .map(|(before, after)| Candidate {
                    model: op.related_model.clone(),
                    before,
                    after,
                    action,
                })
                .collect()
        }
        OperationKeyword::Upsert => {
            let existed = pre.existed(&op.path);
            vec![Candidate {
                model: op.related_model.clone(),
                before: pre.snapshots.get(&op.path).and_then(|s| s.before.clone()),
                after: after.singles.get(&op.path).cloned().flatten(),
                action: resolve_upsert_action(existed),
            }]
        }
    }
}

fn collect_candidates(
    call: &OperationCall,
    nested_ops: &[NestedOp],
    pre: &PreFetchResult,
    after: &AfterStates,
) -> Vec<Candidate> {
    let mut out = root_candidate(call, pre, after);
    for op in nested_ops {
        out.extend(nested_candidates(op, pre, after));
    }
    out
}
