use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use audit_context::Actor;
use audit_value::Value;

use crate::config::PerformanceConfig;
use crate::error::AuditError;
use crate::model::{Action, AuditLogEntry, ResolvedId};

/// Persists finished log entries. An external collaborator, same footing as
/// [`crate::client::DbClient`] (spec.md §6.3) — this crate never defines the
/// audit-log table's own schema, only what a row looks like.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, entries: &[AuditLogEntry]) -> Result<(), AuditError>;
}

/// Everything needed to build the one-or-more [`AuditLogEntry`] rows for a
/// single (record, action) pair — one row per resolved aggregate id, all
/// sharing the same entity identity (spec.md §6.4).
pub struct EmitInput {
    pub entity_category: String,
    pub entity_type: String,
    pub entity_id: String,
    pub entity_context: Option<Value>,
    pub resolved_ids: Vec<ResolvedId>,
    /// aggregate type -> (aggregate id -> context)
    pub aggregate_contexts: HashMap<String, HashMap<String, Value>>,
    pub actor: Actor,
    pub actor_context: Option<Value>,
    pub action: Action,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub changes: Option<Value>,
    pub request_context: Option<Value>,
    pub created_at_unix_millis: i64,
}

fn generate_entry_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Expands one [`EmitInput`] into one [`AuditLogEntry`] per resolved
/// aggregate id. A record that resolved to zero ids (unregistered model, or
/// every resolver declined) produces zero entries — the caller never writes
/// an empty-aggregate row.
pub fn build_entries(input: EmitInput) -> Vec<AuditLogEntry> {
    input
        .resolved_ids
        .into_iter()
        .map(|resolved| {
            let aggregate_context = input
                .aggregate_contexts
                .get(&resolved.aggregate_type)
                .and_then(|by_id| by_id.get(&resolved.aggregate_id))
                .cloned();
            AuditLogEntry {
                id: generate_entry_id(),
                entity_category: input.entity_category.clone(),
                entity_type: input.entity_type.clone(),
                entity_id: input.entity_id.clone(),
                entity_context: input.entity_context.clone(),
                aggregate_category: resolved.aggregate_category,
                aggregate_type: resolved.aggregate_type,
                aggregate_id: resolved.aggregate_id,
                aggregate_context,
                actor_category: input.actor.category.clone(),
                actor_type: input.actor.r#type.clone(),
                actor_id: input.actor.id.clone(),
                actor_context: input.actor_context.clone(),
                action: input.action,
                before: input.before.clone(),
                after: input.after.clone(),
                changes: input.changes.clone(),
                request_context: input.request_context.clone(),
                created_at_unix_millis: input.created_at_unix_millis,
            }
        })
        .collect()
}

/// Drops entries per `performance.sampling`, independently per entry — the
/// "per `(call, record, aggregate)` triple" sampling unit from spec.md §4.8
/// is exactly one `AuditLogEntry` here, since each already carries one
/// resolved aggregate id.
fn sample(entries: Vec<AuditLogEntry>, sampling: f64) -> Vec<AuditLogEntry> {
    if sampling >= 1.0 {
        return entries;
    }
    if sampling <= 0.0 {
        return Vec::new();
    }
    entries
        .into_iter()
        .filter(|_| rand::random::<f64>() < sampling)
        .collect()
}

/// Writes `entries` through `sink`, honoring spec.md §4.8's two delivery
/// modes: `await_write` runs inline so the write enlists on the caller's own
/// transaction and a failure can abort it; otherwise the write is
/// fire-and-forget on a detached task and failures only get logged, since by
/// the time they surface the original call has already returned.
pub async fn emit(
    entries: Vec<AuditLogEntry>,
    sink: Arc<dyn LogSink>,
    performance: &PerformanceConfig,
) -> Result<(), AuditError> {
    let entries = sample(entries, performance.sampling);
    if entries.is_empty() {
        return Ok(());
    }

    if performance.await_write {
        sink.write(&entries).await
    } else {
        tokio::spawn(async move {
            if let Err(err) = sink.write(&entries).await {
                tracing::error!(error = %err, "background audit log write failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        written: Mutex<Vec<AuditLogEntry>>,
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        async fn write(&self, entries: &[AuditLogEntry]) -> Result<(), AuditError> {
            self.written.lock().unwrap().extend(entries.iter().cloned());
            Ok(())
        }
    }

    fn actor() -> Actor {
        Actor {
            category: "model".into(),
            r#type: "User".into(),
            id: "u1".into(),
            name: None,
        }
    }

    fn base_input(resolved_ids: Vec<ResolvedId>) -> EmitInput {
        EmitInput {
            entity_category: "model".into(),
            entity_type: "Post".into(),
            entity_id: "1".into(),
            entity_context: None,
            resolved_ids,
            aggregate_contexts: HashMap::new(),
            actor: actor(),
            actor_context: None,
            action: Action::Create,
            before: None,
            after: Some(Value::Null),
            changes: None,
            request_context: None,
            created_at_unix_millis: 0,
        }
    }

    #[test]
    fn one_entry_per_resolved_id() {
        let ids = vec![
            ResolvedId {
                aggregate_category: "model".into(),
                aggregate_type: "Post".into(),
                aggregate_id: "1".into(),
            },
            ResolvedId {
                aggregate_category: "model".into(),
                aggregate_type: "Tenant".into(),
                aggregate_id: "t1".into(),
            },
        ];
        let entries = build_entries(base_input(ids));
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.entity_id == "1" && e.entity_type == "Post"));
    }

    #[test]
    fn zero_resolved_ids_yields_zero_entries() {
        assert!(build_entries(base_input(vec![])).is_empty());
    }

    #[tokio::test]
    async fn sync_emit_writes_inline_and_propagates_errors() {
        let sink = Arc::new(RecordingSink {
            written: Mutex::new(vec![]),
        });
        let ids = vec![ResolvedId {
            aggregate_category: "model".into(),
            aggregate_type: "Post".into(),
            aggregate_id: "1".into(),
        }];
        let entries = build_entries(base_input(ids));
        let performance = PerformanceConfig {
            await_write: true,
            sampling: 1.0,
        };
        emit(entries, sink.clone(), &performance).await.unwrap();
        assert_eq!(sink.written.lock().unwrap().len(), 1);
    }

    #[test]
    fn sampling_zero_drops_everything() {
        let ids = vec![ResolvedId {
            aggregate_category: "model".into(),
            aggregate_type: "Post".into(),
            aggregate_id: "1".into(),
        }];
        let entries = build_entries(base_input(ids));
        assert!(sample(entries, 0.0).is_empty());
    }

    #[test]
    fn sampling_one_keeps_everything() {
        let ids = vec![ResolvedId {
            aggregate_category: "model".into(),
            aggregate_type: "Post".into(),
            aggregate_id: "1".into(),
        }];
        let entries = build_entries(base_input(ids));
        assert_eq!(sample(entries, 1.0).len(), 1);
    }
}
