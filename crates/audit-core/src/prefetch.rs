use std::collections::HashMap;

use audit_value::Value;

use crate::client::DbClient;
use crate::config::NestedOperationsConfig;
use crate::error::{AuditError, Phase, WithContext};
use crate::model::{NestedOp, OperationCall, OperationKeyword, OperationKind, PreFetchSnapshot};
use crate::schema::SchemaMetadata;
use crate::walker::{WalkPhase, walk_nested_ops};

/// Everything the pre-fetcher learned about the call, before any write
/// actually runs (spec.md §4.3).
#[derive(Default)]
pub struct PreFetchResult {
    /// The operations that will actually execute — upserts already resolved
    /// to their taken branch.
    pub nested_ops: Vec<NestedOp>,
    /// Single-row snapshots, keyed by path (`""` for the root call).
    pub snapshots: HashMap<String, PreFetchSnapshot>,
    /// Rows matched by a `updateMany`/`deleteMany` filter, keyed by path.
    pub batches: HashMap<String, Vec<Value>>,
}

impl PreFetchResult {
    pub fn root_snapshot(&self) -> Option<&PreFetchSnapshot> {
        self.snapshots.get("")
    }

    pub fn existed(&self, path: &str) -> bool {
        self.snapshots
            .get(path)
            .is_some_and(|s| s.before.is_some())
    }
}

enum Requirement {
    /// `find_unique` by a (believed) unique `where`; the result doubles as
    /// the "before" state for diffing and, for `upsert`/`connectOrCreate`,
    /// as the existence check that decides the branch taken.
    Single,
    /// `find_many` by a filter `where`; every matched row gets its own
    /// before-state and, downstream, its own log entry.
    Many,
    None,
}

fn requirement_for_keyword(keyword: OperationKeyword) -> Requirement {
    match keyword {
        OperationKeyword::Update | OperationKeyword::Delete => Requirement::Single,
        OperationKeyword::Upsert | OperationKeyword::ConnectOrCreate => Requirement::Single,
        OperationKeyword::UpdateMany | OperationKeyword::DeleteMany => Requirement::Many,
        OperationKeyword::Create | OperationKeyword::CreateMany | OperationKeyword::Connect => {
            Requirement::None
        }
    }
}

fn requirement_for_root(kind: OperationKind) -> Requirement {
    match kind {
        OperationKind::Update | OperationKind::Delete | OperationKind::Upsert => {
            Requirement::Single
        }
        OperationKind::UpdateMany | OperationKind::DeleteMany => Requirement::Many,
        OperationKind::Create | OperationKind::CreateMany | OperationKind::NestedOnly => {
            Requirement::None
        }
    }
}

/// spec.md §6.5: `nestedOperations.update.fetchBeforeOperation` and
/// `.delete.fetchBeforeOperation` gate the before-state fetch for plain
/// `update`/`delete`. `upsert`/`connectOrCreate` never consult the flag —
/// their "before" fetch is also the existence check that decides which
/// branch ran, not an optional diff convenience.
fn root_should_fetch_before(kind: OperationKind, nested_operations: &NestedOperationsConfig) -> bool {
    match kind {
        OperationKind::Update => nested_operations.update_fetch_before_operation,
        OperationKind::Delete => nested_operations.delete_fetch_before_operation,
        _ => true,
    }
}

fn keyword_should_fetch_before(keyword: OperationKeyword, nested_operations: &NestedOperationsConfig) -> bool {
    match keyword {
        OperationKeyword::Update => nested_operations.update_fetch_before_operation,
        OperationKeyword::Delete => nested_operations.delete_fetch_before_operation,
        _ => true,
    }
}

pub(crate) async fn fetch_single(
    client: &dyn DbClient,
    model: &str,
    where_clause: Value,
) -> Result<Option<Value>, AuditError> {
    let delegate = client.delegate(model).ok_or_else(|| AuditError::PreFetch {
        phase: Phase::PreFetch,
        message: format!("no model delegate registered for {model}"),
        source: None,
    })?;
    delegate
        .find_unique(where_clause)
        .await
        .with_context(format!("pre-fetching {model}"))
}

async fn fetch_many(
    client: &dyn DbClient,
    model: &str,
    where_clause: Value,
) -> Result<Vec<Value>, AuditError> {
    let delegate = client.delegate(model).ok_or_else(|| AuditError::PreFetch {
        phase: Phase::PreFetch,
        message: format!("no model delegate registered for {model}"),
        source: None,
    })?;
    delegate
        .find_many(where_clause)
        .await
        .with_context(format!("pre-fetching {model}"))
}

fn extract_where(data: &Value) -> Option<Value> {
    data.get("where").cloned()
}

pub(crate) fn entity_id_of(record: &Value) -> Option<String> {
    record.get("id").map(|v| v.to_string())
}

/// Runs the two-phase pre-fetch described in spec.md §4.3: discover every
/// `NestedOp` (including both branches of every `upsert`), fetch the
/// before-state or existence check each node needs, then re-walk with the
/// now-known branch decisions so only the operations that will actually run
/// are returned.
pub async fn pre_fetch(
    call: &OperationCall,
    schema: &dyn SchemaMetadata,
    client: &dyn DbClient,
    nested_operations: &NestedOperationsConfig,
) -> Result<PreFetchResult, AuditError> {
    let discovery_ops = walk_nested_ops(&call.model, &call.args, schema, &WalkPhase::Discovery);

    let mut snapshots = HashMap::new();
    let mut batches = HashMap::new();

    if let Requirement::Single = requirement_for_root(call.kind) {
        if let Some(where_clause) = extract_where(&call.args) {
            let before = if root_should_fetch_before(call.kind, nested_operations) {
                fetch_single(client, &call.model, where_clause.clone()).await?
            } else {
                None
            };
            let entity_id = before
                .as_ref()
                .and_then(entity_id_of)
                .or_else(|| entity_id_of(&where_clause));
            snapshots.insert(
                String::new(),
                PreFetchSnapshot {
                    path: String::new(),
                    entity_id,
                    before,
                },
            );
        }
    } else if let Requirement::Many = requirement_for_root(call.kind) {
        if let Some(where_clause) = extract_where(&call.args) {
            let rows = fetch_many(client, &call.model, where_clause).await?;
            batches.insert(String::new(), rows);
        }
    }

    for op in &discovery_ops {
        match requirement_for_keyword(op.operation) {
            Requirement::Single => {
                let Some(where_clause) = extract_where(&op.data) else {
                    continue;
                };
                let before = if keyword_should_fetch_before(op.operation, nested_operations) {
                    fetch_single(client, &op.related_model, where_clause.clone()).await?
                } else {
                    None
                };
                let entity_id = before
                    .as_ref()
                    .and_then(entity_id_of)
                    .or_else(|| entity_id_of(&where_clause));
                snapshots.insert(
                    op.path.clone(),
                    PreFetchSnapshot {
                        path: op.path.clone(),
                        entity_id,
                        before,
                    },
                );
            }
            Requirement::Many => {
                let Some(where_clause) = extract_where(&op.data) else {
                    continue;
                };
                let rows = fetch_many(client, &op.related_model, where_clause).await?;
                batches.insert(op.path.clone(), rows);
            }
            Requirement::None => {}
        }
    }

    let pre_fetched: HashMap<String, bool> = snapshots
        .iter()
        .map(|(path, snap)| (path.clone(), snap.before.is_some()))
        .collect();

    let nested_ops = walk_nested_ops(
        &call.model,
        &call.args,
        schema,
        &WalkPhase::Prune(&pre_fetched),
    );

    let taken_paths: std::collections::HashSet<&str> =
        nested_ops.iter().map(|op| op.path.as_str()).collect();
    snapshots.retain(|path, _| path.is_empty() || taken_paths.contains(path.as_str()));
    batches.retain(|path, _| path.is_empty() || taken_paths.contains(path.as_str()));

    Ok(PreFetchResult {
        nested_ops,
        snapshots,
        batches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BoxFuture, ModelDelegate};
    use crate::schema::{RelationField, UniqueConstraint};
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use std::sync::Mutex;

    struct FakeDelegate {
        unique_rows: Mutex<Map<String, Value>>,
    }

    #[async_trait]
    impl ModelDelegate for FakeDelegate {
        async fn find_unique(&self, args: Value) -> Result<Option<Value>, AuditError> {
            let key = args.get("where").map(|v| v.to_string()).unwrap_or_default();
            Ok(self.unique_rows.lock().unwrap().get(&key).cloned())
        }
        async fn find_many(&self, _args: Value) -> Result<Vec<Value>, AuditError> {
            Ok(vec![])
        }
    }

    struct FakeClient {
        post: FakeDelegate,
    }

    #[async_trait]
    impl DbClient for FakeClient {
        fn delegate(&self, model: &str) -> Option<&dyn ModelDelegate> {
            match model {
                "Post" => Some(&self.post),
                _ => None,
            }
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

    struct FakeSchema;
    impl SchemaMetadata for FakeSchema {
        fn relation_fields(&self, model: &str) -> Vec<RelationField> {
            if model == "User" {
                vec![RelationField {
                    name: "posts".into(),
                    related_model: "Post".into(),
                    is_list: true,
                }]
            } else {
                vec![]
            }
        }
        fn unique_constraints(&self, _model: &str) -> Vec<UniqueConstraint> {
            vec![]
        }
    }

    #[tokio::test]
    async fn upsert_resolves_to_update_branch_when_row_exists() {
        let where_value: Value = serde_json::json!({"id": 1}).into();
        let mut rows = Map::new();
        rows.insert(
            where_value.to_string(),
            serde_json::json!({"id": 1, "title": "old"}).into(),
        );
        let client = FakeClient {
            post: FakeDelegate {
                unique_rows: Mutex::new(rows),
            },
        };
        let schema = FakeSchema;

        let args: Value = serde_json::json!({
            "posts": {
                "upsert": {
                    "where": {"id": 1},
                    "create": {"title": "new"},
                    "update": {"title": "edited"}
                }
            }
        })
        .into();
        let call = OperationCall {
            model: "User".into(),
            kind: OperationKind::Update,
            args,
            path: None,
        };

        let result = pre_fetch(&call, &schema, &client, &NestedOperationsConfig::default())
            .await
            .unwrap();
        assert!(result.existed("posts"));
        assert_eq!(result.nested_ops.len(), 1);
        assert_eq!(result.nested_ops[0].operation, OperationKeyword::Upsert);
    }

    #[tokio::test]
    async fn create_only_call_needs_no_prefetch() {
        let client = FakeClient {
            post: FakeDelegate {
                unique_rows: Mutex::new(Map::new()),
            },
        };
        let schema = FakeSchema;
        let args: Value = serde_json::json!({"email": "a@x"}).into();
        let call = OperationCall {
            model: "User".into(),
            kind: OperationKind::Create,
            args,
            path: None,
        };
        let result = pre_fetch(&call, &schema, &client, &NestedOperationsConfig::default())
            .await
            .unwrap();
        assert!(result.snapshots.is_empty());
        assert!(result.nested_ops.is_empty());
    }

    #[tokio::test]
    async fn update_skips_before_fetch_when_disabled() {
        let where_value: Value = serde_json::json!({"id": 1}).into();
        let mut rows = Map::new();
        rows.insert(
            where_value.to_string(),
            serde_json::json!({"id": 1, "title": "old"}).into(),
        );
        let client = FakeClient {
            post: FakeDelegate {
                unique_rows: Mutex::new(rows),
            },
        };
        let schema = FakeSchema;
        let args: Value = serde_json::json!({
            "posts": {
                "update": {
                    "where": {"id": 1},
                    "data": {"title": "new"}
                }
            }
        })
        .into();
        let call = OperationCall {
            model: "User".into(),
            kind: OperationKind::Update,
            args,
            path: None,
        };
        let nested_operations = NestedOperationsConfig {
            update_fetch_before_operation: false,
            delete_fetch_before_operation: true,
        };

        let result = pre_fetch(&call, &schema, &client, &nested_operations)
            .await
            .unwrap();
        let snapshot = result.snapshots.get("posts").unwrap();
        assert!(snapshot.before.is_none());
        assert_eq!(snapshot.entity_id.as_deref(), Some("1"));
    }
}
