use std::collections::HashMap;

use audit_value::Value;

use crate::client::DbClient;
use crate::error::AuditError;
use crate::model::{NestedOp, OperationCall, OperationKeyword, OperationKind, PreFetchSnapshot};
use crate::prefetch::{entity_id_of, fetch_single};

/// The after-write state the engine collected for the call, per spec.md
/// §4.4: read straight from the write's own result tree wherever the ORM
/// echoed it back, falling back to a point refetch only when it didn't.
#[derive(Default)]
pub struct AfterStates {
    /// Root call's after-state, for the common single-row case.
    pub root_single: Option<Value>,
    /// Root call's after-state, for `createMany`/`updateMany`/`deleteMany`.
    pub root_many: Option<Vec<Value>>,
    pub singles: HashMap<String, Option<Value>>,
    pub many: HashMap<String, Vec<Value>>,
}

fn segment(result: &Value, field: &str) -> Option<Value> {
    result.get(field).cloned()
}

/// Walks a dotted path (`"posts.comments"`) through the result tree,
/// stepping over list segments by taking them as-is — the caller decides
/// whether a list or a single row was expected at that depth.
fn extract_at_path(result: &Value, path: &str) -> Option<Value> {
    let mut current = result.clone();
    for segment_name in path.split('.') {
        match current {
            Value::Map(_) => current = segment(&current, segment_name)?,
            Value::Seq(_) => {
                // Ambiguous without an index; the caller falls back to a
                // refetch in this case.
                return None;
            }
            _ => return None,
        }
    }
    Some(current)
}

async fn refetch_by_known_id(
    client: &dyn DbClient,
    model: &str,
    known_id: Option<String>,
) -> Result<Option<Value>, AuditError> {
    let Some(id) = known_id else {
        return Ok(None);
    };
    let where_clause = Value::Map(std::iter::once(("id".to_string(), Value::Str(id))).collect());
    fetch_single(client, model, where_clause).await
}

/// Collects after-states for the root call and every nested op that
/// actually ran (the ops already pruned to their taken upsert branch).
pub async fn collect_after_states(
    call: &OperationCall,
    result: &Value,
    nested_ops: &[NestedOp],
    snapshots: &HashMap<String, PreFetchSnapshot>,
    client: &dyn DbClient,
) -> Result<AfterStates, AuditError> {
    let mut states = AfterStates::default();

    let root_is_delete = matches!(
        call.kind,
        OperationKind::Delete | OperationKind::DeleteMany
    );
    let root_is_many = matches!(
        call.kind,
        OperationKind::CreateMany | OperationKind::UpdateMany | OperationKind::DeleteMany
    );

    if root_is_many {
        states.root_many = if root_is_delete {
            Some(Vec::new())
        } else {
            result.as_seq().map(|items| items.to_vec())
        };
    } else if root_is_delete {
        states.root_single = None;
    } else {
        states.root_single = if result.as_map().is_some() {
            Some(result.clone())
        } else {
            let known_id = snapshots.get("").and_then(|s| s.entity_id.clone());
            refetch_by_known_id(client, &call.model, known_id).await?
        };
    }

    for op in nested_ops {
        let is_delete = matches!(
            op.operation,
            OperationKeyword::Delete | OperationKeyword::DeleteMany
        );
        // A plain `create` under a list relation carries an array of rows
        // too (e.g. `posts: { create: [...] }`), same as `createMany` — both
        // need the batch path. `update`/`delete`/`upsert`/`connectOrCreate`
        // under a list relation are assumed single-target (Prisma's
        // array-of-updates shorthand isn't modeled here).
        let is_many = matches!(op.operation, OperationKeyword::CreateMany | OperationKeyword::UpdateMany | OperationKeyword::DeleteMany)
            || (op.is_list && op.operation == OperationKeyword::Create);

        if is_many {
            let rows = if is_delete {
                Vec::new()
            } else {
                extract_at_path(result, &op.path)
                    .and_then(|v| v.as_seq().map(|s| s.to_vec()))
                    .unwrap_or_default()
            };
            states.many.insert(op.path.clone(), rows);
            continue;
        }

        if is_delete {
            states.singles.insert(op.path.clone(), None);
            continue;
        }

        let direct = extract_at_path(result, &op.path).filter(|v| !v.is_null());
        let after = match direct {
            Some(v) => Some(v),
            None => {
                let known_id = snapshots
                    .get(&op.path)
                    .and_then(|s| s.entity_id.clone())
                    .or_else(|| op.data.get("where").and_then(entity_id_of));
                refetch_by_known_id(client, &op.related_model, known_id).await?
            }
        };
        states.singles.insert(op.path.clone(), after);
    }

    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BoxFuture, ModelDelegate};
    use async_trait::async_trait;

    struct FakeDelegate {
        row: Option<Value>,
    }

    #[async_trait]
    impl ModelDelegate for FakeDelegate {
        async fn find_unique(&self, _args: Value) -> Result<Option<Value>, AuditError> {
            Ok(self.row.clone())
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

    #[tokio::test]
    async fn root_after_state_read_directly_from_result() {
        let client = FakeClient {
            post: FakeDelegate { row: None },
        };
        let result: Value = serde_json::json!({"id": 1, "name": "A"}).into();
        let call = OperationCall {
            model: "User".into(),
            kind: OperationKind::Update,
            args: Value::Null,
            path: None,
        };
        let states = collect_after_states(&call, &result, &[], &HashMap::new(), &client)
            .await
            .unwrap();
        assert_eq!(states.root_single, Some(result));
    }

    #[tokio::test]
    async fn nested_create_missing_from_result_falls_back_to_refetch() {
        let client = FakeClient {
            post: FakeDelegate {
                row: Some(serde_json::json!({"id": 9, "title": "P"}).into()),
            },
        };
        let result: Value = serde_json::json!({"id": 1}).into(); // no "posts" echoed back
        let op = NestedOp {
            path: "posts".into(),
            field_name: "posts".into(),
            related_model: "Post".into(),
            operation: OperationKeyword::Create,
            is_list: false,
            data: serde_json::json!({"id": 9}).into(),
        };
        let mut snapshots = HashMap::new();
        snapshots.insert(
            "posts".to_string(),
            PreFetchSnapshot {
                path: "posts".into(),
                entity_id: Some("9".into()),
                before: None,
            },
        );
        let call = OperationCall {
            model: "User".into(),
            kind: OperationKind::Update,
            args: Value::Null,
            path: None,
        };
        let states = collect_after_states(&call, &result, &[op], &snapshots, &client)
            .await
            .unwrap();
        assert!(states.singles["posts"].is_some());
    }

    #[tokio::test]
    async fn root_delete_has_no_after_state() {
        let client = FakeClient {
            post: FakeDelegate { row: None },
        };
        let result = Value::Null;
        let call = OperationCall {
            model: "User".into(),
            kind: OperationKind::Delete,
            args: Value::Null,
            path: None,
        };
        let states = collect_after_states(&call, &result, &[], &HashMap::new(), &client)
            .await
            .unwrap();
        assert_eq!(states.root_single, None);
    }
}
