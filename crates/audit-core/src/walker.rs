use std::collections::{HashMap, HashSet};

use audit_value::Value;

use crate::model::{NestedOp, OperationKeyword};
use crate::schema::SchemaMetadata;

const OPERATION_KEYWORDS: &[OperationKeyword] = &[
    OperationKeyword::Create,
    OperationKeyword::CreateMany,
    OperationKeyword::Connect,
    OperationKeyword::ConnectOrCreate,
    OperationKeyword::Update,
    OperationKeyword::UpdateMany,
    OperationKeyword::Delete,
    OperationKeyword::DeleteMany,
    OperationKeyword::Upsert,
];

/// Which upsert branch pruning should apply, per spec.md §4.3.
pub enum WalkPhase<'a> {
    /// Phase 1: explore both branches of every `upsert` node, so the
    /// pre-fetcher can discover every nested unique `WHERE`.
    Discovery,
    /// Phase 2: explore only the branch the pre-fetch map says will run —
    /// `update` if a record was found at that path, `create` otherwise.
    Prune(&'a HashMap<String, bool>),
}

struct Frame {
    model: String,
    data: Value,
    path: String,
}

/// Produces every [`NestedOp`] at any depth in `root_data`, using
/// `SchemaMetadata::relation_fields` to tell real relations from JSON keys
/// that merely share a name with an operation keyword.
///
/// Implemented as an explicit-stack DFS rather than native recursion —
/// relation graphs cycle (`Post ⇄ User`), and the dedup set below is what
/// actually guarantees termination, but an explicit stack also means a
/// pathologically deep payload can't blow the native call stack
/// (spec.md §9).
pub fn walk_nested_ops(
    root_model: &str,
    root_data: &Value,
    schema: &dyn SchemaMetadata,
    phase: &WalkPhase,
) -> Vec<NestedOp> {
    let mut ops = Vec::new();
    let mut seen: HashSet<(String, OperationKeyword)> = HashSet::new();
    let mut stack = vec![Frame {
        model: root_model.to_string(),
        data: root_data.clone(),
        path: String::new(),
    }];

    while let Some(frame) = stack.pop() {
        if let Some(items) = frame.data.as_seq() {
            // `create`/`createMany` carry an array of records when the
            // relation is a list (`posts: { create: [...] }`); each element
            // is its own record to recurse into, at the same path.
            for item in items {
                stack.push(Frame {
                    model: frame.model.clone(),
                    data: item.clone(),
                    path: frame.path.clone(),
                });
            }
            continue;
        }

        let Some(fields) = frame.data.as_map() else {
            continue;
        };

        let relations = schema.relation_fields(&frame.model);

        for relation in &relations {
            let Some(field_value) = fields.get(&relation.name) else {
                continue;
            };
            let Some(field_ops) = field_value.as_map() else {
                continue;
            };

            let child_path = if frame.path.is_empty() {
                relation.name.clone()
            } else {
                format!("{}.{}", frame.path, relation.name)
            };

            for keyword in OPERATION_KEYWORDS {
                let Some(op_data) = field_ops.get(keyword.as_str()) else {
                    continue;
                };

                if !seen.insert((child_path.clone(), *keyword)) {
                    continue;
                }

                ops.push(NestedOp {
                    path: child_path.clone(),
                    field_name: relation.name.clone(),
                    related_model: relation.related_model.clone(),
                    operation: *keyword,
                    is_list: relation.is_list,
                    data: op_data.clone(),
                });

                match keyword {
                    OperationKeyword::Create | OperationKeyword::CreateMany => {
                        stack.push(Frame {
                            model: relation.related_model.clone(),
                            data: op_data.clone(),
                            path: child_path.clone(),
                        });
                    }
                    OperationKeyword::ConnectOrCreate => {
                        if let Some(create_data) = op_data.get("create") {
                            stack.push(Frame {
                                model: relation.related_model.clone(),
                                data: create_data.clone(),
                                path: child_path.clone(),
                            });
                        }
                    }
                    OperationKeyword::Upsert => match phase {
                        WalkPhase::Discovery => {
                            if let Some(create_data) = op_data.get("create") {
                                stack.push(Frame {
                                    model: relation.related_model.clone(),
                                    data: create_data.clone(),
                                    path: child_path.clone(),
                                });
                            }
                            if let Some(update_data) = op_data.get("update") {
                                stack.push(Frame {
                                    model: relation.related_model.clone(),
                                    data: update_data.clone(),
                                    path: child_path.clone(),
                                });
                            }
                        }
                        WalkPhase::Prune(pre_fetched) => {
                            let exists = pre_fetched.get(&child_path).copied().unwrap_or(false);
                            let branch = if exists { "update" } else { "create" };
                            if let Some(branch_data) = op_data.get(branch) {
                                stack.push(Frame {
                                    model: relation.related_model.clone(),
                                    data: branch_data.clone(),
                                    path: child_path.clone(),
                                });
                            }
                        }
                    },
                    // update / delete / updateMany / deleteMany / connect:
                    // recorded but not recursed into — their own children
                    // are walked when that nested call's own args arrive.
                    OperationKeyword::Update
                    | OperationKeyword::Delete
                    | OperationKeyword::UpdateMany
                    | OperationKeyword::DeleteMany
                    | OperationKeyword::Connect => {}
                }
            }
        }
    }

    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RelationField;

    struct Fake(HashMap<&'static str, Vec<RelationField>>);

    impl SchemaMetadata for Fake {
        fn relation_fields(&self, model: &str) -> Vec<RelationField> {
            self.0.get(model).cloned().unwrap_or_default()
        }
        fn unique_constraints(&self, _model: &str) -> Vec<crate::schema::UniqueConstraint> {
            vec![]
        }
    }

    fn user_posts_schema() -> Fake {
        let mut map = HashMap::new();
        map.insert(
            "User",
            vec![RelationField {
                name: "posts".into(),
                related_model: "Post".into(),
                is_list: true,
            }],
        );
        map.insert(
            "Post",
            vec![RelationField {
                name: "author".into(),
                related_model: "User".into(),
                is_list: false,
            }],
        );
        Fake(map)
    }

    #[test]
    fn finds_nested_create_under_relation_field() {
        let schema = user_posts_schema();
        let data: Value = serde_json::json!({
            "email": "a@x",
            "posts": {
                "create": [{"title": "P1"}, {"title": "P2"}]
            }
        })
        .into();

        let ops = walk_nested_ops("User", &data, &schema, &WalkPhase::Discovery);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].path, "posts");
        assert_eq!(ops[0].operation, OperationKeyword::Create);
        assert_eq!(ops[0].related_model, "Post");
    }

    #[test]
    fn ignores_json_keys_that_are_not_declared_relations() {
        let schema = user_posts_schema();
        let data: Value = serde_json::json!({
            "settings": { "create": {"theme": "dark"} }
        })
        .into();
        let ops = walk_nested_ops("User", &data, &schema, &WalkPhase::Discovery);
        assert!(ops.is_empty());
    }

    #[test]
    fn discovery_explores_both_upsert_branches() {
        let schema = user_posts_schema();
        let data: Value = serde_json::json!({
            "posts": {
                "upsert": {
                    "create": {"title": "new"},
                    "update": {"title": "edited"}
                }
            }
        })
        .into();
        let ops = walk_nested_ops("User", &data, &schema, &WalkPhase::Discovery);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, OperationKeyword::Upsert);
    }

    #[test]
    fn prune_picks_update_branch_when_record_exists() {
        let schema = user_posts_schema();
        let data: Value = serde_json::json!({
            "posts": {
                "upsert": {
                    "create": {"title": "new"},
                    "update": {"title": "edited"}
                }
            }
        })
        .into();
        let mut pre_fetched = HashMap::new();
        pre_fetched.insert("posts".to_string(), true);
        let ops = walk_nested_ops("User", &data, &schema, &WalkPhase::Prune(&pre_fetched));
        // The upsert node itself is still recorded once; its nested children
        // (none here) would come from the "update" branch only.
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn connect_or_create_recurses_only_into_create_branch() {
        let schema = user_posts_schema();
        let data: Value = serde_json::json!({
            "posts": {
                "connectOrCreate": {
                    "where": {"id": 1},
                    "create": {"title": "new", "posts": {}}
                }
            }
        })
        .into();
        let ops = walk_nested_ops("User", &data, &schema, &WalkPhase::Discovery);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, OperationKeyword::ConnectOrCreate);
    }

    #[test]
    fn recurses_into_nested_writes_inside_list_create_elements() {
        let schema = user_posts_schema();
        let data: Value = serde_json::json!({
            "posts": {
                "create": [
                    {"title": "P1", "author": {"create": {"email": "a@x"}}}
                ]
            }
        })
        .into();
        let ops = walk_nested_ops("User", &data, &schema, &WalkPhase::Discovery);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().any(|op| op.path == "posts" && op.operation == OperationKeyword::Create));
        assert!(
            ops.iter()
                .any(|op| op.path == "posts.author" && op.operation == OperationKeyword::Create)
        );
    }

    #[test]
    fn dedupes_repeated_path_and_keyword() {
        let schema = user_posts_schema();
        let data: Value = serde_json::json!({
            "posts": { "create": [{"title": "P1"}] }
        })
        .into();
        let ops1 = walk_nested_ops("User", &data, &schema, &WalkPhase::Discovery);
        let ops2 = walk_nested_ops("User", &data, &schema, &WalkPhase::Discovery);
        assert_eq!(ops1.len(), ops2.len());
        assert_eq!(ops1.len(), 1);
    }
}
