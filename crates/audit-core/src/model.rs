use audit_value::Value;

/// The three actions an emitted log can record (spec.md §3 invariants).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// The classification of a root mutating call, before nested operations are
/// walked (spec.md §4.1 step 2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Upsert,
    CreateMany,
    UpdateMany,
    DeleteMany,
    NestedOnly,
}

impl OperationKind {
    /// `createMany→create`, `updateMany→update`, `deleteMany→delete`; a
    /// plain `create`/`update`/`delete` maps to itself. `Upsert` has no
    /// single static action — it resolves per-record from pre-fetch
    /// (see `resolve_upsert_action`).
    pub fn base_action(&self) -> Option<Action> {
        match self {
            OperationKind::Create | OperationKind::CreateMany => Some(Action::Create),
            OperationKind::Update | OperationKind::UpdateMany => Some(Action::Update),
            OperationKind::Delete | OperationKind::DeleteMany => Some(Action::Delete),
            OperationKind::Upsert | OperationKind::NestedOnly => None,
        }
    }
}

/// `upsert` resolves to `create` if the pre-fetch found no existing record,
/// else `update` (spec.md §3 invariants).
pub fn resolve_upsert_action(found_existing: bool) -> Action {
    if found_existing {
        Action::Update
    } else {
        Action::Create
    }
}

/// One intercepted mutation, fresh per call (spec.md §3).
#[derive(Clone, Debug)]
pub struct OperationCall {
    pub model: String,
    pub kind: OperationKind,
    pub args: Value,
    /// Dotted path from the root if this call originated as a nested
    /// operation; `None` for the root call itself.
    pub path: Option<String>,
}

/// One `(category, type, id)` triple a log will be attached to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResolvedId {
    pub aggregate_category: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
}

/// The "before" state of a record about to be updated/deleted, or the
/// existence check result for an upsert branch (spec.md §3).
#[derive(Clone, Debug)]
pub struct PreFetchSnapshot {
    pub path: String,
    pub entity_id: Option<String>,
    pub before: Option<Value>,
}

/// An operation keyword the nested-op walker recognizes (spec.md §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKeyword {
    Create,
    CreateMany,
    Connect,
    ConnectOrCreate,
    Update,
    UpdateMany,
    Delete,
    DeleteMany,
    Upsert,
}

impl OperationKeyword {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKeyword::Create => "create",
            OperationKeyword::CreateMany => "createMany",
            OperationKeyword::Connect => "connect",
            OperationKeyword::ConnectOrCreate => "connectOrCreate",
            OperationKeyword::Update => "update",
            OperationKeyword::UpdateMany => "updateMany",
            OperationKeyword::Delete => "delete",
            OperationKeyword::DeleteMany => "deleteMany",
            OperationKeyword::Upsert => "upsert",
        }
    }
}

/// A detected write at some depth inside a parent mutation's args
/// (spec.md §3, §4.2).
#[derive(Clone, Debug)]
pub struct NestedOp {
    pub path: String,
    pub field_name: String,
    pub related_model: String,
    pub operation: OperationKeyword,
    pub is_list: bool,
    pub data: Value,
}

/// The persisted output row, per spec.md §6.4.
#[derive(Clone, Debug)]
pub struct AuditLogEntry {
    pub id: String,
    pub entity_category: String,
    pub entity_type: String,
    pub entity_id: String,
    pub entity_context: Option<Value>,
    pub aggregate_category: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub aggregate_context: Option<Value>,
    pub actor_category: String,
    pub actor_type: String,
    pub actor_id: String,
    pub actor_context: Option<Value>,
    pub action: Action,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub changes: Option<Value>,
    pub request_context: Option<Value>,
    pub created_at_unix_millis: i64,
}
