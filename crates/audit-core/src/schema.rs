/// A relation field declared on a model, as reported by the injected
/// schema source (spec.md §6.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationField {
    pub name: String,
    pub related_model: String,
    pub is_list: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey,
    UniqueIndex,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub kind: ConstraintKind,
    pub fields: Vec<String>,
    pub name: Option<String>,
}

/// Schema metadata injected from the host ORM binding. This crate never
/// parses a schema file itself — it's an external collaborator, per
/// spec.md §1.
pub trait SchemaMetadata: Send + Sync {
    fn relation_fields(&self, model: &str) -> Vec<RelationField>;
    fn unique_constraints(&self, model: &str) -> Vec<UniqueConstraint>;

    /// Convenience built on `unique_constraints`: true if `fields` (as a
    /// set) match exactly one declared unique constraint.
    fn is_unique_key(&self, model: &str, fields: &[String]) -> bool {
        self.unique_constraints(model).iter().any(|c| {
            c.fields.len() == fields.len() && c.fields.iter().all(|f| fields.contains(f))
        })
    }
}
