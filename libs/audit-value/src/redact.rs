use std::collections::BTreeMap;

use crate::Value;

/// The sentinel shape a redacted field is replaced by, per the persisted
/// layout: `{"redacted":true,"hadValue":bool[,"isDifferent":bool]}`.
pub fn redacted_sentinel(had_value: bool, is_different: Option<bool>) -> Value {
    let mut map = BTreeMap::new();
    map.insert("redacted".to_string(), Value::Bool(true));
    map.insert("hadValue".to_string(), Value::Bool(had_value));
    if let Some(different) = is_different {
        map.insert("isDifferent".to_string(), Value::Bool(different));
    }
    Value::Map(map)
}

/// True if `field` is covered by the transformer or the static redact list.
pub fn is_redacted(
    field: &str,
    redact_fields: &[String],
    transformer: Option<&(dyn Fn(&str) -> bool + Send + Sync)>,
) -> bool {
    redact_fields.iter().any(|f| f == field) || transformer.is_some_and(|t| t(field))
}
