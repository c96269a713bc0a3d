use std::collections::{BTreeMap, BTreeSet, HashSet};

use audit_value::{Value, is_redacted, redacted_sentinel};

use crate::error::{AuditError, Phase};

/// A user-supplied field-name predicate for redaction, in addition to the
/// static `security.redact.fields` list (spec.md §6.5).
pub type RedactTransformer = dyn Fn(&str) -> bool + Send + Sync;

/// Pure field-level diff, per spec.md §4.6.
///
/// `diff(x, x) == Ok(None)` and the function has no side effects — it's the
/// one component in the pipeline with no async boundary, which is what lets
/// the conformance suite (spec.md §8) test it directly without a fake
/// `DbClient`.
pub fn diff(
    before: Option<&Value>,
    after: Option<&Value>,
    excluded_fields: &HashSet<String>,
    redact_fields: &[String],
    transformer: Option<&RedactTransformer>,
) -> Result<Option<Value>, AuditError> {
    let (before_map, after_map) = match (before, after) {
        (Some(b), Some(a)) => (as_map(b)?, as_map(a)?),
        _ => return Ok(None),
    };

    let keys: BTreeSet<&String> = before_map.keys().chain(after_map.keys()).collect();
    let mut changes = BTreeMap::new();

    for key in keys {
        if excluded_fields.contains(key) {
            continue;
        }

        let b = before_map.get(key).unwrap_or(&Value::Null);
        let a = after_map.get(key).unwrap_or(&Value::Null);
        let unchanged = b.deep_eq(a);

        if is_redacted(key, redact_fields, transformer) {
            if !unchanged {
                let mut entry = BTreeMap::new();
                entry.insert("old".to_string(), redacted_sentinel(!b.is_null(), None));
                entry.insert(
                    "new".to_string(),
                    redacted_sentinel(!a.is_null(), Some(true)),
                );
                changes.insert(key.clone(), Value::Map(entry));
            }
            continue;
        }

        if unchanged {
            continue;
        }

        let mut entry = BTreeMap::new();
        entry.insert("old".to_string(), b.clone());
        entry.insert("new".to_string(), a.clone());
        changes.insert(key.clone(), Value::Map(entry));
    }

    if changes.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Value::Map(changes)))
    }
}

/// Applies redaction to a whole record for storage as `before`/`after`
/// (spec.md §3: "Redacted fields never appear verbatim in before, after, or
/// changes"). Only top-level fields are redacted — the configs this engine
/// consumes name fields, not JSON pointers into nested structures.
pub fn redact_record(
    record: &Value,
    redact_fields: &[String],
    transformer: Option<&RedactTransformer>,
) -> Result<Value, AuditError> {
    let map = as_map(record)?;
    let mut out = BTreeMap::new();
    for (key, value) in map {
        if is_redacted(key, redact_fields, transformer) {
            out.insert(key.clone(), redacted_sentinel(!value.is_null(), None));
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::Map(out))
}

fn as_map(value: &Value) -> Result<&BTreeMap<String, Value>, AuditError> {
    value.as_map().ok_or_else(|| AuditError::Diff {
        phase: Phase::Diff,
        message: "expected a record (map), got a scalar or sequence".to_string(),
    })
}
