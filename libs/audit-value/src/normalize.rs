use thiserror::Error;

use crate::Value;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot normalize aggregate id: {0}")]
pub struct NormalizeError(pub String);

/// Stringifies an id value for storage in `aggregateId`/`entityId`.
///
/// Accepts strings (unchanged), integers and arbitrary-precision integers
/// (decimal), and booleans (`true`/`false`). Maps and sequences have no
/// well-defined string form in a statically-typed value tree, so they're
/// rejected rather than guessed at — see the "aggregate-resolver overload"
/// open question in DESIGN.md.
pub fn normalize(value: &Value) -> Result<String, NormalizeError> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        Value::Int(n) => Ok(n.to_string()),
        Value::BigInt(n) => Ok(n.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(NormalizeError(format!(
            "unsupported id value: {other}"
        ))),
    }
}
