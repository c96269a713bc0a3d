//! The value tree the interception engine walks: operation args, pre-fetched
//! rows, and result trees all get converted into [`Value`] before anything
//! in `audit-core` inspects them.

mod normalize;
mod redact;
mod value;

pub use normalize::{NormalizeError, normalize};
pub use redact::{is_redacted, redacted_sentinel};
pub use value::Value;
