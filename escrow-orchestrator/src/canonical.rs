//! Canonical serialization of escrow events
//!
//! Object keys are sorted by their UTF-8 bytes at every nesting level, arrays
//! keep their order, and output uses compact separators. Scalars are written
//! by `serde_json`, which never depends on locale. The same logical value
//! therefore produces the same bytes regardless of key insertion order.

use serde::Serialize;
use serde_json::Value;

use crate::EscrowResult;

/// Bytes produced by [`canonicalize`]; the only input accepted for event hashing
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalBytes(Vec<u8>);

impl CanonicalBytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Canonicalize any serializable value
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> EscrowResult<CanonicalBytes> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&value, &mut out)?;
    Ok(CanonicalBytes(out.into_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) -> EscrowResult<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
