use serde::{Deserialize, Serialize};

/// A single value produced by a data generator or scanned out of a result
/// row (spec.md §3, §4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Null,
}

/// Describes the placeholder width of a generator's produced values
/// (spec.md §3 `Format()`), used when a statement falls back to textual
/// substitution instead of a prepared-statement bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Float,
    Str,
    Bytes,
}

impl Value {
    /// Render as a SQL literal for textual (non-prepared) execution.
    pub fn render_literal(&self) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Bytes(b) => format!("0x{}", hex_encode(b)),
            Value::Null => "NULL".to_string(),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_renders_bare() {
        assert_eq!(Value::Int(42).render_literal(), "42");
    }

    #[test]
    fn str_renders_quoted_and_escaped() {
        assert_eq!(Value::Str("o'clock".into()).render_literal(), "'o''clock'");
    }

    #[test]
    fn null_renders_as_null() {
        assert_eq!(Value::Null.render_literal(), "NULL");
    }

    #[test]
    fn bytes_render_as_hex_literal() {
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).render_literal(), "0xdead");
    }
}
