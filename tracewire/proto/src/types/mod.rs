mod convert;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Attribute value attached to a span.
///
/// The value set is deliberately narrow: string, integer, float and
/// boolean. Collectors treat attribute values as opaque scalars, so
/// richer types are flattened by the caller before they reach the wire.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Bool(x) => f.write_fmt(format_args!("{x}")),
            AttrValue::I64(x) => f.write_fmt(format_args!("{x}")),
            AttrValue::F64(x) => f.write_fmt(format_args!("{x}")),
            AttrValue::Text(x) => f.write_str(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_value_display() {
        assert_eq!(AttrValue::Bool(true).to_string(), "true");
        assert_eq!(AttrValue::I64(-7).to_string(), "-7");
        assert_eq!(AttrValue::Text("users/123".into()).to_string(), "users/123");
    }

    #[test]
    fn test_attr_value_untagged_serialization() {
        let json = serde_json::to_string(&AttrValue::I64(42)).unwrap();
        assert_eq!(json, "42", "scalar attributes serialize without a tag");

        let json = serde_json::to_string(&AttrValue::Text("pg".into())).unwrap();
        assert_eq!(json, "\"pg\"");

        let back: AttrValue = serde_json::from_str("true").unwrap();
        assert_eq!(back, AttrValue::Bool(true));
    }
}
