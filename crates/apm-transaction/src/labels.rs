//! Flatten arbitrary structured values into string labels.
//!
//! Any `Serialize` value can be turned into a `HashMap<String, String>`
//! suitable for `add_labels` / `add_message_payload_to_transaction`:
//!
//! ```
//! use apm_transaction::ToLabels;
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct Order {
//!     id: u32,
//!     items: Vec<String>,
//! }
//!
//! let order = Order { id: 7, items: vec!["a".into(), "b".into()] };
//! let labels = order.to_labels_with_prefix("order");
//! assert_eq!(labels["order_id"], "7");
//! assert_eq!(labels["order_items"], "a, b");
//! ```

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

/// String-keyed, string-valued metadata attached to transactions and spans.
pub type Labels = HashMap<String, String>;

/// Key used when serialization itself fails.
pub const EXTRACTION_ERROR_KEY: &str = "extraction_error";

/// Key used when the value is not a struct or map.
pub const SCALAR_VALUE_KEY: &str = "value";

/// Conversion of structured values into flat labels.
pub trait ToLabels {
    /// One label per top-level field.
    fn to_labels(&self) -> Labels;

    /// Same as [`ToLabels::to_labels`] with every key prefixed by `prefix_`.
    fn to_labels_with_prefix(&self, prefix: &str) -> Labels {
        let prefix = normalize_prefix(prefix);
        self.to_labels()
            .into_iter()
            .map(|(k, v)| (format!("{prefix}{k}"), v))
            .collect()
    }

    /// Only the listed top-level fields. Unknown names are ignored.
    fn to_labels_for(&self, fields: &[&str]) -> Labels {
        let mut labels = self.to_labels();
        labels.retain(|k, _| fields.contains(&k.as_str()));
        labels
    }
}

impl<T: Serialize + ?Sized> ToLabels for T {
    fn to_labels(&self) -> Labels {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => object_labels(map),
            Ok(Value::Null) => Labels::new(),
            Ok(other) => {
                let mut labels = Labels::new();
                labels.insert(SCALAR_VALUE_KEY.to_string(), label_value(&other));
                labels
            }
            Err(e) => {
                tracing::debug!(error = %e, "Failed to extract labels");
                let mut labels = Labels::new();
                labels.insert(
                    EXTRACTION_ERROR_KEY.to_string(),
                    format!("Error extracting object labels: {e}"),
                );
                labels
            }
        }
    }
}

fn object_labels(map: Map<String, Value>) -> Labels {
    map.into_iter()
        .filter_map(|(k, v)| {
            let key = normalize_key(&k);
            if key.is_empty() {
                None
            } else {
                Some((key, label_value(&v)))
            }
        })
        .collect()
}

/// Render one JSON value as a label string.
///
/// Strings are taken verbatim, arrays of primitives are joined with `", "`,
/// nested objects are kept as compact JSON.
pub fn label_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| match v {
                Value::Array(_) | Value::Object(_) => v.to_string(),
                other => label_value(other),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => value.to_string(),
    }
}

/// Trim a label key and replace inner whitespace with underscores.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('_');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}_")
    }
}
