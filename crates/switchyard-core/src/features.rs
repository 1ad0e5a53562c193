//! Context features and the fixed-length vectors derived from them
//!
//! A [`Context`] is the per-request bag of named features supplied by the
//! caller. Policies that need numeric input turn it into a fixed-length
//! vector with [`feature_vector`]:
//!
//! - slot 0 is a constant bias of `1.0`
//! - slots `1..dim` take the context values in sorted key order
//! - numbers are used as-is, text is hashed into `[0, 1)`, anything else is `0.0`
//! - unused slots stay `0.0`, keys that do not fit are dropped
//!
//! The mapping is pure: equal contexts always produce bit-identical vectors.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::collections::btree_map;

/// Value of the constant bias slot
pub const BIAS: f64 = 1.0;

/// A single context feature value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Numeric feature, used directly
    Number(f64),
    /// Text feature, hashed into `[0, 1)`
    Text(String),
    /// Anything else (booleans, null, arrays, objects); encodes as `0.0`
    Other(serde_json::Value),
}

impl FeatureValue {
    /// Numeric value, if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Encode this value as a single vector slot
    pub fn encode(&self) -> f64 {
        match self {
            Self::Number(n) => *n,
            Self::Text(s) => text_hash_unit(s),
            Self::Other(_) => 0.0,
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for FeatureValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<serde_json::Value> for FeatureValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => Self::Number(f),
                None => Self::Other(serde_json::Value::Number(n)),
            },
            serde_json::Value::String(s) => Self::Text(s),
            other => Self::Other(other),
        }
    }
}

/// Named features describing one routing decision
///
/// Keys are kept sorted so iteration order is the feature order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    features: BTreeMap<String, FeatureValue>,
}

impl Context {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a numeric feature
    pub fn with_number(mut self, name: impl Into<String>, value: f64) -> Self {
        self.insert(name, FeatureValue::Number(value));
        self
    }

    /// Add a text feature
    pub fn with_text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, FeatureValue::Text(value.into()));
        self
    }

    /// Add a feature of any kind
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.insert(name, value.into());
        self
    }

    /// Insert or replace a feature
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FeatureValue>) {
        self.features.insert(name.into(), value.into());
    }

    /// Get a feature by name
    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.features.get(name)
    }

    /// Get a feature only if it is numeric
    pub fn numeric(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FeatureValue::as_number)
    }

    /// Iterate over features in sorted key order
    pub fn iter(&self) -> btree_map::Iter<'_, String, FeatureValue> {
        self.features.iter()
    }

    /// Iterate over numeric features only, in sorted key order
    pub fn numeric_features(&self) -> impl Iterator<Item = (&str, f64)> {
        self.features
            .iter()
            .filter_map(|(k, v)| v.as_number().map(|n| (k.as_str(), n)))
    }

    /// Number of features
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether the context carries no features
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Context
where
    K: Into<String>,
    V: Into<FeatureValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            features: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Build the fixed-length feature vector for a context
pub fn feature_vector(context: &Context, dim: usize) -> Vec<f64> {
    let mut vector = vec![0.0; dim];
    let Some((bias, slots)) = vector.split_first_mut() else {
        return vector;
    };
    *bias = BIAS;

    for (slot, (_, value)) in slots.iter_mut().zip(context.iter()) {
        *slot = value.encode();
    }

    vector
}

/// Map text into `[0, 1)` with a hash that is stable across processes
///
/// Uses the top 53 bits of the SHA-256 digest so the result is exactly
/// representable and strictly below 1.0.
pub fn text_hash_unit(text: &str) -> f64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let bits = u64::from_be_bytes(head) >> 11;
    bits as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bias_and_padding() {
        let context = Context::new().with_number("latency_ms", 50.0);
        let vector = feature_vector(&context, 4);
        assert_eq!(vector, vec![1.0, 50.0, 0.0, 0.0]);
    }

    #[test]
    fn test_sorted_key_order() {
        let context = Context::new()
            .with_number("zeta", 3.0)
            .with_number("alpha", 1.0)
            .with_number("mid", 2.0);
        assert_eq!(feature_vector(&context, 4), vec![1.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_extra_keys_dropped() {
        let context: Context = [("a", 1.0), ("b", 2.0), ("c", 3.0)].into_iter().collect();
        assert_eq!(feature_vector(&context, 3), vec![1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_degenerate_dimensions() {
        let context = Context::new().with_number("a", 1.0);
        assert!(feature_vector(&context, 0).is_empty());
        assert_eq!(feature_vector(&context, 1), vec![1.0]);
    }

    #[test]
    fn test_text_hash_in_unit_interval() {
        for text in ["", "gpt-4o", "eu-west-1", "a much longer region identifier"] {
            let h = text_hash_unit(text);
            assert!((0.0..1.0).contains(&h), "{text} hashed to {h}");
        }
        assert_eq!(text_hash_unit("eu-west-1"), text_hash_unit("eu-west-1"));
        assert_ne!(text_hash_unit("eu-west-1"), text_hash_unit("us-east-1"));
    }

    #[test]
    fn test_other_values_encode_to_zero() {
        let context = Context::new()
            .with_value("flag", serde_json::json!(true))
            .with_value("nested", serde_json::json!({"x": 1}));
        assert_eq!(feature_vector(&context, 3), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_deserialize_mixed_context() {
        let context: Context =
            serde_json::from_str(r#"{"latency_ms": 50, "region": "eu", "tags": ["a"]}"#).unwrap();
        assert_eq!(context.numeric("latency_ms"), Some(50.0));
        assert_eq!(
            context.get("region"),
            Some(&FeatureValue::Text("eu".to_string()))
        );
        assert!(matches!(context.get("tags"), Some(FeatureValue::Other(_))));
        assert_eq!(context.numeric("region"), None);
    }

    #[test]
    fn test_numeric_features_skip_text() {
        let context = Context::new()
            .with_number("b", 2.0)
            .with_text("a", "x")
            .with_number("c", 3.0);
        let numeric: Vec<_> = context.numeric_features().collect();
        assert_eq!(numeric, vec![("b", 2.0), ("c", 3.0)]);
    }
}
