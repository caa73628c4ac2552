use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Reserved flag a node script sets to ask the interpreter to block.
pub const WAIT_FLAG: &str = "waiting_wait";
/// Optional human-readable reason accompanying [`WAIT_FLAG`].
pub const WAIT_REASON: &str = "waiting_reason";

/// The mutable variable bag shared by every node of one run.
///
/// Keys are normalized on every access (see [`StoreVars::normalize_key`]),
/// so `"User Name"`, `"user-name"` and `"user_name"` address the same slot.
/// Values are arbitrary JSON.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "BTreeMap<String, Value>")]
pub struct StoreVars {
    data: BTreeMap<String, Value>,
}

impl StoreVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-fold and collapse separators into `_`.
    ///
    /// Runs of whitespace, `-`, `.` and `/` become a single underscore and
    /// leading/trailing separators are dropped.
    pub fn normalize_key(key: &str) -> String {
        let mut out = String::with_capacity(key.len());
        let mut pending_sep = false;
        for c in key.trim().chars() {
            if c.is_whitespace() || matches!(c, '-' | '.' | '/' | '_') {
                pending_sep = !out.is_empty();
                continue;
            }
            if pending_sep {
                out.push('_');
                pending_sep = false;
            }
            out.extend(c.to_lowercase());
        }
        out
    }

    /// Key under which a node's last script error is recorded.
    pub fn error_key(node_id: &str) -> String {
        format!("{}_error", Self::normalize_key(node_id))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(&Self::normalize_key(key))
    }

    /// Resolve `var` and then walk `path` (dot separated) into it.
    ///
    /// Object segments are matched exactly first and then by normalized key;
    /// numeric segments index arrays.
    pub fn get_path(&self, var: &str, path: Option<&str>) -> Option<&Value> {
        let mut current = self.get(var)?;
        let Some(path) = path.map(str::trim).filter(|p| !p.is_empty()) else {
            return Some(current);
        };
        for segment in path.split('.').map(str::trim) {
            current = match current {
                Value::Object(map) => map.get(segment).or_else(|| {
                    let wanted = Self::normalize_key(segment);
                    map.iter()
                        .find(|(k, _)| Self::normalize_key(k) == wanted)
                        .map(|(_, v)| v)
                })?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Resolve a `var[:path]` reference.
    pub fn resolve(&self, reference: &str) -> Option<&Value> {
        match reference.split_once(':') {
            Some((var, path)) => self.get_path(var, Some(path)),
            None => self.get(reference),
        }
    }

    /// Set a value, returning the normalized key it was stored under.
    pub fn set(&mut self, key: &str, value: Value) -> String {
        let key = Self::normalize_key(key);
        self.data.insert(key.clone(), value);
        key
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(&Self::normalize_key(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(&Self::normalize_key(key))
    }

    /// Full replace, used by `update_store_vars`.
    pub fn replace(&mut self, other: StoreVars) {
        self.data = other.data;
    }

    /// Whether a script asked the run to block after the current node.
    pub fn is_waiting(&self) -> bool {
        match self.get(WAIT_FLAG) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
            _ => false,
        }
    }

    pub fn wait_reason(&self) -> Option<String> {
        match self.get(WAIT_REASON)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn clear_wait(&mut self) {
        self.data.remove(WAIT_FLAG);
        self.data.remove(WAIT_REASON);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone().into_iter().collect())
    }
}

impl From<BTreeMap<String, Value>> for StoreVars {
    fn from(raw: BTreeMap<String, Value>) -> Self {
        raw.into_iter().collect()
    }
}

impl FromIterator<(String, Value)> for StoreVars {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut vars = StoreVars::new();
        for (k, v) in iter {
            vars.set(&k, v);
        }
        vars
    }
}

impl Serialize for StoreVars {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_key() {
        assert_eq!(StoreVars::normalize_key("User Name"), "user_name");
        assert_eq!(StoreVars::normalize_key("  user--name "), "user_name");
        assert_eq!(StoreVars::normalize_key("Order.Total/Amount"), "order_total_amount");
        assert_eq!(StoreVars::normalize_key("_leading"), "leading");
        assert_eq!(StoreVars::normalize_key("already_ok"), "already_ok");
    }

    #[test]
    fn test_get_is_key_insensitive() {
        let mut vars = StoreVars::new();
        vars.set("Customer Id", json!(7));
        assert_eq!(vars.get("customer-id"), Some(&json!(7)));
        assert_eq!(vars.get("CUSTOMER_ID"), Some(&json!(7)));
        assert!(vars.contains("customer id"));
    }

    #[test]
    fn test_resolve_path() {
        let mut vars = StoreVars::new();
        vars.set(
            "order",
            json!({"Shipping Address": {"city": "Oslo"}, "items": [{"sku": "a1"}]}),
        );
        assert_eq!(vars.resolve("order:shipping_address.city"), Some(&json!("Oslo")));
        assert_eq!(vars.resolve("order:items.0.sku"), Some(&json!("a1")));
        assert_eq!(vars.resolve("order:items.5.sku"), None);
        assert_eq!(vars.resolve("missing:x"), None);
    }

    #[test]
    fn test_wait_flag() {
        let mut vars = StoreVars::new();
        assert!(!vars.is_waiting());
        vars.set(WAIT_FLAG, json!(true));
        vars.set(WAIT_REASON, json!("need approval"));
        assert!(vars.is_waiting());
        assert_eq!(vars.wait_reason().as_deref(), Some("need approval"));
        vars.clear_wait();
        assert!(!vars.is_waiting());
        assert!(vars.wait_reason().is_none());
    }

    #[test]
    fn test_deserialize_normalizes_keys() {
        let vars: StoreVars = serde_json::from_value(json!({"First Name": "Ada"})).unwrap();
        assert_eq!(vars.get("first_name"), Some(&json!("Ada")));
        let back = serde_json::to_value(&vars).unwrap();
        assert_eq!(back, json!({"first_name": "Ada"}));
    }

    #[test]
    fn test_error_key() {
        assert_eq!(StoreVars::error_key("Fetch Orders"), "fetch_orders_error");
    }
}
