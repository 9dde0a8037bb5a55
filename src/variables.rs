//! Variable scopes.
//!
//! Transaction variables live for a single traffic request. Global variables
//! persist across requests and are shared by every request handler.

use crate::error::PayloadError;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Variables scoped to one request.
pub type TransactionVars = BTreeMap<String, String>;

/// Process-wide variables.
#[derive(Debug, Default)]
pub struct GlobalVariables {
    vars: RwLock<BTreeMap<String, String>>,
}

impl GlobalVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.vars.read().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.write().insert(name.into(), value.into());
    }

    /// Remove one variable, returning whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.vars.write().remove(name).is_some()
    }

    /// Remove every variable, returning whether any existed.
    pub fn clear(&self) -> bool {
        let mut vars = self.vars.write();
        let had_any = !vars.is_empty();
        vars.clear();
        had_any
    }

    pub fn len(&self) -> usize {
        self.vars.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.read().is_empty()
    }

    /// Load an object of `name -> scalar` pairs.
    ///
    /// The whole document is checked before anything is stored, so a rejected
    /// payload leaves the current variables untouched.
    pub fn load_json(&self, document: &Value) -> Result<usize, PayloadError> {
        let object = document
            .as_object()
            .ok_or_else(|| PayloadError::Schema("expected an object".to_string()))?;

        let mut parsed = Vec::with_capacity(object.len());
        for (name, value) in object {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(PayloadError::Schema(format!(
                        "variable '{name}' must be a string, number or boolean"
                    )))
                }
            };
            parsed.push((name.clone(), text));
        }

        let count = parsed.len();
        self.vars.write().extend(parsed);
        Ok(count)
    }

    pub fn to_json(&self) -> Value {
        let vars = self.vars.read();
        let map: Map<String, Value> = vars
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Value::Object(map)
    }
}

/// Replace `@{name}` tokens in `text`.
///
/// Transaction variables shadow global variables of the same name. Tokens
/// naming an unknown variable are left as they are.
pub fn substitute(text: &str, local: &TransactionVars, global: &GlobalVariables) -> String {
    if !text.contains("@{") {
        return text.to_string();
    }

    let globals = global.vars.read();
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("@{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match local.get(name).or_else(|| globals.get(name)) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + end + 3]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitute_two_variables() {
        let globals = GlobalVariables::new();
        let mut local = TransactionVars::new();
        local.insert("var1".into(), "value1".into());
        local.insert("var2".into(), "value2".into());

        assert_eq!(
            substitute("@{var1}-@{var2}", &local, &globals),
            "value1-value2"
        );
    }

    #[test]
    fn test_transaction_scope_shadows_global() {
        let globals = GlobalVariables::new();
        globals.set("name", "global");
        globals.set("only_global", "g");
        let mut local = TransactionVars::new();
        local.insert("name".into(), "local".into());

        assert_eq!(substitute("@{name}", &local, &globals), "local");
        assert_eq!(substitute("@{only_global}", &local, &globals), "g");
    }

    #[test]
    fn test_unknown_and_unterminated_tokens_kept() {
        let globals = GlobalVariables::new();
        let local = TransactionVars::new();

        assert_eq!(substitute("a@{missing}b", &local, &globals), "a@{missing}b");
        assert_eq!(substitute("x@{open", &local, &globals), "x@{open");
        assert_eq!(substitute("plain", &local, &globals), "plain");
    }

    #[test]
    fn test_load_json_scalars() {
        let globals = GlobalVariables::new();
        let loaded = globals
            .load_json(&json!({"a": "1", "b": 2, "c": true}))
            .unwrap();

        assert_eq!(loaded, 3);
        assert_eq!(globals.get("b").as_deref(), Some("2"));
        assert_eq!(globals.get("c").as_deref(), Some("true"));
    }

    #[test]
    fn test_load_json_rejects_nested_without_side_effects() {
        let globals = GlobalVariables::new();
        let err = globals
            .load_json(&json!({"a": "1", "b": {"nested": true}}))
            .unwrap_err();

        assert!(err.is_schema());
        assert!(globals.is_empty());
        assert!(globals.load_json(&json!(["a"])).is_err());
    }

    #[test]
    fn test_remove_and_clear() {
        let globals = GlobalVariables::new();
        globals.set("a", "1");
        globals.set("b", "2");

        assert!(globals.remove("a"));
        assert!(!globals.remove("a"));
        assert_eq!(globals.to_json(), json!({"b": "2"}));
        assert!(globals.clear());
        assert!(!globals.clear());
    }
}
