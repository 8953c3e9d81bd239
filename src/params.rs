//! Query parameters and their deterministic placeholder names.
//!
//! Placeholders use the store's server-side syntax `{name:Type}`. A name is
//! the owning node's path identifier plus a role suffix, e.g.
//! `{n_0_1_time:Int64}`, so the same tree always binds the same names.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::ast::NodePath;

/// The name of the team parameter shared by every scan.
pub const TEAM_ID: &str = "team_id";

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    String(String),
    StringList(Vec<String>),
}

impl ParamValue {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ParamValue::Int(_) => "Int64",
            ParamValue::Float(_) => "Float64",
            ParamValue::String(_) => "String",
            ParamValue::StringList(_) => "Array(String)",
        }
    }
}

/// Parameter mapping, ordered by name.
pub type Params = BTreeMap<String, ParamValue>;

/// Placeholder for the team id.
pub fn team_placeholder() -> String {
    format!("{{{}:Int64}}", TEAM_ID)
}

/// Binds parameters under one node's prefix.
pub struct ParamScope {
    prefix: String,
    params: Params,
}

impl ParamScope {
    pub fn new(path: &NodePath) -> Self {
        Self {
            prefix: path.ident(),
            params: Params::new(),
        }
    }

    /// Binds `value` and returns its placeholder.
    pub fn bind(&mut self, role: &str, value: ParamValue) -> String {
        let name = format!("{}_{}", self.prefix, role);
        let placeholder = format!("{{{}:{}}}", name, value.sql_type());
        self.params.insert(name, value);
        placeholder
    }

    pub fn into_params(self) -> Params {
        self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_is_prefixed_by_path() {
        let mut scope = ParamScope::new(&NodePath(vec![0, 2]));
        let placeholder = scope.bind("event", ParamValue::String("$pageview".to_string()));
        assert_eq!(placeholder, "{n_0_2_event:String}");

        let placeholder = scope.bind("values", ParamValue::StringList(vec!["a".to_string()]));
        assert_eq!(placeholder, "{n_0_2_values:Array(String)}");

        let params = scope.into_params();
        assert_eq!(params.len(), 2);
        assert_eq!(params["n_0_2_event"], ParamValue::String("$pageview".to_string()));
    }

    #[test]
    fn test_values_serialize_untagged() {
        let json = serde_json::to_string(&ParamValue::Int(3)).unwrap();
        assert_eq!(json, "3");
        let json = serde_json::to_string(&ParamValue::StringList(vec!["x".to_string()])).unwrap();
        assert_eq!(json, r#"["x"]"#);
    }
}
