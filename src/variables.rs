use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::VariableError;
use crate::target::{BuildTarget, Environment};

/// Key-value lookup feeding the environment injection transform. Reading a
/// key that was never declared is an error, a declared `null` is not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    values: BTreeMap<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Result<&Value, VariableError> {
        self.values
            .get(key)
            .ok_or_else(|| VariableError::Missing(key.to_string()))
    }

    pub fn get_maybe(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = (String, Value)>) -> &mut Self {
        self.values.extend(other);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Project variables with the standard build variables layered on top.
    pub fn for_build(
        project: &BTreeMap<String, Value>,
        target: BuildTarget,
        environment: Environment,
        version: &str,
    ) -> Self {
        let mut vars = Self::new();
        vars.extend(project.clone());

        let debug = if target.is_dev() || target.is_test() {
            project.get("DEBUG").cloned().unwrap_or(Value::Null)
        } else {
            Value::Null
        };

        vars.set("DEBUG", debug)
            .set("IN_TEST", target.is_test())
            .set(
                "NODE_ENV",
                if target.is_dev() {
                    "development"
                } else {
                    "production"
                },
            )
            .set("BUILD_ENVIRONMENT", environment.as_str())
            .set("BUILD_TARGET", target.as_str())
            .set("BUILD_VERSION", version);

        vars
    }
}
