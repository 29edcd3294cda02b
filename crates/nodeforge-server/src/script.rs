//! Script-execution namespace (§4.7): host-registered named callables a client can
//! invoke by name over the wire, the same trust boundary §4.7 draws around arbitrary
//! script text — only pre-registered entries are reachable, there is no `eval`.
//!
//! A `function`-backend node wraps one of these closures for the node contract; the
//! `execute_script` command reaches the same registry directly for one-off calls that
//! don't need a node identity at all.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, ServerError};

pub type ScriptFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

#[derive(Default)]
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<String, ScriptFn>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, f: ScriptFn) {
        self.scripts.write().insert(name.into(), f);
    }

    pub fn names(&self) -> Vec<String> {
        self.scripts.read().keys().cloned().collect()
    }

    pub fn call(&self, name: &str, args: Value) -> Result<Value> {
        let script = self
            .scripts
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ServerError::InvalidRequest(format!("no script registered under {name:?}")))?;
        script(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_name_is_an_invalid_request() {
        let registry = ScriptRegistry::new();
        assert!(registry.call("missing", Value::Null).is_err());
    }

    #[test]
    fn registered_script_runs_with_its_args() {
        let registry = ScriptRegistry::new();
        registry.register(
            "double",
            Arc::new(|args: Value| Ok(Value::from(args.as_i64().unwrap_or(0) * 2))),
        );
        assert_eq!(registry.call("double", Value::from(21)).unwrap(), Value::from(42));
    }
}
