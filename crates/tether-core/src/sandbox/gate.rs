//! Import gate: the `require` seen by sandboxed scripts.
//!
//! A gate is created per execution and installed into that execution's
//! environment table, so two scripts never share (or race on) import state.

use mlua::{Lua, Table, Value};
use std::sync::Arc;

/// Modules a script may obtain through `require`.
///
/// These are the standard libraries the sandbox interpreter is created with;
/// anything else is reported as not found.
pub const SAFE_MODULES: &[&str] = &["string", "table", "math", "utf8", "coroutine"];

/// Rejects imports whose root package is on a denylist.
#[derive(Debug, Clone)]
pub struct ImportGate {
    blocked: Arc<[String]>,
}

impl ImportGate {
    /// Create a gate rejecting the given root package names.
    pub fn new<I, S>(blocked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked: blocked.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether importing `module` (or any submodule of its root) is denied.
    pub fn is_blocked(&self, module: &str) -> bool {
        let root = root_of(module);
        self.blocked.iter().any(|b| b == root)
    }

    /// Resolve a module for `require`.
    pub fn resolve(&self, lua: &Lua, module: &str) -> mlua::Result<Value> {
        if self.is_blocked(module) {
            tracing::warn!(module = %module, "Blocked import");
            return Err(mlua::Error::runtime(format!(
                "import of '{module}' is blocked"
            )));
        }
        if SAFE_MODULES.contains(&module) {
            return lua.globals().get::<Value>(module);
        }
        Err(mlua::Error::runtime(format!("module '{module}' not found")))
    }

    /// Install `require` into `env`.
    pub fn install(&self, lua: &Lua, env: &Table) -> mlua::Result<()> {
        let gate = self.clone();
        let require = lua.create_function(move |lua, module: String| gate.resolve(lua, &module))?;
        env.set("require", require)
    }
}

fn root_of(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::{LuaOptions, StdLib};

    fn gate() -> ImportGate {
        ImportGate::new(["os", "io", "subprocess", "socket"])
    }

    #[test]
    fn test_root_name_is_checked() {
        let gate = gate();
        assert!(gate.is_blocked("os"));
        assert!(gate.is_blocked("socket.http"));
        assert!(!gate.is_blocked("string"));
        assert!(!gate.is_blocked("osmosis"));
    }

    #[test]
    fn test_resolve() {
        let lua = Lua::new_with(StdLib::STRING | StdLib::MATH, LuaOptions::default()).unwrap();
        let gate = gate();

        let string = gate.resolve(&lua, "string").unwrap();
        assert!(matches!(string, Value::Table(_)));

        let err = gate.resolve(&lua, "subprocess").unwrap_err();
        assert!(err.to_string().contains("import of 'subprocess' is blocked"));

        let err = gate.resolve(&lua, "lpeg").unwrap_err();
        assert!(err.to_string().contains("module 'lpeg' not found"));
    }

    #[test]
    fn test_gates_are_independent() {
        let strict = ImportGate::new(["math"]);
        let lax = ImportGate::new(Vec::<String>::new());
        assert!(strict.is_blocked("math"));
        assert!(!lax.is_blocked("math"));
    }
}
