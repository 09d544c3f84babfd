/// The host object graph that hooks intercept.
///
/// The host application exposes its callable surface as a flat table of
/// dotted paths. Everything that wants hookable behaviour calls through
/// `HostFunctions::call` rather than holding the function directly.
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use modhost_core::HookError;
use serde_json::Value;

pub type HostFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

#[derive(Default)]
pub struct HostFunctions {
    fns: RwLock<HashMap<String, HostFn>>,
}

impl HostFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or redefine) the function at `path`.
    pub fn define(&self, path: impl Into<String>, f: impl Fn(&[Value]) -> Value + Send + Sync + 'static) {
        self.set(path.into(), Arc::new(f));
    }

    pub fn resolve(&self, path: &str) -> Option<HostFn> {
        self.fns.read().unwrap_or_else(PoisonError::into_inner).get(path).cloned()
    }

    /// Invoke the function currently installed at `path`.
    ///
    /// No lock is held during the call, so the callee may call other paths.
    pub fn call(&self, path: &str, args: Vec<Value>) -> Result<Value, HookError> {
        let f = self
            .resolve(path)
            .ok_or_else(|| HookError::UnknownPath(path.to_string()))?;
        Ok(f(&args[..]))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.fns.read().unwrap_or_else(PoisonError::into_inner).contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .fns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Install `f` only if `expected` is still the function at `path`.
    pub(crate) fn swap_if_current(&self, path: &str, expected: &HostFn, f: HostFn) -> bool {
        let mut fns = self.fns.write().unwrap_or_else(PoisonError::into_inner);
        match fns.get_mut(path) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                *current = f;
                true
            }
            _ => false,
        }
    }

    /// Swap in `f`, returning whatever was installed before.
    pub(crate) fn set(&self, path: String, f: HostFn) -> Option<HostFn> {
        self.fns.write().unwrap_or_else(PoisonError::into_inner).insert(path, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_resolves_dotted_path() {
        let host = HostFunctions::new();
        host.define("math.add", |args| json!(args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0)));
        assert_eq!(host.call("math.add", vec![json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(host.paths(), vec!["math.add".to_string()]);
    }

    #[test]
    fn unknown_path_is_an_error() {
        let host = HostFunctions::new();
        assert_eq!(
            host.call("nope", vec![]).unwrap_err(),
            HookError::UnknownPath("nope".into())
        );
    }
}
