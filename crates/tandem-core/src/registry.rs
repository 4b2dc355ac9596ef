//! Function registry: locally bound callables the peer may invoke by name.

use crate::error::RemoteFailure;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// A callable bound to a command name.
pub type BoundFunction =
    Arc<dyn Fn(Value) -> std::result::Result<Value, RemoteFailure> + Send + Sync>;

/// Concurrent map from command name to bound function.
///
/// Reads take a shared lock; the function is cloned out before it runs so
/// a bound function may itself register or remove entries.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, BoundFunction>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `function`, replacing any previous binding.
    pub fn set<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(Value) -> std::result::Result<Value, RemoteFailure> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut functions = self
            .functions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if functions.insert(name.clone(), Arc::new(function)).is_some() {
            warn!("Replaced existing binding for '{}'", name);
        }
    }

    /// Bind a typed function; the parameter and return value go through serde.
    ///
    /// A parameter that does not decode into `TIn` is answered with an
    /// `invalid_argument` failure without calling `function`.
    pub fn set_typed<TIn, TOut, F>(&self, name: impl Into<String>, function: F)
    where
        TIn: DeserializeOwned,
        TOut: Serialize,
        F: Fn(TIn) -> std::result::Result<TOut, RemoteFailure> + Send + Sync + 'static,
    {
        self.set(name, move |parameter: Value| {
            let input: TIn = serde_json::from_value(parameter)
                .map_err(|e| RemoteFailure::new("invalid_argument", e.to_string()))?;
            let output = function(input)?;
            serde_json::to_value(output).map_err(|e| RemoteFailure::new("serialization", e.to_string()))
        });
    }

    /// Remove the binding for `name`. Returns true if one existed.
    pub fn remove(&self, name: &str) -> bool {
        self.functions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every binding.
    pub fn clear(&self) {
        self.functions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    fn get(&self, name: &str) -> Option<BoundFunction> {
        self.functions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Invoke the function bound to `name`.
    ///
    /// Returns `None` if nothing is bound. A panicking function is reported
    /// as a `panic` failure instead of unwinding into the caller.
    pub fn invoke(&self, name: &str, parameter: Value) -> Option<std::result::Result<Value, RemoteFailure>> {
        let function = self.get(name)?;
        Some(call_guarded(name, || function(parameter)))
    }
}

/// Run a bound callable, turning a panic into a failure.
pub(crate) fn call_guarded<F>(name: &str, f: F) -> std::result::Result<Value, RemoteFailure>
where
    F: FnOnce() -> std::result::Result<Value, RemoteFailure>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "bound function panicked".to_string());
            warn!("Bound function '{}' panicked: {}", name, message);
            Err(RemoteFailure::new("panic", message))
        }
    }
}
