//! Scoped variable context
//!
//! A context is a chain of scopes. Lookup walks from the innermost scope
//! outward. A write lands in the scope that declares the name, so loop
//! and branch bodies can update outer variables while names they
//! introduce stay local and vanish with the child scope.

use crate::expr::VariableResolver;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct VariableContext {
    scope: Arc<Scope>,
}

#[derive(Debug)]
struct Scope {
    bindings: RwLock<HashMap<String, Value>>,
    parent: Option<Arc<Scope>>,
}

impl Default for VariableContext {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableContext {
    pub fn new() -> Self {
        Self {
            scope: Arc::new(Scope {
                bindings: RwLock::new(HashMap::new()),
                parent: None,
            }),
        }
    }

    /// Innermost-out lookup.
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut scope = Some(&self.scope);
        while let Some(s) = scope {
            if let Some(value) = s.bindings.read().get(name) {
                return Some(value.clone());
            }
            scope = s.parent.as_ref();
        }
        None
    }

    /// Write to the scope that declares `name`; if no scope does, the
    /// name is declared in the current scope.
    pub fn set(&self, name: &str, value: Value) {
        let mut scope = Some(&self.scope);
        while let Some(s) = scope {
            let mut bindings = s.bindings.write();
            if bindings.contains_key(name) {
                bindings.insert(name.to_string(), value);
                return;
            }
            drop(bindings);
            scope = s.parent.as_ref();
        }
        self.scope.bindings.write().insert(name.to_string(), value);
    }

    /// Declare `name` in the current scope, shadowing any outer binding.
    pub fn declare(&self, name: &str, value: Value) {
        self.scope.bindings.write().insert(name.to_string(), value);
    }

    /// A nested scope sharing this context's chain as its parent.
    /// Dropping the returned context discards everything declared in it.
    pub fn child_scope(&self) -> VariableContext {
        VariableContext {
            scope: Arc::new(Scope {
                bindings: RwLock::new(HashMap::new()),
                parent: Some(self.scope.clone()),
            }),
        }
    }

    /// Immutable map of every visible binding; inner scopes shadow outer
    /// ones.
    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        let mut chain = Vec::new();
        let mut scope = Some(&self.scope);
        while let Some(s) = scope {
            chain.push(s);
            scope = s.parent.as_ref();
        }

        let mut out = serde_json::Map::new();
        for s in chain.into_iter().rev() {
            for (name, value) in s.bindings.read().iter() {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }
}

impl VariableResolver for VariableContext {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.get(name)
    }
}
