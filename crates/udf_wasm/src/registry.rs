//! Named function registry.

use crate::definition::FunctionDefinition;
use crate::error::{UdfError, UdfResult};
use crate::sandbox::{Invocation, Sandbox};
use indexmap::IndexMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};
use udf_core::{CqlValue, FunctionName, FunctionSignature, SourceHash};

/// Registered functions by qualified name, in creation order.
///
/// Calls clone the definition's `Arc` out of the map and run without the
/// lock held, so a concurrent `drop` or `create_or_replace` never blocks or
/// disturbs calls already in flight.
pub struct FunctionRegistry {
    sandbox: Arc<Sandbox>,
    functions: RwLock<IndexMap<FunctionName, Arc<FunctionDefinition>>>,
}

impl FunctionRegistry {
    /// Create an empty registry on `sandbox`
    #[must_use]
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            sandbox,
            functions: RwLock::new(IndexMap::new()),
        }
    }

    /// Underlying sandbox
    #[must_use]
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Register a new function
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the name is taken, or the registration error
    pub fn create(
        &self,
        name: FunctionName,
        signature: FunctionSignature,
        source: &[u8],
    ) -> UdfResult<Arc<FunctionDefinition>> {
        if self.contains(&name) {
            return Err(UdfError::AlreadyExists {
                function: name.to_string(),
            });
        }
        let definition = Arc::new(self.sandbox.register(name.clone(), signature, source)?);

        let mut functions = self.functions.write().unwrap_or_else(PoisonError::into_inner);
        if functions.contains_key(&name) {
            return Err(UdfError::AlreadyExists {
                function: name.to_string(),
            });
        }
        functions.insert(name.clone(), Arc::clone(&definition));
        info!(function = %name, "function created");
        Ok(definition)
    }

    /// Register a function, replacing any previous definition.
    ///
    /// An identical signature and source keeps the existing definition
    /// without recompiling.
    ///
    /// # Errors
    ///
    /// Returns the registration error; the previous definition is kept
    pub fn create_or_replace(
        &self,
        name: FunctionName,
        signature: FunctionSignature,
        source: &[u8],
    ) -> UdfResult<Arc<FunctionDefinition>> {
        if let Some(existing) = self.get(&name) {
            if existing.same_source(&signature, &SourceHash::compute(source)) {
                debug!(function = %name, "definition unchanged, keeping compiled module");
                return Ok(existing);
            }
        }
        let definition = Arc::new(self.sandbox.register(name.clone(), signature, source)?);
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::clone(&definition));
        info!(function = %name, "function replaced");
        Ok(definition)
    }

    /// Remove a function
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such function exists
    pub fn drop(&self, name: &FunctionName) -> UdfResult<Arc<FunctionDefinition>> {
        let removed = self
            .functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(name)
            .ok_or_else(|| UdfError::NotFound {
                function: name.to_string(),
            })?;
        info!(function = %name, "function dropped");
        Ok(removed)
    }

    /// Look up a function
    #[must_use]
    pub fn get(&self, name: &FunctionName) -> Option<Arc<FunctionDefinition>> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Whether a function is registered
    #[must_use]
    pub fn contains(&self, name: &FunctionName) -> bool {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Call a function by name
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or the invocation error
    pub fn call(&self, name: &FunctionName, args: &[Option<CqlValue>]) -> UdfResult<Invocation> {
        let definition = self.get(name).ok_or_else(|| UdfError::NotFound {
            function: name.to_string(),
        })?;
        self.sandbox.call(&definition, args)
    }

    /// Registered names in creation order
    #[must_use]
    pub fn names(&self) -> Vec<FunctionName> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of registered functions
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no function is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
