//! Function names and declared signatures.

use crate::error::CoreError;
use crate::types::{CqlType, NullPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fully qualified function name, `keyspace.name`
///
/// The unqualified name doubles as the export looked up in the module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionName {
    /// Keyspace the function lives in
    pub keyspace: String,
    /// Function (and export) name
    pub name: String,
}

impl FunctionName {
    /// Create a new function name
    #[must_use]
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
        }
    }

    /// Export name inside the module
    #[must_use]
    pub fn export(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.name)
    }
}

impl FromStr for FunctionName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidName {
            name: s.to_string(),
            reason: reason.to_string(),
        };
        let (keyspace, name) = s
            .split_once('.')
            .ok_or_else(|| invalid("expected keyspace.name"))?;
        if keyspace.is_empty() || name.is_empty() {
            return Err(invalid("empty component"));
        }
        if name.contains('.') {
            return Err(invalid("too many components"));
        }
        Ok(Self::new(keyspace, name))
    }
}

/// A declared parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name
    pub name: String,
    /// Declared type
    pub ty: CqlType,
}

/// Declared signature of a function, as given at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    /// Parameters in call order
    pub params: Vec<Parameter>,
    /// Return type
    pub returns: CqlType,
    /// Null handling
    pub null_policy: NullPolicy,
}

impl FunctionSignature {
    /// Create a signature with no parameters
    #[must_use]
    pub fn new(returns: CqlType) -> Self {
        Self {
            params: Vec::new(),
            returns,
            null_policy: NullPolicy::default(),
        }
    }

    /// Build from a list of parameter types, naming them `arg0..argN`
    #[must_use]
    pub fn from_types(params: &[CqlType], returns: CqlType) -> Self {
        params
            .iter()
            .enumerate()
            .fold(Self::new(returns), |sig, (i, ty)| {
                sig.with_param(format!("arg{}", i), *ty)
            })
    }

    /// Append a parameter
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, ty: CqlType) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            ty,
        });
        self
    }

    /// Set the null policy
    #[must_use]
    pub fn with_null_policy(mut self, policy: NullPolicy) -> Self {
        self.null_policy = policy;
        self
    }

    /// Shorthand for `CALLED ON NULL INPUT`
    #[must_use]
    pub fn called_on_null_input(self) -> Self {
        self.with_null_policy(NullPolicy::CalledOnNullInput)
    }

    /// Number of declared parameters
    #[must_use]
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Declared parameter types
    pub fn param_types(&self) -> impl Iterator<Item = CqlType> + '_ {
        self.params.iter().map(|p| p.ty)
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{} {}", p.name, p.ty))
            .collect();
        write!(
            f,
            "({}) {} RETURNS {}",
            params.join(", "),
            self.null_policy,
            self.returns
        )
    }
}
