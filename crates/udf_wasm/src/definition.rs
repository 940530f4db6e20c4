//! A validated, callable function.

use crate::abi::{AbiVersion, SlotPlan};
use crate::compile::{self, CompiledModule};
use crate::error::SignatureMismatch;
use std::sync::OnceLock;
use udf_core::{FunctionName, FunctionSignature, SourceHash};
use wasmtime::{FuncType, Module};

/// A registered function: compiled module, negotiated ABI and the slot plan
/// derived from its declared signature.
///
/// Definitions are immutable once built and shared between concurrent calls.
/// The only lazily computed state is the result of matching the exported
/// function type against the plan, which happens at most once.
#[derive(Debug)]
pub struct FunctionDefinition {
    name: FunctionName,
    signature: FunctionSignature,
    compiled: CompiledModule,
    func_type: FuncType,
    plan: SlotPlan,
    signature_check: OnceLock<Result<(), SignatureMismatch>>,
}

impl FunctionDefinition {
    pub(crate) fn new(
        name: FunctionName,
        signature: FunctionSignature,
        compiled: CompiledModule,
        func_type: FuncType,
        plan: SlotPlan,
    ) -> Self {
        Self {
            name,
            signature,
            compiled,
            func_type,
            plan,
            signature_check: OnceLock::new(),
        }
    }

    /// Qualified name
    #[must_use]
    pub fn name(&self) -> &FunctionName {
        &self.name
    }

    /// Declared signature
    #[must_use]
    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    /// Compiled module
    #[must_use]
    pub fn module(&self) -> &Module {
        self.compiled.module()
    }

    /// Hash of the module source
    #[must_use]
    pub fn source_hash(&self) -> &SourceHash {
        self.compiled.hash()
    }

    /// Negotiated ABI version
    #[must_use]
    pub fn abi(&self) -> AbiVersion {
        self.plan.abi
    }

    /// Slot plan of the declared signature
    #[must_use]
    pub fn plan(&self) -> &SlotPlan {
        &self.plan
    }

    /// Whether `other` would produce an identical definition
    #[must_use]
    pub fn same_source(&self, signature: &FunctionSignature, hash: &SourceHash) -> bool {
        &self.signature == signature && self.source_hash() == hash
    }

    /// Match the exported function type against the plan, once.
    ///
    /// # Errors
    ///
    /// Returns the cached mismatch on every call after the first failure
    pub fn ensure_signature(&self) -> Result<(), SignatureMismatch> {
        self.signature_check
            .get_or_init(|| {
                compile::check_signature(self.name.export(), &self.func_type, &self.plan)
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{CompileConfig, WasmCompiler};
    use udf_core::CqlType;

    fn definition(wat: &str, signature: FunctionSignature) -> FunctionDefinition {
        let compiler = WasmCompiler::new(wasmtime::Engine::default(), CompileConfig::default());
        let compiled = compiler.compile(wat.as_bytes()).unwrap();
        let func_type = compiler.lookup(&compiled, "f").unwrap();
        let plan = SlotPlan::derive(AbiVersion::V0, &signature).unwrap();
        FunctionDefinition::new(
            FunctionName::new("ks", "f"),
            signature,
            compiled,
            func_type,
            plan,
        )
    }

    const ID: &str = r#"(module (func (export "f") (param i64) (result i64) local.get 0))"#;

    #[test]
    fn test_accessors() {
        let sig = FunctionSignature::from_types(&[CqlType::BigInt], CqlType::BigInt);
        let def = definition(ID, sig.clone());
        assert_eq!(def.name().to_string(), "ks.f");
        assert_eq!(def.abi(), AbiVersion::V0);
        assert!(def.same_source(&sig, &SourceHash::compute(ID.as_bytes())));
        assert!(!def.same_source(&sig, &SourceHash::compute(b"(module)")));
    }

    #[test]
    fn test_ensure_signature_ok() {
        let sig = FunctionSignature::from_types(&[CqlType::BigInt], CqlType::BigInt);
        let def = definition(ID, sig);
        assert!(def.ensure_signature().is_ok());
        assert!(def.ensure_signature().is_ok());
    }

    #[test]
    fn test_ensure_signature_cached_failure() {
        let sig = FunctionSignature::from_types(&[CqlType::Int], CqlType::BigInt);
        let def = definition(ID, sig);
        let first = def.ensure_signature().unwrap_err();
        let second = def.ensure_signature().unwrap_err();
        assert_eq!(first, second);
        assert!(first.to_string().contains("Expected i32, got i64"));
    }
}
