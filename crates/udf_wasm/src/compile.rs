//! Module compilation and export validation.

use crate::abi::SlotPlan;
use crate::error::{CompilationError, SignatureMismatch, SlotPosition, ValidationError};
use serde::{Deserialize, Serialize};
use udf_core::{SlotKind, SourceHash};
use wasmtime::{Engine, ExternType, FuncType, Module, ValType};

/// Default maximum module source size, 10 MiB
pub const DEFAULT_MAX_MODULE_SIZE: usize = 10 * 1024 * 1024;

/// Compilation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Largest accepted module source in bytes
    pub max_module_size: usize,
}

impl CompileConfig {
    /// Create a new compile config
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_module_size: DEFAULT_MAX_MODULE_SIZE,
        }
    }

    /// Set the maximum module size
    #[must_use]
    pub fn with_max_module_size(mut self, size: usize) -> Self {
        self.max_module_size = size;
        self
    }
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiled module ready to be instantiated
#[derive(Debug, Clone)]
pub struct CompiledModule {
    module: Module,
    hash: SourceHash,
    size: usize,
}

impl CompiledModule {
    /// Underlying module
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Hash of the source the module was compiled from
    #[must_use]
    pub fn hash(&self) -> &SourceHash {
        &self.hash
    }

    /// Source size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the module exports `name`
    #[must_use]
    pub fn has_export(&self, name: &str) -> bool {
        self.module.get_export(name).is_some()
    }
}

/// Compiles module sources and validates their exports
#[derive(Clone)]
pub struct WasmCompiler {
    engine: Engine,
    config: CompileConfig,
}

impl WasmCompiler {
    /// Create a new compiler on `engine`
    #[must_use]
    pub fn new(engine: Engine, config: CompileConfig) -> Self {
        Self { engine, config }
    }

    /// Engine modules are compiled for
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Compilation configuration
    #[must_use]
    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    /// Compile a module from text or binary source
    ///
    /// # Errors
    ///
    /// Returns error if the source is too large, does not parse, or does
    /// not validate
    pub fn compile(&self, source: &[u8]) -> Result<CompiledModule, CompilationError> {
        if source.len() > self.config.max_module_size {
            return Err(CompilationError::TooLarge {
                size: source.len(),
                limit: self.config.max_module_size,
            });
        }

        let binary = wat::parse_bytes(source)
            .map_err(|e| CompilationError::InvalidModule(e.to_string()))?;
        let module = Module::from_binary(&self.engine, &binary)
            .map_err(|e| CompilationError::InvalidModule(format!("{e:#}")))?;

        Ok(CompiledModule {
            module,
            hash: SourceHash::compute(source),
            size: source.len(),
        })
    }

    /// Reject modules that import anything; the sandbox provides no host
    /// functions
    ///
    /// # Errors
    ///
    /// Returns the first unresolved import
    pub fn check_imports(&self, compiled: &CompiledModule) -> Result<(), ValidationError> {
        match compiled.module.imports().next() {
            Some(import) => Err(ValidationError::UnresolvedImport {
                module: import.module().to_string(),
                name: import.name().to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Find the exported function `export`
    ///
    /// # Errors
    ///
    /// Returns error if the export is missing or not a function
    pub fn lookup(
        &self,
        compiled: &CompiledModule,
        export: &str,
    ) -> Result<FuncType, ValidationError> {
        match compiled.module.get_export(export) {
            Some(ExternType::Func(ty)) => Ok(ty),
            Some(other) => Err(ValidationError::NotAFunction {
                export: export.to_string(),
                kind: extern_kind(&other),
            }),
            None => Err(ValidationError::ExportNotFound {
                export: export.to_string(),
            }),
        }
    }

    /// Find the exported function `export` and match it against `plan`
    ///
    /// # Errors
    ///
    /// Returns error if the export is missing, not a function, or its type
    /// does not fit the plan
    pub fn resolve(
        &self,
        compiled: &CompiledModule,
        export: &str,
        plan: &SlotPlan,
    ) -> Result<FuncType, ValidationError> {
        let func = self.lookup(compiled, export)?;
        check_signature(export, &func, plan)?;
        Ok(func)
    }
}

/// Short name of an export's kind
#[must_use]
#[allow(unreachable_patterns)]
pub fn extern_kind(ty: &ExternType) -> &'static str {
    match ty {
        ExternType::Func(_) => "function",
        ExternType::Global(_) => "global",
        ExternType::Table(_) => "table",
        ExternType::Memory(_) => "memory",
        _ => "non-function export",
    }
}

fn slot_matches(expected: SlotKind, found: &ValType) -> bool {
    matches!(
        (expected, found),
        (SlotKind::I32, ValType::I32)
            | (SlotKind::I64, ValType::I64)
            | (SlotKind::F32, ValType::F32)
            | (SlotKind::F64, ValType::F64)
    )
}

/// Check an exported function type against a slot plan.
///
/// Arity is checked first, then the result count, then each parameter in
/// order and finally the result.
///
/// # Errors
///
/// Returns the first mismatch found
pub fn check_signature(
    export: &str,
    func: &FuncType,
    plan: &SlotPlan,
) -> Result<(), SignatureMismatch> {
    let declared = plan.params.len();
    let actual = func.params().len();
    if declared != actual {
        return Err(SignatureMismatch::Arity {
            export: export.to_string(),
            declared,
            actual,
        });
    }

    let results: Vec<ValType> = func.results().collect();
    if results.len() != 1 {
        return Err(SignatureMismatch::ResultCount {
            export: export.to_string(),
            actual: results.len(),
        });
    }

    for (index, (expected, found)) in plan.param_slots().zip(func.params()).enumerate() {
        if !slot_matches(expected, &found) {
            return Err(SignatureMismatch::Slot {
                position: SlotPosition::Parameter(index),
                expected,
                found: found.to_string(),
            });
        }
    }

    let expected = plan.result.slot();
    if !slot_matches(expected, &results[0]) {
        return Err(SignatureMismatch::Slot {
            position: SlotPosition::Return,
            expected,
            found: results[0].to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::AbiVersion;
    use udf_core::{CqlType, FunctionSignature};

    fn compiler() -> WasmCompiler {
        WasmCompiler::new(Engine::default(), CompileConfig::default())
    }

    const INC: &str = r#"(module
        (func (export "inc") (param f32) (result f32)
            local.get 0
            f32.const 1
            f32.add)
        (memory (export "memory") 1))"#;

    fn plan(params: &[CqlType], returns: CqlType) -> SlotPlan {
        let sig = FunctionSignature::from_types(params, returns);
        SlotPlan::derive(AbiVersion::V0, &sig).unwrap()
    }

    #[test]
    fn test_compile_config_new() {
        let config = CompileConfig::new();
        assert_eq!(config.max_module_size, DEFAULT_MAX_MODULE_SIZE);
        assert_eq!(config.with_max_module_size(10).max_module_size, 10);
    }

    #[test]
    fn test_compile_text() {
        let module = compiler().compile(INC.as_bytes()).unwrap();
        assert!(module.has_export("inc"));
        assert!(!module.has_export("dec"));
        assert_eq!(module.size(), INC.len());
        assert_eq!(*module.hash(), SourceHash::compute(INC.as_bytes()));
    }

    #[test]
    fn test_compile_binary() {
        let binary = wat::parse_str(INC).unwrap();
        let module = compiler().compile(&binary).unwrap();
        assert!(module.has_export("inc"));
    }

    #[test]
    fn test_compile_garbage() {
        let err = compiler().compile(b"not a module at all").unwrap_err();
        assert!(err.to_string().contains("Compilation failed"));
    }

    #[test]
    fn test_compile_invalid_bytecode() {
        let err = compiler()
            .compile(br#"(module (func (result i32) f32.const 1))"#)
            .unwrap_err();
        assert!(matches!(err, CompilationError::InvalidModule(_)));
    }

    #[test]
    fn test_compile_too_large() {
        let compiler = WasmCompiler::new(
            Engine::default(),
            CompileConfig::new().with_max_module_size(4),
        );
        let err = compiler.compile(b"(module)").unwrap_err();
        assert_eq!(err, CompilationError::TooLarge { size: 8, limit: 4 });
    }

    #[test]
    fn test_check_imports() {
        let c = compiler();
        let module = c
            .compile(br#"(module (import "env" "log" (func (param i32))))"#)
            .unwrap();
        let err = c.check_imports(&module).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnresolvedImport {
                module: "env".to_string(),
                name: "log".to_string()
            }
        );
        let module = c.compile(INC.as_bytes()).unwrap();
        assert!(c.check_imports(&module).is_ok());
    }

    #[test]
    fn test_lookup() {
        let c = compiler();
        let module = c.compile(INC.as_bytes()).unwrap();
        assert!(c.lookup(&module, "inc").is_ok());

        let err = c.lookup(&module, "dec").unwrap_err();
        assert!(err.to_string().contains("not found"));

        let err = c.lookup(&module, "memory").unwrap_err();
        assert!(err.to_string().contains("not a function"));
        assert!(matches!(err, ValidationError::NotAFunction { kind: "memory", .. }));
    }

    #[test]
    fn test_check_signature() {
        let c = compiler();
        let module = c.compile(INC.as_bytes()).unwrap();
        let func = c.lookup(&module, "inc").unwrap();

        assert!(check_signature("inc", &func, &plan(&[CqlType::Float], CqlType::Float)).is_ok());

        let err =
            check_signature("inc", &func, &plan(&[CqlType::Int], CqlType::Float)).unwrap_err();
        assert!(matches!(
            err,
            SignatureMismatch::Slot {
                position: SlotPosition::Parameter(0),
                ..
            }
        ));

        let err =
            check_signature("inc", &func, &plan(&[CqlType::Float], CqlType::Int)).unwrap_err();
        assert!(err.to_string().contains("Expected i32, got f32"));

        let err = check_signature(
            "inc",
            &func,
            &plan(&[CqlType::Float, CqlType::Float], CqlType::Float),
        )
        .unwrap_err();
        assert!(err.to_string().contains("number of arguments"));
    }

    #[test]
    fn test_resolve() {
        let c = compiler();
        let module = c.compile(INC.as_bytes()).unwrap();
        let func = c
            .resolve(&module, "inc", &plan(&[CqlType::Float], CqlType::Float))
            .unwrap();
        assert_eq!(func.results().len(), 1);

        let err = c
            .resolve(&module, "inc", &plan(&[CqlType::Float], CqlType::Double))
            .unwrap_err();
        assert!(matches!(err, ValidationError::SignatureMismatch(_)));
        assert!(err.to_string().contains("type mismatch"));

        let err = c
            .resolve(&module, "memory", &plan(&[], CqlType::Int))
            .unwrap_err();
        assert!(err.to_string().contains("not a function"));
    }

    #[test]
    fn test_check_signature_result_count() {
        let c = compiler();
        let module = c.compile(br#"(module (func (export "f")))"#).unwrap();
        let func = c.lookup(&module, "f").unwrap();
        let err = check_signature("f", &func, &plan(&[], CqlType::Int)).unwrap_err();
        assert!(matches!(err, SignatureMismatch::ResultCount { actual: 0, .. }));
    }
}
