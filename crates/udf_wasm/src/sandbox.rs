//! Sandboxed execution of registered functions.
//!
//! Every call gets its own store and instance: fuel, linear memory and
//! globals never leak between calls. Only the engine and compiled modules
//! are shared.

use crate::abi::{self, AbiVersion, SlotPlan, ABI_EXPORT, MEMORY_EXPORT};
use crate::compile::{CompileConfig, CompiledModule, WasmCompiler};
use crate::definition::FunctionDefinition;
use crate::error::{
    InvocationError, MarshalingError, RuntimeFailure, UdfError, UdfResult, ValidationError,
};
use crate::fuel::{self, FuelMeter, DEFAULT_MAX_FUEL};
use crate::marshal::{self, Marshaler};
use crate::memory::{GuestMemory, MemoryLimit};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use udf_core::{CqlValue, FunctionName, FunctionSignature};
use wasmtime::{Engine, ExternType, Instance, Store, StoreLimits, Val};

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Fuel budget of a single call
    pub max_fuel: u64,
    /// Linear memory limit of a single call, in bytes
    pub memory_limit: u64,
    /// Match exported function types at registration instead of first call
    pub eager_signature_check: bool,
    /// Compilation config
    #[serde(flatten)]
    pub compile_config: CompileConfig,
}

impl SandboxConfig {
    /// Create a new sandbox config
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_fuel: DEFAULT_MAX_FUEL,
            memory_limit: MemoryLimit::default().max_bytes,
            eager_signature_check: false,
            compile_config: CompileConfig::new(),
        }
    }

    /// Set maximum fuel
    #[must_use]
    pub fn with_max_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = fuel;
        self
    }

    /// Set memory limit
    #[must_use]
    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Set the maximum module source size
    #[must_use]
    pub fn with_max_module_size(mut self, size: usize) -> Self {
        self.compile_config.max_module_size = size;
        self
    }

    /// Enable/disable signature checking at registration
    #[must_use]
    pub fn with_eager_signature_check(mut self, eager: bool) -> Self {
        self.eager_signature_check = eager;
        self
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Data attached to each store
pub struct StoreState {
    limits: StoreLimits,
}

/// Per-call execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Instantiated, arguments being staged
    Ready,
    /// Control is inside the sandbox
    Running,
    /// Returned normally
    Completed,
    /// Stopped by a trap
    Trapped,
    /// Stopped by running out of fuel
    FuelExhausted,
}

/// Outcome of a successful call
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Result, `None` for null
    pub value: Option<CqlValue>,
    /// Fuel spent by the call
    pub fuel_consumed: u64,
    /// False when the call was skipped because of a null argument
    pub executed: bool,
}

impl Invocation {
    fn skipped() -> Self {
        Self {
            value: None,
            fuel_consumed: 0,
            executed: false,
        }
    }
}

/// State of one call: a fresh store and instance
pub struct ExecutionContext<'a> {
    definition: &'a FunctionDefinition,
    store: Store<StoreState>,
    instance: Instance,
    meter: FuelMeter,
    state: CallState,
}

impl<'a> ExecutionContext<'a> {
    /// Instantiate the definition's module in a fresh store
    ///
    /// # Errors
    ///
    /// Returns error if instantiation traps or runs out of fuel
    pub fn new(
        sandbox: &Sandbox,
        definition: &'a FunctionDefinition,
    ) -> Result<Self, InvocationError> {
        let budget = sandbox.config.max_fuel;
        let mut store = sandbox
            .new_store()
            .map_err(|e| RuntimeFailure::Trapped(format!("{e:#}")))?;
        let instance = Instance::new(&mut store, definition.module(), &[])
            .map_err(|e| fuel::classify_trap(&e, budget))?;
        Ok(Self {
            definition,
            store,
            instance,
            meter: FuelMeter::new(budget),
            state: CallState::Ready,
        })
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Fuel accounting, final once `run` returned
    #[must_use]
    pub fn meter(&self) -> &FuelMeter {
        &self.meter
    }

    /// Marshal `args`, run the export and marshal the result back
    ///
    /// # Errors
    ///
    /// Returns error if marshaling fails or execution traps
    pub fn run(&mut self, args: &[Option<CqlValue>]) -> Result<Option<CqlValue>, InvocationError> {
        let outcome = self.invoke(args);
        self.meter.record(self.store.get_fuel().unwrap_or(0));
        match &outcome {
            Err(InvocationError::Runtime(RuntimeFailure::FuelExhausted { .. })) => {
                self.meter.exhaust();
                self.state = CallState::FuelExhausted;
            }
            Err(InvocationError::Runtime(RuntimeFailure::Trapped(_))) => {
                self.state = CallState::Trapped;
            }
            _ => {}
        }
        outcome
    }

    fn invoke(&mut self, args: &[Option<CqlValue>]) -> Result<Option<CqlValue>, InvocationError> {
        let definition = self.definition;
        let budget = self.meter.initial();

        let memory = if definition.plan().uses_memory() {
            Some(GuestMemory::locate(&mut self.store, &self.instance)?)
        } else {
            None
        };
        let marshaler = Marshaler::new(definition.signature(), definition.plan(), memory, budget);
        let params = marshaler.lower_args(&mut self.store, args)?;

        let func = self
            .instance
            .get_func(&mut self.store, definition.name().export())
            .ok_or_else(|| {
                RuntimeFailure::Trapped("function export missing from instance".to_string())
            })?;

        let mut results = [Val::I32(0)];
        self.state = CallState::Running;
        debug!(function = %definition.name(), state = ?self.state, "entering sandbox");
        func.call(&mut self.store, &params, &mut results)
            .map_err(|e| fuel::classify_trap(&e, budget))?;
        self.state = CallState::Completed;

        marshaler.lift_result(&mut self.store, &results[0])
    }
}

/// Compiles, validates and runs functions
pub struct Sandbox {
    engine: Engine,
    compiler: WasmCompiler,
    config: SandboxConfig,
}

impl Sandbox {
    /// Create a new sandbox with a fuel-metering engine
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be created
    pub fn new(config: SandboxConfig) -> UdfResult<Self> {
        let mut engine_config = wasmtime::Config::new();
        engine_config.consume_fuel(true);
        let engine =
            Engine::new(&engine_config).map_err(|e| UdfError::Setup(format!("{e:#}")))?;
        let compiler = WasmCompiler::new(engine.clone(), config.compile_config.clone());
        Ok(Self {
            engine,
            compiler,
            config,
        })
    }

    /// Sandbox configuration
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Shared engine
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Module compiler
    #[must_use]
    pub fn compiler(&self) -> &WasmCompiler {
        &self.compiler
    }

    fn new_store(&self) -> wasmtime::Result<Store<StoreState>> {
        let limits = MemoryLimit::new(self.config.memory_limit).store_limits();
        let mut store = Store::new(&self.engine, StoreState { limits });
        store.limiter(|state| &mut state.limits);
        store.set_fuel(self.config.max_fuel)?;
        Ok(store)
    }

    /// Compile and validate a function.
    ///
    /// The module must compile, import nothing, export `name` as a function
    /// and declare an ABI able to carry the signature. The exported function
    /// type is matched against the signature here only when
    /// `eager_signature_check` is set; otherwise on the first call.
    ///
    /// # Errors
    ///
    /// Returns a compilation or validation error
    pub fn register(
        &self,
        name: FunctionName,
        signature: FunctionSignature,
        source: &[u8],
    ) -> UdfResult<FunctionDefinition> {
        let compiled = self.compiler.compile(source)?;
        self.compiler.check_imports(&compiled)?;
        let func_type = self.compiler.lookup(&compiled, name.export())?;
        let abi = self.negotiate(&compiled)?;
        let plan = SlotPlan::derive(abi, &signature)?;

        if plan.uses_memory()
            && !matches!(
                compiled.module().get_export(MEMORY_EXPORT),
                Some(ExternType::Memory(_))
            )
        {
            return Err(ValidationError::UnsupportedConvention {
                reason: format!(
                    "abi {abi} passes values through linear memory, \
                     but the module exports no `{MEMORY_EXPORT}`"
                ),
            }
            .into());
        }

        let hash = compiled.hash().short();
        let size = compiled.size();
        let definition = FunctionDefinition::new(name, signature, compiled, func_type, plan);
        if self.config.eager_signature_check {
            definition
                .ensure_signature()
                .map_err(ValidationError::from)?;
        }

        debug!(
            function = %definition.name(),
            signature = %definition.signature(),
            %abi,
            %hash,
            size,
            "registered function"
        );
        Ok(definition)
    }

    /// Read the ABI version of a compiled module, instantiating it only
    /// when it exports `_scylla_abi`
    fn negotiate(&self, compiled: &CompiledModule) -> Result<AbiVersion, ValidationError> {
        if !compiled.has_export(ABI_EXPORT) {
            return Ok(AbiVersion::V0);
        }
        let instantiation = |reason: String| ValidationError::Instantiation { reason };
        let mut store = self.new_store().map_err(|e| instantiation(format!("{e:#}")))?;
        let instance = Instance::new(&mut store, compiled.module(), &[])
            .map_err(|e| instantiation(fuel::classify_trap(&e, self.config.max_fuel).to_string()))?;
        abi::negotiate(&mut store, &instance)
    }

    /// Call a function with positional arguments, `None` for null.
    ///
    /// Under `RETURNS NULL ON NULL INPUT` a null argument short-circuits the
    /// call to a null result without instantiating the module.
    ///
    /// # Errors
    ///
    /// Returns `UdfError::Invocation` naming the function
    pub fn call(
        &self,
        definition: &FunctionDefinition,
        args: &[Option<CqlValue>],
    ) -> UdfResult<Invocation> {
        let wrap = |source: InvocationError| UdfError::Invocation {
            function: definition.name().to_string(),
            source,
        };

        marshal::check_arguments(definition.signature(), args).map_err(|e| wrap(e.into()))?;
        if !definition.signature().null_policy.accepts_null() && marshal::has_null(args) {
            debug!(function = %definition.name(), "null argument, call skipped");
            return Ok(Invocation::skipped());
        }
        definition
            .ensure_signature()
            .map_err(|e| wrap(MarshalingError::from(e).into()))?;

        let mut context = ExecutionContext::new(self, definition).map_err(wrap)?;
        match context.run(args) {
            Ok(value) => {
                debug!(
                    function = %definition.name(),
                    state = ?context.state(),
                    fuel = context.meter().consumed(),
                    fuel_left = context.meter().remaining(),
                    "call completed"
                );
                Ok(Invocation {
                    value,
                    fuel_consumed: context.meter().consumed(),
                    executed: true,
                })
            }
            Err(e) => {
                warn!(
                    function = %definition.name(),
                    state = ?context.state(),
                    error = %e,
                    "call failed"
                );
                Err(wrap(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use udf_core::CqlType;

    fn sandbox() -> Sandbox {
        Sandbox::new(SandboxConfig::default()).unwrap()
    }

    const ADD: &str = r#"(module
        (func (export "add") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add))"#;

    #[test]
    fn test_sandbox_config_new() {
        let config = SandboxConfig::new();
        assert_eq!(config.max_fuel, 10_000_000);
        assert_eq!(config.memory_limit, 16 * 1024 * 1024);
        assert_eq!(config.compile_config.max_module_size, 10 * 1024 * 1024);
        assert!(!config.eager_signature_check);
    }

    #[test]
    fn test_sandbox_config_builders() {
        let config = SandboxConfig::new()
            .with_max_fuel(1_000)
            .with_memory_limit(65536)
            .with_max_module_size(128)
            .with_eager_signature_check(true);
        assert_eq!(config.max_fuel, 1_000);
        assert_eq!(config.memory_limit, 65536);
        assert_eq!(config.compile_config.max_module_size, 128);
        assert!(config.eager_signature_check);
    }

    #[test]
    fn test_sandbox_config_from_partial_json() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"max_fuel": 500, "max_module_size": 64}"#).unwrap();
        assert_eq!(config.max_fuel, 500);
        assert_eq!(config.compile_config.max_module_size, 64);
        assert_eq!(config.memory_limit, 16 * 1024 * 1024);
    }

    #[test]
    fn test_register_and_call() {
        let sandbox = sandbox();
        let sig = FunctionSignature::from_types(&[CqlType::Int, CqlType::Int], CqlType::Int);
        let def = sandbox
            .register(FunctionName::new("ks", "add"), sig, ADD.as_bytes())
            .unwrap();
        assert_eq!(def.abi(), AbiVersion::V0);

        let out = sandbox
            .call(&def, &[Some(CqlValue::Int(2)), Some(CqlValue::Int(3))])
            .unwrap();
        assert_eq!(out.value, Some(CqlValue::Int(5)));
        assert!(out.executed);
        assert!(out.fuel_consumed > 0);
    }

    #[test]
    fn test_null_skips_call() {
        let sandbox = sandbox();
        let sig = FunctionSignature::from_types(&[CqlType::Int, CqlType::Int], CqlType::Int);
        let def = sandbox
            .register(FunctionName::new("ks", "add"), sig, ADD.as_bytes())
            .unwrap();
        let out = sandbox.call(&def, &[None, Some(CqlValue::Int(3))]).unwrap();
        assert_eq!(out, Invocation::skipped());
    }

    #[test]
    fn test_execution_context_states() {
        let sandbox = sandbox();
        let sig = FunctionSignature::from_types(&[CqlType::Int, CqlType::Int], CqlType::Int);
        let def = sandbox
            .register(FunctionName::new("ks", "add"), sig, ADD.as_bytes())
            .unwrap();
        let mut context = ExecutionContext::new(&sandbox, &def).unwrap();
        assert_eq!(context.state(), CallState::Ready);
        let value = context
            .run(&[Some(CqlValue::Int(1)), Some(CqlValue::Int(1))])
            .unwrap();
        assert_eq!(value, Some(CqlValue::Int(2)));
        assert_eq!(context.state(), CallState::Completed);
        assert!(context.meter().consumed() > 0);
    }

    #[test]
    fn test_trap_state() {
        let sandbox = sandbox();
        let def = sandbox
            .register(
                FunctionName::new("ks", "boom"),
                FunctionSignature::new(CqlType::Int),
                br#"(module (func (export "boom") (result i32) unreachable))"#,
            )
            .unwrap();
        let mut context = ExecutionContext::new(&sandbox, &def).unwrap();
        let err = context.run(&[]).unwrap_err();
        assert!(matches!(err, InvocationError::Runtime(RuntimeFailure::Trapped(_))));
        assert_eq!(context.state(), CallState::Trapped);
    }

    #[test]
    fn test_fuel_exhausted_state() {
        let sandbox = Sandbox::new(SandboxConfig::new().with_max_fuel(1_000)).unwrap();
        let def = sandbox
            .register(
                FunctionName::new("ks", "spin"),
                FunctionSignature::new(CqlType::Int),
                br#"(module (func (export "spin") (result i32) (loop br 0) i32.const 0))"#,
            )
            .unwrap();
        let mut context = ExecutionContext::new(&sandbox, &def).unwrap();
        let err = context.run(&[]).unwrap_err();
        assert_eq!(
            err,
            InvocationError::Runtime(RuntimeFailure::FuelExhausted { budget: 1_000 })
        );
        assert_eq!(context.state(), CallState::FuelExhausted);
        assert_eq!(context.meter().remaining(), 0);
    }

    #[test]
    fn test_register_rejects_text_under_v0() {
        let err = sandbox()
            .register(
                FunctionName::new("ks", "f"),
                FunctionSignature::from_types(&[CqlType::Text], CqlType::Text),
                br#"(module
                    (memory (export "memory") 1)
                    (func (export "f") (param i64) (result i64) local.get 0))"#,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            UdfError::Validation(ValidationError::UnsupportedConvention { .. })
        ));
    }

    #[test]
    fn test_register_requires_memory_for_serialized_values() {
        let err = sandbox()
            .register(
                FunctionName::new("ks", "f"),
                FunctionSignature::from_types(&[CqlType::Text], CqlType::Text),
                br#"(module
                    (global (export "_scylla_abi") i32 (i32.const 2))
                    (func (export "f") (param i64) (result i64) local.get 0))"#,
            )
            .unwrap_err();
        assert!(err.to_string().contains("exports no `memory`"));
    }
}
