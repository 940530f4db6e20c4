//! WASM sandbox for user-defined functions
//!
//! Compiles function modules, negotiates their calling convention, converts
//! CQL values to and from sandbox slots and runs each call in a fresh
//! instance under a fuel budget and a memory limit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod abi;
pub mod compile;
pub mod definition;
pub mod error;
pub mod fuel;
pub mod marshal;
pub mod memory;
pub mod registry;
pub mod sandbox;

pub use abi::{AbiVersion, ArgConvention, SlotPlan};
pub use compile::{CompileConfig, CompiledModule, WasmCompiler};
pub use definition::FunctionDefinition;
pub use error::{
    CompilationError, InvocationError, MarshalingError, RuntimeFailure, SignatureMismatch,
    UdfError, UdfResult, ValidationError,
};
pub use fuel::FuelMeter;
pub use memory::{GuestMemory, MemoryError, MemoryLimit};
pub use registry::FunctionRegistry;
pub use sandbox::{CallState, ExecutionContext, Invocation, Sandbox, SandboxConfig};
