//! UDF Core Types
//!
//! This crate contains the pure data model of the function sandbox:
//! column types, values, signatures and their wire encoding. No I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod function;
pub mod hash;
pub mod types;
pub mod value;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use function::{FunctionName, FunctionSignature, Parameter};
pub use hash::SourceHash;
pub use types::{CqlType, NullPolicy, PrimitiveKind, SlotKind};
pub use value::CqlValue;
