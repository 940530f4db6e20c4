//! ABI negotiation between the host and a function module.
//!
//! A module announces its calling convention through an exported integer
//! global named `_scylla_abi`. Without it the module speaks the legacy
//! convention, where every value travels in a native slot.
//!
//! Compiled guests export `_scylla_abi` as the address of a `u32` static, so
//! when the module also exports `memory` the i32 global is read as a pointer
//! to the little-endian version number.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use udf_core::{CqlType, FunctionSignature, NullPolicy, SlotKind};
use wasmtime::{AsContextMut, Extern, Instance, Val};

/// Export holding the ABI version
pub const ABI_EXPORT: &str = "_scylla_abi";

/// Optional guest allocator, `(size: i32) -> i32`
pub const MALLOC_EXPORT: &str = "_scylla_malloc";

/// Linear memory export used for pointer+size values
pub const MEMORY_EXPORT: &str = "memory";

/// Calling convention a module declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AbiVersion {
    /// Legacy: fixed-size values in native slots only
    #[default]
    V0,
    /// Pointer+size values for variable-length and nullable data
    V2,
}

impl AbiVersion {
    /// Map the raw `_scylla_abi` value to a version
    ///
    /// # Errors
    ///
    /// Returns error for any value other than 0 or 2
    pub fn from_value(value: i64) -> Result<Self, ValidationError> {
        match value {
            0 => Ok(Self::V0),
            2 => Ok(Self::V2),
            other => Err(ValidationError::UnsupportedAbi {
                found: other.to_string(),
            }),
        }
    }

    /// Numeric version
    #[must_use]
    pub const fn number(&self) -> u32 {
        match self {
            Self::V0 => 0,
            Self::V2 => 2,
        }
    }

    /// How a value of type `ty` travels under this ABI
    ///
    /// # Errors
    ///
    /// Returns error if the ABI cannot carry the value at all
    pub fn convention(
        &self,
        ty: CqlType,
        policy: NullPolicy,
    ) -> Result<ArgConvention, ValidationError> {
        match self {
            Self::V0 => {
                if policy.accepts_null() {
                    return Err(ValidationError::UnsupportedConvention {
                        reason: format!("{} requires abi version 2", policy),
                    });
                }
                ty.native_slot()
                    .map(ArgConvention::Native)
                    .ok_or_else(|| ValidationError::UnsupportedConvention {
                        reason: format!("type {} requires abi version 2", ty),
                    })
            }
            Self::V2 => match ty.native_slot() {
                Some(slot) if !policy.accepts_null() => Ok(ArgConvention::Native(slot)),
                _ => Ok(ArgConvention::Serialized),
            },
        }
    }
}

impl std::fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.number())
    }
}

/// How one value crosses the sandbox boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgConvention {
    /// By value in a native slot
    Native(SlotKind),
    /// Serialized into linear memory, passed as a packed i64 (size << 32 | offset)
    Serialized,
}

impl ArgConvention {
    /// Native slot occupied at the call boundary
    #[must_use]
    pub const fn slot(&self) -> SlotKind {
        match self {
            Self::Native(kind) => *kind,
            Self::Serialized => SlotKind::I64,
        }
    }

    /// Whether the value lives in linear memory
    #[must_use]
    pub const fn is_serialized(&self) -> bool {
        matches!(self, Self::Serialized)
    }
}

/// Conventions of every parameter and the return value of one function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPlan {
    /// ABI the plan was derived for
    pub abi: AbiVersion,
    /// Per-parameter conventions, in call order
    pub params: Vec<ArgConvention>,
    /// Return value convention
    pub result: ArgConvention,
}

impl SlotPlan {
    /// Derive the plan of a declared signature
    ///
    /// # Errors
    ///
    /// Returns error if some declared type cannot cross under `abi`
    pub fn derive(abi: AbiVersion, signature: &FunctionSignature) -> Result<Self, ValidationError> {
        let policy = signature.null_policy;
        let params = signature
            .param_types()
            .map(|ty| abi.convention(ty, policy))
            .collect::<Result<Vec<_>, _>>()?;
        let result = abi.convention(signature.returns, policy)?;
        Ok(Self {
            abi,
            params,
            result,
        })
    }

    /// Native parameter slots the exported function must take
    pub fn param_slots(&self) -> impl ExactSizeIterator<Item = SlotKind> + '_ {
        self.params.iter().map(ArgConvention::slot)
    }

    /// Whether any value travels through linear memory
    #[must_use]
    pub fn uses_memory(&self) -> bool {
        self.result.is_serialized() || self.params.iter().any(ArgConvention::is_serialized)
    }
}

/// Read the ABI version of an instantiated module
///
/// # Errors
///
/// Returns error if `_scylla_abi` is not an integer global, points outside
/// linear memory or holds an unsupported value
pub fn negotiate(
    mut store: impl AsContextMut,
    instance: &Instance,
) -> Result<AbiVersion, ValidationError> {
    let unsupported = |found: String| ValidationError::UnsupportedAbi { found };
    let global = match instance.get_export(&mut store, ABI_EXPORT) {
        None => return Ok(AbiVersion::V0),
        Some(Extern::Global(global)) => global,
        Some(_) => return Err(unsupported("in an export that is not a global".to_string())),
    };
    let value = match global.get(&mut store) {
        Val::I32(address) => match instance.get_memory(&mut store, MEMORY_EXPORT) {
            Some(memory) => {
                let mut version = [0u8; 4];
                let offset = address as u32 as usize;
                memory
                    .read(&store, offset, &mut version)
                    .map_err(|_| unsupported(format!("at address {offset} outside memory")))?;
                i64::from(u32::from_le_bytes(version))
            }
            None => i64::from(address),
        },
        Val::I64(value) => value,
        _ => return Err(unsupported("in a non-integer global".to_string())),
    };
    AbiVersion::from_value(value)
}
