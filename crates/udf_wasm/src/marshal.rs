//! Conversion of CQL values to and from call slots.
//!
//! Fixed-size values under the native convention travel by value. Anything
//! serialized is written to linear memory in its wire form and passed as an
//! i64 packing the size in the upper 32 bits and the offset in the lower
//! 32 bits. A negative size stands for null.

use crate::abi::{ArgConvention, SlotPlan};
use crate::error::{InvocationError, MarshalingError, SlotPosition};
use crate::memory::{GuestMemory, MemoryError};
use udf_core::{CqlType, CqlValue, FunctionSignature};
use wasmtime::{AsContextMut, Val};

/// Packed pointer+size of a null value: size -1, offset 0
pub const NULL_PTR_SIZE: i64 = -1i64 << 32;

/// Pack an offset and a size into one i64
#[must_use]
pub fn pack_ptr_size(offset: u32, size: i32) -> i64 {
    (i64::from(size) << 32) | i64::from(offset)
}

/// Split a packed i64 into `(offset, size)`
#[must_use]
pub fn unpack_ptr_size(packed: i64) -> (u32, i32) {
    (packed as u32, (packed >> 32) as i32)
}

/// Check the argument count and the type of every non-null argument
///
/// # Errors
///
/// Returns error on a count or type mismatch
pub fn check_arguments(
    signature: &FunctionSignature,
    args: &[Option<CqlValue>],
) -> Result<(), MarshalingError> {
    if args.len() != signature.arity() {
        return Err(MarshalingError::ArgumentCountMismatch {
            expected: signature.arity(),
            actual: args.len(),
        });
    }
    for (index, (param, arg)) in signature.params.iter().zip(args).enumerate() {
        if let Some(value) = arg {
            if value.cql_type() != param.ty {
                return Err(MarshalingError::TypeMismatch {
                    position: SlotPosition::Parameter(index),
                    expected: param.ty.to_string(),
                    found: value.cql_type().to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Whether any argument is null
#[must_use]
pub fn has_null(args: &[Option<CqlValue>]) -> bool {
    args.iter().any(Option::is_none)
}

/// Put a fixed-size value into its native slot
///
/// # Errors
///
/// Returns error for variable-length values
pub fn to_slot(value: &CqlValue, position: SlotPosition) -> Result<Val, MarshalingError> {
    let val = match value {
        CqlValue::TinyInt(v) => Val::I32(i32::from(*v)),
        CqlValue::SmallInt(v) => Val::I32(i32::from(*v)),
        CqlValue::Int(v) => Val::I32(*v),
        CqlValue::BigInt(v) => Val::I64(*v),
        CqlValue::Float(v) => Val::F32(v.to_bits()),
        CqlValue::Double(v) => Val::F64(v.to_bits()),
        CqlValue::Boolean(v) => Val::I32(i32::from(*v)),
        CqlValue::Text(_) => {
            return Err(MarshalingError::TypeMismatch {
                position,
                expected: "fixed-size value".to_string(),
                found: value.cql_type().to_string(),
            });
        }
    };
    Ok(val)
}

/// Read a value of type `ty` from a native slot.
///
/// i32 slots are narrowed to tinyint and smallint by truncation; a boolean
/// is true when nonzero.
///
/// # Errors
///
/// Returns error if the slot does not hold the expected kind
pub fn from_slot(ty: CqlType, val: &Val) -> Result<CqlValue, MarshalingError> {
    let value = match (ty, val) {
        (CqlType::TinyInt, Val::I32(v)) => CqlValue::TinyInt(*v as i8),
        (CqlType::SmallInt, Val::I32(v)) => CqlValue::SmallInt(*v as i16),
        (CqlType::Int, Val::I32(v)) => CqlValue::Int(*v),
        (CqlType::Boolean, Val::I32(v)) => CqlValue::Boolean(*v != 0),
        (CqlType::BigInt, Val::I64(v)) => CqlValue::BigInt(*v),
        (CqlType::Float, Val::F32(bits)) => CqlValue::Float(f32::from_bits(*bits)),
        (CqlType::Double, Val::F64(bits)) => CqlValue::Double(f64::from_bits(*bits)),
        _ => {
            return Err(MarshalingError::TypeMismatch {
                position: SlotPosition::Return,
                expected: ty
                    .native_slot()
                    .map_or_else(|| "i64".to_string(), |slot| slot.to_string()),
                found: val_kind(val).to_string(),
            });
        }
    };
    Ok(value)
}

fn val_kind(val: &Val) -> &'static str {
    match val {
        Val::I32(_) => "i32",
        Val::I64(_) => "i64",
        Val::F32(_) => "f32",
        Val::F64(_) => "f64",
        _ => "non-numeric value",
    }
}

/// Lowers arguments and lifts the result of one call
pub struct Marshaler<'a> {
    signature: &'a FunctionSignature,
    plan: &'a SlotPlan,
    memory: Option<GuestMemory>,
    budget: u64,
}

impl<'a> Marshaler<'a> {
    /// Create a marshaler; `memory` is required when the plan serializes
    /// anything
    #[must_use]
    pub fn new(
        signature: &'a FunctionSignature,
        plan: &'a SlotPlan,
        memory: Option<GuestMemory>,
        budget: u64,
    ) -> Self {
        Self {
            signature,
            plan,
            memory,
            budget,
        }
    }

    fn memory(&self) -> Result<&GuestMemory, MemoryError> {
        self.memory.as_ref().ok_or(MemoryError::MissingMemory)
    }

    /// Convert arguments into call slots, writing serialized values into
    /// guest memory
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be placed
    pub fn lower_args(
        &self,
        mut store: impl AsContextMut,
        args: &[Option<CqlValue>],
    ) -> Result<Vec<Val>, InvocationError> {
        let mut slots = Vec::with_capacity(args.len());
        for (index, (convention, arg)) in self.plan.params.iter().zip(args).enumerate() {
            let position = SlotPosition::Parameter(index);
            let slot = match (convention, arg) {
                (ArgConvention::Native(_), Some(value)) => to_slot(value, position)?,
                (ArgConvention::Native(kind), None) => {
                    return Err(MarshalingError::TypeMismatch {
                        position,
                        expected: kind.to_string(),
                        found: "null".to_string(),
                    }
                    .into());
                }
                (ArgConvention::Serialized, None) => Val::I64(NULL_PTR_SIZE),
                (ArgConvention::Serialized, Some(value)) => {
                    let bytes = value.to_wire();
                    let size = i32::try_from(bytes.len())
                        .map_err(|_| MemoryError::TooLarge { len: bytes.len() })?;
                    let memory = self.memory()?;
                    let offset = memory.allocate(&mut store, bytes.len(), self.budget)?;
                    memory.write(&mut store, offset, &bytes)?;
                    Val::I64(pack_ptr_size(offset, size))
                }
            };
            slots.push(slot);
        }
        Ok(slots)
    }

    /// Convert the returned slot into a value, `None` for null
    ///
    /// # Errors
    ///
    /// Returns error if the slot cannot be decoded
    pub fn lift_result(
        &self,
        mut store: impl AsContextMut,
        result: &Val,
    ) -> Result<Option<CqlValue>, InvocationError> {
        let ty = self.signature.returns;
        match self.plan.result {
            ArgConvention::Native(_) => Ok(Some(from_slot(ty, result)?)),
            ArgConvention::Serialized => {
                let Val::I64(packed) = result else {
                    return Err(MarshalingError::TypeMismatch {
                        position: SlotPosition::Return,
                        expected: "i64".to_string(),
                        found: val_kind(result).to_string(),
                    }
                    .into());
                };
                let (offset, size) = unpack_ptr_size(*packed);
                if size < 0 {
                    return Ok(None);
                }
                let bytes = self.memory()?.read(&mut store, offset, size as usize)?;
                let value = CqlValue::from_wire(ty, &bytes)
                    .map_err(|e| MarshalingError::InvalidResult(e.to_string()))?;
                Ok(Some(value))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::AbiVersion;
    use udf_core::SlotKind;

    #[test]
    fn test_null_ptr_size() {
        assert_eq!(NULL_PTR_SIZE as u64, 0xFFFF_FFFF_0000_0000);
        assert_eq!(unpack_ptr_size(NULL_PTR_SIZE), (0, -1));
    }

    #[test]
    fn test_pack_ptr_size() {
        assert_eq!(pack_ptr_size(1024, 8), (8 << 32) | 1024);
        assert_eq!(unpack_ptr_size((8 << 32) | 1024), (1024, 8));
        assert_eq!(unpack_ptr_size(pack_ptr_size(u32::MAX, 3)), (u32::MAX, 3));
    }

    #[test]
    fn test_check_arguments() {
        let sig = FunctionSignature::from_types(&[CqlType::Int, CqlType::Text], CqlType::Int);
        assert!(check_arguments(&sig, &[Some(CqlValue::Int(1)), None]).is_ok());

        let err = check_arguments(&sig, &[Some(CqlValue::Int(1))]).unwrap_err();
        assert!(err.to_string().contains("number of arguments"));

        let err = check_arguments(
            &sig,
            &[Some(CqlValue::Int(1)), Some(CqlValue::BigInt(2))],
        )
        .unwrap_err();
        assert_eq!(
            err,
            MarshalingError::TypeMismatch {
                position: SlotPosition::Parameter(1),
                expected: "text".to_string(),
                found: "bigint".to_string(),
            }
        );
    }

    #[test]
    fn test_has_null() {
        assert!(has_null(&[Some(CqlValue::Int(1)), None]));
        assert!(!has_null(&[Some(CqlValue::Int(1))]));
        assert!(!has_null(&[]));
    }

    #[test]
    fn test_to_slot() {
        let pos = SlotPosition::Parameter(0);
        assert_eq!(to_slot(&CqlValue::TinyInt(-3), pos).unwrap().i32(), Some(-3));
        assert_eq!(to_slot(&CqlValue::Boolean(true), pos).unwrap().i32(), Some(1));
        assert_eq!(to_slot(&CqlValue::BigInt(997), pos).unwrap().i64(), Some(997));
        assert_eq!(
            to_slot(&CqlValue::Float(1.5), pos).unwrap().f32(),
            Some(1.5)
        );
        assert!(to_slot(&CqlValue::Text("x".to_string()), pos).is_err());
    }

    #[test]
    fn test_from_slot_narrows() {
        assert_eq!(
            from_slot(CqlType::TinyInt, &Val::I32(232)).unwrap(),
            CqlValue::TinyInt(-24)
        );
        assert_eq!(
            from_slot(CqlType::SmallInt, &Val::I32(56001)).unwrap(),
            CqlValue::SmallInt(-9535)
        );
        assert_eq!(
            from_slot(CqlType::Boolean, &Val::I32(5)).unwrap(),
            CqlValue::Boolean(true)
        );
    }

    #[test]
    fn test_from_slot_mismatch() {
        let err = from_slot(CqlType::Int, &Val::F32(0)).unwrap_err();
        assert!(err.to_string().contains("Expected i32, got f32"));
    }

    fn instantiate(wat: &str) -> (wasmtime::Store<()>, wasmtime::Instance) {
        let engine = wasmtime::Engine::default();
        let module = wasmtime::Module::new(&engine, wat::parse_str(wat).unwrap()).unwrap();
        let mut store = wasmtime::Store::new(&engine, ());
        let instance = wasmtime::Instance::new(&mut store, &module, &[]).unwrap();
        (store, instance)
    }

    #[test]
    fn test_lower_and_lift_serialized() {
        let (mut store, instance) = instantiate(r#"(module (memory (export "memory") 1))"#);
        let memory = GuestMemory::locate(&mut store, &instance).unwrap();
        let sig = FunctionSignature::from_types(&[CqlType::Text, CqlType::BigInt], CqlType::Text);
        let plan = SlotPlan::derive(AbiVersion::V2, &sig).unwrap();
        assert_eq!(plan.params[1], ArgConvention::Native(SlotKind::I64));

        let marshaler = Marshaler::new(&sig, &plan, Some(memory), 1000);
        let slots = marshaler
            .lower_args(
                &mut store,
                &[Some(CqlValue::Text("cat".to_string())), Some(CqlValue::BigInt(2))],
            )
            .unwrap();
        let packed = slots[0].i64().unwrap();
        let (offset, size) = unpack_ptr_size(packed);
        assert_eq!(size, 3);
        assert_eq!(u64::from(offset), crate::memory::WASM_PAGE_SIZE);
        assert_eq!(slots[1].i64(), Some(2));

        let lifted = marshaler.lift_result(&mut store, &Val::I64(packed)).unwrap();
        assert_eq!(lifted, Some(CqlValue::Text("cat".to_string())));

        let lifted = marshaler
            .lift_result(&mut store, &Val::I64(NULL_PTR_SIZE))
            .unwrap();
        assert_eq!(lifted, None);
    }

    #[test]
    fn test_lower_null_serialized() {
        let (mut store, instance) = instantiate(r#"(module (memory (export "memory") 1))"#);
        let memory = GuestMemory::locate(&mut store, &instance).unwrap();
        let sig = FunctionSignature::from_types(&[CqlType::BigInt], CqlType::BigInt)
            .called_on_null_input();
        let plan = SlotPlan::derive(AbiVersion::V2, &sig).unwrap();
        let marshaler = Marshaler::new(&sig, &plan, Some(memory), 1000);

        let slots = marshaler.lower_args(&mut store, &[None]).unwrap();
        assert_eq!(slots[0].i64(), Some(NULL_PTR_SIZE));

        let slots = marshaler
            .lower_args(&mut store, &[Some(CqlValue::BigInt(7))])
            .unwrap();
        let (_, size) = unpack_ptr_size(slots[0].i64().unwrap());
        assert_eq!(size, 8);
    }

    #[test]
    fn test_serialized_without_memory() {
        let (mut store, _) = instantiate("(module)");
        let sig = FunctionSignature::from_types(&[CqlType::Text], CqlType::Text);
        let plan = SlotPlan::derive(AbiVersion::V2, &sig).unwrap();
        let marshaler = Marshaler::new(&sig, &plan, None, 1000);
        let err = marshaler
            .lower_args(&mut store, &[Some(CqlValue::Text("x".to_string()))])
            .unwrap_err();
        assert!(matches!(
            err,
            InvocationError::Marshaling(MarshalingError::Memory(MemoryError::MissingMemory))
        ));
    }

    #[test]
    fn test_lift_out_of_bounds() {
        let (mut store, instance) = instantiate(r#"(module (memory (export "memory") 1))"#);
        let memory = GuestMemory::locate(&mut store, &instance).unwrap();
        let sig = FunctionSignature::from_types(&[], CqlType::Text);
        let plan = SlotPlan::derive(AbiVersion::V2, &sig).unwrap();
        let marshaler = Marshaler::new(&sig, &plan, Some(memory), 1000);
        let err = marshaler
            .lift_result(&mut store, &Val::I64(pack_ptr_size(65530, 100)))
            .unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    proptest::proptest! {
        #[test]
        fn prop_ptr_size_halves(offset: u32, size: i32) {
            let packed = pack_ptr_size(offset, size);
            proptest::prop_assert_eq!(unpack_ptr_size(packed), (offset, size));
            proptest::prop_assert_eq!(packed >> 32, i64::from(size));
        }

        #[test]
        fn prop_tinyint_narrowing_truncates(v: i32) {
            proptest::prop_assert_eq!(
                from_slot(CqlType::TinyInt, &Val::I32(v)).unwrap(),
                CqlValue::TinyInt(v as i8)
            );
        }
    }
}
