//! Memory limits and access to a function's linear memory.

use crate::abi::{MALLOC_EXPORT, MEMORY_EXPORT};
use crate::error::InvocationError;
use crate::fuel;
use serde::{Deserialize, Serialize};
use std::fmt;
use wasmtime::{
    AsContext, AsContextMut, Instance, Memory, StoreLimits, StoreLimitsBuilder, TypedFunc,
};

/// WASM page size in bytes
pub const WASM_PAGE_SIZE: u64 = 65536;

/// Memory limit configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimit {
    /// Maximum linear memory in bytes
    pub max_bytes: u64,
}

impl MemoryLimit {
    /// Create a new memory limit
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// Resource limiter for one call's store
    #[must_use]
    pub fn store_limits(&self) -> StoreLimits {
        let bytes = usize::try_from(self.max_bytes).unwrap_or(usize::MAX);
        StoreLimitsBuilder::new()
            .memory_size(bytes)
            .instances(1)
            .build()
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

/// Pages needed to hold `bytes`
#[must_use]
pub fn bytes_to_pages(bytes: u64) -> u64 {
    bytes.div_ceil(WASM_PAGE_SIZE)
}

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// The module has no linear memory to pass values through
    #[error("module does not export a linear memory named `memory`")]
    MissingMemory,

    /// Access outside the current memory size
    #[error("access of {len} bytes at offset {offset} is out of bounds (memory size {size})")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    /// Memory could not grow to hold a value
    #[error("failed to grow memory by {pages} pages: {reason}")]
    GrowFailed { pages: u64, reason: String },

    /// Value does not fit a 32-bit pointer+size pair
    #[error("value of {len} bytes does not fit in linear memory")]
    TooLarge { len: usize },

    /// The guest allocator is unusable or returned garbage
    #[error("invalid allocation: {0}")]
    InvalidAllocation(String),
}

/// Linear memory of one instance, plus its allocator if it exports one
#[derive(Clone)]
pub struct GuestMemory {
    memory: Memory,
    malloc: Option<TypedFunc<i32, i32>>,
}

impl fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestMemory")
            .field("memory", &self.memory)
            .field("has_allocator", &self.has_allocator())
            .finish()
    }
}

impl GuestMemory {
    /// Find the memory and optional `_scylla_malloc` of an instance
    ///
    /// # Errors
    ///
    /// Returns error if there is no exported memory, or `_scylla_malloc`
    /// has the wrong signature
    pub fn locate(mut store: impl AsContextMut, instance: &Instance) -> Result<Self, MemoryError> {
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or(MemoryError::MissingMemory)?;
        let malloc = match instance.get_export(&mut store, MALLOC_EXPORT) {
            None => None,
            Some(_) => Some(
                instance
                    .get_typed_func::<i32, i32>(&mut store, MALLOC_EXPORT)
                    .map_err(|e| {
                        MemoryError::InvalidAllocation(format!("{MALLOC_EXPORT}: {e}"))
                    })?,
            ),
        };
        Ok(Self { memory, malloc })
    }

    /// Whether allocations go through the guest allocator
    #[must_use]
    pub fn has_allocator(&self) -> bool {
        self.malloc.is_some()
    }

    /// Current size in bytes
    pub fn size(&self, store: impl AsContext) -> u64 {
        self.memory.data_size(&store) as u64
    }

    /// Reserve `len` bytes and return their offset.
    ///
    /// Calls the guest allocator when present, otherwise grows memory and
    /// hands out the fresh pages. A trap inside the allocator is reported
    /// as a runtime failure against `budget`.
    ///
    /// # Errors
    ///
    /// Returns error if the allocation fails or traps
    pub fn allocate(
        &self,
        mut store: impl AsContextMut,
        len: usize,
        budget: u64,
    ) -> Result<u32, InvocationError> {
        let size = i32::try_from(len).map_err(|_| MemoryError::TooLarge { len })?;

        if let Some(malloc) = &self.malloc {
            let ptr = malloc
                .call(&mut store, size)
                .map_err(|e| fuel::classify_trap(&e, budget))?;
            let offset = u32::try_from(ptr).map_err(|_| {
                MemoryError::InvalidAllocation(format!("{MALLOC_EXPORT} returned {ptr}"))
            })?;
            return Ok(offset);
        }

        let pages = bytes_to_pages(len as u64);
        let old_pages = self
            .memory
            .grow(&mut store, pages)
            .map_err(|e| MemoryError::GrowFailed {
                pages,
                reason: e.to_string(),
            })?;
        let offset = u32::try_from(old_pages * WASM_PAGE_SIZE)
            .map_err(|_| MemoryError::TooLarge { len })?;
        Ok(offset)
    }

    /// Copy `bytes` into memory at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds
    pub fn write(
        &self,
        mut store: impl AsContextMut,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), MemoryError> {
        self.check_bounds(&mut store, offset, bytes.len())?;
        self.memory
            .write(&mut store, offset as usize, bytes)
            .map_err(|_| MemoryError::OutOfBounds {
                offset: u64::from(offset),
                len: bytes.len() as u64,
                size: self.size(&mut store),
            })
    }

    /// Copy `len` bytes out of memory at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds
    pub fn read(
        &self,
        mut store: impl AsContextMut,
        offset: u32,
        len: usize,
    ) -> Result<Vec<u8>, MemoryError> {
        self.check_bounds(&mut store, offset, len)?;
        let mut buf = vec![0u8; len];
        self.memory
            .read(&store, offset as usize, &mut buf)
            .map_err(|_| MemoryError::OutOfBounds {
                offset: u64::from(offset),
                len: len as u64,
                size: self.size(&mut store),
            })?;
        Ok(buf)
    }

    fn check_bounds(
        &self,
        store: impl AsContextMut,
        offset: u32,
        len: usize,
    ) -> Result<(), MemoryError> {
        let size = self.size(store);
        let end = u64::from(offset) + len as u64;
        if end > size {
            return Err(MemoryError::OutOfBounds {
                offset: u64::from(offset),
                len: len as u64,
                size,
            });
        }
        Ok(())
    }
}
