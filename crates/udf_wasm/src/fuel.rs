//! Fuel metering for bounded WASM execution.

use crate::error::RuntimeFailure;
use serde::{Deserialize, Serialize};
use wasmtime::Trap;

/// Default fuel budget per call
pub const DEFAULT_MAX_FUEL: u64 = 10_000_000;

/// Fuel meter for tracking execution cost of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuelMeter {
    /// Current fuel remaining
    pub remaining: u64,
    /// Initial fuel budget
    pub initial: u64,
    /// Total fuel consumed
    pub consumed: u64,
}

impl FuelMeter {
    /// Create a new fuel meter with a budget
    #[must_use]
    pub fn new(budget: u64) -> Self {
        Self {
            remaining: budget,
            initial: budget,
            consumed: 0,
        }
    }

    /// Record the fuel the store reports as left
    pub fn record(&mut self, remaining: u64) {
        self.remaining = remaining.min(self.initial);
        self.consumed = self.initial - self.remaining;
    }

    /// Mark the whole budget as spent
    pub fn exhaust(&mut self) {
        self.record(0);
    }

    /// Get remaining fuel
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Get fuel consumed so far
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Get initial fuel budget
    #[must_use]
    pub fn initial(&self) -> u64 {
        self.initial
    }
}

/// Map an execution error to a runtime failure
#[must_use]
pub fn classify_trap(err: &wasmtime::Error, budget: u64) -> RuntimeFailure {
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => RuntimeFailure::FuelExhausted { budget },
        Some(trap) => RuntimeFailure::Trapped(trap.to_string()),
        None => RuntimeFailure::Trapped(format!("{err:#}")),
    }
}
