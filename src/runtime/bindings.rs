//! Register bindings and the observable effects of a run

use std::collections::VecDeque;

use super::Value;
use crate::bytecode::{Reg, MAX_REGISTERS};

static NIL: Value = Value::Nil;

/// The register file of the frame being executed
///
/// Alongside each value the bindings record whether it derives from I/O. Every
/// executor maintains that provenance identically, so the specializer can
/// refuse to treat such values as compile-time constants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    values: Vec<Value>,
    tainted: u64,
}

impl Bindings {
    /// `registers` registers, all `nil` and clean
    pub fn new(registers: usize) -> Self {
        Self {
            values: vec![Value::Nil; registers.min(MAX_REGISTERS)],
            tainted: 0,
        }
    }

    /// Bindings holding `values`, all clean
    pub fn from_values(mut values: Vec<Value>) -> Self {
        values.truncate(MAX_REGISTERS);
        Self { values, tainted: 0 }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, reg: Reg) -> &Value {
        self.values.get(reg as usize).unwrap_or(&NIL)
    }

    /// Store `value`, recording whether it derives from I/O
    pub fn set(&mut self, reg: Reg, value: Value, tainted: bool) {
        if let Some(slot) = self.values.get_mut(reg as usize) {
            *slot = value;
            let bit = 1u64 << reg;
            if tainted {
                self.tainted |= bit;
            } else {
                self.tainted &= !bit;
            }
        }
    }

    pub fn is_tainted(&self, reg: Reg) -> bool {
        (reg as usize) < self.values.len() && self.tainted & (1u64 << reg) != 0
    }

    /// Provenance of every register as a bit mask
    pub fn taint_mask(&self) -> u64 {
        self.tainted
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// The outside world as seen by a program: queued input and an output log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effects {
    input: VecDeque<Value>,
    output: Vec<Value>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effects whose input queue yields `input` in order
    pub fn with_input(input: impl IntoIterator<Item = Value>) -> Self {
        Self {
            input: input.into_iter().collect(),
            output: Vec::new(),
        }
    }

    /// Next input value, `nil` once the queue is exhausted
    pub fn read(&mut self) -> Value {
        self.input.pop_front().unwrap_or_default()
    }

    pub fn write(&mut self, value: Value) {
        self.output.push(value);
    }

    pub fn output(&self) -> &[Value] {
        &self.output
    }

    pub fn remaining_input(&self) -> usize {
        self.input.len()
    }
}
