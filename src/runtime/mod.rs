//! Runtime environment for metajit
//!
//! This module provides what every executor shares: values, the register
//! bindings of the running frame with their I/O provenance, the observable
//! effects of a run, and the base interpreter.

mod bindings;
mod interpreter;
mod value;

pub use bindings::{Bindings, Effects};
pub use interpreter::{
    Capabilities, Exit, ExitKind, Interpreter, NoopObserver, Observer, DEFAULT_MAX_CALL_DEPTH,
};
pub use value::Value;
