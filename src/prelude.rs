//! Prelude module for convenient imports
//!
//! ```no_run
//! use metajit::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let mut b = FunctionBuilder::new("main");
//!     b.konst(0, Value::Int(42));
//!     b.ret(0);
//!     let program = Arc::new(Program::single(b.build()?)?);
//!     let mut dispatcher = Dispatcher::new(program, JitConfig::default())?;
//!     println!("{}", dispatcher.run_program(&mut Effects::new())?);
//!     Ok(())
//! }
//! ```

// Errors
pub use crate::error::{Error, Result, RuntimeErrorKind};

// Programs
pub use crate::bytecode::{BinaryOp, FunctionBuilder, Instr, Location, Program};

// Execution
pub use crate::runtime::{Bindings, Capabilities, Effects, Exit, ExitKind, Interpreter, Value};

// Specialization
pub use crate::jit::{CodeCache, Dispatcher, DispatchStats, JitConfig};
