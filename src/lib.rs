//! metajit: an adaptive meta-tracing specialization engine
//!
//! metajit runs register-machine bytecode in a plain interpreter and, once a
//! merge point or a promotion value is hot, specializes the code that follows
//! it: everything computable from values known at that point is folded away,
//! and what remains becomes a compiled unit that later arrivals run instead.
//! Program output is identical whichever way a piece of code runs.
//!
//! # Quick Start
//!
//! ```no_run
//! use metajit::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> metajit::Result<()> {
//!     let program = Arc::new(Program::from_json_file("demos/sum.json")?);
//!     let mut dispatcher = Dispatcher::new(program, JitConfig::default())?;
//!     let mut effects = Effects::with_input(vec![Value::Int(100)]);
//!     let result = dispatcher.run_program(&mut effects)?;
//!     println!("{} {:?}", result, effects.output());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Code** | [`bytecode`] (instructions, programs, static analysis) |
//! | **Execution** | [`runtime`] (values, bindings, the base interpreter) |
//! | **Specialization** | [`jit`] (counters, specializer, code cache, dispatcher) |

#![allow(clippy::new_without_default)]

pub mod bytecode;
pub mod jit;
pub mod prelude;
pub mod runtime;

mod error;

pub use error::{Error, Result, RuntimeErrorKind};
pub use runtime::Value;

/// metajit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
