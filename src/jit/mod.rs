//! Adaptive specialization tier
//!
//! Counts merge point arrivals, promotion values and split directions while
//! the program is interpreted, and once something is hot, specializes the code
//! that follows it into a compiled unit installed in a shared [`CodeCache`].
//!
//! | Module         | Role                                                        |
//! |----------------|-------------------------------------------------------------|
//! | `classify`     | fixed (green) vs variable (red) values                      |
//! | `state`        | the execution state a specialization attempt threads along  |
//! | `hotness`      | per-dispatcher counters                                     |
//! | `fallback`     | interpretation with counting, used whenever nothing is hot  |
//! | `specializer`  | residualization, red splits, promotion decisions            |
//! | `residual`     | the residual trace format                                   |
//! | `backend`      | compiled units and code generation backends                 |
//! | `install`      | shared installation tables and promotion caches             |
//! | `dispatcher`   | the per-thread state machine tying it together              |
//!
//! **Status:** the shipped [`IrBackend`] evaluates residual traces directly; a
//! native backend plugs in through [`Backend`].

pub mod backend;
pub mod classify;
mod config;
mod dispatcher;
mod fallback;
pub mod hotness;
pub mod install;
pub mod residual;
mod specializer;
pub mod state;

pub use backend::{Backend, CompiledCode, CompiledUnit, IrBackend, RunContext, UnitEntry, UnitId};
pub use classify::{classify, Classification, Provenance};
pub use config::JitConfig;
pub use dispatcher::{DispatchEvent, DispatchState, DispatchStats, Dispatcher};
pub use fallback::FallbackInterpreter;
pub use hotness::{HotnessCounters, Profiler, SiteKey};
pub use install::{CodeCache, GreenKey, MergePointKey, PromotionCache};
pub use residual::{ResidualOp, ResidualTrace};
pub use specializer::{FallbackReason, PromotionDecision, SpecializeOutcome, Specializer};
pub use state::ExecutionState;
