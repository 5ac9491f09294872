//! The dispatcher
//!
//! Owns one thread's execution: it decides at every merge point arrival and
//! every promotion exit whether to interpret, compile or run compiled code,
//! and moves between the five dispatch states accordingly.
//!
//! ```text
//!   Interpreting ──arrive──> ArmedForJIT ──hot──> Compiling ──> ExecutingCompiled
//!        ^                        │                   │                │
//!        └────────── cold ────────┘                   └─> FallingBack <┘
//! ```
//!
//! Control is passed around as a [`Next`] value in a loop, so arbitrarily
//! long runs of unit exits and re-entries never grow the native stack.

use rustc_hash::FxHashSet as HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace};

use super::backend::{Backend, CompiledUnit, IrBackend, RunContext, UnitEntry};
use super::fallback::FallbackInterpreter;
use super::hotness::{promotion_key, HotnessCounters, SiteKey};
use super::install::{CodeCache, MergePointKey};
use super::specializer::{PromotionDecision, SpecializeOutcome, Specializer};
use super::state::ExecutionState;
use super::JitConfig;
use crate::bytecode::{Location, Program, Reg};
use crate::error::{Error, Result};
use crate::runtime::{Bindings, Capabilities, Effects, Exit, ExitKind, Interpreter, Value};

/// Dispatch state of one dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatchState {
    #[default]
    Interpreting,
    /// At a merge point, deciding what to do
    ArmedForJit,
    Compiling,
    ExecutingCompiled,
    /// Running the fallback interpreter after a unit exit or a failed attempt
    FallingBack,
}

impl DispatchState {
    pub fn can_transition_to(self, to: DispatchState) -> bool {
        use DispatchState::*;
        match (self, to) {
            (from, to) if from == to => true,
            (Interpreting, _) => true,
            (ArmedForJit, Interpreting | Compiling | ExecutingCompiled) => true,
            (Compiling, Interpreting | ExecutingCompiled | FallingBack) => true,
            (ExecutingCompiled, _) => true,
            (FallingBack, Interpreting | ArmedForJit) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchState::Interpreting => "Interpreting",
            DispatchState::ArmedForJit => "ArmedForJIT",
            DispatchState::Compiling => "Compiling",
            DispatchState::ExecutingCompiled => "ExecutingCompiled",
            DispatchState::FallingBack => "FallingBack",
        };
        f.write_str(name)
    }
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEvent {
    pub from: DispatchState,
    pub to: DispatchState,
    pub location: Location,
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.location, self.from, self.to)
    }
}

/// Counters describing what a dispatcher did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub merge_point_arrivals: u64,
    pub promotion_exits: u64,
    pub interpreted_segments: u64,
    pub fallback_segments: u64,
    pub compiled_runs: u64,
    pub units_compiled: u64,
    pub specialization_fallbacks: u64,
    pub empty_regions: u64,
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Dispatch Summary ===")?;
        writeln!(f, "Merge point arrivals: {}", self.merge_point_arrivals)?;
        writeln!(f, "Promotion exits: {}", self.promotion_exits)?;
        writeln!(
            f,
            "Segments: {} interpreted, {} fallback, {} compiled",
            self.interpreted_segments, self.fallback_segments, self.compiled_runs
        )?;
        writeln!(
            f,
            "Units compiled: {} ({} attempts fell back, {} empty regions)",
            self.units_compiled, self.specialization_fallbacks, self.empty_regions
        )?;
        Ok(())
    }
}

/// Where control goes next
enum Next {
    /// Arrived at a dispatch merge point
    Arrive(Location, Bindings),
    /// Plain interpretation, counting as it goes
    Interpret(Location, Bindings),
    /// Fallback interpretation after specialization declined
    FallBack(Location, Bindings),
    Execute(Arc<CompiledUnit>, Bindings),
    Done(Exit),
}

/// Result of one compilation attempt
enum Compiled {
    Unit(Arc<CompiledUnit>),
    Interpret,
    FallBack,
}

/// Per-thread execution engine
#[derive(Debug)]
pub struct Dispatcher {
    program: Arc<Program>,
    config: JitConfig,
    counters: HotnessCounters,
    interpreter: Interpreter,
    fallback: FallbackInterpreter,
    cache: Arc<CodeCache>,
    backend: Arc<dyn Backend>,
    empty_regions: HashSet<UnitEntry>,
    state: DispatchState,
    stats: DispatchStats,
    events: Vec<DispatchEvent>,
}

impl Dispatcher {
    pub fn new(program: Arc<Program>, config: JitConfig) -> Result<Self> {
        config.validate()?;
        let interpreter = Interpreter::new(program.clone())
            .with_max_call_depth(config.max_call_depth)
            .with_loop_headers_only(config.loop_headers_only);
        Ok(Self {
            fallback: FallbackInterpreter::new(program.clone(), &config),
            counters: HotnessCounters::with_dedup(config.dedup_counters),
            cache: Arc::new(CodeCache::new(config.megamorphic_threshold)),
            backend: Arc::new(IrBackend::new()),
            empty_regions: HashSet::default(),
            state: DispatchState::default(),
            stats: DispatchStats::default(),
            events: Vec::new(),
            program,
            config,
            interpreter,
        })
    }

    /// Share installed units with other dispatchers
    pub fn with_cache(mut self, cache: Arc<CodeCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_fallback_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.fallback = self.fallback.with_capabilities(capabilities);
        self
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn counters(&self) -> &HotnessCounters {
        &self.counters
    }

    pub fn cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// State changes, if `record_events` is on
    pub fn events(&self) -> &[DispatchEvent] {
        &self.events
    }

    /// Run the program's entry function to completion
    pub fn run_program(&mut self, effects: &mut Effects) -> Result<Value> {
        let bindings = self.interpreter.entry_bindings()?;
        let entry = Location::new(self.program.entry(), 0);
        let exit = self.run(entry, bindings, effects)?;
        exit.returned().cloned().ok_or_else(|| {
            Error::program(format!("run ended at {} without returning", exit.location))
        })
    }

    /// Run from `location` until the top frame returns
    pub fn run(&mut self, location: Location, bindings: Bindings, effects: &mut Effects) -> Result<Exit> {
        self.drive(Next::Interpret(location, bindings), effects, false)
    }

    /// Handle one arrival at merge point `location` and run until the next
    /// arrival or a return
    pub fn arrive_at_merge_point(
        &mut self,
        location: Location,
        bindings: Bindings,
        effects: &mut Effects,
    ) -> Result<Exit> {
        self.drive(Next::Arrive(location, bindings), effects, true)
    }

    /// Handle promotion site `site` holding its value in `reg`, then run until
    /// the next merge point arrival or a return
    pub fn arrive_at_promotion(
        &mut self,
        site: Location,
        reg: Reg,
        bindings: Bindings,
        effects: &mut Effects,
    ) -> Result<Exit> {
        let next = self.on_promotion(site, reg, bindings)?;
        self.drive(next, effects, true)
    }

    fn drive(&mut self, mut next: Next, effects: &mut Effects, single: bool) -> Result<Exit> {
        loop {
            next = match next {
                Next::Done(exit) => {
                    self.enter(DispatchState::Interpreting, exit.location);
                    return Ok(exit);
                }
                Next::Arrive(location, bindings) => self.on_merge_point(location, bindings)?,
                Next::Interpret(location, bindings) => {
                    self.enter(DispatchState::Interpreting, location);
                    self.stats.interpreted_segments += 1;
                    self.segment(location, bindings, effects, single)?
                }
                Next::FallBack(location, bindings) => {
                    self.enter(DispatchState::FallingBack, location);
                    self.stats.fallback_segments += 1;
                    self.segment(location, bindings, effects, single)?
                }
                Next::Execute(unit, bindings) => {
                    self.enter(DispatchState::ExecutingCompiled, unit.entry().location());
                    self.stats.compiled_runs += 1;
                    trace!(unit = unit.id(), entry = %unit.entry(), "executing unit");
                    let exit = unit.run(
                        bindings,
                        &mut RunContext {
                            interpreter: &self.interpreter,
                            effects: &mut *effects,
                        },
                    )?;
                    self.on_unit_exit(exit, single)?
                }
            };
        }
    }

    fn segment(
        &mut self,
        location: Location,
        bindings: Bindings,
        effects: &mut Effects,
        single: bool,
    ) -> Result<Next> {
        match self.fallback.resume(location, bindings, effects, &mut self.counters, &self.cache) {
            Ok(exit) => Ok(self.after_segment(exit, single)),
            Err(err @ Error::FallbackGap { .. }) => {
                self.cache.disable();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn after_segment(&self, exit: Exit, single: bool) -> Next {
        match exit.kind {
            ExitKind::MergePoint if !single => Next::Arrive(exit.location, exit.bindings),
            _ => Next::Done(exit),
        }
    }

    fn on_unit_exit(&mut self, exit: Exit, single: bool) -> Result<Next> {
        match exit.kind {
            ExitKind::Promotion { reg } => self.on_promotion(exit.location, reg, exit.bindings),
            ExitKind::Fallback => Ok(Next::FallBack(exit.location, exit.bindings)),
            ExitKind::MergePoint | ExitKind::Return(_) => Ok(self.after_segment(exit, single)),
        }
    }

    fn on_merge_point(&mut self, location: Location, bindings: Bindings) -> Result<Next> {
        self.enter(DispatchState::ArmedForJit, location);
        self.stats.merge_point_arrivals += 1;
        if !self.jit_active() {
            return Ok(Next::Interpret(location.next(), bindings));
        }

        let program = Arc::clone(&self.program);
        let greens = program.merge_point_greens(location);
        let key = MergePointKey::new(location, greens, &bindings);
        if let Some(unit) = self.cache.lookup(&key) {
            if unit.accepts(&bindings) {
                return Ok(Next::Execute(unit, bindings));
            }
        }

        let count = self.counters.observe(SiteKey::MergePoint(key.clone()));
        let entry = UnitEntry::MergePoint(key.clone());
        if count < self.config.merge_point_threshold || self.empty_regions.contains(&entry) {
            return Ok(Next::Interpret(location.next(), bindings));
        }

        self.enter(DispatchState::Compiling, location);
        let state = ExecutionState::at_merge_point(location, greens, &bindings);
        Ok(match self.compile(state, entry, &bindings)? {
            Compiled::Unit(unit) => {
                self.cache.install(key, unit.clone());
                Next::Execute(unit, bindings)
            }
            Compiled::Interpret => Next::Interpret(location.next(), bindings),
            Compiled::FallBack => Next::FallBack(location.next(), bindings),
        })
    }

    fn on_promotion(&mut self, site: Location, reg: Reg, bindings: Bindings) -> Result<Next> {
        self.stats.promotion_exits += 1;
        if !self.jit_active() || bindings.is_tainted(reg) {
            return Ok(Next::FallBack(site.next(), bindings));
        }

        let value = bindings.get(reg).clone();
        let count = self.counters.observe(promotion_key(&self.cache, site, &value));
        let decision = Specializer::new(&self.program, &self.config, &self.counters, &self.cache)
            .resolve_promotion(site, &value, count, &bindings);
        trace!(site = %site, value = %value, count, ?decision, "promotion");

        let (state, entry) = match decision {
            PromotionDecision::Cached(unit) => return Ok(Next::Execute(unit, bindings)),
            PromotionDecision::Fallback => return Ok(Next::FallBack(site.next(), bindings)),
            PromotionDecision::Specialize => (
                ExecutionState::at_promotion(site, reg, &bindings),
                UnitEntry::Promotion {
                    site,
                    value: value.clone(),
                },
            ),
            PromotionDecision::SpecializeGeneric => (
                ExecutionState::generic(site.next(), &bindings),
                UnitEntry::GenericPromotion(site),
            ),
        };
        if self.empty_regions.contains(&entry) {
            return Ok(Next::FallBack(site.next(), bindings));
        }

        self.enter(DispatchState::Compiling, site);
        let generic = matches!(entry, UnitEntry::GenericPromotion(_));
        Ok(match self.compile(state, entry, &bindings)? {
            Compiled::Unit(unit) => {
                if generic {
                    self.cache.install_generic(site, unit.clone());
                } else {
                    self.cache
                        .install_promotion(site, value, bindings.taint_mask(), unit.clone());
                }
                Next::Execute(unit, bindings)
            }
            Compiled::Interpret | Compiled::FallBack => Next::FallBack(site.next(), bindings),
        })
    }

    fn compile(&mut self, state: ExecutionState, entry: UnitEntry, bindings: &Bindings) -> Result<Compiled> {
        let outcome = Specializer::new(&self.program, &self.config, &self.counters, &self.cache).specialize(state);
        match outcome {
            Ok(SpecializeOutcome::Committed(trace)) => {
                let op_count = trace.op_count();
                let code = self.backend.emit(trace)?;
                let unit = Arc::new(CompiledUnit::new(
                    self.cache.next_unit_id(),
                    entry,
                    code,
                    op_count,
                    bindings.taint_mask(),
                ));
                self.stats.units_compiled += 1;
                debug!(
                    entry = %unit.entry(),
                    unit = unit.id(),
                    ops = op_count,
                    backend = self.backend.name(),
                    "compiled unit"
                );
                Ok(Compiled::Unit(unit))
            }
            Ok(SpecializeOutcome::Empty) => {
                self.stats.empty_regions += 1;
                self.empty_regions.insert(entry);
                Ok(Compiled::Interpret)
            }
            Ok(SpecializeOutcome::Fallback(_)) => {
                self.stats.specialization_fallbacks += 1;
                Ok(Compiled::FallBack)
            }
            Err(err @ Error::MergeIncompatible(_)) => {
                error!(%err, entry = %entry, "disabling specialization");
                self.cache.disable();
                Ok(Compiled::Interpret)
            }
            Err(err) => Err(err),
        }
    }

    fn jit_active(&self) -> bool {
        self.config.enabled && !self.cache.is_disabled()
    }

    fn enter(&mut self, to: DispatchState, location: Location) {
        let from = self.state;
        debug_assert!(
            from.can_transition_to(to),
            "illegal dispatch transition {} -> {} at {}",
            from,
            to,
            location
        );
        if from != to {
            trace!(%from, %to, at = %location, "dispatch");
            if self.config.record_events {
                self.events.push(DispatchEvent { from, to, location });
            }
        }
        self.state = to;
    }
}
