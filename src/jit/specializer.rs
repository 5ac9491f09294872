//! The specializer
//!
//! Walks bytecode from an [`ExecutionState`], folding everything computable
//! from fixed values and emitting residual ops for the rest, until the region
//! ends at a merge point, a promotion it cannot resolve, or a return.
//!
//! | Instruction      | Fixed operands        | Variable operands                  |
//! |------------------|-----------------------|------------------------------------|
//! | arithmetic/alloc | folded (unless it faults) | residual op into a fresh slot  |
//! | branch           | arm chosen statically | red split                          |
//! | promote          | continues             | region ends with a promotion exit  |
//! | merge point      | region ends (dispatch points only)                         |

use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::backend::CompiledUnit;
use super::classify::Repr;
use super::hotness::{HotnessCounters, SiteKey};
use super::install::CodeCache;
use super::residual::{Operand, ResidualExit, ResidualOp, ResidualTrace};
use super::state::{ArmMerge, ExecutionState};
use super::JitConfig;
use crate::bytecode::{Instr, Location, Program, SplitKind};
use crate::error::{Error, Result};
use crate::runtime::{Bindings, Value};

/// Why a specialization attempt gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// A split with allocating arms and no dominant arm
    ComplicatedSplit(Location),
    /// The attempt processed more instructions than allowed
    RegionTooLong { limit: usize },
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::ComplicatedSplit(at) => write!(f, "complicated split at {}", at),
            FallbackReason::RegionTooLong { limit } => {
                write!(f, "region exceeds {} instructions", limit)
            }
        }
    }
}

#[derive(Debug)]
pub enum SpecializeOutcome {
    /// A trace ready for the backend
    Committed(ResidualTrace),
    /// The region has nothing to execute; stay in the interpreter
    Empty,
    /// Discard the state and let the fallback interpreter run
    Fallback(FallbackReason),
}

/// What to do with a promotion site's current value
#[derive(Debug)]
pub enum PromotionDecision {
    /// A unit is installed for this value (or for the generic site)
    Cached(Arc<CompiledUnit>),
    /// The value is hot: specialize with it fixed
    Specialize,
    /// The site is generic and hot: specialize with the value variable
    SpecializeGeneric,
    /// Not hot yet
    Fallback,
}

/// How a walk over a region (or one arm of a split) ended
enum Region {
    /// Every path ends in an exit
    Done,
    /// Reached the join of the enclosing split
    Joined,
    Abort(FallbackReason),
}

/// One specialization pass over shared engine state
pub struct Specializer<'a> {
    program: &'a Program,
    config: &'a JitConfig,
    counters: &'a HotnessCounters,
    cache: &'a CodeCache,
}

impl<'a> Specializer<'a> {
    pub fn new(
        program: &'a Program,
        config: &'a JitConfig,
        counters: &'a HotnessCounters,
        cache: &'a CodeCache,
    ) -> Self {
        Self {
            program,
            config,
            counters,
            cache,
        }
    }

    /// Specialize the region `state` is positioned at
    ///
    /// Fails only on internal inconsistencies ([`Error::MergeIncompatible`]).
    pub fn specialize(&self, mut state: ExecutionState) -> Result<SpecializeOutcome> {
        let entry = state.entry();
        match self.run_region(&mut state)? {
            Region::Abort(reason) => {
                debug!(at = %entry, %reason, "specialization falls back");
                Ok(SpecializeOutcome::Fallback(reason))
            }
            Region::Joined => Err(Error::MergeIncompatible(format!(
                "region from {} stopped at a join outside any split",
                entry
            ))),
            Region::Done => {
                let trace = state.into_trace();
                if trace.is_empty() {
                    debug!(at = %entry, "nothing to compile");
                    Ok(SpecializeOutcome::Empty)
                } else {
                    debug!(at = %entry, ops = trace.op_count(), slots = trace.var_count, "specialization committed");
                    Ok(SpecializeOutcome::Committed(trace))
                }
            }
        }
    }

    /// Decide how to continue at promotion site `site` holding `value`
    ///
    /// `count` is the hotness of this observation: per value, or for the
    /// whole site once it is generic. Per-value units are looked up under the
    /// provenance mask of `bindings`.
    pub fn resolve_promotion(
        &self,
        site: Location,
        value: &Value,
        count: u64,
        bindings: &Bindings,
    ) -> PromotionDecision {
        let threshold = self.config.promotion_threshold;
        if self.cache.is_generic(site) {
            return match self.cache.generic_unit(site) {
                Some(unit) if unit.accepts(bindings) => PromotionDecision::Cached(unit),
                _ if count >= threshold => PromotionDecision::SpecializeGeneric,
                _ => PromotionDecision::Fallback,
            };
        }
        if let Some(unit) = self.cache.lookup_promotion(site, value, bindings.taint_mask()) {
            if unit.accepts(bindings) {
                return PromotionDecision::Cached(unit);
            }
        }
        if count < threshold {
            return PromotionDecision::Fallback;
        }
        if !self.cache.promotion_has_room(site, value) {
            self.cache.make_generic(site);
            return PromotionDecision::Fallback;
        }
        PromotionDecision::Specialize
    }

    fn run_region(&self, state: &mut ExecutionState) -> Result<Region> {
        let limit = self.config.max_region_instrs;
        loop {
            if state.stop_at() == Some(state.cursor()) {
                return Ok(Region::Joined);
            }
            if state.tick() > limit {
                return Ok(Region::Abort(FallbackReason::RegionTooLong { limit }));
            }

            let at = state.location();
            let instr = self
                .program
                .instr_at(at)
                .ok_or_else(|| Error::program(format!("specializer ran off the code at {}", at)))?;

            match instr {
                Instr::Const { dst, value } => state.set(*dst, Repr::literal(value.clone())),
                Instr::Move { dst, src } => {
                    let repr = state.get(*src).clone();
                    state.set(*dst, repr);
                }
                Instr::Binary { op, dst, lhs, rhs } => {
                    let (l, r) = (state.get(*lhs).clone(), state.get(*rhs).clone());
                    let folded = match (l.constant(), r.constant()) {
                        (Some(a), Some(b)) => op.eval(a, b).ok(),
                        _ => None,
                    };
                    match folded {
                        Some(value) => state.set(*dst, Repr::literal(value)),
                        None => {
                            let var = state.fresh_var();
                            state.emit(ResidualOp::Binary {
                                op: *op,
                                dst: var,
                                lhs: l.operand(),
                                rhs: r.operand(),
                            });
                            state.set(*dst, Repr::variable(var, l.is_tainted() || r.is_tainted()));
                        }
                    }
                }
                Instr::Input { dst } => {
                    let var = state.fresh_var();
                    state.emit(ResidualOp::Input { dst: var });
                    state.set(*dst, Repr::variable(var, true));
                }
                Instr::Print { src } => {
                    let src = state.get(*src).operand();
                    state.emit(ResidualOp::Print { src });
                }
                Instr::Alloc { dst, fields } => {
                    let reprs: Vec<Repr> = fields.iter().map(|r| state.get(*r).clone()).collect();
                    if reprs.iter().all(Repr::is_fixed) {
                        let values = reprs.iter().filter_map(|r| r.constant().cloned()).collect();
                        state.set(*dst, Repr::literal(Value::tuple(values)));
                    } else {
                        let var = state.fresh_var();
                        state.emit(ResidualOp::Alloc {
                            dst: var,
                            fields: reprs.iter().map(Repr::operand).collect(),
                        });
                        let tainted = reprs.iter().any(Repr::is_tainted);
                        state.set(*dst, Repr::variable(var, tainted));
                    }
                }
                Instr::GetField { dst, obj, index } => {
                    let o = state.get(*obj).clone();
                    match o.constant().and_then(|v| v.field(*index).ok()) {
                        Some(value) => state.set(*dst, Repr::literal(value)),
                        None => {
                            let var = state.fresh_var();
                            state.emit(ResidualOp::GetField {
                                dst: var,
                                obj: o.operand(),
                                index: *index,
                            });
                            state.set(*dst, Repr::variable(var, o.is_tainted()));
                        }
                    }
                }
                Instr::Call { dst, func, args } => {
                    let reprs: Vec<Repr> = args.iter().map(|r| state.get(*r).clone()).collect();
                    let tainted =
                        self.program.has_effects(*func) || reprs.iter().any(Repr::is_tainted);
                    let var = state.fresh_var();
                    state.emit(ResidualOp::Call {
                        dst: var,
                        func: *func,
                        args: reprs.iter().map(Repr::operand).collect(),
                    });
                    state.set(*dst, Repr::variable(var, tainted));
                }
                Instr::Jump { target } => {
                    state.jump(*target);
                    continue;
                }
                Instr::Branch {
                    cond,
                    else_pc,
                    join,
                } => {
                    let cond = state.get(*cond).clone();
                    if let Some(value) = cond.constant() {
                        let next = if value.truthy() { at.pc + 1 } else { *else_pc };
                        state.jump(next);
                        continue;
                    }
                    match self.red_split(state, at, cond.operand(), *else_pc, *join)? {
                        Some(end) => return Ok(end),
                        None => continue,
                    }
                }
                Instr::MergePoint { .. } => {
                    if self.program.is_dispatch_point(at, self.config.loop_headers_only) {
                        state.exit_here(ResidualExit::MergePoint);
                        return Ok(Region::Done);
                    }
                }
                Instr::Promote { reg } => {
                    let repr = state.get(*reg);
                    if !repr.is_fixed() && !repr.is_tainted() && !self.cache.is_generic(at) {
                        state.exit_here(ResidualExit::Promotion { reg: *reg });
                        return Ok(Region::Done);
                    }
                }
                Instr::Return { src } => {
                    let value = state.get(*src).operand();
                    state.exit_here(ResidualExit::Return(value));
                    return Ok(Region::Done);
                }
            }
            state.advance();
        }
    }

    /// Specialize a split on a variable condition
    ///
    /// Returns `None` when the walk continues from the state's new cursor.
    fn red_split(
        &self,
        state: &mut ExecutionState,
        at: Location,
        cond: Operand,
        else_pc: usize,
        join: Option<usize>,
    ) -> Result<Option<Region>> {
        if self.program.split_kind(at) == SplitKind::Complicated {
            return Ok(match self.hot_arm(at) {
                Some(taken) => {
                    trace!(at = %at, taken, "guarding the hot arm of a complicated split");
                    let exit = state.exit_descr(at, ResidualExit::Fallback);
                    state.emit(ResidualOp::Guard {
                        cond,
                        expect: taken,
                        exit: Box::new(exit),
                    });
                    state.jump(if taken { at.pc + 1 } else { else_pc });
                    None
                }
                None => Some(Region::Abort(FallbackReason::ComplicatedSplit(at))),
            });
        }

        let mut then = state.fork(at.pc + 1, join);
        let then_end = self.run_region(&mut then)?;
        if let Region::Abort(reason) = then_end {
            return Ok(Some(Region::Abort(reason)));
        }
        let mut else_ = state.fork(else_pc, join);
        else_.reserve_vars_of(&then);
        else_.charge_steps(then.steps());
        let else_end = self.run_region(&mut else_)?;
        if let Region::Abort(reason) = else_end {
            return Ok(Some(Region::Abort(reason)));
        }
        let spent = else_.steps();

        let (then_ops, else_ops, end) = match (then_end, else_end) {
            (Region::Joined, Region::Joined) => match ExecutionState::merge_arms(then, else_)? {
                ArmMerge::Merged {
                    then_ops,
                    else_ops,
                    state: merged,
                } => {
                    state.continue_from(merged);
                    (then_ops, else_ops, None)
                }
                ArmMerge::CannotMerge {
                    then,
                    mut else_,
                    reg,
                    reason,
                } => {
                    warn!(at = %at, reg, %reason, "arms cannot merge, else arm falls back");
                    else_.exit_here(ResidualExit::Fallback);
                    state.reserve_vars_of(&else_);
                    let else_ops = else_.take_ops();
                    let then_ops = state.continue_from(then);
                    (then_ops, else_ops, None)
                }
            },
            (Region::Joined, _) => {
                state.reserve_vars_of(&else_);
                let else_ops = else_.take_ops();
                let then_ops = state.continue_from(then);
                (then_ops, else_ops, None)
            }
            (_, Region::Joined) => {
                state.reserve_vars_of(&then);
                let then_ops = then.take_ops();
                let else_ops = state.continue_from(else_);
                (then_ops, else_ops, None)
            }
            _ => {
                state.reserve_vars_of(&else_);
                (then.take_ops(), else_.take_ops(), Some(Region::Done))
            }
        };

        state.charge_steps(spent);
        state.emit(ResidualOp::Branch {
            cond,
            then_ops,
            else_ops,
        });
        Ok(end)
    }

    /// The arm of a complicated split worth compiling, if one dominates
    fn hot_arm(&self, at: Location) -> Option<bool> {
        let count = |taken| self.counters.count(&SiteKey::Split { site: at, taken });
        let (taken, not_taken) = (count(true), count(false));
        let threshold = self.config.split_threshold;
        if taken >= threshold && not_taken * 2 < taken {
            Some(true)
        } else if not_taken >= threshold && taken * 2 < not_taken {
            Some(false)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BinaryOp, FunctionBuilder};
    use crate::jit::backend::{Backend, IrBackend, RunContext};
    use crate::runtime::{Effects, Exit, ExitKind, Interpreter, NoopObserver};

    struct Fixture {
        program: Program,
        config: JitConfig,
        counters: HotnessCounters,
        cache: CodeCache,
    }

    impl Fixture {
        fn new(b: FunctionBuilder) -> Self {
            Self {
                program: Program::single(b.build().unwrap()).unwrap(),
                config: JitConfig::default(),
                counters: HotnessCounters::new(),
                cache: CodeCache::default(),
            }
        }

        fn specializer(&self) -> Specializer<'_> {
            Specializer::new(&self.program, &self.config, &self.counters, &self.cache)
        }

        fn specialize_from_start(&self) -> SpecializeOutcome {
            let registers = self.program.functions()[0].registers as usize;
            let state = ExecutionState::generic(Location::new(0, 0), &Bindings::new(registers));
            self.specializer().specialize(state).unwrap()
        }

        fn run(&self, trace: ResidualTrace, bindings: Bindings) -> (Exit, Vec<Value>) {
            let code = IrBackend::new().emit(trace).unwrap();
            let interpreter = Interpreter::new(Arc::new(self.program.clone()));
            let mut effects = Effects::new();
            let exit = code
                .run(
                    bindings,
                    &mut RunContext {
                        interpreter: &interpreter,
                        effects: &mut effects,
                    },
                )
                .unwrap();
            (exit, effects.output().to_vec())
        }
    }

    /// x = 5; if r0 { x += 1 }; print x; return x
    fn simple_split() -> FunctionBuilder {
        let mut b = FunctionBuilder::new("simple");
        let join = b.new_label();
        b.konst(1, Value::Int(5));
        b.konst(2, Value::Int(1));
        b.branch(0, join, Some(join));
        b.add(1, 1, 2);
        b.bind(join);
        b.print(1);
        b.ret(1);
        b
    }

    /// r1 = if r0 { (r0) } else { nil }; return r1
    fn allocating_split() -> FunctionBuilder {
        let mut b = FunctionBuilder::new("complicated");
        let else_arm = b.new_label();
        let join = b.new_label();
        b.branch(0, else_arm, Some(join));
        b.alloc(1, &[0]);
        b.jump(join);
        b.bind(else_arm);
        b.konst(1, Value::Nil);
        b.bind(join);
        b.ret(1);
        b
    }

    /// `k` splits on r0 in a row, none declaring a join
    fn split_chain(k: usize) -> FunctionBuilder {
        let mut b = FunctionBuilder::new("chain");
        b.konst(2, Value::Int(1));
        for _ in 0..k {
            let next = b.new_label();
            b.branch(0, next, None);
            b.add(1, 1, 2);
            b.bind(next);
        }
        b.ret(1);
        b
    }

    /// promote r0; if r1 { } else { r0 = 99 }; print r0; return r0
    fn rebinding_split() -> FunctionBuilder {
        let mut b = FunctionBuilder::new("rebind");
        let else_arm = b.new_label();
        let join = b.new_label();
        b.promote(0);
        b.branch(1, else_arm, Some(join));
        b.jump(join);
        b.bind(else_arm);
        b.konst(0, Value::Int(99));
        b.bind(join);
        b.print(0);
        b.ret(0);
        b
    }

    #[test]
    fn test_simple_split_merges_and_commits() {
        let fixture = Fixture::new(simple_split());
        let trace = match fixture.specialize_from_start() {
            SpecializeOutcome::Committed(trace) => trace,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(trace.ops[0], ResidualOp::Branch { .. }));

        let (exit, output) = fixture.run(trace.clone(), Bindings::from_values(vec![Value::Int(1), Value::Nil, Value::Nil]));
        assert_eq!(exit.kind, ExitKind::Return(Value::Int(6)));
        assert_eq!(output, vec![Value::Int(6)]);
        let (exit, _) = fixture.run(trace, Bindings::new(3));
        assert_eq!(exit.kind, ExitKind::Return(Value::Int(5)));
        assert_eq!(exit.bindings.get(2), &Value::Int(1));
    }

    #[test]
    fn test_allocating_split_falls_back() {
        let fixture = Fixture::new(allocating_split());
        match fixture.specialize_from_start() {
            SpecializeOutcome::Fallback(reason) => {
                assert_eq!(reason, FallbackReason::ComplicatedSplit(Location::new(0, 0)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_hot_arm_is_guarded() {
        let mut fixture = Fixture::new(allocating_split());
        for _ in 0..10 {
            fixture.counters.observe(SiteKey::Split {
                site: Location::new(0, 0),
                taken: true,
            });
        }
        let trace = match fixture.specialize_from_start() {
            SpecializeOutcome::Committed(trace) => trace,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(trace.ops[0], ResidualOp::Guard { expect: true, .. }));

        let (exit, _) = fixture.run(trace.clone(), Bindings::from_values(vec![Value::Int(2), Value::Nil]));
        assert_eq!(exit.kind, ExitKind::Return(Value::tuple(vec![Value::Int(2)])));
        let (exit, _) = fixture.run(trace, Bindings::new(2));
        assert_eq!(exit.kind, ExitKind::Fallback);
        assert_eq!(exit.location, Location::new(0, 0));
    }

    #[test]
    fn test_faulting_ops_are_not_folded() {
        let mut b = FunctionBuilder::new("div");
        b.konst(0, Value::Int(1));
        b.konst(1, Value::Int(0));
        b.binary(BinaryOp::Div, 2, 0, 1);
        b.ret(2);
        let fixture = Fixture::new(b);
        let trace = match fixture.specialize_from_start() {
            SpecializeOutcome::Committed(trace) => trace,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(
            &trace.ops[0],
            ResidualOp::Binary {
                op: BinaryOp::Div,
                lhs: Operand::Const(Value::Int(1)),
                rhs: Operand::Const(Value::Int(0)),
                ..
            }
        ));
    }

    #[test]
    fn test_variable_promotion_ends_region() {
        let mut b = FunctionBuilder::new("promote");
        b.konst(1, Value::Int(2));
        b.promote(0);
        b.add(1, 0, 1);
        b.ret(1);
        let fixture = Fixture::new(b);
        match fixture.specialize_from_start() {
            SpecializeOutcome::Empty => {}
            other => panic!("unexpected {:?}", other),
        }

        let mut bindings = Bindings::new(2);
        bindings.set(0, Value::Int(7), false);
        bindings.set(1, Value::Int(2), false);
        let state = ExecutionState::at_promotion(Location::new(0, 1), 0, &bindings);
        let trace = match fixture.specializer().specialize(state).unwrap() {
            SpecializeOutcome::Committed(trace) => trace,
            other => panic!("unexpected {:?}", other),
        };
        // r1 is red on entry, so the add stays with 7 as a constant operand
        assert!(matches!(
            &trace.ops[0],
            ResidualOp::Binary {
                lhs: Operand::Const(Value::Int(7)),
                ..
            }
        ));
        let (exit, _) = fixture.run(trace, bindings);
        assert_eq!(exit.kind, ExitKind::Return(Value::Int(9)));
    }

    #[test]
    fn test_runaway_region_is_cut_off() {
        let mut b = FunctionBuilder::new("spin");
        let head = b.new_label();
        b.bind(head);
        b.add(0, 0, 1);
        b.jump(head);
        let mut fixture = Fixture::new(b);
        fixture.config = JitConfig::default().with_max_region_instrs(50);
        match fixture.specialize_from_start() {
            SpecializeOutcome::Fallback(FallbackReason::RegionTooLong { limit }) => {
                assert_eq!(limit, 50)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_split_arms_share_the_budget() {
        let fixture = Fixture::new(split_chain(3));
        assert!(matches!(fixture.specialize_from_start(), SpecializeOutcome::Committed(_)));

        // 2^20 paths through 42 instructions
        let fixture = Fixture::new(split_chain(20));
        match fixture.specialize_from_start() {
            SpecializeOutcome::Fallback(FallbackReason::RegionTooLong { limit }) => {
                assert_eq!(limit, JitConfig::default().max_region_instrs)
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut fixture = Fixture::new(split_chain(6));
        fixture.config = JitConfig::default().with_max_region_instrs(100);
        assert!(matches!(
            fixture.specialize_from_start(),
            SpecializeOutcome::Fallback(FallbackReason::RegionTooLong { limit: 100 })
        ));
    }

    #[test]
    fn test_unmergeable_else_arm_falls_back_at_join() {
        let fixture = Fixture::new(rebinding_split());
        let mut bindings = Bindings::new(2);
        bindings.set(0, Value::Int(7), false);
        bindings.set(1, Value::Int(1), false);
        let state = ExecutionState::at_promotion(Location::new(0, 0), 0, &bindings);
        let trace = match fixture.specializer().specialize(state).unwrap() {
            SpecializeOutcome::Committed(trace) => trace,
            other => panic!("unexpected {:?}", other),
        };

        let (exit, output) = fixture.run(trace.clone(), bindings.clone());
        assert_eq!(exit.kind, ExitKind::Return(Value::Int(7)));
        assert_eq!(output, vec![Value::Int(7)]);

        bindings.set(1, Value::Int(0), false);
        let (exit, output) = fixture.run(trace, bindings);
        assert_eq!(exit.kind, ExitKind::Fallback);
        assert_eq!(exit.location, Location::new(0, 4));
        assert_eq!(exit.bindings.get(0), &Value::Int(99));
        assert!(output.is_empty());

        // the interpreter picks up where the arm left off
        let interpreter = Interpreter::new(Arc::new(fixture.program.clone()));
        let mut effects = Effects::new();
        let exit = interpreter
            .resume(exit.location, exit.bindings, &mut effects, &mut NoopObserver)
            .unwrap();
        assert_eq!(exit.kind, ExitKind::Return(Value::Int(99)));
        assert_eq!(effects.output(), &[Value::Int(99)]);
    }

    #[test]
    fn test_resolve_promotion_thresholds() {
        let fixture = Fixture::new(simple_split());
        let site = Location::new(0, 3);
        let specializer = fixture.specializer();
        let bindings = Bindings::new(3);
        assert!(matches!(
            specializer.resolve_promotion(site, &Value::Int(7), 9, &bindings),
            PromotionDecision::Fallback
        ));
        assert!(matches!(
            specializer.resolve_promotion(site, &Value::Int(7), 10, &bindings),
            PromotionDecision::Specialize
        ));
    }
}
