//! The execution state threaded through specialization
//!
//! One [`ExecutionState`] exists per specialization attempt. The dispatcher
//! creates it, hands it to the specializer by value and it is consumed into a
//! residual trace or dropped on fallback. Simple splits fork it for their two
//! arms and merge the arms back into it.

use std::fmt;

use super::classify::{fix, Provenance, Repr, VarId};
use super::residual::{ExitDescr, ResidualExit, ResidualOp, ResidualTrace};
use crate::bytecode::{FuncId, Location, Reg};
use crate::error::{Error, Result};
use crate::runtime::{Bindings, Value};

/// Shape of one register with slot identities erased
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FrozenRepr {
    Fixed(Value),
    Variable { tainted: bool },
}

/// The fixed/variable shape of a state at its cursor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrozenShape {
    pub cursor: usize,
    pub regs: Vec<FrozenRepr>,
}

impl FrozenShape {
    /// Whether two states have the same shape at the same point
    pub fn exact_match(&self, other: &FrozenShape) -> bool {
        self == other
    }

    /// Whether two states can be merged at all
    pub fn compatible(&self, other: &FrozenShape) -> bool {
        self.cursor == other.cursor && self.regs.len() == other.regs.len()
    }
}

/// Why two arms could not be merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeConflict {
    /// A pinned green differs between the arms
    Pinned,
    /// One arm's value derives from I/O and the other's does not
    Taint,
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeConflict::Pinned => write!(f, "pinned value differs"),
            MergeConflict::Taint => write!(f, "provenance differs"),
        }
    }
}

/// Result of merging the two arms of a simple split at their join
#[derive(Debug)]
pub enum ArmMerge {
    /// The arms merged; each op list ends with the materializations that
    /// generalize differing registers
    Merged {
        then_ops: Vec<ResidualOp>,
        else_ops: Vec<ResidualOp>,
        state: ExecutionState,
    },
    /// The shapes cannot be reconciled; the else arm must fall back
    CannotMerge {
        then: ExecutionState,
        else_: ExecutionState,
        reg: Reg,
        reason: MergeConflict,
    },
}

enum RegMerge {
    Keep(Repr),
    Generalize,
    Conflict(MergeConflict),
}

#[derive(Debug, Clone)]
pub struct ExecutionState {
    func: FuncId,
    entry: Location,
    regs: Vec<Repr>,
    ops: Vec<ResidualOp>,
    cursor: usize,
    next_var: u32,
    stop_at: Option<usize>,
    steps: usize,
}

impl ExecutionState {
    /// State entering the code after merge point `location`, with its green
    /// registers fixed
    pub fn at_merge_point(location: Location, greens: &[Reg], bindings: &Bindings) -> Self {
        Self::entering(location.next(), bindings, |reg| {
            greens.contains(&reg).then_some(Provenance::GreenEntry)
        })
    }

    /// State entering the code after promotion site `site` with `reg` fixed to
    /// its current value
    pub fn at_promotion(site: Location, reg: Reg, bindings: &Bindings) -> Self {
        Self::entering(site.next(), bindings, |r| {
            (r == reg).then_some(Provenance::Promoted)
        })
    }

    /// State entering at `location` with every register variable
    pub fn generic(location: Location, bindings: &Bindings) -> Self {
        Self::entering(location, bindings, |_| None)
    }

    fn entering(
        location: Location,
        bindings: &Bindings,
        fixed: impl Fn(Reg) -> Option<Provenance>,
    ) -> Self {
        let regs = (0..bindings.len())
            .map(|index| {
                let reg = index as Reg;
                let tainted = bindings.is_tainted(reg);
                let green = fixed(reg)
                    .filter(|_| !tainted)
                    .and_then(|provenance| fix(bindings.get(reg).clone(), provenance));
                match green {
                    Some(green) => Repr::Fixed(green),
                    None => Repr::variable(VarId(index as u32), tainted),
                }
            })
            .collect();

        Self {
            func: location.func,
            entry: location,
            regs,
            ops: Vec::new(),
            cursor: location.pc,
            next_var: bindings.len() as u32,
            stop_at: None,
            steps: 0,
        }
    }

    pub fn entry(&self) -> Location {
        self.entry
    }

    pub fn location(&self) -> Location {
        Location::new(self.func, self.cursor)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn advance(&mut self) {
        self.cursor += 1;
    }

    pub fn jump(&mut self, pc: usize) {
        self.cursor = pc;
    }

    /// The join this arm stops at, if it is an arm
    pub fn stop_at(&self) -> Option<usize> {
        self.stop_at
    }

    pub fn get(&self, reg: Reg) -> &Repr {
        &self.regs[reg as usize]
    }

    pub fn set(&mut self, reg: Reg, repr: Repr) {
        self.regs[reg as usize] = repr;
    }

    pub fn regs(&self) -> &[Repr] {
        &self.regs
    }

    pub fn fresh_var(&mut self) -> VarId {
        let var = VarId(self.next_var);
        self.next_var += 1;
        var
    }

    pub fn emit(&mut self, op: ResidualOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[ResidualOp] {
        &self.ops
    }

    pub fn take_ops(&mut self) -> Vec<ResidualOp> {
        std::mem::take(&mut self.ops)
    }

    /// Count one processed instruction, returning the total
    pub fn tick(&mut self) -> usize {
        self.steps += 1;
        self.steps
    }

    /// Copy of this state for one arm of a split, starting at `cursor` with
    /// no ops of its own
    pub fn fork(&self, cursor: usize, stop_at: Option<usize>) -> Self {
        Self {
            func: self.func,
            entry: self.entry,
            regs: self.regs.clone(),
            ops: Vec::new(),
            cursor,
            next_var: self.next_var,
            stop_at,
            steps: self.steps,
        }
    }

    /// Never hand out slots `other` already used
    pub fn reserve_vars_of(&mut self, other: &ExecutionState) {
        self.next_var = self.next_var.max(other.next_var);
    }

    /// Raise the processed-instruction count to `steps`
    ///
    /// Arms of a split run one after the other against the same budget, so
    /// each starts from what its predecessors already spent.
    pub fn charge_steps(&mut self, steps: usize) {
        self.steps = self.steps.max(steps);
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Continue where `arm` stopped, returning the ops it produced
    pub fn continue_from(&mut self, mut arm: ExecutionState) -> Vec<ResidualOp> {
        let ops = arm.take_ops();
        self.regs = arm.regs;
        self.cursor = arm.cursor;
        self.next_var = self.next_var.max(arm.next_var);
        self.steps = self.steps.max(arm.steps);
        ops
    }

    pub fn freeze(&self) -> FrozenShape {
        FrozenShape {
            cursor: self.cursor,
            regs: self
                .regs
                .iter()
                .map(|repr| match repr {
                    Repr::Fixed(green) => FrozenRepr::Fixed(green.value().clone()),
                    Repr::Variable { tainted, .. } => FrozenRepr::Variable { tainted: *tainted },
                })
                .collect(),
        }
    }

    /// Describe an exit at `location` with the current register file
    pub fn exit_descr(&self, location: Location, kind: ResidualExit) -> ExitDescr {
        ExitDescr {
            location,
            kind,
            regs: self.regs.clone(),
        }
    }

    /// Append an exit at the cursor
    pub fn exit_here(&mut self, kind: ResidualExit) {
        let exit = self.exit_descr(self.location(), kind);
        self.emit(ResidualOp::Exit(Box::new(exit)));
    }

    /// Finish the attempt
    pub fn into_trace(self) -> ResidualTrace {
        ResidualTrace {
            entry: self.entry,
            var_count: self.next_var,
            registers: self.regs.len(),
            ops: self.ops,
        }
    }

    /// Merge two arms that stopped at the same join
    ///
    /// Equal constants stay fixed. Differing unpinned constants, or a constant
    /// and a slot, are generalized into a fresh slot written on both arms.
    /// Arms at different points are an internal error.
    pub fn merge_arms(mut then: ExecutionState, mut else_: ExecutionState) -> Result<ArmMerge> {
        let (then_shape, else_shape) = (then.freeze(), else_.freeze());
        if !then_shape.compatible(&else_shape) || then.func != else_.func {
            return Err(Error::MergeIncompatible(format!(
                "arms stopped at {} and {} with {} and {} registers",
                then.location(),
                else_.location(),
                then.regs.len(),
                else_.regs.len()
            )));
        }

        let mut plan = Vec::with_capacity(then.regs.len());
        let mut conflict = None;
        for (index, (t, e)) in then.regs.iter().zip(&else_.regs).enumerate() {
            match merge_reg(t, e) {
                RegMerge::Conflict(reason) => {
                    conflict = Some((index as Reg, reason));
                    break;
                }
                decision => plan.push(decision),
            }
        }
        if let Some((reg, reason)) = conflict {
            return Ok(ArmMerge::CannotMerge {
                then,
                else_,
                reg,
                reason,
            });
        }

        let mut next_var = then.next_var.max(else_.next_var);
        let mut regs = Vec::with_capacity(plan.len());
        for (index, decision) in plan.into_iter().enumerate() {
            match decision {
                RegMerge::Keep(repr) => regs.push(repr),
                _ => {
                    let var = VarId(next_var);
                    next_var += 1;
                    let tainted = then.regs[index].is_tainted();
                    let then_op = materialize(var, &then.regs[index]);
                    let else_op = materialize(var, &else_.regs[index]);
                    then.emit(then_op);
                    else_.emit(else_op);
                    regs.push(Repr::variable(var, tainted));
                }
            }
        }

        let then_ops = then.take_ops();
        let else_ops = else_.take_ops();
        let state = ExecutionState {
            func: then.func,
            entry: then.entry,
            regs,
            ops: Vec::new(),
            cursor: then.cursor,
            next_var,
            stop_at: then.stop_at,
            steps: then.steps.max(else_.steps),
        };
        Ok(ArmMerge::Merged {
            then_ops,
            else_ops,
            state,
        })
    }
}

fn merge_reg(t: &Repr, e: &Repr) -> RegMerge {
    match (t, e) {
        _ if t == e => RegMerge::Keep(t.clone()),
        (Repr::Fixed(a), Repr::Fixed(b)) if a.value() == b.value() => {
            RegMerge::Keep(if a.is_pinned() { t.clone() } else { e.clone() })
        }
        _ if t.is_pinned() || e.is_pinned() => RegMerge::Conflict(MergeConflict::Pinned),
        _ if t.is_tainted() != e.is_tainted() => RegMerge::Conflict(MergeConflict::Taint),
        _ => RegMerge::Generalize,
    }
}

fn materialize(dst: VarId, repr: &Repr) -> ResidualOp {
    match repr {
        Repr::Fixed(green) => ResidualOp::Const {
            dst,
            value: green.value().clone(),
        },
        Repr::Variable { var, .. } => ResidualOp::Copy { dst, src: *var },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(regs: usize) -> ExecutionState {
        ExecutionState::generic(Location::new(0, 0), &Bindings::new(regs))
    }

    #[test]
    fn test_entry_states() {
        let mut bindings = Bindings::new(3);
        bindings.set(0, Value::Int(4), false);
        bindings.set(1, Value::Int(5), true);

        let s = ExecutionState::at_merge_point(Location::new(0, 2), &[0, 1], &bindings);
        assert_eq!(s.cursor(), 3);
        assert!(s.get(0).is_pinned());
        assert_eq!(s.get(0).constant(), Some(&Value::Int(4)));
        assert_eq!(s.get(1), &Repr::variable(VarId(1), true));
        assert_eq!(s.get(2), &Repr::variable(VarId(2), false));

        let s = ExecutionState::at_promotion(Location::new(0, 5), 2, &bindings);
        assert_eq!(s.location(), Location::new(0, 6));
        assert_eq!(s.get(2).constant(), Some(&Value::Nil));
        assert!(!s.get(0).is_fixed());
    }

    #[test]
    fn test_equal_constants_stay_fixed() {
        let mut parent = state(1);
        parent.set(0, Repr::literal(Value::Int(5)));
        let then = parent.fork(3, Some(3));
        let else_ = parent.fork(3, Some(3));
        assert!(then.freeze().exact_match(&else_.freeze()));

        match ExecutionState::merge_arms(then, else_).unwrap() {
            ArmMerge::Merged {
                then_ops,
                else_ops,
                state,
            } => {
                assert!(then_ops.is_empty() && else_ops.is_empty());
                assert_eq!(state.get(0).constant(), Some(&Value::Int(5)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_differing_constants_generalize() {
        let parent = state(1);
        let mut then = parent.fork(3, Some(3));
        then.set(0, Repr::literal(Value::Int(6)));
        let mut else_ = parent.fork(3, Some(3));
        else_.set(0, Repr::literal(Value::Int(5)));

        match ExecutionState::merge_arms(then, else_).unwrap() {
            ArmMerge::Merged {
                then_ops,
                else_ops,
                state,
            } => {
                assert_eq!(
                    then_ops,
                    vec![ResidualOp::Const {
                        dst: VarId(1),
                        value: Value::Int(6)
                    }]
                );
                assert_eq!(
                    else_ops,
                    vec![ResidualOp::Const {
                        dst: VarId(1),
                        value: Value::Int(5)
                    }]
                );
                assert_eq!(state.get(0), &Repr::variable(VarId(1), false));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pinned_and_taint_conflicts() {
        let mut bindings = Bindings::new(2);
        bindings.set(0, Value::Int(1), false);
        let parent = ExecutionState::at_promotion(Location::new(0, 0), 0, &bindings);
        let then = parent.fork(4, Some(4));
        let mut else_ = parent.fork(4, Some(4));
        else_.set(0, Repr::literal(Value::Int(2)));
        assert!(matches!(
            ExecutionState::merge_arms(then, else_).unwrap(),
            ArmMerge::CannotMerge {
                reg: 0,
                reason: MergeConflict::Pinned,
                ..
            }
        ));

        let parent = state(1);
        let then = parent.fork(4, Some(4));
        let mut else_ = parent.fork(4, Some(4));
        else_.set(0, Repr::variable(VarId(9), true));
        assert!(matches!(
            ExecutionState::merge_arms(then, else_).unwrap(),
            ArmMerge::CannotMerge {
                reason: MergeConflict::Taint,
                ..
            }
        ));
    }

    #[test]
    fn test_arms_at_different_points_are_incompatible() {
        let parent = state(1);
        let then = parent.fork(3, None);
        let else_ = parent.fork(5, None);
        let err = ExecutionState::merge_arms(then, else_).unwrap_err();
        assert!(err.is_fatal());
    }
}
