//! Static facts about a program used by the dispatcher and the specializer
//!
//! All facts are computed once when a [`Program`](super::Program) is built so
//! that the hot paths only perform set lookups.

use rustc_hash::FxHashSet as HashSet;

use super::{Function, Instr, Location};

/// Shape of a split, decided from the code between the branch and its join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitKind {
    /// Neither arm allocates; both arms can be specialized and merged
    Simple,
    /// At least one arm allocates; specialization must suspend
    Complicated,
}

/// Precomputed program facts
#[derive(Debug, Clone, Default)]
pub(crate) struct ProgramFacts {
    /// Merge points targeted by a backward jump
    pub loop_headers: HashSet<Location>,
    /// Functions that perform I/O, directly or through callees
    pub effectful: Vec<bool>,
    /// Branches with an allocation reachable from an arm before the join
    pub complicated_splits: HashSet<Location>,
}

pub(crate) fn analyze(functions: &[Function]) -> ProgramFacts {
    let mut facts = ProgramFacts {
        effectful: effectful_functions(functions),
        ..ProgramFacts::default()
    };

    for (func, function) in functions.iter().enumerate() {
        let func = func as u32;
        for (pc, instr) in function.code.iter().enumerate() {
            match instr {
                Instr::Jump { target } if *target <= pc => {
                    if matches!(function.code.get(*target), Some(Instr::MergePoint { .. })) {
                        facts.loop_headers.insert(Location::new(func, *target));
                    }
                }
                Instr::Branch { else_pc, join, .. } => {
                    if *else_pc <= pc
                        && matches!(function.code.get(*else_pc), Some(Instr::MergePoint { .. }))
                    {
                        facts.loop_headers.insert(Location::new(func, *else_pc));
                    }
                    if arms_allocate(function, pc, *else_pc, *join) {
                        facts.complicated_splits.insert(Location::new(func, pc));
                    }
                }
                _ => {}
            }
        }
    }

    facts
}

/// Fixpoint over the call graph: a function is effectful if it reads or
/// writes I/O or calls an effectful function.
fn effectful_functions(functions: &[Function]) -> Vec<bool> {
    let mut effectful: Vec<bool> = functions
        .iter()
        .map(|f| {
            f.code
                .iter()
                .any(|i| matches!(i, Instr::Input { .. } | Instr::Print { .. }))
        })
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for (index, function) in functions.iter().enumerate() {
            if effectful[index] {
                continue;
            }
            let calls_effectful = function.code.iter().any(|i| match i {
                Instr::Call { func, .. } => effectful.get(*func as usize).copied().unwrap_or(false),
                _ => false,
            });
            if calls_effectful {
                effectful[index] = true;
                changed = true;
            }
        }
    }

    effectful
}

/// Walk both arms of the branch at `pc` until the join, a merge point or a
/// return, looking for an allocation.
fn arms_allocate(function: &Function, pc: usize, else_pc: usize, join: Option<usize>) -> bool {
    let mut visited = HashSet::default();
    let mut worklist = vec![pc + 1, else_pc];

    while let Some(at) = worklist.pop() {
        if Some(at) == join || !visited.insert(at) {
            continue;
        }
        let Some(instr) = function.code.get(at) else {
            continue;
        };
        match instr {
            Instr::Alloc { .. } => return true,
            Instr::MergePoint { .. } | Instr::Return { .. } => continue,
            _ => worklist.extend(instr.successors(at)),
        }
    }

    false
}
