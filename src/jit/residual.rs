//! Residual operations produced by the specializer
//!
//! A residual trace is what remains of a region once everything computable
//! from fixed values has been folded away. Operations address run-time slots
//! ([`VarId`]) or embed constants directly.

use rustc_hash::FxHashSet as HashSet;
use std::fmt;

use super::classify::{Repr, VarId};
use crate::bytecode::{BinaryOp, FuncId, Location, Reg};
use crate::runtime::Value;

/// An input of a residual operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Const(Value),
    Var(VarId),
}

impl Operand {
    pub fn var(&self) -> Option<VarId> {
        match self {
            Operand::Var(var) => Some(*var),
            Operand::Const(_) => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Const(value) => write!(f, "{}", value),
            Operand::Var(var) => write!(f, "{}", var),
        }
    }
}

/// Why a residual trace hands control back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResidualExit {
    MergePoint,
    Promotion { reg: Reg },
    Fallback,
    Return(Operand),
}

/// An exit: where control goes and how to rebuild the register file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitDescr {
    pub location: Location,
    pub kind: ResidualExit,
    pub regs: Vec<Repr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResidualOp {
    Const {
        dst: VarId,
        value: Value,
    },
    Copy {
        dst: VarId,
        src: VarId,
    },
    Binary {
        op: BinaryOp,
        dst: VarId,
        lhs: Operand,
        rhs: Operand,
    },
    Input {
        dst: VarId,
    },
    Print {
        src: Operand,
    },
    Alloc {
        dst: VarId,
        fields: Vec<Operand>,
    },
    GetField {
        dst: VarId,
        obj: Operand,
        index: usize,
    },
    Call {
        dst: VarId,
        func: FuncId,
        args: Vec<Operand>,
    },
    /// Leave through `exit` unless `cond` has the expected truthiness
    Guard {
        cond: Operand,
        expect: bool,
        exit: Box<ExitDescr>,
    },
    /// Run one of two op lists; an arm without an exit continues after the
    /// branch
    Branch {
        cond: Operand,
        then_ops: Vec<ResidualOp>,
        else_ops: Vec<ResidualOp>,
    },
    Exit(Box<ExitDescr>),
}

impl ResidualOp {
    /// Slot written by this op
    fn defines(&self) -> Option<VarId> {
        match self {
            ResidualOp::Const { dst, .. }
            | ResidualOp::Copy { dst, .. }
            | ResidualOp::Binary { dst, .. }
            | ResidualOp::Input { dst }
            | ResidualOp::Alloc { dst, .. }
            | ResidualOp::GetField { dst, .. }
            | ResidualOp::Call { dst, .. } => Some(*dst),
            _ => None,
        }
    }

    /// Whether the op can be dropped when its result is unused
    fn is_pure_materialization(&self) -> bool {
        matches!(self, ResidualOp::Const { .. } | ResidualOp::Copy { .. })
    }
}

/// Ops of a specialized region, ready for a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidualTrace {
    /// First bytecode location the trace covers
    pub entry: Location,
    pub ops: Vec<ResidualOp>,
    /// Number of slots; slots below `registers` hold the entry bindings
    pub var_count: u32,
    pub registers: usize,
}

impl ResidualTrace {
    /// Whether the trace does nothing but leave
    pub fn is_empty(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, ResidualOp::Exit(_)))
    }

    /// Number of ops, nested arms included
    pub fn op_count(&self) -> usize {
        fn count(ops: &[ResidualOp]) -> usize {
            ops.iter()
                .map(|op| match op {
                    ResidualOp::Branch {
                        then_ops, else_ops, ..
                    } => 1 + count(then_ops) + count(else_ops),
                    _ => 1,
                })
                .sum()
        }
        count(&self.ops)
    }

    /// Drop self copies and constant or copy materializations nothing reads
    pub fn simplify(&mut self) {
        loop {
            let mut used = HashSet::default();
            collect_uses(&self.ops, &mut used);
            let before = self.op_count();
            prune(&mut self.ops, &used);
            if self.op_count() == before {
                break;
            }
        }
    }
}

fn collect_uses(ops: &[ResidualOp], used: &mut HashSet<VarId>) {
    for op in ops {
        match op {
            ResidualOp::Const { .. } | ResidualOp::Input { .. } => {}
            ResidualOp::Copy { dst, src } => {
                if dst != src {
                    used.insert(*src);
                }
            }
            ResidualOp::Binary { lhs, rhs, .. } => {
                use_operand(lhs, used);
                use_operand(rhs, used);
            }
            ResidualOp::Print { src } => use_operand(src, used),
            ResidualOp::Alloc { fields: args, .. } | ResidualOp::Call { args, .. } => {
                args.iter().for_each(|a| use_operand(a, used));
            }
            ResidualOp::GetField { obj, .. } => use_operand(obj, used),
            ResidualOp::Guard { cond, exit, .. } => {
                use_operand(cond, used);
                exit_uses(exit, used);
            }
            ResidualOp::Branch {
                cond,
                then_ops,
                else_ops,
            } => {
                use_operand(cond, used);
                collect_uses(then_ops, used);
                collect_uses(else_ops, used);
            }
            ResidualOp::Exit(exit) => exit_uses(exit, used),
        }
    }
}

fn use_operand(operand: &Operand, used: &mut HashSet<VarId>) {
    if let Some(var) = operand.var() {
        used.insert(var);
    }
}

fn exit_uses(exit: &ExitDescr, used: &mut HashSet<VarId>) {
    if let ResidualExit::Return(Operand::Var(var)) = &exit.kind {
        used.insert(*var);
    }
    for repr in &exit.regs {
        if let Repr::Variable { var, .. } = repr {
            used.insert(*var);
        }
    }
}

fn prune(ops: &mut Vec<ResidualOp>, used: &HashSet<VarId>) {
    ops.retain(|op| match op {
        ResidualOp::Copy { dst, src } if dst == src => false,
        _ if op.is_pure_materialization() => op.defines().is_some_and(|dst| used.contains(&dst)),
        _ => true,
    });
    for op in ops.iter_mut() {
        if let ResidualOp::Branch {
            then_ops, else_ops, ..
        } = op
        {
            prune(then_ops, used);
            prune(else_ops, used);
        }
    }
}

impl fmt::Display for ExitDescr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ResidualExit::MergePoint => write!(f, "exit merge_point {}", self.location)?,
            ResidualExit::Promotion { reg } => {
                write!(f, "exit promote r{} at {}", reg, self.location)?
            }
            ResidualExit::Fallback => write!(f, "exit fallback {}", self.location)?,
            ResidualExit::Return(value) => write!(f, "exit return {}", value)?,
        }
        let regs: Vec<String> = self.regs.iter().map(|r| r.to_string()).collect();
        write!(f, " [{}]", regs.join(", "))
    }
}

fn write_ops(f: &mut fmt::Formatter<'_>, ops: &[ResidualOp], depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    let list = |operands: &[Operand]| {
        operands
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    for op in ops {
        match op {
            ResidualOp::Const { dst, value } => writeln!(f, "{}{} = const {}", pad, dst, value)?,
            ResidualOp::Copy { dst, src } => writeln!(f, "{}{} = {}", pad, dst, src)?,
            ResidualOp::Binary { op, dst, lhs, rhs } => {
                writeln!(f, "{}{} = {} {} {}", pad, dst, lhs, op, rhs)?
            }
            ResidualOp::Input { dst } => writeln!(f, "{}{} = input", pad, dst)?,
            ResidualOp::Print { src } => writeln!(f, "{}print {}", pad, src)?,
            ResidualOp::Alloc { dst, fields } => {
                writeln!(f, "{}{} = alloc ({})", pad, dst, list(fields))?
            }
            ResidualOp::GetField { dst, obj, index } => {
                writeln!(f, "{}{} = {}.{}", pad, dst, obj, index)?
            }
            ResidualOp::Call { dst, func, args } => {
                writeln!(f, "{}{} = call f{}({})", pad, dst, func, list(args))?
            }
            ResidualOp::Guard { cond, expect, exit } => {
                writeln!(f, "{}guard {} is {} else {}", pad, cond, expect, exit)?
            }
            ResidualOp::Branch {
                cond,
                then_ops,
                else_ops,
            } => {
                writeln!(f, "{}if {}:", pad, cond)?;
                write_ops(f, then_ops, depth + 1)?;
                writeln!(f, "{}else:", pad)?;
                write_ops(f, else_ops, depth + 1)?;
            }
            ResidualOp::Exit(exit) => writeln!(f, "{}{}", pad, exit)?,
        }
    }
    Ok(())
}

impl fmt::Display for ResidualTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "trace from {} ({} slots)", self.entry, self.var_count)?;
        write_ops(f, &self.ops, 1)
    }
}
