//! Code generation backends and compiled units
//!
//! A [`Backend`] turns a residual trace into executable code. The crate ships
//! [`IrBackend`], which keeps the simplified trace and evaluates it directly;
//! a native backend plugs in through the same traits.

use std::fmt;
use std::sync::Arc;

use super::install::MergePointKey;
use super::residual::{ExitDescr, Operand, ResidualExit, ResidualOp, ResidualTrace};
use crate::bytecode::Location;
use crate::error::{Error, Result};
use crate::runtime::{Bindings, Effects, Exit, ExitKind, Interpreter, Value};

/// Identifier of a compiled unit, unique per code cache
pub type UnitId = u64;

/// What compiled code may use while it runs
pub struct RunContext<'a> {
    /// Executes direct calls made by the unit
    pub interpreter: &'a Interpreter,
    pub effects: &'a mut Effects,
}

/// Executable code for one region
pub trait CompiledCode: Send + Sync + fmt::Debug {
    /// Run from the region's entry with `bindings` until an exit
    fn run(&self, bindings: Bindings, ctx: &mut RunContext<'_>) -> Result<Exit>;

    /// Human-readable form of the code
    fn listing(&self) -> String;
}

pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn emit(&self, trace: ResidualTrace) -> Result<Arc<dyn CompiledCode>>;
}

/// Where a unit is entered from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnitEntry {
    MergePoint(MergePointKey),
    Promotion { site: Location, value: Value },
    GenericPromotion(Location),
}

impl UnitEntry {
    /// The merge point or promotion site the unit belongs to
    pub fn location(&self) -> Location {
        match self {
            UnitEntry::MergePoint(key) => key.location,
            UnitEntry::Promotion { site, .. } | UnitEntry::GenericPromotion(site) => *site,
        }
    }
}

impl fmt::Display for UnitEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitEntry::MergePoint(key) => write!(f, "merge point {}", key),
            UnitEntry::Promotion { site, value } => write!(f, "promotion {} = {}", site, value),
            UnitEntry::GenericPromotion(site) => write!(f, "generic promotion {}", site),
        }
    }
}

/// An installed, immutable region of compiled code
#[derive(Debug)]
pub struct CompiledUnit {
    id: UnitId,
    entry: UnitEntry,
    code: Arc<dyn CompiledCode>,
    op_count: usize,
    entry_taint: u64,
}

impl CompiledUnit {
    pub fn new(
        id: UnitId,
        entry: UnitEntry,
        code: Arc<dyn CompiledCode>,
        op_count: usize,
        entry_taint: u64,
    ) -> Self {
        Self {
            id,
            entry,
            code,
            op_count,
            entry_taint,
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn entry(&self) -> &UnitEntry {
        &self.entry
    }

    pub fn op_count(&self) -> usize {
        self.op_count
    }

    /// Whether the unit was compiled for bindings with this provenance
    pub fn accepts(&self, bindings: &Bindings) -> bool {
        bindings.taint_mask() == self.entry_taint
    }

    pub fn run(&self, bindings: Bindings, ctx: &mut RunContext<'_>) -> Result<Exit> {
        self.code.run(bindings, ctx)
    }

    pub fn listing(&self) -> String {
        self.code.listing()
    }
}

/// Backend that evaluates residual ops directly
#[derive(Debug, Clone)]
pub struct IrBackend {
    simplify: bool,
}

impl IrBackend {
    pub fn new() -> Self {
        Self { simplify: true }
    }

    /// Keep every op the specializer produced
    pub fn without_simplify() -> Self {
        Self { simplify: false }
    }
}

impl Default for IrBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for IrBackend {
    fn name(&self) -> &'static str {
        "ir"
    }

    fn emit(&self, mut trace: ResidualTrace) -> Result<Arc<dyn CompiledCode>> {
        if self.simplify {
            trace.simplify();
        }
        Ok(Arc::new(IrCode { trace }))
    }
}

#[derive(Debug)]
struct IrCode {
    trace: ResidualTrace,
}

impl CompiledCode for IrCode {
    fn run(&self, bindings: Bindings, ctx: &mut RunContext<'_>) -> Result<Exit> {
        let registers = self.trace.registers;
        if bindings.len() != registers {
            return Err(Error::program(format!(
                "unit at {} entered with {} bindings, expected {}",
                self.trace.entry,
                bindings.len(),
                registers
            )));
        }
        let mut slots = vec![Value::Nil; (self.trace.var_count as usize).max(registers)];
        slots[..registers].clone_from_slice(bindings.values());

        execute(&self.trace.ops, &mut slots, ctx)?.ok_or_else(|| {
            Error::program(format!("unit at {} ran past its last op", self.trace.entry))
        })
    }

    fn listing(&self) -> String {
        self.trace.to_string()
    }
}

fn read<'a>(slots: &'a [Value], operand: &'a Operand) -> &'a Value {
    match operand {
        Operand::Const(value) => value,
        Operand::Var(var) => &slots[var.index()],
    }
}

fn execute(ops: &[ResidualOp], slots: &mut [Value], ctx: &mut RunContext<'_>) -> Result<Option<Exit>> {
    for op in ops {
        match op {
            ResidualOp::Const { dst, value } => slots[dst.index()] = value.clone(),
            ResidualOp::Copy { dst, src } => slots[dst.index()] = slots[src.index()].clone(),
            ResidualOp::Binary { op, dst, lhs, rhs } => {
                let value = op.eval(read(slots, lhs), read(slots, rhs))?;
                slots[dst.index()] = value;
            }
            ResidualOp::Input { dst } => slots[dst.index()] = ctx.effects.read(),
            ResidualOp::Print { src } => {
                let value = read(slots, src).clone();
                ctx.effects.write(value);
            }
            ResidualOp::Alloc { dst, fields } => {
                let values = fields.iter().map(|f| read(slots, f).clone()).collect();
                slots[dst.index()] = Value::tuple(values);
            }
            ResidualOp::GetField { dst, obj, index } => {
                let value = read(slots, obj).field(*index)?;
                slots[dst.index()] = value;
            }
            ResidualOp::Call { dst, func, args } => {
                let values = args.iter().map(|a| read(slots, a).clone()).collect();
                let value = ctx.interpreter.call(*func, values, ctx.effects, 1)?;
                slots[dst.index()] = value;
            }
            ResidualOp::Guard { cond, expect, exit } => {
                if read(slots, cond).truthy() != *expect {
                    return Ok(Some(leave(exit, slots)));
                }
            }
            ResidualOp::Branch {
                cond,
                then_ops,
                else_ops,
            } => {
                let arm = if read(slots, cond).truthy() {
                    then_ops
                } else {
                    else_ops
                };
                if let Some(exit) = execute(arm, slots, ctx)? {
                    return Ok(Some(exit));
                }
            }
            ResidualOp::Exit(exit) => return Ok(Some(leave(exit, slots))),
        }
    }
    Ok(None)
}

/// Rebuild the register file described by `exit`
fn leave(exit: &ExitDescr, slots: &[Value]) -> Exit {
    let mut bindings = Bindings::new(exit.regs.len());
    for (index, repr) in exit.regs.iter().enumerate() {
        let value = read(slots, &repr.operand()).clone();
        bindings.set(index as u8, value, repr.is_tainted());
    }
    let kind = match &exit.kind {
        ResidualExit::MergePoint => ExitKind::MergePoint,
        ResidualExit::Promotion { reg } => ExitKind::Promotion { reg: *reg },
        ResidualExit::Fallback => ExitKind::Fallback,
        ResidualExit::Return(operand) => ExitKind::Return(read(slots, operand).clone()),
    };
    Exit::new(exit.location, kind, bindings)
}
