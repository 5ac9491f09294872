//! Builder for functions with forward-referenced labels

use super::{BinaryOp, FuncId, Function, Instr, Reg, MAX_REGISTERS};
use crate::error::{Error, Result};
use crate::runtime::Value;

/// A jump target that may be bound after it is referenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Which operand of a jump instruction a fixup patches
#[derive(Debug, Clone, Copy)]
enum Patch {
    Target,
    Else,
    Join,
}

/// Incrementally assembles a [`Function`]
#[derive(Debug, Clone)]
pub struct FunctionBuilder {
    name: String,
    params: u8,
    registers: Option<u8>,
    max_reg: Option<Reg>,
    code: Vec<Instr>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label, Patch)>,
}

impl FunctionBuilder {
    /// Create a builder for a function without parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: 0,
            registers: None,
            max_reg: None,
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Set the parameter count; parameters occupy the first registers
    pub fn params(mut self, params: u8) -> Self {
        self.params = params;
        if params > 0 {
            self.touch(params - 1);
        }
        self
    }

    /// Reserve an explicit register count instead of inferring it
    pub fn registers(mut self, registers: u8) -> Self {
        self.registers = Some(registers);
        self
    }

    /// Index of the next instruction
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Create an unbound label
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the next instruction
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    /// Append a raw instruction
    pub fn emit(&mut self, instr: Instr) -> &mut Self {
        for reg in instr.reads().into_iter().chain(instr.writes()) {
            self.touch(reg);
        }
        self.code.push(instr);
        self
    }

    pub fn konst(&mut self, dst: Reg, value: Value) -> &mut Self {
        self.emit(Instr::Const { dst, value })
    }

    pub fn mov(&mut self, dst: Reg, src: Reg) -> &mut Self {
        self.emit(Instr::Move { dst, src })
    }

    pub fn binary(&mut self, op: BinaryOp, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.emit(Instr::Binary { op, dst, lhs, rhs })
    }

    pub fn add(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.binary(BinaryOp::Add, dst, lhs, rhs)
    }

    pub fn sub(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.binary(BinaryOp::Sub, dst, lhs, rhs)
    }

    pub fn mul(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.binary(BinaryOp::Mul, dst, lhs, rhs)
    }

    pub fn lt(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.binary(BinaryOp::Lt, dst, lhs, rhs)
    }

    pub fn eq(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.binary(BinaryOp::Eq, dst, lhs, rhs)
    }

    pub fn input(&mut self, dst: Reg) -> &mut Self {
        self.emit(Instr::Input { dst })
    }

    pub fn print(&mut self, src: Reg) -> &mut Self {
        self.emit(Instr::Print { src })
    }

    pub fn alloc(&mut self, dst: Reg, fields: &[Reg]) -> &mut Self {
        self.emit(Instr::Alloc {
            dst,
            fields: fields.to_vec(),
        })
    }

    pub fn get_field(&mut self, dst: Reg, obj: Reg, index: usize) -> &mut Self {
        self.emit(Instr::GetField { dst, obj, index })
    }

    pub fn call(&mut self, dst: Reg, func: FuncId, args: &[Reg]) -> &mut Self {
        self.emit(Instr::Call {
            dst,
            func,
            args: args.to_vec(),
        })
    }

    pub fn merge_point(&mut self, greens: &[Reg]) -> &mut Self {
        self.emit(Instr::MergePoint {
            greens: greens.to_vec(),
        })
    }

    pub fn promote(&mut self, reg: Reg) -> &mut Self {
        self.emit(Instr::Promote { reg })
    }

    pub fn ret(&mut self, src: Reg) -> &mut Self {
        self.emit(Instr::Return { src })
    }

    /// Jump to a label
    pub fn jump(&mut self, target: Label) -> &mut Self {
        self.fixups.push((self.code.len(), target, Patch::Target));
        self.emit(Instr::Jump { target: usize::MAX })
    }

    /// Branch on `cond`: fall through when truthy, else go to `else_arm`
    pub fn branch(&mut self, cond: Reg, else_arm: Label, join: Option<Label>) -> &mut Self {
        let at = self.code.len();
        self.fixups.push((at, else_arm, Patch::Else));
        if let Some(join) = join {
            self.fixups.push((at, join, Patch::Join));
        }
        self.emit(Instr::Branch {
            cond,
            else_pc: usize::MAX,
            join: join.map(|_| usize::MAX),
        })
    }

    /// Resolve labels and produce the function
    pub fn build(mut self) -> Result<Function> {
        for (at, label, patch) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].ok_or_else(|| {
                Error::program(format!("{}: label {} referenced but never bound", self.name, label.0))
            })?;
            match (&mut self.code[at], patch) {
                (Instr::Jump { target: t }, Patch::Target) => *t = target,
                (Instr::Branch { else_pc, .. }, Patch::Else) => *else_pc = target,
                (Instr::Branch { join: Some(j), .. }, Patch::Join) => *j = target,
                (instr, _) => {
                    return Err(Error::program(format!(
                        "{}: cannot patch label into `{}`",
                        self.name, instr
                    )))
                }
            }
        }

        let inferred = self.max_reg.map(|r| r as usize + 1).unwrap_or(0);
        let registers = match self.registers {
            Some(explicit) if (explicit as usize) < inferred => {
                return Err(Error::program(format!(
                    "{}: {} registers reserved but r{} is used",
                    self.name,
                    explicit,
                    inferred - 1
                )))
            }
            Some(explicit) => explicit as usize,
            None => inferred.max(1),
        };
        if registers > MAX_REGISTERS {
            return Err(Error::program(format!(
                "{}: {} registers exceeds the limit of {}",
                self.name, registers, MAX_REGISTERS
            )));
        }

        Ok(Function {
            name: self.name,
            params: self.params,
            registers: registers as u8,
            code: self.code,
        })
    }

    fn touch(&mut self, reg: Reg) {
        self.max_reg = Some(self.max_reg.map_or(reg, |m| m.max(reg)));
    }
}
