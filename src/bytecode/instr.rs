//! Instruction set for the metajit register machine
//!
//! Instructions address registers of the current frame. Control flow targets
//! are absolute instruction indices within the same function.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{FuncId, Reg};
use crate::error::{Error, Result};
use crate::runtime::{Capabilities, Value};

/// Binary operators on values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Eq,
    Ne,
}

impl BinaryOp {
    /// Evaluate the operator
    ///
    /// Arithmetic wraps on overflow. Comparisons produce `Int(1)` or `Int(0)`.
    pub fn eval(self, lhs: &Value, rhs: &Value) -> Result<Value> {
        let result = match self {
            BinaryOp::Eq => Value::from_bool(lhs == rhs),
            BinaryOp::Ne => Value::from_bool(lhs != rhs),
            BinaryOp::Add => {
                let (a, b) = self.int_operands(lhs, rhs)?;
                Value::Int(a.wrapping_add(b))
            }
            BinaryOp::Sub => {
                let (a, b) = self.int_operands(lhs, rhs)?;
                Value::Int(a.wrapping_sub(b))
            }
            BinaryOp::Mul => {
                let (a, b) = self.int_operands(lhs, rhs)?;
                Value::Int(a.wrapping_mul(b))
            }
            BinaryOp::Div => {
                let (a, b) = self.int_operands(lhs, rhs)?;
                if b == 0 {
                    return Err(Error::division_by_zero());
                }
                Value::Int(a.wrapping_div(b))
            }
            BinaryOp::Rem => {
                let (a, b) = self.int_operands(lhs, rhs)?;
                if b == 0 {
                    return Err(Error::division_by_zero());
                }
                Value::Int(a.wrapping_rem(b))
            }
            BinaryOp::Lt => {
                let (a, b) = self.int_operands(lhs, rhs)?;
                Value::from_bool(a < b)
            }
            BinaryOp::Le => {
                let (a, b) = self.int_operands(lhs, rhs)?;
                Value::from_bool(a <= b)
            }
        };
        Ok(result)
    }

    fn int_operands(self, lhs: &Value, rhs: &Value) -> Result<(i64, i64)> {
        match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok((*a, *b)),
            _ => Err(Error::type_error(format!(
                "unsupported operand types for {}: {} and {}",
                self,
                lhs.type_name(),
                rhs.type_name()
            ))),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
        };
        write!(f, "{}", symbol)
    }
}

/// A single instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instr {
    /// Load a literal into a register
    Const { dst: Reg, value: Value },
    /// Copy one register into another
    Move { dst: Reg, src: Reg },
    /// Apply a binary operator
    Binary {
        #[serde(rename = "operator")]
        op: BinaryOp,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    /// Read the next input value (side-effecting)
    Input { dst: Reg },
    /// Write a value to the output log (side-effecting)
    Print { src: Reg },
    /// Allocate an immutable tuple from registers
    Alloc { dst: Reg, fields: Vec<Reg> },
    /// Read a tuple field
    GetField { dst: Reg, obj: Reg, index: usize },
    /// Call another function directly
    Call {
        dst: Reg,
        func: FuncId,
        args: Vec<Reg>,
    },
    /// Unconditional jump
    Jump { target: usize },
    /// Fall through when `cond` is truthy, otherwise jump to `else_pc`.
    /// `join` names the point where both arms meet again, if they do.
    Branch {
        cond: Reg,
        else_pc: usize,
        #[serde(default)]
        join: Option<usize>,
    },
    /// Designated merge point; `greens` are the registers forming its key
    MergePoint {
        #[serde(default)]
        greens: Vec<Reg>,
    },
    /// Promotion site for `reg`
    Promote { reg: Reg },
    /// Return from the current function
    Return { src: Reg },
}

impl Instr {
    /// Capability an executor needs for this instruction
    pub fn required_capability(&self) -> Capabilities {
        match self {
            Instr::Input { .. } | Instr::Print { .. } => Capabilities::IO,
            Instr::Alloc { .. } | Instr::GetField { .. } => Capabilities::ALLOC,
            Instr::Call { .. } => Capabilities::CALL,
            Instr::Promote { .. } => Capabilities::PROMOTE,
            _ => Capabilities::empty(),
        }
    }

    /// Register written by this instruction, if any
    pub fn writes(&self) -> Option<Reg> {
        match self {
            Instr::Const { dst, .. }
            | Instr::Move { dst, .. }
            | Instr::Binary { dst, .. }
            | Instr::Input { dst }
            | Instr::Alloc { dst, .. }
            | Instr::GetField { dst, .. }
            | Instr::Call { dst, .. } => Some(*dst),
            _ => None,
        }
    }

    /// Registers read by this instruction
    pub fn reads(&self) -> Vec<Reg> {
        match self {
            Instr::Const { .. } | Instr::Input { .. } | Instr::Jump { .. } => Vec::new(),
            Instr::Move { src, .. } | Instr::Print { src } | Instr::Return { src } => vec![*src],
            Instr::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Instr::Alloc { fields, .. } => fields.clone(),
            Instr::GetField { obj, .. } => vec![*obj],
            Instr::Call { args, .. } => args.clone(),
            Instr::Branch { cond, .. } => vec![*cond],
            Instr::MergePoint { greens } => greens.clone(),
            Instr::Promote { reg } => vec![*reg],
        }
    }

    /// Control-flow successors of the instruction at `pc`
    pub fn successors(&self, pc: usize) -> Vec<usize> {
        match self {
            Instr::Jump { target } => vec![*target],
            Instr::Branch { else_pc, .. } => vec![pc + 1, *else_pc],
            Instr::Return { .. } => Vec::new(),
            _ => vec![pc + 1],
        }
    }

    /// Whether control can continue to `pc + 1`
    pub fn falls_through(&self) -> bool {
        !matches!(self, Instr::Jump { .. } | Instr::Return { .. })
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Const { dst, value } => write!(f, "r{} = const {}", dst, value),
            Instr::Move { dst, src } => write!(f, "r{} = r{}", dst, src),
            Instr::Binary { op, dst, lhs, rhs } => write!(f, "r{} = r{} {} r{}", dst, lhs, op, rhs),
            Instr::Input { dst } => write!(f, "r{} = input", dst),
            Instr::Print { src } => write!(f, "print r{}", src),
            Instr::Alloc { dst, fields } => {
                let fields: Vec<String> = fields.iter().map(|r| format!("r{}", r)).collect();
                write!(f, "r{} = alloc ({})", dst, fields.join(", "))
            }
            Instr::GetField { dst, obj, index } => write!(f, "r{} = r{}.{}", dst, obj, index),
            Instr::Call { dst, func, args } => {
                let args: Vec<String> = args.iter().map(|r| format!("r{}", r)).collect();
                write!(f, "r{} = call f{}({})", dst, func, args.join(", "))
            }
            Instr::Jump { target } => write!(f, "jump {}", target),
            Instr::Branch {
                cond,
                else_pc,
                join,
            } => match join {
                Some(join) => write!(f, "branch r{} else {} join {}", cond, else_pc, join),
                None => write!(f, "branch r{} else {}", cond, else_pc),
            },
            Instr::MergePoint { greens } => {
                let greens: Vec<String> = greens.iter().map(|r| format!("r{}", r)).collect();
                write!(f, "merge_point [{}]", greens.join(", "))
            }
            Instr::Promote { reg } => write!(f, "promote r{}", reg),
            Instr::Return { src } => write!(f, "return r{}", src),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_wraps() {
        let result = BinaryOp::Add.eval(&Value::Int(i64::MAX), &Value::Int(1)).unwrap();
        assert_eq!(result, Value::Int(i64::MIN));
        let result = BinaryOp::Div.eval(&Value::Int(i64::MIN), &Value::Int(-1)).unwrap();
        assert_eq!(result, Value::Int(i64::MIN));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(BinaryOp::Div.eval(&Value::Int(1), &Value::Int(0)).is_err());
        assert!(BinaryOp::Rem.eval(&Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    fn test_equality_on_tuples() {
        let a = Value::tuple(vec![Value::Int(1), Value::Nil]);
        let b = Value::tuple(vec![Value::Int(1), Value::Nil]);
        assert_eq!(BinaryOp::Eq.eval(&a, &b).unwrap(), Value::Int(1));
        assert_eq!(BinaryOp::Ne.eval(&a, &Value::Nil).unwrap(), Value::Int(1));
        assert!(BinaryOp::Lt.eval(&a, &b).is_err());
    }

    #[test]
    fn test_instr_json_shape() {
        let instr: Instr =
            serde_json::from_str(r#"{"op":"branch","cond":1,"else_pc":7}"#).unwrap();
        assert_eq!(
            instr,
            Instr::Branch {
                cond: 1,
                else_pc: 7,
                join: None
            }
        );
        let instr: Instr =
            serde_json::from_str(r#"{"op":"binary","operator":"rem","dst":2,"lhs":0,"rhs":1}"#).unwrap();
        assert_eq!(
            instr,
            Instr::Binary {
                op: BinaryOp::Rem,
                dst: 2,
                lhs: 0,
                rhs: 1
            }
        );
        let instr: Instr = serde_json::from_str(r#"{"op":"const","dst":0,"value":[1,null]}"#).unwrap();
        assert_eq!(
            instr,
            Instr::Const {
                dst: 0,
                value: Value::tuple(vec![Value::Int(1), Value::Nil])
            }
        );
    }

    #[test]
    fn test_capabilities() {
        assert_eq!(Instr::Input { dst: 0 }.required_capability(), Capabilities::IO);
        assert_eq!(Instr::Promote { reg: 0 }.required_capability(), Capabilities::PROMOTE);
        assert!(Instr::Jump { target: 0 }.required_capability().is_empty());
    }
}
