//! Bytecode representation and instruction set
//!
//! This module defines the register bytecode executed by the interpreter and
//! specialized by the JIT. A [`Program`] is validated and analyzed once when it
//! is built; afterwards it is immutable and can be shared between threads.

mod analysis;
mod builder;
mod instr;

pub use analysis::SplitKind;
pub use builder::{FunctionBuilder, Label};
pub use instr::{BinaryOp, Instr};

use analysis::ProgramFacts;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

/// Register index within a frame
pub type Reg = u8;

/// Function index within a program
pub type FuncId = u32;

/// Maximum registers per function (provenance is tracked in a 64-bit mask)
pub const MAX_REGISTERS: usize = 64;

/// A program point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub func: FuncId,
    pub pc: usize,
}

impl Location {
    pub fn new(func: FuncId, pc: usize) -> Self {
        Self { func, pc }
    }

    /// The instruction after this one
    pub fn next(self) -> Self {
        Self {
            func: self.func,
            pc: self.pc + 1,
        }
    }

    /// Another instruction in the same function
    pub fn at(self, pc: usize) -> Self {
        Self { func: self.func, pc }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}:{}", self.func, self.pc)
    }
}

/// A function body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub params: u8,
    pub registers: u8,
    pub code: Vec<Instr>,
}

/// Serialized form of a program
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProgramSource {
    functions: Vec<Function>,
    #[serde(default)]
    entry: FuncId,
}

/// A validated, analyzed program
#[derive(Debug, Clone)]
pub struct Program {
    functions: Vec<Function>,
    entry: FuncId,
    facts: ProgramFacts,
}

impl Program {
    /// Validate `functions` and compute the static facts the engine needs
    pub fn new(functions: Vec<Function>, entry: FuncId) -> Result<Self> {
        validate(&functions, entry)?;
        let facts = analysis::analyze(&functions);
        Ok(Self {
            functions,
            entry,
            facts,
        })
    }

    /// Build a single-function program
    pub fn single(function: Function) -> Result<Self> {
        Self::new(vec![function], 0)
    }

    /// Parse a program from its JSON form
    pub fn from_json_str(source: &str) -> Result<Self> {
        let source: ProgramSource = serde_json::from_str(source)?;
        Self::new(source.functions, source.entry)
    }

    /// Load a program from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Serialize the program to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        let source = ProgramSource {
            functions: self.functions.clone(),
            entry: self.entry,
        };
        Ok(serde_json::to_string_pretty(&source)?)
    }

    pub fn entry(&self) -> FuncId {
        self.entry
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn function(&self, func: FuncId) -> Option<&Function> {
        self.functions.get(func as usize)
    }

    /// Instruction at a location
    pub fn instr_at(&self, location: Location) -> Option<&Instr> {
        self.function(location.func)?.code.get(location.pc)
    }

    /// Green registers of the merge point at `location` (empty if it is not one)
    pub fn merge_point_greens(&self, location: Location) -> &[Reg] {
        match self.instr_at(location) {
            Some(Instr::MergePoint { greens }) => greens,
            _ => &[],
        }
    }

    /// Whether the merge point at `location` is targeted by a back-edge
    pub fn is_loop_header(&self, location: Location) -> bool {
        self.facts.loop_headers.contains(&location)
    }

    /// Whether calling `func` can perform I/O
    pub fn has_effects(&self, func: FuncId) -> bool {
        self.facts.effectful.get(func as usize).copied().unwrap_or(false)
    }

    /// Whether arriving at `location` hands control to the dispatcher
    ///
    /// With `loop_headers_only` set, merge points that no back-edge targets
    /// are executed as no-ops.
    pub fn is_dispatch_point(&self, location: Location, loop_headers_only: bool) -> bool {
        matches!(self.instr_at(location), Some(Instr::MergePoint { .. }))
            && (!loop_headers_only || self.is_loop_header(location))
    }

    /// Classification of the split at `location`
    pub fn split_kind(&self, location: Location) -> SplitKind {
        if self.facts.complicated_splits.contains(&location) {
            SplitKind::Complicated
        } else {
            SplitKind::Simple
        }
    }

    /// Disassemble the whole program for debugging
    pub fn disassemble(&self) -> String {
        let mut output = String::new();
        for (index, function) in self.functions.iter().enumerate() {
            output.push_str(&format!(
                "== f{} {} (params: {}, registers: {}) ==\n",
                index, function.name, function.params, function.registers
            ));
            for (pc, instr) in function.code.iter().enumerate() {
                let location = Location::new(index as FuncId, pc);
                let marker = if self.is_loop_header(location) { "*" } else { " " };
                output.push_str(&format!("{}{:04} {}\n", marker, pc, instr));
            }
        }
        output
    }
}

fn validate(functions: &[Function], entry: FuncId) -> Result<()> {
    if functions.get(entry as usize).is_none() {
        return Err(Error::program(format!("entry function f{} does not exist", entry)));
    }

    for (index, function) in functions.iter().enumerate() {
        let name = &function.name;
        let registers = function.registers as usize;
        let len = function.code.len();

        if registers > MAX_REGISTERS {
            return Err(Error::program(format!(
                "{}: {} registers exceeds the limit of {}",
                name, registers, MAX_REGISTERS
            )));
        }
        if function.params as usize > registers {
            return Err(Error::program(format!(
                "{}: {} parameters but only {} registers",
                name, function.params, registers
            )));
        }
        match function.code.last() {
            None => return Err(Error::program(format!("{}: empty function body", name))),
            Some(last) if last.falls_through() => {
                return Err(Error::program(format!(
                    "{}: control falls off the end after `{}`",
                    name, last
                )))
            }
            Some(_) => {}
        }

        for (pc, instr) in function.code.iter().enumerate() {
            let at = Location::new(index as FuncId, pc);
            for reg in instr.reads().into_iter().chain(instr.writes()) {
                if reg as usize >= registers {
                    return Err(Error::program(format!(
                        "{}: r{} out of range in `{}` at {}",
                        name, reg, instr, at
                    )));
                }
            }
            for target in instr.successors(pc) {
                if target >= len {
                    return Err(Error::program(format!(
                        "{}: jump target {} out of range at {}",
                        name, target, at
                    )));
                }
            }
            match instr {
                Instr::Branch { join: Some(join), .. } if *join >= len => {
                    return Err(Error::program(format!(
                        "{}: join {} out of range at {}",
                        name, join, at
                    )));
                }
                Instr::Call { func, args, .. } => {
                    let callee = functions.get(*func as usize).ok_or_else(|| {
                        Error::program(format!("{}: call to unknown f{} at {}", name, func, at))
                    })?;
                    if callee.params as usize != args.len() {
                        return Err(Error::program(format!(
                            "{}: f{} expects {} arguments, got {} at {}",
                            name,
                            func,
                            callee.params,
                            args.len(),
                            at
                        )));
                    }
                }
                _ => {}
            }
        }
    }

    Ok(())
}
