//! The base interpreter
//!
//! This module implements the plain bytecode interpreter. It doubles as the
//! engine of the fallback interpreter (with a possibly reduced capability set)
//! and as the callee executor for direct calls made by compiled units.

use bitflags::bitflags;
use std::sync::Arc;

use super::{Bindings, Effects, Value};
use crate::bytecode::{FuncId, Function, Instr, Location, Program, Reg};
use crate::error::{Error, Result};

/// Default limit on nested calls
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

bitflags! {
    /// What an executor is able to execute
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// Direct calls to other functions
        const CALL = 1 << 0;
        /// Input and output
        const IO = 1 << 1;
        /// Tuple allocation and field reads
        const ALLOC = 1 << 2;
        /// Promotion sites
        const PROMOTE = 1 << 3;
    }
}

impl Capabilities {
    /// Names of the set flags, e.g. `IO | CALL`
    pub fn describe(&self) -> String {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        if names.is_empty() {
            "none".to_string()
        } else {
            names.join(" | ")
        }
    }
}

/// Receives the sites the interpreter passes in the top frame
pub trait Observer {
    /// A promotion site saw `value`. Values derived from I/O are not reported.
    fn promotion(&mut self, site: Location, value: &Value);

    /// A split took the `taken` arm (`true` is the fall-through arm)
    fn split(&mut self, site: Location, taken: bool);
}

/// An observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn promotion(&mut self, _site: Location, _value: &Value) {}
    fn split(&mut self, _site: Location, _taken: bool) {}
}

/// Why an executor handed control back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// Arrived at a dispatch merge point; `location` is the merge point
    MergePoint,
    /// A compiled unit reached a promotion site whose value it cannot fix;
    /// `location` is the site
    Promotion { reg: Reg },
    /// A compiled unit needs the fallback interpreter to resume at `location`
    Fallback,
    /// The top frame returned
    Return(Value),
}

/// Where and how execution stopped, with the bindings at that point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exit {
    pub location: Location,
    pub kind: ExitKind,
    pub bindings: Bindings,
}

impl Exit {
    pub fn new(location: Location, kind: ExitKind, bindings: Bindings) -> Self {
        Self {
            location,
            kind,
            bindings,
        }
    }

    /// Returned value if the program finished
    pub fn returned(&self) -> Option<&Value> {
        match &self.kind {
            ExitKind::Return(value) => Some(value),
            _ => None,
        }
    }
}

/// Control flow after one instruction
enum Flow {
    Next,
    Goto(usize),
    Return(Value),
}

/// The base bytecode interpreter
#[derive(Debug, Clone)]
pub struct Interpreter {
    program: Arc<Program>,
    capabilities: Capabilities,
    max_call_depth: usize,
    loop_headers_only: bool,
}

impl Interpreter {
    /// Create an interpreter with every capability
    pub fn new(program: Arc<Program>) -> Self {
        Self {
            program,
            capabilities: Capabilities::all(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            loop_headers_only: false,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Only stop at merge points targeted by a back-edge
    pub fn with_loop_headers_only(mut self, enabled: bool) -> Self {
        self.loop_headers_only = enabled;
        self
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Whether arriving at `location` stops a resumed segment
    pub fn is_dispatch_point(&self, location: Location) -> bool {
        self.program
            .is_dispatch_point(location, self.loop_headers_only)
    }

    /// Bindings for a fresh frame of the program's entry function
    pub fn entry_bindings(&self) -> Result<Bindings> {
        let function = self.function(self.program.entry())?;
        Ok(Bindings::new(function.registers as usize))
    }

    /// Run the top frame from `location` until it reaches a dispatch merge
    /// point (the start location included) or returns
    ///
    /// Nested calls run to completion. Promotion sites and splits of the top
    /// frame are reported to `observer`.
    pub fn resume(
        &self,
        location: Location,
        mut bindings: Bindings,
        effects: &mut Effects,
        observer: &mut dyn Observer,
    ) -> Result<Exit> {
        let function = self.function(location.func)?;
        if bindings.len() != function.registers as usize {
            return Err(Error::program(format!(
                "resume at {} with {} bindings, {} expects {}",
                location,
                bindings.len(),
                function.name,
                function.registers
            )));
        }

        let mut pc = location.pc;
        loop {
            let at = location.at(pc);
            let instr = fetch(function, at)?;
            if self.is_dispatch_point(at) {
                return Ok(Exit::new(at, ExitKind::MergePoint, bindings));
            }
            match self.step(at, instr, &mut bindings, effects, observer, 0)? {
                Flow::Next => pc += 1,
                Flow::Goto(target) => pc = target,
                Flow::Return(value) => {
                    return Ok(Exit::new(at, ExitKind::Return(value), bindings));
                }
            }
        }
    }

    /// Call `func` with `args` and run it to completion
    ///
    /// `depth` is the depth of the new frame; the top frame is depth 0.
    pub fn call(
        &self,
        func: FuncId,
        args: Vec<Value>,
        effects: &mut Effects,
        depth: usize,
    ) -> Result<Value> {
        if depth > self.max_call_depth {
            return Err(Error::stack_overflow(self.max_call_depth));
        }
        let function = self.function(func)?;
        let mut frame = Bindings::new(function.registers as usize);
        for (reg, value) in args.into_iter().enumerate() {
            frame.set(reg as Reg, value, false);
        }

        // Sites inside callees are never specialized, so they are not reported.
        let mut observer = NoopObserver;
        let mut pc = 0;
        loop {
            let at = Location::new(func, pc);
            let instr = fetch(function, at)?;
            match self.step(at, instr, &mut frame, effects, &mut observer, depth)? {
                Flow::Next => pc += 1,
                Flow::Goto(target) => pc = target,
                Flow::Return(value) => return Ok(value),
            }
        }
    }

    fn function(&self, func: FuncId) -> Result<&Function> {
        self.program
            .function(func)
            .ok_or_else(|| Error::program(format!("unknown function f{}", func)))
    }

    fn step(
        &self,
        at: Location,
        instr: &Instr,
        regs: &mut Bindings,
        effects: &mut Effects,
        observer: &mut dyn Observer,
        depth: usize,
    ) -> Result<Flow> {
        let needed = instr.required_capability();
        if !self.capabilities.contains(needed) {
            return Err(Error::FallbackGap {
                location: at,
                message: format!("missing capability {}", needed.describe()),
            });
        }

        match instr {
            Instr::Const { dst, value } => regs.set(*dst, value.clone(), false),
            Instr::Move { dst, src } => {
                let tainted = regs.is_tainted(*src);
                regs.set(*dst, regs.get(*src).clone(), tainted);
            }
            Instr::Binary { op, dst, lhs, rhs } => {
                let value = op.eval(regs.get(*lhs), regs.get(*rhs))?;
                let tainted = regs.is_tainted(*lhs) || regs.is_tainted(*rhs);
                regs.set(*dst, value, tainted);
            }
            Instr::Input { dst } => {
                let value = effects.read();
                regs.set(*dst, value, true);
            }
            Instr::Print { src } => effects.write(regs.get(*src).clone()),
            Instr::Alloc { dst, fields } => {
                let values = fields.iter().map(|r| regs.get(*r).clone()).collect();
                let tainted = fields.iter().any(|r| regs.is_tainted(*r));
                regs.set(*dst, Value::tuple(values), tainted);
            }
            Instr::GetField { dst, obj, index } => {
                let value = regs.get(*obj).field(*index)?;
                let tainted = regs.is_tainted(*obj);
                regs.set(*dst, value, tainted);
            }
            Instr::Call { dst, func, args } => {
                let values = args.iter().map(|r| regs.get(*r).clone()).collect();
                let tainted =
                    self.program.has_effects(*func) || args.iter().any(|r| regs.is_tainted(*r));
                let value = self.call(*func, values, effects, depth + 1)?;
                regs.set(*dst, value, tainted);
            }
            Instr::Jump { target } => return Ok(Flow::Goto(*target)),
            Instr::Branch { cond, else_pc, .. } => {
                let taken = regs.get(*cond).truthy();
                observer.split(at, taken);
                if !taken {
                    return Ok(Flow::Goto(*else_pc));
                }
            }
            Instr::MergePoint { .. } => {}
            Instr::Promote { reg } => {
                if !regs.is_tainted(*reg) {
                    observer.promotion(at, regs.get(*reg));
                }
            }
            Instr::Return { src } => return Ok(Flow::Return(regs.get(*src).clone())),
        }

        Ok(Flow::Next)
    }
}

fn fetch(function: &Function, at: Location) -> Result<&Instr> {
    function
        .code
        .get(at.pc)
        .ok_or_else(|| Error::program(format!("no instruction at {}", at)))
}
