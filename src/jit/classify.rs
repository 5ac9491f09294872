//! Variable classification
//!
//! Every register the specializer tracks is either *fixed* (its value is known
//! while specializing and is folded into the residual code) or *variable* (it
//! lives in a run-time slot). Fixed values can only be created here, which
//! makes it impossible to fix a value derived from I/O.

use std::fmt;

use super::residual::Operand;
use crate::runtime::Value;

/// Where a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// A constant in the bytecode
    Literal,
    /// Computed from fixed operands while specializing
    Folded,
    /// A green variable of the entry merge point
    GreenEntry,
    /// Any other register live at entry
    RedEntry,
    /// Fixed by a successful promotion
    Promoted,
    /// Read from the outside world, or derived from such a read
    Io,
    /// Returned by a residual call
    Call,
    /// The join of two arms holding different values
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Fixed,
    Variable,
}

/// Classify a value by its provenance
pub fn classify(provenance: Provenance) -> Classification {
    match provenance {
        Provenance::Literal | Provenance::Folded | Provenance::GreenEntry | Provenance::Promoted => {
            Classification::Fixed
        }
        Provenance::RedEntry | Provenance::Io | Provenance::Call | Provenance::Merge => {
            Classification::Variable
        }
    }
}

/// A value known at specialization time
///
/// A pinned green came from the unit's identity (a green entry variable or a
/// promoted value) and is never generalized into a variable when arms merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Green {
    value: Value,
    pinned: bool,
}

impl Green {
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

/// Fix `value` if its provenance allows it
pub fn fix(value: Value, provenance: Provenance) -> Option<Green> {
    match classify(provenance) {
        Classification::Fixed => Some(Green {
            value,
            pinned: matches!(provenance, Provenance::GreenEntry | Provenance::Promoted),
        }),
        Classification::Variable => None,
    }
}

/// A run-time slot of a compiled unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// How a register is represented while specializing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repr {
    Fixed(Green),
    /// `tainted` records whether the slot's value derives from I/O
    Variable { var: VarId, tainted: bool },
}

impl Repr {
    /// A bytecode literal or a value computed from fixed operands
    pub fn literal(value: Value) -> Self {
        Repr::Fixed(Green {
            value,
            pinned: false,
        })
    }

    pub fn variable(var: VarId, tainted: bool) -> Self {
        Repr::Variable { var, tainted }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, Repr::Fixed(_))
    }

    /// The constant, if fixed
    pub fn constant(&self) -> Option<&Value> {
        match self {
            Repr::Fixed(green) => Some(green.value()),
            Repr::Variable { .. } => None,
        }
    }

    pub fn is_tainted(&self) -> bool {
        matches!(self, Repr::Variable { tainted: true, .. })
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self, Repr::Fixed(green) if green.is_pinned())
    }

    /// The operand residual code uses to read this register
    pub fn operand(&self) -> Operand {
        match self {
            Repr::Fixed(green) => Operand::Const(green.value().clone()),
            Repr::Variable { var, .. } => Operand::Var(*var),
        }
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repr::Fixed(green) if green.is_pinned() => write!(f, "={}!", green.value()),
            Repr::Fixed(green) => write!(f, "={}", green.value()),
            Repr::Variable { var, tainted: true } => write!(f, "{}~", var),
            Repr::Variable { var, .. } => write!(f, "{}", var),
        }
    }
}
