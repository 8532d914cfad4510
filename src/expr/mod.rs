//! Hash-consed bit-vector expressions over symbolic byte arrays.
//!
//! Every node lives in a process-wide pool and is referred to by a `Copy` handle, so two
//! structurally identical expressions always compare equal by handle. Width 1 doubles as the
//! boolean sort.

mod assignment;
mod build;
mod constraints;
mod pool;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub use assignment::{bytes_to_u64, u64_to_bytes, Assignment};
pub use build::mask;
pub use constraints::ConstraintSet;

/// Widest bit-vector the pool represents.
pub const MAX_WIDTH: u32 = 128;
/// Width of pointers, sizes and offsets.
pub const POINTER_WIDTH: u32 = 64;

/// Handle to an interned expression node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Expr(u32);

/// Handle to an interned array declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArrayId(u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArraySource {
    /// Program input made symbolic by the analysis.
    Symbolic,
    /// Backing array of a symbolic allocation size.
    SymbolicSize,
    /// Backing array of a symbolic base address.
    SymbolicAddress,
    /// Fully known contents.
    Constant(Vec<u8>),
}

impl ArraySource {
    pub fn is_symbolic(&self) -> bool {
        !matches!(self, ArraySource::Constant(_))
    }
}

#[derive(Clone, Debug)]
pub struct Array {
    pub name: String,
    pub size: u64,
    pub source: ArraySource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ult,
    Ule,
    Slt,
    Sle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExprKind {
    Constant(u128),
    /// One byte of `array` at `index` (a pointer-width expression).
    Read {
        array: ArrayId,
        index: Expr,
    },
    Select {
        cond: Expr,
        then: Expr,
        otherwise: Expr,
    },
    Concat {
        high: Expr,
        low: Expr,
    },
    Extract {
        expr: Expr,
        offset: u32,
    },
    ZExt(Expr),
    SExt(Expr),
    Not(Expr),
    Binary {
        op: BinOp,
        lhs: Expr,
        rhs: Expr,
    },
    Compare {
        op: CmpOp,
        lhs: Expr,
        rhs: Expr,
    },
}

impl ExprKind {
    pub fn children(&self) -> Vec<Expr> {
        match *self {
            ExprKind::Constant(_) => Vec::new(),
            ExprKind::Read { index, .. } => vec![index],
            ExprKind::Select {
                cond,
                then,
                otherwise,
            } => vec![cond, then, otherwise],
            ExprKind::Concat { high, low } => vec![high, low],
            ExprKind::Extract { expr, .. }
            | ExprKind::ZExt(expr)
            | ExprKind::SExt(expr)
            | ExprKind::Not(expr) => vec![expr],
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::Compare { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
        }
    }
}

impl Expr {
    pub fn kind(self) -> ExprKind {
        pool::node(self).kind
    }

    pub fn width(self) -> u32 {
        pool::node(self).width
    }

    pub fn as_constant(self) -> Option<u128> {
        match self.kind() {
            ExprKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_constant(self) -> bool {
        self.as_constant().is_some()
    }

    pub fn is_true(self) -> bool {
        self.width() == 1 && self.as_constant() == Some(1)
    }

    pub fn is_false(self) -> bool {
        self.width() == 1 && self.as_constant() == Some(0)
    }

    /// Every array read anywhere below this node.
    pub fn arrays(self) -> BTreeSet<ArrayId> {
        let mut found = BTreeSet::new();
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![self];
        while let Some(e) = stack.pop() {
            if !seen.insert(e) {
                continue;
            }
            let kind = e.kind();
            if let ExprKind::Read { array, .. } = kind {
                found.insert(array);
            }
            stack.extend(kind.children());
        }
        found
    }

    /// Rebuilds the expression bottom-up, letting `on_read` replace array reads.
    ///
    /// Rebuilt nodes go through the folding constructors, so substituting constants collapses
    /// whatever becomes concrete.
    pub fn map_reads<F>(self, mut on_read: F) -> Expr
    where
        F: FnMut(ArrayId, Expr) -> Option<Expr>,
    {
        let mut done: std::collections::HashMap<Expr, Expr> = std::collections::HashMap::new();
        let mut stack = vec![(self, false)];
        while let Some((e, expanded)) = stack.pop() {
            if done.contains_key(&e) {
                continue;
            }
            let kind = e.kind();
            if !expanded {
                stack.push((e, true));
                for child in kind.children() {
                    if !done.contains_key(&child) {
                        stack.push((child, false));
                    }
                }
                continue;
            }
            let get = |x: Expr| done.get(&x).copied().unwrap_or(x);
            let rebuilt = match kind {
                ExprKind::Constant(_) => e,
                ExprKind::Read { array, index } => {
                    let index = get(index);
                    on_read(array, index).unwrap_or_else(|| Expr::read(array, index))
                }
                ExprKind::Select {
                    cond,
                    then,
                    otherwise,
                } => Expr::select(get(cond), get(then), get(otherwise)),
                ExprKind::Concat { high, low } => Expr::concat(get(high), get(low)),
                ExprKind::Extract { expr, offset } => Expr::extract(get(expr), offset, e.width()),
                ExprKind::ZExt(inner) => Expr::zext(get(inner), e.width()),
                ExprKind::SExt(inner) => Expr::sext(get(inner), e.width()),
                ExprKind::Not(inner) => Expr::not(get(inner)),
                ExprKind::Binary { op, lhs, rhs } => Expr::binary(op, get(lhs), get(rhs)),
                ExprKind::Compare { op, lhs, rhs } => Expr::compare(op, get(lhs), get(rhs)),
            };
            done.insert(e, rebuilt);
        }
        done.get(&self).copied().unwrap_or(self)
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.width();
        match self.kind() {
            ExprKind::Constant(value) if width == 1 => write!(f, "{}", value == 1),
            ExprKind::Constant(value) => write!(f, "(w{width} {value})"),
            ExprKind::Read { array, index } => {
                write!(f, "(Read w8 {index} {})", array_name(array))
            }
            ExprKind::Select {
                cond,
                then,
                otherwise,
            } => write!(f, "(Select w{width} {cond} {then} {otherwise})"),
            ExprKind::Concat { high, low } => write!(f, "(Concat w{width} {high} {low})"),
            ExprKind::Extract { expr, offset } => {
                write!(f, "(Extract w{width} {offset} {expr})")
            }
            ExprKind::ZExt(inner) => write!(f, "(ZExt w{width} {inner})"),
            ExprKind::SExt(inner) => write!(f, "(SExt w{width} {inner})"),
            ExprKind::Not(inner) => write!(f, "(Not w{width} {inner})"),
            ExprKind::Binary { op, lhs, rhs } => write!(f, "({op:?} w{width} {lhs} {rhs})"),
            ExprKind::Compare { op, lhs, rhs } => write!(f, "({op:?} {lhs} {rhs})"),
        }
    }
}

fn array_name(id: ArrayId) -> String {
    id.get().name.clone()
}

impl ArrayId {
    /// Declares a fresh array. Arrays are never deduplicated: two declarations with the same
    /// name are distinct unknowns.
    pub fn new(name: impl Into<String>, size: u64, source: ArraySource) -> ArrayId {
        pool::declare_array(Array {
            name: name.into(),
            size,
            source,
        })
    }

    pub fn get(self) -> Arc<Array> {
        pool::array(self)
    }

    pub fn index(self) -> u32 {
        self.0
    }

    pub fn name(self) -> String {
        self.get().name.clone()
    }

    pub fn size(self) -> u64 {
        self.get().size
    }

    pub fn is_symbolic(self) -> bool {
        self.get().source.is_symbolic()
    }
}
