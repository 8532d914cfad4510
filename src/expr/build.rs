//! Folding constructors.
//!
//! Constant operands are evaluated eagerly using SMT-LIB bit-vector semantics, including the
//! total definitions of division by zero and of over-wide shifts.

use super::pool::intern;
use super::{ArrayId, ArraySource, BinOp, CmpOp, Expr, ExprKind, MAX_WIDTH, POINTER_WIDTH};

/// All-ones value of `width` bits.
pub fn mask(width: u32) -> u128 {
    if width >= MAX_WIDTH {
        u128::MAX
    } else {
        (1u128 << width) - 1
    }
}

fn to_signed(value: u128, width: u32) -> i128 {
    if width >= MAX_WIDTH {
        return value as i128;
    }
    let sign = 1u128 << (width - 1);
    if value & sign != 0 {
        (value | !mask(width)) as i128
    } else {
        value as i128
    }
}

pub(crate) fn fold_binary(op: BinOp, lhs: u128, rhs: u128, width: u32) -> u128 {
    let m = mask(width);
    let value = match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::UDiv => {
            if rhs == 0 {
                m
            } else {
                lhs / rhs
            }
        }
        BinOp::URem => {
            if rhs == 0 {
                lhs
            } else {
                lhs % rhs
            }
        }
        BinOp::And => lhs & rhs,
        BinOp::Or => lhs | rhs,
        BinOp::Xor => lhs ^ rhs,
        BinOp::Shl => {
            if rhs >= width as u128 {
                0
            } else {
                lhs << rhs
            }
        }
        BinOp::LShr => {
            if rhs >= width as u128 {
                0
            } else {
                lhs >> rhs
            }
        }
        BinOp::AShr => {
            let signed = to_signed(lhs, width);
            if rhs >= width as u128 {
                if signed < 0 {
                    m
                } else {
                    0
                }
            } else {
                (signed >> rhs) as u128
            }
        }
    };
    value & m
}

pub(crate) fn fold_compare(op: CmpOp, lhs: u128, rhs: u128, width: u32) -> bool {
    match op {
        CmpOp::Eq => lhs == rhs,
        CmpOp::Ult => lhs < rhs,
        CmpOp::Ule => lhs <= rhs,
        CmpOp::Slt => to_signed(lhs, width) < to_signed(rhs, width),
        CmpOp::Sle => to_signed(lhs, width) <= to_signed(rhs, width),
    }
}

impl Expr {
    pub fn constant(value: u128, width: u32) -> Expr {
        debug_assert!(width > 0 && width <= MAX_WIDTH);
        intern(ExprKind::Constant(value & mask(width)), width)
    }

    pub fn pointer(value: u64) -> Expr {
        Expr::constant(value as u128, POINTER_WIDTH)
    }

    pub fn bool(value: bool) -> Expr {
        Expr::constant(value as u128, 1)
    }

    pub fn true_() -> Expr {
        Expr::bool(true)
    }

    pub fn false_() -> Expr {
        Expr::bool(false)
    }

    /// One byte of `array`. Constant arrays fold when the index is known.
    pub fn read(array: ArrayId, index: Expr) -> Expr {
        if let Some(offset) = index.as_constant() {
            if let ArraySource::Constant(bytes) = &array.get().source {
                if let Some(byte) = bytes.get(offset as usize) {
                    return Expr::constant(*byte as u128, 8);
                }
            }
        }
        intern(ExprKind::Read { array, index }, 8)
    }

    /// Little-endian read of `bytes` bytes starting at `offset`.
    pub fn read_le(array: ArrayId, offset: u64, bytes: u32) -> Expr {
        debug_assert!(bytes > 0 && bytes * 8 <= MAX_WIDTH);
        let mut result = Expr::read(array, Expr::pointer(offset));
        for i in 1..bytes as u64 {
            let byte = Expr::read(array, Expr::pointer(offset + i));
            result = Expr::concat(byte, result);
        }
        result
    }

    /// The whole array as one little-endian value; the usual view of a symcrete.
    pub fn whole_array(array: ArrayId) -> Expr {
        let bytes = array.size().clamp(1, (MAX_WIDTH / 8) as u64) as u32;
        Expr::read_le(array, 0, bytes)
    }

    pub fn select(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
        debug_assert_eq!(cond.width(), 1);
        debug_assert_eq!(then.width(), otherwise.width());
        if let Some(c) = cond.as_constant() {
            return if c != 0 { then } else { otherwise };
        }
        if then == otherwise {
            return then;
        }
        intern(
            ExprKind::Select {
                cond,
                then,
                otherwise,
            },
            then.width(),
        )
    }

    pub fn concat(high: Expr, low: Expr) -> Expr {
        let width = high.width() + low.width();
        debug_assert!(width <= MAX_WIDTH);
        if let (Some(h), Some(l)) = (high.as_constant(), low.as_constant()) {
            return Expr::constant((h << low.width()) | l, width);
        }
        intern(ExprKind::Concat { high, low }, width)
    }

    pub fn extract(expr: Expr, offset: u32, width: u32) -> Expr {
        debug_assert!(offset + width <= expr.width());
        if offset == 0 && width == expr.width() {
            return expr;
        }
        if let Some(value) = expr.as_constant() {
            return Expr::constant(value >> offset, width);
        }
        if let ExprKind::Concat { high, low } = expr.kind() {
            let low_width = low.width();
            if offset + width <= low_width {
                return Expr::extract(low, offset, width);
            }
            if offset >= low_width {
                return Expr::extract(high, offset - low_width, width);
            }
        }
        intern(ExprKind::Extract { expr, offset }, width)
    }

    pub fn zext(expr: Expr, width: u32) -> Expr {
        let from = expr.width();
        if width == from {
            return expr;
        }
        if width < from {
            return Expr::extract(expr, 0, width);
        }
        if let Some(value) = expr.as_constant() {
            return Expr::constant(value, width);
        }
        intern(ExprKind::ZExt(expr), width)
    }

    pub fn sext(expr: Expr, width: u32) -> Expr {
        let from = expr.width();
        if width == from {
            return expr;
        }
        if width < from {
            return Expr::extract(expr, 0, width);
        }
        if let Some(value) = expr.as_constant() {
            return Expr::constant(to_signed(value, from) as u128, width);
        }
        intern(ExprKind::SExt(expr), width)
    }

    /// Bitwise complement; logical negation at width 1.
    pub fn not(expr: Expr) -> Expr {
        if let Some(value) = expr.as_constant() {
            return Expr::constant(!value, expr.width());
        }
        if let ExprKind::Not(inner) = expr.kind() {
            return inner;
        }
        intern(ExprKind::Not(expr), expr.width())
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        let width = lhs.width();
        debug_assert_eq!(width, rhs.width(), "{op:?} operands differ in width");
        let m = mask(width);
        match (lhs.as_constant(), rhs.as_constant()) {
            (Some(l), Some(r)) => return Expr::constant(fold_binary(op, l, r, width), width),
            (Some(c), None) => match (op, c) {
                (BinOp::Add | BinOp::Or | BinOp::Xor, 0) => return rhs,
                (BinOp::And | BinOp::Mul, 0) => return lhs,
                (BinOp::Mul, 1) => return rhs,
                (BinOp::And, c) if c == m => return rhs,
                (BinOp::Or, c) if c == m => return lhs,
                _ => {}
            },
            (None, Some(c)) => match (op, c) {
                (
                    BinOp::Add
                    | BinOp::Sub
                    | BinOp::Or
                    | BinOp::Xor
                    | BinOp::Shl
                    | BinOp::LShr
                    | BinOp::AShr,
                    0,
                ) => return lhs,
                (BinOp::And | BinOp::Mul, 0) => return rhs,
                (BinOp::Mul | BinOp::UDiv, 1) => return lhs,
                (BinOp::And, c) if c == m => return lhs,
                (BinOp::Or, c) if c == m => return rhs,
                _ => {}
            },
            (None, None) => {
                if lhs == rhs {
                    match op {
                        BinOp::And | BinOp::Or => return lhs,
                        BinOp::Sub | BinOp::Xor => return Expr::constant(0, width),
                        _ => {}
                    }
                }
            }
        }
        intern(ExprKind::Binary { op, lhs, rhs }, width)
    }

    pub fn compare(op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
        let width = lhs.width();
        debug_assert_eq!(width, rhs.width(), "{op:?} operands differ in width");
        // constants go left for equalities
        let (lhs, rhs) = if op == CmpOp::Eq && rhs.is_constant() && !lhs.is_constant() {
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };
        if let (Some(l), Some(r)) = (lhs.as_constant(), rhs.as_constant()) {
            return Expr::bool(fold_compare(op, l, r, width));
        }
        if lhs == rhs {
            return Expr::bool(matches!(op, CmpOp::Eq | CmpOp::Ule | CmpOp::Sle));
        }
        if op == CmpOp::Eq && width == 1 {
            // (= true x) is x, (= false x) is (not x)
            match lhs.as_constant() {
                Some(1) => return rhs,
                Some(_) => return Expr::not(rhs),
                None => {}
            }
        }
        if op == CmpOp::Ult && rhs.as_constant() == Some(0) {
            return Expr::false_();
        }
        if op == CmpOp::Ule && lhs.as_constant() == Some(0) {
            return Expr::true_();
        }
        intern(ExprKind::Compare { op, lhs, rhs }, 1)
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mul, lhs, rhs)
    }

    pub fn udiv(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::UDiv, lhs, rhs)
    }

    pub fn urem(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::URem, lhs, rhs)
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::And, lhs, rhs)
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Or, lhs, rhs)
    }

    pub fn xor(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Xor, lhs, rhs)
    }

    pub fn shl(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Shl, lhs, rhs)
    }

    pub fn lshr(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::LShr, lhs, rhs)
    }

    pub fn ashr(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::AShr, lhs, rhs)
    }

    pub fn equal(lhs: Expr, rhs: Expr) -> Expr {
        Expr::compare(CmpOp::Eq, lhs, rhs)
    }

    pub fn ne(lhs: Expr, rhs: Expr) -> Expr {
        Expr::not(Expr::equal(lhs, rhs))
    }

    pub fn ult(lhs: Expr, rhs: Expr) -> Expr {
        Expr::compare(CmpOp::Ult, lhs, rhs)
    }

    pub fn ule(lhs: Expr, rhs: Expr) -> Expr {
        Expr::compare(CmpOp::Ule, lhs, rhs)
    }

    pub fn ugt(lhs: Expr, rhs: Expr) -> Expr {
        Expr::ult(rhs, lhs)
    }

    pub fn uge(lhs: Expr, rhs: Expr) -> Expr {
        Expr::ule(rhs, lhs)
    }

    pub fn slt(lhs: Expr, rhs: Expr) -> Expr {
        Expr::compare(CmpOp::Slt, lhs, rhs)
    }

    pub fn sle(lhs: Expr, rhs: Expr) -> Expr {
        Expr::compare(CmpOp::Sle, lhs, rhs)
    }

    pub fn is_zero(expr: Expr) -> Expr {
        Expr::equal(expr, Expr::constant(0, expr.width()))
    }

    /// Conjunction of all `terms`; `true` when empty.
    pub fn all(terms: impl IntoIterator<Item = Expr>) -> Expr {
        terms.into_iter().fold(Expr::true_(), Expr::and)
    }
}
