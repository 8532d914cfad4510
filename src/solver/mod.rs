//! Solver interface used by resolution and repair.
//!
//! Backends implement four primitives; every other query is derived from them here, with
//! constant expressions answered without touching the backend.

pub mod logging;
pub mod repair;
pub mod timing;
pub mod z3_backend;

use crate::error::SolverError;
use crate::expr::{mask, ArrayId, Assignment, ConstraintSet, Expr};

pub use logging::QueryLoggingSolver;
pub use repair::{repair_assignment, RepairOutcome, RepairRequest};
pub use timing::TimingSolver;
pub use z3_backend::Z3Solver;

/// A boolean expression asked about under a set of constraints.
#[derive(Clone, Copy, Debug)]
pub struct Query<'a> {
    pub constraints: &'a ConstraintSet,
    pub expr: Expr,
}

impl<'a> Query<'a> {
    pub fn new(constraints: &'a ConstraintSet, expr: Expr) -> Self {
        Self { constraints, expr }
    }

    pub fn with_expr(&self, expr: Expr) -> Self {
        Self {
            constraints: self.constraints,
            expr,
        }
    }

    pub fn with_false(&self) -> Self {
        self.with_expr(Expr::false_())
    }

    pub fn negate_expr(&self) -> Self {
        self.with_expr(Expr::not(self.expr))
    }
}

/// Constraints (and possibly the goal) that together justify a validity result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidityCore {
    pub constraints: Vec<Expr>,
    /// The query expression when it took part in the proof, `true` otherwise.
    pub expr: Expr,
}

impl ValidityCore {
    pub fn trivial() -> Self {
        Self {
            constraints: Vec::new(),
            expr: Expr::true_(),
        }
    }

    pub fn is_trivial(&self) -> bool {
        self.constraints.is_empty() && self.expr.is_true()
    }
}

#[derive(Clone, Debug)]
pub enum SolverResponse {
    /// The constraints imply the expression.
    Valid(ValidityCore),
    /// A counterexample: a model of the constraints falsifying the expression.
    Invalid(Assignment),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    True,
    False,
    Unknown,
}

pub trait Solver {
    /// Whether the constraints imply `query.expr`.
    fn compute_truth(&mut self, query: &Query<'_>) -> Result<bool, SolverError>;

    /// Some value `query.expr` may take under the constraints.
    fn compute_value(&mut self, query: &Query<'_>) -> Result<u128, SolverError>;

    /// Contents of `arrays` in a model of the constraints where `query.expr` is false, or
    /// `None` when no such model exists.
    fn compute_initial_values(
        &mut self,
        query: &Query<'_>,
        arrays: &[ArrayId],
    ) -> Result<Option<Vec<Vec<u8>>>, SolverError>;

    /// Validity with a core when it holds, a counterexample otherwise.
    fn check(&mut self, query: &Query<'_>) -> Result<SolverResponse, SolverError>;

    fn compute_validity(&mut self, query: &Query<'_>) -> Result<Validity, SolverError> {
        if self.compute_truth(query)? {
            return Ok(Validity::True);
        }
        if self.compute_truth(&query.negate_expr())? {
            return Ok(Validity::False);
        }
        Ok(Validity::Unknown)
    }

    fn must_be_true(
        &mut self,
        constraints: &ConstraintSet,
        expr: Expr,
    ) -> Result<bool, SolverError> {
        if let Some(value) = expr.as_constant() {
            return Ok(value != 0);
        }
        self.compute_truth(&Query::new(constraints, expr))
    }

    fn must_be_false(
        &mut self,
        constraints: &ConstraintSet,
        expr: Expr,
    ) -> Result<bool, SolverError> {
        self.must_be_true(constraints, Expr::not(expr))
    }

    fn may_be_true(
        &mut self,
        constraints: &ConstraintSet,
        expr: Expr,
    ) -> Result<bool, SolverError> {
        Ok(!self.must_be_false(constraints, expr)?)
    }

    fn may_be_false(
        &mut self,
        constraints: &ConstraintSet,
        expr: Expr,
    ) -> Result<bool, SolverError> {
        Ok(!self.must_be_true(constraints, expr)?)
    }

    fn evaluate(
        &mut self,
        constraints: &ConstraintSet,
        expr: Expr,
    ) -> Result<Validity, SolverError> {
        if let Some(value) = expr.as_constant() {
            return Ok(if value != 0 {
                Validity::True
            } else {
                Validity::False
            });
        }
        self.compute_validity(&Query::new(constraints, expr))
    }

    fn get_value(
        &mut self,
        constraints: &ConstraintSet,
        expr: Expr,
    ) -> Result<u128, SolverError> {
        if let Some(value) = expr.as_constant() {
            return Ok(value);
        }
        self.compute_value(&Query::new(constraints, expr))
    }

    /// The core behind `constraints => expr`, or `None` when the implication does not hold.
    fn get_validity_core(
        &mut self,
        constraints: &ConstraintSet,
        expr: Expr,
    ) -> Result<Option<ValidityCore>, SolverError> {
        match expr.as_constant() {
            Some(0) => return Ok(None),
            Some(_) => return Ok(Some(ValidityCore::trivial())),
            None => {}
        }
        match self.check(&Query::new(constraints, expr))? {
            SolverResponse::Valid(core) => Ok(Some(core)),
            SolverResponse::Invalid(_) => Ok(None),
        }
    }

    fn get_initial_values(
        &mut self,
        constraints: &ConstraintSet,
        arrays: &[ArrayId],
    ) -> Result<Option<Vec<Vec<u8>>>, SolverError> {
        let trivial = Query::new(constraints, Expr::false_());
        self.compute_initial_values(&trivial, arrays)
    }

    /// Smallest and largest values `expr` may take, found by binary search.
    fn get_range(
        &mut self,
        constraints: &ConstraintSet,
        expr: Expr,
    ) -> Result<(u128, u128), SolverError> {
        if let Some(value) = expr.as_constant() {
            return Ok((value, value));
        }
        let width = expr.width();
        let top = mask(width);
        let hint = self.get_value(constraints, expr)?;

        let (mut lo, mut hi) = (0u128, hint);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.may_be_true(constraints, Expr::ule(expr, Expr::constant(mid, width)))? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let min = lo;

        let (mut lo, mut hi) = (hint, top);
        while lo < hi {
            let mid = lo + (hi - lo) / 2 + (hi - lo) % 2;
            if self.may_be_true(constraints, Expr::uge(expr, Expr::constant(mid, width)))? {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        Ok((min, lo))
    }
}

impl<S: Solver + ?Sized> Solver for Box<S> {
    fn compute_truth(&mut self, query: &Query<'_>) -> Result<bool, SolverError> {
        (**self).compute_truth(query)
    }

    fn compute_value(&mut self, query: &Query<'_>) -> Result<u128, SolverError> {
        (**self).compute_value(query)
    }

    fn compute_initial_values(
        &mut self,
        query: &Query<'_>,
        arrays: &[ArrayId],
    ) -> Result<Option<Vec<Vec<u8>>>, SolverError> {
        (**self).compute_initial_values(query, arrays)
    }

    fn check(&mut self, query: &Query<'_>) -> Result<SolverResponse, SolverError> {
        (**self).check(query)
    }

    fn compute_validity(&mut self, query: &Query<'_>) -> Result<Validity, SolverError> {
        (**self).compute_validity(query)
    }
}
