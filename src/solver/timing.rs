use std::time::Instant;

use super::repair::{repair_assignment, RepairRequest};
use super::{Query, Solver, SolverResponse};
use crate::error::SolverError;
use crate::expr::{ArrayId, Assignment, Expr};
use crate::state::ExecutionState;
use crate::utils::stats;

/// Records query counts and solver time for every primitive, and adds the symcrete-aware
/// queries used by execution states.
pub struct TimingSolver<S> {
    inner: S,
}

impl<S: Solver> TimingSolver<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn timed<T>(
        &mut self,
        run: impl FnOnce(&mut S) -> Result<T, SolverError>,
    ) -> Result<T, SolverError> {
        let started = Instant::now();
        let result = run(&mut self.inner);
        stats::record_query(started.elapsed(), result.is_err());
        result
    }

    /// `must_be_true` under the state's symcrete bindings. A positive answer that only holds
    /// because of stale size bindings is overturned: the result is then `false` together with
    /// the bindings to apply through `ExecutionState::update_symcretes`. Whether the repaired
    /// sizes are minimized follows the state's `minimize_repairs`.
    pub fn must_be_true_repairing(
        &mut self,
        state: &ExecutionState,
        expr: Expr,
    ) -> Result<(bool, Option<Assignment>), SolverError> {
        let constraints = state.constraints_with_symcretes();
        if !self.must_be_true(constraints, expr)? {
            return Ok((false, None));
        }
        let Some(core) = self.get_validity_core(constraints, expr)? else {
            return Ok((false, None));
        };
        let request = RepairRequest {
            constraints: state.constraints(),
            symcretes: state.symcretes(),
            expr,
            core,
            minimize: state.config().minimize_repairs,
        };
        match repair_assignment(self, request)?.into_assignment() {
            Some(repaired) => Ok((false, Some(repaired))),
            None => Ok((true, None)),
        }
    }

    pub fn must_be_false_repairing(
        &mut self,
        state: &ExecutionState,
        expr: Expr,
    ) -> Result<(bool, Option<Assignment>), SolverError> {
        self.must_be_true_repairing(state, Expr::not(expr))
    }

    pub fn may_be_true_repairing(
        &mut self,
        state: &ExecutionState,
        expr: Expr,
    ) -> Result<(bool, Option<Assignment>), SolverError> {
        let (must_be_false, repaired) = self.must_be_false_repairing(state, expr)?;
        Ok((!must_be_false, repaired))
    }

    pub fn may_be_false_repairing(
        &mut self,
        state: &ExecutionState,
        expr: Expr,
    ) -> Result<(bool, Option<Assignment>), SolverError> {
        let (must_be_true, repaired) = self.must_be_true_repairing(state, expr)?;
        Ok((!must_be_true, repaired))
    }
}

impl<S: Solver> Solver for TimingSolver<S> {
    fn compute_truth(&mut self, query: &Query<'_>) -> Result<bool, SolverError> {
        self.timed(|inner| inner.compute_truth(query))
    }

    fn compute_value(&mut self, query: &Query<'_>) -> Result<u128, SolverError> {
        self.timed(|inner| inner.compute_value(query))
    }

    fn compute_initial_values(
        &mut self,
        query: &Query<'_>,
        arrays: &[ArrayId],
    ) -> Result<Option<Vec<Vec<u8>>>, SolverError> {
        self.timed(|inner| inner.compute_initial_values(query, arrays))
    }

    fn check(&mut self, query: &Query<'_>) -> Result<SolverResponse, SolverError> {
        self.timed(|inner| inner.check(query))
    }
}
