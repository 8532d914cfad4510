use std::time::{Duration, Instant};

use super::{Query, Solver, SolverResponse};
use crate::error::SolverError;
use crate::expr::ArrayId;
use crate::utils::config::SpaceConfig;

/// Logs every query passing through to the wrapped solver.
pub struct QueryLoggingSolver<S> {
    inner: S,
    slow_threshold: Duration,
    issued: u64,
}

impl<S: Solver> QueryLoggingSolver<S> {
    pub fn new(inner: S, slow_threshold: Duration) -> Self {
        Self {
            inner,
            slow_threshold,
            issued: 0,
        }
    }

    /// Uses the config's slow-query threshold.
    pub fn from_config(inner: S, config: &SpaceConfig) -> Self {
        Self::new(inner, config.slow_query_threshold())
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn logged<T>(
        &mut self,
        kind: &'static str,
        query: &Query<'_>,
        run: impl FnOnce(&mut S) -> Result<T, SolverError>,
        describe: impl FnOnce(&T) -> String,
    ) -> Result<T, SolverError> {
        self.issued += 1;
        let id = self.issued;
        let started = Instant::now();
        let result = run(&mut self.inner);
        let elapsed = started.elapsed();
        match &result {
            Ok(value) if elapsed >= self.slow_threshold => tracing::info!(
                "[QUERY] #{} {} over {} constraint(s) took {:?} (slow): {}",
                id,
                kind,
                query.constraints.len(),
                elapsed,
                describe(value)
            ),
            Ok(value) => tracing::debug!(
                "[QUERY] #{} {} over {} constraint(s) took {:?}: {} | expr {}",
                id,
                kind,
                query.constraints.len(),
                elapsed,
                describe(value),
                query.expr
            ),
            Err(err) => tracing::warn!(
                "[QUERY] #{} {} over {} constraint(s) failed after {:?}: {}",
                id,
                kind,
                query.constraints.len(),
                elapsed,
                err
            ),
        }
        result
    }
}

impl<S: Solver> Solver for QueryLoggingSolver<S> {
    fn compute_truth(&mut self, query: &Query<'_>) -> Result<bool, SolverError> {
        self.logged(
            "truth",
            query,
            |inner| inner.compute_truth(query),
            |valid| format!("valid={valid}"),
        )
    }

    fn compute_value(&mut self, query: &Query<'_>) -> Result<u128, SolverError> {
        self.logged(
            "value",
            query,
            |inner| inner.compute_value(query),
            |value| format!("{value:#x}"),
        )
    }

    fn compute_initial_values(
        &mut self,
        query: &Query<'_>,
        arrays: &[ArrayId],
    ) -> Result<Option<Vec<Vec<u8>>>, SolverError> {
        self.logged(
            "initial-values",
            query,
            |inner| inner.compute_initial_values(query, arrays),
            |values| match values {
                Some(values) => format!("model for {} array(s)", values.len()),
                None => "no model".to_string(),
            },
        )
    }

    fn check(&mut self, query: &Query<'_>) -> Result<SolverResponse, SolverError> {
        self.logged(
            "check",
            query,
            |inner| inner.check(query),
            |response| match response {
                SolverResponse::Valid(core) => {
                    format!("valid, core of {}", core.constraints.len())
                }
                SolverResponse::Invalid(model) => {
                    format!("invalid, {} array(s) in counterexample", model.len())
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ArraySource, ConstraintSet, Expr};
    use crate::solver::Z3Solver;

    #[test]
    fn forwards_and_counts_queries() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("symspace=debug"))
            .with_test_writer()
            .try_init();
        let mut solver = QueryLoggingSolver::new(Z3Solver::default(), Duration::from_secs(5));
        let input = ArrayId::new("logged", 1, ArraySource::Symbolic);
        let byte = Expr::read(input, Expr::pointer(0));
        let constraints: ConstraintSet =
            std::iter::once(Expr::equal(byte, Expr::constant(42, 8))).collect();

        assert_eq!(solver.get_value(&constraints, byte).unwrap(), 42);
        assert!(solver
            .must_be_true(&constraints, Expr::ugt(byte, Expr::constant(40, 8)))
            .unwrap());
        assert_eq!(solver.issued(), 2);
    }

    #[test]
    fn threshold_follows_config() {
        let config = SpaceConfig {
            slow_query_ms: 250,
            ..SpaceConfig::default()
        };
        let solver = QueryLoggingSolver::from_config(Z3Solver::from_config(&config), &config);
        assert_eq!(solver.slow_threshold(), Duration::from_millis(250));
    }
}
