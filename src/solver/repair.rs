//! Symcrete repair.
//!
//! A validity proof obtained under symcrete bindings may hold only because of the concrete
//! values chosen for symbolic sizes. Starting from the proof's validity core, the bindings the
//! core depends on are released one round at a time until the goal becomes falsifiable. The
//! model of that falsification, restricted to the released size symcretes (optionally with the
//! smallest total size), is the repaired assignment.

use std::collections::{BTreeMap, BTreeSet};

use super::{Query, Solver, SolverResponse, ValidityCore};
use crate::error::SolverError;
use crate::expr::{bytes_to_u64, ArrayId, Assignment, ConstraintSet, Expr, MAX_WIDTH};
use crate::state::symcretes::{binding_equality, register, Symcretes};
use crate::utils::stats;

/// Upper bound of the size-sum search; keeps `max + 1` representable.
const MAX_SIZE_SUM: u128 = (1u128 << 63) - 1;

pub struct RepairRequest<'a> {
    /// Path constraints before symcrete substitution.
    pub constraints: &'a ConstraintSet,
    pub symcretes: &'a Symcretes,
    /// The goal that was proven valid.
    pub expr: Expr,
    pub core: ValidityCore,
    pub minimize: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The proof did not depend on any constraint or symcrete.
    NotNeeded,
    /// No consistent re-concretization overturns the proof.
    Genuine,
    /// New bindings for size symcretes under which the goal can fail.
    Repaired(Assignment),
}

impl RepairOutcome {
    pub fn into_assignment(self) -> Option<Assignment> {
        match self {
            RepairOutcome::Repaired(assignment) => Some(assignment),
            _ => None,
        }
    }
}

/// Bytes of each size array in `model`. Arrays the query never mentioned are unconstrained
/// and read as zero.
fn values_in(model: &Assignment, sizes: &[ArrayId]) -> Vec<Vec<u8>> {
    sizes
        .iter()
        .map(|array| {
            model
                .get(*array)
                .map(<[u8]>::to_vec)
                .unwrap_or_else(|| vec![0; array.size() as usize])
        })
        .collect()
}

fn size_sum(sizes: &BTreeSet<ArrayId>) -> Expr {
    sizes.iter().fold(Expr::constant(0, MAX_WIDTH), |sum, array| {
        Expr::add(sum, Expr::zext(Expr::whole_array(*array), MAX_WIDTH))
    })
}

pub fn repair_assignment(
    solver: &mut dyn Solver,
    request: RepairRequest<'_>,
) -> Result<RepairOutcome, SolverError> {
    if request.core.is_trivial() {
        return Ok(RepairOutcome::NotNeeded);
    }
    let outcome = search(solver, &request)?;
    stats::record_repair(matches!(outcome, RepairOutcome::Repaired(_)));
    Ok(outcome)
}

fn search(
    solver: &mut dyn Solver,
    request: &RepairRequest<'_>,
) -> Result<RepairOutcome, SolverError> {
    let symcretes = request.symcretes;
    let mut dependencies = symcretes.dependencies().clone();
    let goal_arrays: BTreeSet<ArrayId> = request
        .expr
        .arrays()
        .into_iter()
        .filter(|array| symcretes.is_bound(*array))
        .collect();
    register(&mut dependencies, request.expr, goal_arrays);

    let mut remaining: BTreeMap<ArrayId, Vec<u8>> = symcretes
        .bindings()
        .iter()
        .map(|(array, bytes)| (*array, bytes.clone()))
        .collect();
    let mut requested: BTreeSet<ArrayId> = BTreeSet::new();
    let mut core = request.core.clone();

    let (reduced, goal, counterexample) = loop {
        let suspects: BTreeSet<ArrayId> = core
            .constraints
            .iter()
            .chain(std::iter::once(&core.expr))
            .filter_map(|constraint| dependencies.get(constraint))
            .flatten()
            .copied()
            .filter(|array| remaining.contains_key(array))
            .collect();
        if suspects.is_empty() {
            tracing::debug!("[REPAIR] core depends on no bound symcrete; proof stands");
            return Ok(RepairOutcome::Genuine);
        }
        for array in &suspects {
            remaining.remove(array);
            if symcretes.is_size_symcrete(*array) {
                requested.insert(*array);
            }
        }
        tracing::debug!(
            "[REPAIR] released {} symcrete(s), {} still bound",
            suspects.len(),
            remaining.len()
        );

        let partial = Assignment::from_bindings(remaining.clone());
        let mut reduced = ConstraintSet::new();
        for (array, bytes) in &remaining {
            let equality = binding_equality(*array, bytes);
            reduced.add(equality);
            register(&mut dependencies, equality, BTreeSet::from([*array]));
        }
        for constraint in request.constraints.iter() {
            let evaluated = partial.evaluate(constraint);
            reduced.add(evaluated);
            let depends = constraint
                .arrays()
                .into_iter()
                .filter(|array| symcretes.is_bound(*array))
                .collect();
            register(&mut dependencies, evaluated, depends);
        }
        let goal = partial.evaluate(request.expr);
        register(&mut dependencies, goal, goal.arrays());

        match solver.check(&Query::new(&reduced, goal))? {
            SolverResponse::Valid(next) => core = next,
            SolverResponse::Invalid(model) => break (reduced, goal, model),
        }
    };

    if requested.is_empty() {
        tracing::debug!("[REPAIR] only address or input symcretes were involved; proof stands");
        return Ok(RepairOutcome::Genuine);
    }
    let sizes: Vec<ArrayId> = requested.iter().copied().collect();
    let mut values = values_in(&counterexample, &sizes);

    if request.minimize {
        let initial: u128 = values
            .iter()
            .map(|bytes| bytes_to_u64(bytes) as u128)
            .sum();
        let mut max = initial.min(MAX_SIZE_SUM) + 1;
        let init = max;
        let mut min = 0u128;
        let sum = size_sum(&requested);
        let mut bounded = reduced.clone();
        bounded.add(Expr::not(goal));
        let mut best: Option<Assignment> = None;
        while min + 1 < max {
            let mid = min + (max - min) / 2;
            let within = Expr::ule(sum, Expr::constant(mid, MAX_WIDTH));
            match solver.check(&Query::new(&bounded, within).negate_expr())? {
                SolverResponse::Invalid(model) => {
                    max = mid;
                    best = Some(model);
                }
                SolverResponse::Valid(_) => min = mid,
            }
        }
        if max == init {
            tracing::debug!("[REPAIR] size-sum search found nothing below {}", init);
            return Ok(RepairOutcome::Genuine);
        }
        if let Some(model) = best {
            values = values_in(&model, &sizes);
        }
        tracing::debug!("[REPAIR] minimal size sum {}", max);
    }

    let repaired = Assignment::from_bindings(sizes.into_iter().zip(values));
    tracing::info!(
        "[REPAIR] repaired {} size symcrete(s) for goal {}",
        repaired.len(),
        request.expr
    );
    Ok(RepairOutcome::Repaired(repaired))
}
