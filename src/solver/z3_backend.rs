//! z3 backend.
//!
//! Arrays become z3 arrays from 64-bit indices to bytes; width-1 expressions become z3
//! booleans and everything else bit-vectors. Translation walks the expression DAG with an
//! explicit post-order stack so deep terms cannot overflow the native stack.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use z3::ast::{Array as Z3Array, Ast, Bool, BV};
use z3::{Config, Context, Model, Params, SatResult, Sort};

use super::{Query, Solver, SolverResponse, ValidityCore};
use crate::error::SolverError;
use crate::expr::{ArrayId, ArraySource, Assignment, BinOp, CmpOp, Expr, ExprKind, POINTER_WIDTH};
use crate::utils::config::SpaceConfig;

#[derive(Clone)]
enum Term<'ctx> {
    Bool(Bool<'ctx>),
    Bv(BV<'ctx>),
}

fn bv_const<'ctx>(ctx: &'ctx Context, value: u128, width: u32) -> BV<'ctx> {
    if width <= 64 {
        return BV::from_u64(ctx, value as u64, width);
    }
    let high = BV::from_u64(ctx, (value >> 64) as u64, width - 64);
    high.concat(&BV::from_u64(ctx, value as u64, 64))
}

struct Translator<'ctx> {
    ctx: &'ctx Context,
    terms: HashMap<Expr, Term<'ctx>>,
    arrays: HashMap<ArrayId, Z3Array<'ctx>>,
}

impl<'ctx> Translator<'ctx> {
    fn new(ctx: &'ctx Context) -> Self {
        Self {
            ctx,
            terms: HashMap::new(),
            arrays: HashMap::new(),
        }
    }

    fn array(&mut self, id: ArrayId) -> Z3Array<'ctx> {
        if let Some(existing) = self.arrays.get(&id) {
            return existing.clone();
        }
        let domain = Sort::bitvector(self.ctx, POINTER_WIDTH);
        let range = Sort::bitvector(self.ctx, 8);
        let array = id.get();
        let translated = match &array.source {
            ArraySource::Constant(bytes) => {
                let zero = BV::from_u64(self.ctx, 0, 8);
                let mut contents = Z3Array::const_array(self.ctx, &domain, &zero);
                for (i, byte) in bytes.iter().enumerate() {
                    let index = BV::from_u64(self.ctx, i as u64, POINTER_WIDTH);
                    contents = contents.store(&index, &BV::from_u64(self.ctx, *byte as u64, 8));
                }
                contents
            }
            _ => Z3Array::new_const(
                self.ctx,
                format!("{}#{}", array.name, id.index()),
                &domain,
                &range,
            ),
        };
        self.arrays.insert(id, translated.clone());
        translated
    }

    fn one(&self) -> BV<'ctx> {
        BV::from_u64(self.ctx, 1, 1)
    }

    fn to_bool(&self, term: &Term<'ctx>) -> Bool<'ctx> {
        match term {
            Term::Bool(b) => b.clone(),
            Term::Bv(v) => v._eq(&self.one()),
        }
    }

    fn to_bv(&self, term: &Term<'ctx>) -> BV<'ctx> {
        match term {
            Term::Bv(v) => v.clone(),
            Term::Bool(b) => b.ite(&self.one(), &BV::from_u64(self.ctx, 0, 1)),
        }
    }

    fn finish(&self, width: u32, value: BV<'ctx>) -> Term<'ctx> {
        if width == 1 {
            Term::Bool(value._eq(&self.one()))
        } else {
            Term::Bv(value)
        }
    }

    fn operand(&self, expr: Expr) -> Result<&Term<'ctx>, SolverError> {
        self.terms
            .get(&expr)
            .ok_or_else(|| SolverError::Backend(format!("operand {expr} was not translated")))
    }

    fn boolean_operand(&self, expr: Expr) -> Result<Bool<'ctx>, SolverError> {
        Ok(self.to_bool(self.operand(expr)?))
    }

    fn bv_operand(&self, expr: Expr) -> Result<BV<'ctx>, SolverError> {
        Ok(self.to_bv(self.operand(expr)?))
    }

    fn translate(&mut self, root: Expr) -> Result<Term<'ctx>, SolverError> {
        let mut stack = vec![(root, false)];
        while let Some((expr, expanded)) = stack.pop() {
            if self.terms.contains_key(&expr) {
                continue;
            }
            let kind = expr.kind();
            if !expanded {
                stack.push((expr, true));
                for child in kind.children() {
                    if !self.terms.contains_key(&child) {
                        stack.push((child, false));
                    }
                }
                continue;
            }
            let term = self.build(expr, kind)?;
            self.terms.insert(expr, term);
        }
        self.operand(root).cloned()
    }

    fn boolean(&mut self, expr: Expr) -> Result<Bool<'ctx>, SolverError> {
        let term = self.translate(expr)?;
        Ok(self.to_bool(&term))
    }

    fn build(&mut self, expr: Expr, kind: ExprKind) -> Result<Term<'ctx>, SolverError> {
        let width = expr.width();
        let term = match kind {
            ExprKind::Constant(value) if width == 1 => {
                Term::Bool(Bool::from_bool(self.ctx, value != 0))
            }
            ExprKind::Constant(value) => Term::Bv(bv_const(self.ctx, value, width)),
            ExprKind::Read { array, index } => {
                let index = self.bv_operand(index)?;
                let byte = self
                    .array(array)
                    .select(&index)
                    .as_bv()
                    .ok_or_else(|| SolverError::Backend("array select is not a byte".into()))?;
                Term::Bv(byte)
            }
            ExprKind::Select {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.boolean_operand(cond)?;
                if width == 1 {
                    let (t, f) = (self.boolean_operand(then)?, self.boolean_operand(otherwise)?);
                    Term::Bool(cond.ite(&t, &f))
                } else {
                    let (t, f) = (self.bv_operand(then)?, self.bv_operand(otherwise)?);
                    Term::Bv(cond.ite(&t, &f))
                }
            }
            ExprKind::Concat { high, low } => {
                let value = self.bv_operand(high)?.concat(&self.bv_operand(low)?);
                self.finish(width, value)
            }
            ExprKind::Extract { expr: inner, offset } => {
                let value = self.bv_operand(inner)?.extract(offset + width - 1, offset);
                self.finish(width, value)
            }
            ExprKind::ZExt(inner) => {
                Term::Bv(self.bv_operand(inner)?.zero_ext(width - inner.width()))
            }
            ExprKind::SExt(inner) => {
                Term::Bv(self.bv_operand(inner)?.sign_ext(width - inner.width()))
            }
            ExprKind::Not(inner) if width == 1 => Term::Bool(self.boolean_operand(inner)?.not()),
            ExprKind::Not(inner) => Term::Bv(self.bv_operand(inner)?.bvnot()),
            ExprKind::Binary { op, lhs, rhs }
                if width == 1 && matches!(op, BinOp::And | BinOp::Or | BinOp::Xor) =>
            {
                let (l, r) = (self.boolean_operand(lhs)?, self.boolean_operand(rhs)?);
                Term::Bool(match op {
                    BinOp::And => Bool::and(self.ctx, &[&l, &r]),
                    BinOp::Or => Bool::or(self.ctx, &[&l, &r]),
                    _ => l.xor(&r),
                })
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let (l, r) = (self.bv_operand(lhs)?, self.bv_operand(rhs)?);
                let value = match op {
                    BinOp::Add => l.bvadd(&r),
                    BinOp::Sub => l.bvsub(&r),
                    BinOp::Mul => l.bvmul(&r),
                    BinOp::UDiv => l.bvudiv(&r),
                    BinOp::URem => l.bvurem(&r),
                    BinOp::And => l.bvand(&r),
                    BinOp::Or => l.bvor(&r),
                    BinOp::Xor => l.bvxor(&r),
                    BinOp::Shl => l.bvshl(&r),
                    BinOp::LShr => l.bvlshr(&r),
                    BinOp::AShr => l.bvashr(&r),
                };
                self.finish(width, value)
            }
            ExprKind::Compare { op, lhs, rhs } if op == CmpOp::Eq && lhs.width() == 1 => {
                let (l, r) = (self.boolean_operand(lhs)?, self.boolean_operand(rhs)?);
                Term::Bool(l._eq(&r))
            }
            ExprKind::Compare { op, lhs, rhs } => {
                let (l, r) = (self.bv_operand(lhs)?, self.bv_operand(rhs)?);
                Term::Bool(match op {
                    CmpOp::Eq => l._eq(&r),
                    CmpOp::Ult => l.bvult(&r),
                    CmpOp::Ule => l.bvule(&r),
                    CmpOp::Slt => l.bvslt(&r),
                    CmpOp::Sle => l.bvsle(&r),
                })
            }
        };
        Ok(term)
    }

    fn model_value(&self, model: &Model<'ctx>, term: &Term<'ctx>) -> Result<u128, SolverError> {
        let missing = || SolverError::Backend("model has no value for expression".into());
        match term {
            Term::Bool(b) => model
                .eval(b, true)
                .and_then(|v| v.as_bool())
                .map(u128::from)
                .ok_or_else(missing),
            Term::Bv(v) if v.get_size() <= 64 => model
                .eval(v, true)
                .and_then(|v| v.as_u64())
                .map(u128::from)
                .ok_or_else(missing),
            Term::Bv(v) => {
                let size = v.get_size();
                let low = model
                    .eval(&v.extract(63, 0), true)
                    .and_then(|v| v.as_u64())
                    .ok_or_else(missing)?;
                let high = model
                    .eval(&v.extract(size - 1, 64), true)
                    .and_then(|v| v.as_u64())
                    .ok_or_else(missing)?;
                Ok(((high as u128) << 64) | low as u128)
            }
        }
    }

    fn array_bytes(&mut self, model: &Model<'ctx>, id: ArrayId) -> Result<Vec<u8>, SolverError> {
        let array = self.array(id);
        (0..id.size())
            .map(|i| {
                let index = BV::from_u64(self.ctx, i, POINTER_WIDTH);
                array
                    .select(&index)
                    .as_bv()
                    .and_then(|byte| model.eval(&byte, true))
                    .and_then(|byte| byte.as_u64())
                    .map(|byte| byte as u8)
                    .ok_or_else(|| {
                        SolverError::Backend(format!("model has no byte {i} of `{}`", id.name()))
                    })
            })
            .collect()
    }
}

fn symbolic_arrays(query: &Query<'_>) -> BTreeSet<ArrayId> {
    query
        .constraints
        .iter()
        .chain(std::iter::once(query.expr))
        .flat_map(Expr::arrays)
        .filter(|id| id.is_symbolic())
        .collect()
}

/// Solver backed by an owned z3 context. Each query runs in a fresh z3 solver.
pub struct Z3Solver {
    ctx: Context,
    timeout: Option<Duration>,
}

impl Default for Z3Solver {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Z3Solver {
    pub fn new(timeout: Option<Duration>) -> Self {
        let cfg = Config::new();
        Self {
            ctx: Context::new(&cfg),
            timeout,
        }
    }

    pub fn from_config(config: &SpaceConfig) -> Self {
        Self::new(config.solver_timeout())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn session(&self) -> z3::Solver<'_> {
        let solver = z3::Solver::new(&self.ctx);
        if let Some(timeout) = self.timeout {
            let mut params = Params::new(&self.ctx);
            let ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
            params.set_u32("timeout", ms);
            solver.set_params(&params);
        }
        solver
    }
}

fn unknown(solver: &z3::Solver<'_>) -> SolverError {
    let reason = solver
        .get_reason_unknown()
        .unwrap_or_else(|| "unknown".to_string());
    if reason.contains("timeout") || reason.contains("canceled") {
        SolverError::Timeout
    } else {
        SolverError::Unknown(reason)
    }
}

impl Solver for Z3Solver {
    fn compute_truth(&mut self, query: &Query<'_>) -> Result<bool, SolverError> {
        let mut tr = Translator::new(&self.ctx);
        let solver = self.session();
        for constraint in query.constraints.iter() {
            solver.assert(&tr.boolean(constraint)?);
        }
        solver.assert(&tr.boolean(query.expr)?.not());
        match solver.check() {
            SatResult::Unsat => Ok(true),
            SatResult::Sat => Ok(false),
            SatResult::Unknown => Err(unknown(&solver)),
        }
    }

    fn compute_value(&mut self, query: &Query<'_>) -> Result<u128, SolverError> {
        let mut tr = Translator::new(&self.ctx);
        let solver = self.session();
        for constraint in query.constraints.iter() {
            solver.assert(&tr.boolean(constraint)?);
        }
        let term = tr.translate(query.expr)?;
        match solver.check() {
            SatResult::Sat => {
                let model = solver
                    .get_model()
                    .ok_or_else(|| SolverError::Backend("sat without a model".into()))?;
                tr.model_value(&model, &term)
            }
            SatResult::Unsat => Err(SolverError::Unsatisfiable(format!(
                "a value of {}",
                query.expr
            ))),
            SatResult::Unknown => Err(unknown(&solver)),
        }
    }

    fn compute_initial_values(
        &mut self,
        query: &Query<'_>,
        arrays: &[ArrayId],
    ) -> Result<Option<Vec<Vec<u8>>>, SolverError> {
        let mut tr = Translator::new(&self.ctx);
        let solver = self.session();
        for constraint in query.constraints.iter() {
            solver.assert(&tr.boolean(constraint)?);
        }
        solver.assert(&tr.boolean(query.expr)?.not());
        match solver.check() {
            SatResult::Sat => {
                let model = solver
                    .get_model()
                    .ok_or_else(|| SolverError::Backend("sat without a model".into()))?;
                let values = arrays
                    .iter()
                    .map(|id| tr.array_bytes(&model, *id))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(values))
            }
            SatResult::Unsat => Ok(None),
            SatResult::Unknown => Err(unknown(&solver)),
        }
    }

    fn check(&mut self, query: &Query<'_>) -> Result<SolverResponse, SolverError> {
        let mut tr = Translator::new(&self.ctx);
        let solver = self.session();
        let mut literals: HashMap<String, Expr> = HashMap::new();
        let mut assumptions = Vec::with_capacity(query.constraints.len() + 1);
        for (i, constraint) in query.constraints.iter().enumerate() {
            let literal = Bool::new_const(&self.ctx, format!("core_c{i}"));
            solver.assert(&literal.implies(&tr.boolean(constraint)?));
            literals.insert(literal.to_string(), constraint);
            assumptions.push(literal);
        }
        let goal = Bool::new_const(&self.ctx, "core_goal");
        solver.assert(&goal.implies(&tr.boolean(query.expr)?.not()));
        let goal_name = goal.to_string();
        assumptions.push(goal);

        match solver.check_assumptions(&assumptions) {
            SatResult::Unsat => {
                let mut core = ValidityCore {
                    constraints: Vec::new(),
                    expr: Expr::true_(),
                };
                for literal in solver.get_unsat_core() {
                    let name = literal.to_string();
                    if name == goal_name {
                        core.expr = query.expr;
                    } else if let Some(constraint) = literals.get(&name) {
                        core.constraints.push(*constraint);
                    }
                }
                Ok(SolverResponse::Valid(core))
            }
            SatResult::Sat => {
                let model = solver
                    .get_model()
                    .ok_or_else(|| SolverError::Backend("sat without a model".into()))?;
                let mut assignment = Assignment::new();
                for id in symbolic_arrays(query) {
                    assignment.bind(id, tr.array_bytes(&model, id)?);
                }
                Ok(SolverResponse::Invalid(assignment))
            }
            SatResult::Unknown => Err(unknown(&solver)),
        }
    }
}
