use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, TestCaseError, TestRunner};
use symspace::error::SolverError;
use symspace::expr::{ArrayId, ArraySource, ConstraintSet, Expr};
use symspace::memory::{
    AddressSpace, AllocSite, AllocationRequest, GepBase, MemoryManager, MemoryObject,
    ObjectPredicate, ObjectState,
};
use symspace::solver::{Query, Solver, SolverResponse, Z3Solver};
use symspace::state::ExecutionState;
use symspace::utils::config::{ResolutionConfig, SpaceConfig};

fn bind(space: &mut AddressSpace, object: &Arc<MemoryObject>) {
    space
        .bind(Arc::clone(object), ObjectState::new(object))
        .expect("bind fresh object");
}

fn symbolic_pointer(name: &str) -> Expr {
    Expr::whole_array(ArrayId::new(name, 8, ArraySource::Symbolic))
}

/// Backend whose every query times out.
struct TimingOutSolver;

impl Solver for TimingOutSolver {
    fn compute_truth(&mut self, _: &Query<'_>) -> Result<bool, SolverError> {
        Err(SolverError::Timeout)
    }

    fn compute_value(&mut self, _: &Query<'_>) -> Result<u128, SolverError> {
        Err(SolverError::Timeout)
    }

    fn compute_initial_values(
        &mut self,
        _: &Query<'_>,
        _: &[ArrayId],
    ) -> Result<Option<Vec<Vec<u8>>>, SolverError> {
        Err(SolverError::Timeout)
    }

    fn check(&mut self, _: &Query<'_>) -> Result<SolverResponse, SolverError> {
        Err(SolverError::Timeout)
    }
}

/// Three bound objects and a pointer that may point one byte into any of them.
fn three_way_alias(
    space: &mut AddressSpace,
    name: &str,
) -> (Vec<Arc<MemoryObject>>, ConstraintSet, Expr) {
    let mut manager = MemoryManager::default();
    let objects: Vec<Arc<MemoryObject>> = (0..3)
        .map(|_| manager.allocate(AllocationRequest::new(16)).unwrap())
        .collect();
    for object in &objects {
        bind(space, object);
    }
    let pointer = symbolic_pointer(name);
    let alias = objects
        .iter()
        .map(|object| Expr::equal(pointer, Expr::pointer(object.address + 1)))
        .reduce(Expr::or)
        .unwrap();
    (objects, std::iter::once(alias).collect(), pointer)
}

#[test]
fn test_resolve_one_concrete_disjoint_objects() {
    let mut manager = MemoryManager::default();
    let mut space = AddressSpace::new(ResolutionConfig::default());
    let a = manager.allocate_fixed(0x1000, 10, AllocSite::Unknown);
    let b = manager.allocate_fixed(0x1014, 10, AllocSite::Unknown);
    bind(&mut space, &a);
    bind(&mut space, &b);

    let mut solver = Z3Solver::default();
    let none = ConstraintSet::new();
    let any = ObjectPredicate::any();

    let hit = space
        .resolve_one(&mut solver, &none, Expr::pointer(0x1019), &any, None)
        .unwrap()
        .expect("address inside B");
    assert_eq!(hit.object.id, b.id);

    let gap = space
        .resolve_one(&mut solver, &none, Expr::pointer(0x100f), &any, None)
        .unwrap();
    assert!(gap.is_none());

    let start = space
        .resolve_one(&mut solver, &none, Expr::pointer(0x1000), &any, None)
        .unwrap()
        .expect("base of A");
    assert_eq!(start.object.id, a.id);
}

#[test]
fn test_gep_base_outside_object_excludes_it() {
    let mut manager = MemoryManager::default();
    let mut space = AddressSpace::new(ResolutionConfig::default());
    let a = manager.allocate_fixed(0x1000, 10, AllocSite::Unknown);
    let b = manager.allocate_fixed(0x1014, 10, AllocSite::Unknown);
    bind(&mut space, &a);
    bind(&mut space, &b);

    let mut solver = Z3Solver::default();
    let none = ConstraintSet::new();
    let from_a = Some(GepBase {
        base: Expr::pointer(0x1004),
    });
    let found = space
        .resolve_one(
            &mut solver,
            &none,
            Expr::pointer(0x1016),
            &ObjectPredicate::any(),
            from_a,
        )
        .unwrap();
    assert!(found.is_none());
}

#[test]
fn test_symbolic_pointer_resolution_and_timestamp_filter() {
    let mut manager = MemoryManager::default();
    let mut space = AddressSpace::new(ResolutionConfig::default());
    let early = manager
        .allocate(AllocationRequest::new(8).with_timestamp(1))
        .unwrap();
    let late = manager
        .allocate(AllocationRequest::new(8).with_timestamp(5))
        .unwrap();
    bind(&mut space, &early);
    bind(&mut space, &late);

    let pointer = symbolic_pointer("p_late");
    let constraints: ConstraintSet = [
        Expr::uge(pointer, Expr::pointer(late.address)),
        Expr::ult(pointer, Expr::pointer(late.address + 8)),
    ]
    .into_iter()
    .collect();
    let mut solver = Z3Solver::default();

    let unfiltered = space
        .resolve_one(&mut solver, &constraints, pointer, &ObjectPredicate::any(), None)
        .unwrap()
        .expect("pointer lies in the late object");
    assert_eq!(unfiltered.object.id, late.id);

    let old_only = ObjectPredicate::with_max_timestamp(3);
    assert!(space
        .resolve_one(&mut solver, &constraints, pointer, &old_only, None)
        .unwrap()
        .is_none());
    let list = space
        .resolve(&mut solver, &constraints, pointer, &old_only, 0, None, None)
        .unwrap();
    assert!(list.objects.is_empty());
    assert!(!list.incomplete);
}

#[test]
fn test_resolve_reports_incomplete_at_cap() {
    let mut manager = MemoryManager::default();
    let mut space = AddressSpace::new(ResolutionConfig::default());
    let a = manager.allocate(AllocationRequest::new(8)).unwrap();
    let b = manager.allocate(AllocationRequest::new(8)).unwrap();
    let c = manager.allocate(AllocationRequest::new(8)).unwrap();
    for object in [&a, &b, &c] {
        bind(&mut space, object);
    }

    let pointer = symbolic_pointer("p_alias");
    let constraints: ConstraintSet = std::iter::once(Expr::or(
        Expr::equal(pointer, Expr::pointer(a.address + 2)),
        Expr::equal(pointer, Expr::pointer(c.address + 6)),
    ))
    .collect();
    let mut solver = Z3Solver::default();
    let any = ObjectPredicate::any();

    let capped = space
        .resolve(&mut solver, &constraints, pointer, &any, 1, None, None)
        .unwrap();
    assert_eq!(capped.objects.len(), 1);
    assert!(capped.incomplete);

    let full = space
        .resolve(&mut solver, &constraints, pointer, &any, 0, None, None)
        .unwrap();
    let ids: HashSet<_> = full.ids().into_iter().collect();
    assert_eq!(ids, HashSet::from([a.id, c.id]));
    assert!(!full.incomplete);
}

#[test]
fn test_pointer_pinned_to_one_object_is_complete() {
    let mut manager = MemoryManager::default();
    let mut space = AddressSpace::new(ResolutionConfig::default());
    let a = manager.allocate(AllocationRequest::new(16)).unwrap();
    let b = manager.allocate(AllocationRequest::new(16)).unwrap();
    bind(&mut space, &a);
    bind(&mut space, &b);

    let pointer = symbolic_pointer("p_pinned");
    let constraints: ConstraintSet = [
        Expr::uge(pointer, Expr::pointer(b.address)),
        Expr::ult(pointer, Expr::pointer(b.address + 4)),
    ]
    .into_iter()
    .collect();
    let mut solver = Z3Solver::default();
    let list = space
        .resolve(
            &mut solver,
            &constraints,
            pointer,
            &ObjectPredicate::any(),
            1,
            None,
            None,
        )
        .unwrap();
    assert_eq!(list.ids(), vec![b.id]);
    assert!(!list.incomplete);
}

#[test]
fn test_state_resolution_honours_symbolic_only_filter() {
    let config = SpaceConfig {
        resolution: ResolutionConfig {
            use_timestamps: true,
            skip_not_symbolic_objects: true,
        },
        ..SpaceConfig::default()
    };
    let mut manager = MemoryManager::default();
    let mut state = ExecutionState::new(config);
    let plain = state
        .allocate(&mut manager, AllocationRequest::new(8))
        .unwrap();
    let input = state
        .allocate(&mut manager, AllocationRequest::new(8))
        .unwrap();
    state.add_symbolic(
        Arc::clone(&input),
        ArrayId::new("input", 8, ArraySource::Symbolic),
    );

    let pointer = symbolic_pointer("p_either");
    state.add_constraint(Expr::or(
        Expr::equal(pointer, Expr::pointer(plain.address)),
        Expr::equal(pointer, Expr::pointer(input.address)),
    ));
    let mut solver = Z3Solver::default();
    let list = state.resolve(&mut solver, pointer).unwrap();
    assert_eq!(list.ids(), vec![input.id]);
}

fn linear_scan(objects: &[Arc<MemoryObject>], address: u64) -> Option<u64> {
    objects
        .iter()
        .find(|object| object.contains_concrete(address, object.capacity))
        .map(|object| object.id)
}

#[test]
fn test_concrete_resolution_matches_linear_scan_proptest() {
    let mut runner = TestRunner::new(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    });
    let strategy = (prop::collection::vec(0u64..48, 1..12), any::<u32>());

    let result = runner.run(&strategy, |(capacities, probe)| {
        let mut manager = MemoryManager::default();
        let mut space = AddressSpace::new(ResolutionConfig::default());
        let objects: Vec<Arc<MemoryObject>> = capacities
            .iter()
            .map(|capacity| manager.allocate(AllocationRequest::new(*capacity)).unwrap())
            .collect();
        for object in &objects {
            bind(&mut space, object);
        }
        let first = objects[0].address;
        let last = &objects[objects.len() - 1];
        let span = last.address + last.capacity + 32 - first;
        let address = first - 16 + (probe as u64 % (span + 16));

        let mut solver = Z3Solver::default();
        let found = space
            .resolve_one(
                &mut solver,
                &ConstraintSet::new(),
                Expr::pointer(address),
                &ObjectPredicate::any(),
                None,
            )
            .map_err(|err| TestCaseError::fail(err.to_string()))?
            .map(|pair| pair.object.id);
        prop_assert_eq!(found, linear_scan(&objects, address));
        Ok(())
    });

    if let Err(err) = result {
        panic!("concrete resolution proptest failed: {err}");
    }
}

#[test]
fn test_resolve_past_deadline_is_incomplete() {
    let mut space = AddressSpace::new(ResolutionConfig::default());
    let (_, constraints, pointer) = three_way_alias(&mut space, "deadline_ptr");
    let mut solver = Z3Solver::default();
    let any = ObjectPredicate::any();

    let full = space
        .resolve(&mut solver, &constraints, pointer, &any, 0, None, None)
        .unwrap();
    assert_eq!(full.objects.len(), 3);
    assert!(!full.incomplete);

    let expired = space
        .resolve(
            &mut solver,
            &constraints,
            pointer,
            &any,
            0,
            Some(Duration::ZERO),
            None,
        )
        .unwrap();
    assert!(expired.incomplete);
    assert!(expired.objects.len() < 3);
}

#[test]
fn test_solver_failure_aborts_resolution() {
    let mut space = AddressSpace::new(ResolutionConfig::default());
    let (objects, constraints, pointer) = three_way_alias(&mut space, "failing_ptr");
    let any = ObjectPredicate::any();

    assert_eq!(
        space
            .resolve(&mut TimingOutSolver, &constraints, pointer, &any, 0, None, None)
            .unwrap_err(),
        SolverError::Timeout
    );
    assert_eq!(
        space
            .resolve_one(&mut TimingOutSolver, &constraints, pointer, &any, None)
            .unwrap_err(),
        SolverError::Timeout
    );

    let gep = Some(GepBase {
        base: symbolic_pointer("failing_base"),
    });
    let inside = Expr::pointer(objects[0].address + 2);
    assert_eq!(
        space
            .resolve_one(&mut TimingOutSolver, &constraints, inside, &any, gep)
            .unwrap_err(),
        SolverError::Timeout
    );
}
