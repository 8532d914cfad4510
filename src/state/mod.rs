//! Per-path execution state: address space, path constraints and symcrete bookkeeping.

pub mod symcretes;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ContractViolation, Result, SolverError};
use crate::expr::{u64_to_bytes, ArrayId, ArraySource, Assignment, ConstraintSet, Expr};
use crate::memory::{
    AddressSpace, AllocSite, AllocationRequest, GepBase, MemoryManager, MemoryObject,
    ObjectFlags, ObjectPair, ObjectPredicate, ObjectState, ResolutionList,
};
use crate::solver::Solver;
use crate::utils::config::SpaceConfig;
use crate::utils::stats;

pub use symcretes::Symcretes;

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

const POINTER_BYTES: usize = 8;

#[derive(Clone, Debug, Default)]
pub struct StackFrame {
    allocas: Vec<Arc<MemoryObject>>,
}

impl StackFrame {
    pub fn allocas(&self) -> &[Arc<MemoryObject>] {
        &self.allocas
    }
}

/// Where an updated size symcrete's object ends up.
struct Placement {
    size: ArrayId,
    address: ArrayId,
    object: Arc<MemoryObject>,
    growth: Option<(Arc<MemoryObject>, ObjectState)>,
}

pub struct ExecutionState {
    id: u64,
    config: SpaceConfig,
    address_space: AddressSpace,
    constraints: ConstraintSet,
    symcretes: Symcretes,
    symbolics: im::Vector<(Arc<MemoryObject>, ArrayId)>,
    stack: Vec<StackFrame>,
    /// Pointer -> object its value was derived from.
    pointer_bases: im::HashMap<Expr, Arc<MemoryObject>>,
    /// Pointer -> root pointer of the arithmetic that produced it.
    gep_bases: im::HashMap<Expr, Expr>,
    clock: u64,
}

impl ExecutionState {
    pub fn new(config: SpaceConfig) -> Self {
        Self {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            address_space: AddressSpace::new(config.resolution),
            config,
            constraints: ConstraintSet::new(),
            symcretes: Symcretes::new(),
            symbolics: im::Vector::new(),
            stack: Vec::new(),
            pointer_bases: im::HashMap::new(),
            gep_bases: im::HashMap::new(),
            clock: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    /// Forks the state. Persistent collections make this a handle copy; both address spaces
    /// move to fresh copy-on-write epochs.
    pub fn branch(&mut self) -> ExecutionState {
        let address_space = self.address_space.branch();
        ExecutionState {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            config: self.config.clone(),
            address_space,
            constraints: self.constraints.clone(),
            symcretes: self.symcretes.clone(),
            symbolics: self.symbolics.clone(),
            stack: self.stack.clone(),
            pointer_bases: self.pointer_bases.clone(),
            gep_bases: self.gep_bases.clone(),
            clock: self.clock,
        }
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    pub fn address_space_mut(&mut self) -> &mut AddressSpace {
        &mut self.address_space
    }

    /// Path constraints as added, before symcrete substitution.
    pub fn constraints(&self) -> &ConstraintSet {
        &self.constraints
    }

    /// Path constraints under the current symcrete bindings, binding equalities included.
    /// This is the set queries are asked against.
    pub fn constraints_with_symcretes(&self) -> &ConstraintSet {
        self.symcretes.constraints()
    }

    pub fn symcretes(&self) -> &Symcretes {
        &self.symcretes
    }

    pub fn symbolics(&self) -> impl Iterator<Item = &(Arc<MemoryObject>, ArrayId)> {
        self.symbolics.iter()
    }

    pub fn stack(&self) -> &[StackFrame] {
        &self.stack
    }

    /// Current allocation timestamp; the next object gets this value.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn advance_clock(&mut self) -> u64 {
        let now = self.clock;
        self.clock += 1;
        now
    }

    pub fn add_constraint(&mut self, constraint: Expr) {
        if self.constraints.add(constraint) {
            self.symcretes.add_constraint(constraint);
        }
    }

    pub fn evaluate_with_symcretes(&self, expr: Expr) -> Expr {
        self.symcretes.evaluate(expr)
    }

    pub fn push_frame(&mut self) {
        self.stack.push(StackFrame::default());
    }

    /// Pops the innermost frame and unbinds its local allocations.
    pub fn pop_frame(&mut self) -> Result<StackFrame> {
        let frame = self.stack.pop().ok_or(ContractViolation::EmptyStack)?;
        for object in &frame.allocas {
            self.address_space.unbind(object);
        }
        Ok(frame)
    }

    /// Allocates and binds a zero-filled object stamped with the current clock. Local objects
    /// are owned by the innermost frame.
    pub fn allocate(
        &mut self,
        manager: &mut MemoryManager,
        request: AllocationRequest,
    ) -> Result<Arc<MemoryObject>> {
        if request.flags.is_local && self.stack.is_empty() {
            return Err(ContractViolation::EmptyStack.into());
        }
        let timestamp = self.advance_clock();
        let object = manager.allocate(request.with_timestamp(timestamp))?;
        self.address_space
            .bind(Arc::clone(&object), ObjectState::new(&object))?;
        if object.flags.is_local {
            if let Some(frame) = self.stack.last_mut() {
                frame.allocas.push(Arc::clone(&object));
            }
        }
        Ok(object)
    }

    /// Allocates an object whose size and base are symbolic, pinned by fresh size and address
    /// symcretes to `initial_size` and the representative address.
    pub fn allocate_with_symbolic_size(
        &mut self,
        manager: &mut MemoryManager,
        name: &str,
        initial_size: u64,
        flags: ObjectFlags,
        site: AllocSite,
    ) -> Result<Arc<MemoryObject>> {
        let size = ArrayId::new(
            format!("{name}.size"),
            POINTER_BYTES as u64,
            ArraySource::SymbolicSize,
        );
        let address = ArrayId::new(
            format!("{name}.address"),
            POINTER_BYTES as u64,
            ArraySource::SymbolicAddress,
        );
        let request = AllocationRequest::new(initial_size)
            .with_size(Expr::whole_array(size))
            .with_base(Expr::whole_array(address))
            .with_flags(flags)
            .with_site(site);
        let object = self.allocate(manager, request)?;
        self.symcretes
            .add(size, u64_to_bytes(initial_size, POINTER_BYTES))?;
        self.symcretes
            .add(address, u64_to_bytes(object.address, POINTER_BYTES))?;
        self.symcretes
            .register_object(size, address, Arc::clone(&object));
        tracing::debug!(
            "[SYMCRETE] object {} has symbolic size {} (initially {})",
            object.id,
            size.name(),
            initial_size
        );
        Ok(object)
    }

    pub fn add_symcrete(&mut self, array: ArrayId, bytes: Vec<u8>) -> Result<()> {
        self.symcretes.add(array, bytes)?;
        Ok(())
    }

    /// Marks `object` as holding the symbolic input `array`.
    pub fn add_symbolic(&mut self, object: Arc<MemoryObject>, array: ArrayId) {
        self.symbolics.push_back((object, array));
    }

    pub fn record_pointer_base(&mut self, pointer: Expr, object: Arc<MemoryObject>) {
        self.pointer_bases.insert(pointer, object);
    }

    /// Records that `result` was computed from `base` by pointer arithmetic.
    pub fn record_gep(&mut self, result: Expr, base: Expr) {
        let root = self.gep_bases.get(&base).copied().unwrap_or(base);
        self.gep_bases.insert(result, root);
        if let Some(object) = self.pointer_bases.get(&base).cloned() {
            self.pointer_bases.insert(result, object);
        }
    }

    pub fn gep_base(&self, pointer: Expr) -> Option<GepBase> {
        self.gep_bases
            .get(&pointer)
            .map(|base| GepBase { base: *base })
    }

    fn base_object(&self, pointer: Expr) -> Option<&Arc<MemoryObject>> {
        self.pointer_bases.get(&pointer).or_else(|| {
            let root = self.gep_bases.get(&pointer)?;
            self.pointer_bases.get(root)
        })
    }

    /// Candidate filter derived from the resolution config.
    pub fn resolution_predicate(&self, pointer: Expr) -> ObjectPredicate {
        let resolution = self.address_space.config();
        let mut predicate = ObjectPredicate::any();
        if resolution.use_timestamps {
            if let Some(base) = self.base_object(pointer) {
                predicate = predicate.and(ObjectPredicate::with_max_timestamp(base.timestamp));
            }
        }
        if resolution.skip_not_symbolic_objects {
            let ids: HashSet<_> = self.symbolics.iter().map(|(object, _)| object.id).collect();
            predicate = predicate.and(ObjectPredicate::only_objects(ids));
        }
        predicate
    }

    pub fn resolve_one(
        &self,
        solver: &mut dyn Solver,
        pointer: Expr,
    ) -> std::result::Result<Option<ObjectPair>, SolverError> {
        let predicate = self.resolution_predicate(pointer);
        self.address_space.resolve_one(
            solver,
            self.constraints_with_symcretes(),
            pointer,
            &predicate,
            self.gep_base(pointer),
        )
    }

    pub fn resolve(
        &self,
        solver: &mut dyn Solver,
        pointer: Expr,
    ) -> std::result::Result<ResolutionList, SolverError> {
        let predicate = self.resolution_predicate(pointer);
        self.address_space.resolve(
            solver,
            self.constraints_with_symcretes(),
            pointer,
            &predicate,
            self.config.max_resolutions,
            self.config.resolve_timeout(),
            self.gep_base(pointer),
        )
    }

    /// Applies repaired size bindings.
    ///
    /// Every binding is re-derived from scratch: the new size bindings replace the old ones,
    /// the address bindings paired with them are dropped, and all path constraints are
    /// substituted again. Objects whose new size no longer fits are reallocated with
    /// `max(2 * capacity, size)` bytes, keep their contents and are linked to the object they
    /// replace through `parent`.
    ///
    /// All validation and reallocation happens before any binding is touched, so an error
    /// leaves the state as it was.
    pub fn update_symcretes(
        &mut self,
        manager: &mut MemoryManager,
        assignment: &Assignment,
    ) -> Result<()> {
        let mut working = self.symcretes.bindings().clone();
        let mut updated = Vec::with_capacity(assignment.len());
        for (size, bytes) in assignment.iter() {
            let object = self
                .symcretes
                .object_of_size(size)
                .ok_or_else(|| ContractViolation::UnknownSizeSymcrete(size.name()))?;
            if size.size() != bytes.len() as u64 {
                return Err(ContractViolation::SymcreteLengthMismatch {
                    array: size.name(),
                    declared: size.size(),
                    actual: bytes.len(),
                }
                .into());
            }
            let address = self
                .symcretes
                .address_array(object.id)
                .ok_or_else(|| ContractViolation::UnknownSizeSymcrete(size.name()))?;
            working.remove(&address);
            working.insert(size, bytes.to_vec());
            updated.push((size, address, Arc::clone(object)));
        }

        let values = Assignment::from_bindings(working.clone());
        let mut placements = Vec::with_capacity(updated.len());
        for (size, address, object) in updated {
            let concrete = values
                .evaluate(object.size)
                .as_constant()
                .and_then(|value| u64::try_from(value).ok())
                .ok_or_else(|| ContractViolation::SizeNotConcretized(size.name()))?;
            let growth = if concrete <= object.capacity {
                None
            } else {
                Some(self.prepare_growth(manager, &object, concrete)?)
            };
            placements.push(Placement {
                size,
                address,
                object,
                growth,
            });
        }

        let saved = self.symcretes.clone();
        if let Err(err) = self.rebind_symcretes(working, &placements) {
            self.symcretes = saved;
            return Err(err);
        }
        for placement in placements {
            if let Some((grown, contents)) = placement.growth {
                self.install_growth(&placement.object, grown, contents)?;
            }
        }
        Ok(())
    }

    fn rebind_symcretes(
        &mut self,
        working: im::OrdMap<ArrayId, Vec<u8>>,
        placements: &[Placement],
    ) -> Result<()> {
        self.symcretes.clear();
        for (array, bytes) in working {
            self.symcretes.add(array, bytes)?;
        }
        for constraint in self.constraints.iter() {
            self.symcretes.add_constraint(constraint);
        }
        for placement in placements {
            let target = placement
                .growth
                .as_ref()
                .map_or(&placement.object, |(grown, _)| grown);
            self.symcretes.add(
                placement.address,
                u64_to_bytes(target.address, POINTER_BYTES),
            )?;
            if placement.growth.is_some() {
                self.symcretes.move_object(placement.size, Arc::clone(target));
            }
        }
        Ok(())
    }

    /// Allocates the replacement for `object` and builds its contents without touching the
    /// address space.
    fn prepare_growth(
        &self,
        manager: &mut MemoryManager,
        object: &Arc<MemoryObject>,
        size: u64,
    ) -> Result<(Arc<MemoryObject>, ObjectState)> {
        let capacity = object
            .capacity
            .saturating_mul(2)
            .min(manager.max_object_size())
            .max(size);
        let previous = self
            .address_space
            .find(object)
            .map(|pair| Arc::clone(&pair.state))
            .ok_or(ContractViolation::NotBound(object.id))?;
        let request = AllocationRequest::new(capacity)
            .with_size(object.size)
            .with_base(object.base)
            .with_flags(object.flags)
            .with_site(object.site.clone())
            .with_alignment(object.alignment)
            .with_timestamp(object.timestamp)
            .with_parent(Arc::clone(object));
        let grown = manager.allocate(request)?;
        let input = self
            .symbolics
            .iter()
            .find(|(symbolic, _)| symbolic.id == object.id)
            .map(|(_, array)| *array);
        let contents = ObjectState::grown_from(&grown, &previous, input);
        Ok((grown, contents))
    }

    fn install_growth(
        &mut self,
        object: &Arc<MemoryObject>,
        grown: Arc<MemoryObject>,
        contents: ObjectState,
    ) -> Result<()> {
        self.address_space.bind(Arc::clone(&grown), contents)?;
        self.address_space.unbind(object);
        self.replace_object(object, &grown);
        stats::record_growth();
        tracing::info!(
            "[SYMCRETE] grew object {} ({} bytes) into object {} ({} bytes) at {:#x}",
            object.id,
            object.capacity,
            grown.id,
            grown.capacity,
            grown.address
        );
        Ok(())
    }

    fn replace_object(&mut self, old: &Arc<MemoryObject>, new: &Arc<MemoryObject>) {
        for entry in self.symbolics.iter_mut() {
            if entry.0.id == old.id {
                entry.0 = Arc::clone(new);
            }
        }
        for frame in &mut self.stack {
            for alloca in &mut frame.allocas {
                if alloca.id == old.id {
                    *alloca = Arc::clone(new);
                }
            }
        }
        let stale: Vec<Expr> = self
            .pointer_bases
            .iter()
            .filter(|(_, object)| object.id == old.id)
            .map(|(pointer, _)| *pointer)
            .collect();
        for pointer in stale {
            self.pointer_bases.insert(pointer, Arc::clone(new));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_frame_unbinds_locals() {
        let mut manager = MemoryManager::default();
        let mut state = ExecutionState::new(SpaceConfig::default());
        let local = AllocationRequest::new(4).with_flags(ObjectFlags {
            is_local: true,
            ..ObjectFlags::default()
        });
        assert!(state.allocate(&mut manager, local.clone()).is_err());

        state.push_frame();
        let object = state.allocate(&mut manager, local).unwrap();
        let global = state
            .allocate(&mut manager, AllocationRequest::new(4))
            .unwrap();
        assert_eq!(state.pop_frame().unwrap().allocas().len(), 1);
        assert!(state.address_space().find(&object).is_none());
        assert!(state.address_space().find(&global).is_some());
        assert!(state.pop_frame().is_err());
    }

    #[test]
    fn allocations_are_stamped_in_order() {
        let mut manager = MemoryManager::default();
        let mut state = ExecutionState::new(SpaceConfig::default());
        let first = state
            .allocate(&mut manager, AllocationRequest::new(1))
            .unwrap();
        let second = state
            .allocate(&mut manager, AllocationRequest::new(1))
            .unwrap();
        assert!(first.timestamp < second.timestamp);
        assert_eq!(state.clock(), 2);
    }

    #[test]
    fn branch_shares_constraints_but_not_writes() {
        let mut manager = MemoryManager::default();
        let mut state = ExecutionState::new(SpaceConfig::default());
        let object = state
            .allocate(&mut manager, AllocationRequest::new(2))
            .unwrap();
        let input = ArrayId::new("branch", 1, ArraySource::Symbolic);
        state.add_constraint(Expr::ult(
            Expr::read(input, Expr::pointer(0)),
            Expr::constant(3, 8),
        ));

        let mut child = state.branch();
        assert_ne!(child.id(), state.id());
        assert_eq!(child.constraints().len(), 1);
        child
            .address_space_mut()
            .get_writeable(&object)
            .unwrap()
            .write_bytes(0, &[9, 9])
            .unwrap();
        let parent_bytes = state.address_space().find(&object).unwrap().state.clone();
        assert_eq!(parent_bytes.concrete_store(), &[0, 0]);
    }

    #[test]
    fn gep_results_inherit_base_object() {
        let mut manager = MemoryManager::default();
        let mut state = ExecutionState::new(SpaceConfig::default());
        let object = state
            .allocate(&mut manager, AllocationRequest::new(16))
            .unwrap();
        let offset = ArrayId::new("offset", 1, ArraySource::Symbolic);
        let base = object.base;
        let step = Expr::add(base, Expr::zext(Expr::read(offset, Expr::pointer(0)), 64));
        let further = Expr::add(step, Expr::pointer(1));
        state.record_pointer_base(base, Arc::clone(&object));
        state.record_gep(step, base);
        state.record_gep(further, step);

        assert_eq!(state.gep_base(further), Some(GepBase { base }));
        assert!(!state.resolution_predicate(further).is_trivial());
    }
}
