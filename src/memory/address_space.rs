//! Copy-on-write address space and symbolic pointer resolution.
//!
//! Objects are kept in a persistent ordered map keyed by representative address, so branching a
//! space is a root-handle copy and each later mutation only clones the touched path. Every space
//! carries a copy-on-write epoch (`cow_key`); an `ObjectState` may only be mutated in place by
//! the space whose epoch it is stamped with.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use im::OrdMap;

use crate::error::{ContractViolation, SolverError};
use crate::expr::{ConstraintSet, Expr};
use crate::solver::Solver;
use crate::utils::config::ResolutionConfig;
use crate::utils::stats;

use super::object::{MemoryObject, ObjectId};
use super::object_state::ObjectState;
use super::predicate::ObjectPredicate;

static NEXT_COW_KEY: AtomicU64 = AtomicU64::new(1);

fn fresh_cow_key() -> u64 {
    NEXT_COW_KEY.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct ObjectKey {
    address: u64,
    id: ObjectId,
}

impl ObjectKey {
    fn of(object: &MemoryObject) -> Self {
        Self {
            address: object.address,
            id: object.id,
        }
    }

    /// Sorts after every object at `address`.
    fn upper(address: u64) -> Self {
        Self {
            address,
            id: ObjectId::MAX,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ObjectPair {
    pub object: Arc<MemoryObject>,
    pub state: Arc<ObjectState>,
}

/// A pointer known to be derived from `base` by pointer arithmetic. Resolution then also
/// requires `base` to lie inside the candidate object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GepBase {
    pub base: Expr,
}

/// Result of a multi-object resolution. `incomplete` means the candidate list may be missing
/// objects (result cap or timeout reached); it is not a negative answer.
#[derive(Clone, Debug, Default)]
pub struct ResolutionList {
    pub objects: Vec<ObjectPair>,
    pub incomplete: bool,
}

impl ResolutionList {
    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.iter().map(|pair| pair.object.id).collect()
    }
}

/// Buffer that concrete object bytes are synchronized with around external calls.
pub trait HostMemory {
    fn read(&self, address: u64, len: usize) -> Vec<u8>;
    fn write(&mut self, address: u64, bytes: &[u8]);
}

/// Sparse host buffer; unwritten bytes read as zero.
#[derive(Debug, Default, Clone)]
pub struct HostBuffer {
    bytes: BTreeMap<u64, u8>,
}

impl HostMemory for HostBuffer {
    fn read(&self, address: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| {
                self.bytes
                    .get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    fn write(&mut self, address: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.bytes.insert(address.wrapping_add(i as u64), *byte);
        }
    }
}

enum Probe {
    Continue,
    Complete,
    Incomplete,
}

pub struct AddressSpace {
    cow_key: u64,
    objects: OrdMap<ObjectKey, ObjectPair>,
    addresses: OrdMap<ObjectId, u64>,
    config: ResolutionConfig,
}

impl AddressSpace {
    pub fn new(config: ResolutionConfig) -> Self {
        Self {
            cow_key: fresh_cow_key(),
            objects: OrdMap::new(),
            addresses: OrdMap::new(),
            config,
        }
    }

    /// Forks this space. Both sides move to fresh epochs, so every state bound so far becomes
    /// a shared snapshot that either side must clone before writing.
    pub fn branch(&mut self) -> AddressSpace {
        self.cow_key = fresh_cow_key();
        AddressSpace {
            cow_key: fresh_cow_key(),
            objects: self.objects.clone(),
            addresses: self.addresses.clone(),
            config: self.config,
        }
    }

    pub fn cow_key(&self) -> u64 {
        self.cow_key
    }

    pub fn config(&self) -> ResolutionConfig {
        self.config
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectPair> {
        self.objects.values()
    }

    pub fn bind(
        &mut self,
        object: Arc<MemoryObject>,
        mut state: ObjectState,
    ) -> Result<(), ContractViolation> {
        if state.object_id() != object.id {
            return Err(ContractViolation::ObjectMismatch {
                object: object.id,
                state: state.object_id(),
            });
        }
        if state.owner != 0 && state.owner != self.cow_key {
            return Err(ContractViolation::AlreadyOwned {
                object: object.id,
                owner: state.owner,
                epoch: self.cow_key,
            });
        }
        state.owner = self.cow_key;
        self.insert(object, Arc::new(state));
        Ok(())
    }

    fn insert(&mut self, object: Arc<MemoryObject>, state: Arc<ObjectState>) {
        if let Some(previous) = self.addresses.insert(object.id, object.address) {
            self.objects.remove(&ObjectKey {
                address: previous,
                id: object.id,
            });
        }
        self.objects
            .insert(ObjectKey::of(&object), ObjectPair { object, state });
    }

    pub fn unbind(&mut self, object: &MemoryObject) -> Option<ObjectPair> {
        let address = self.addresses.remove(&object.id)?;
        self.objects.remove(&ObjectKey {
            address,
            id: object.id,
        })
    }

    pub fn find(&self, object: &MemoryObject) -> Option<&ObjectPair> {
        self.objects.get(&ObjectKey::of(object))
    }

    pub fn find_by_id(&self, id: ObjectId) -> Option<&ObjectPair> {
        let address = *self.addresses.get(&id)?;
        self.objects.get(&ObjectKey { address, id })
    }

    /// Mutable state for `object` in this epoch, cloning a shared snapshot on first write.
    pub fn get_writeable(
        &mut self,
        object: &MemoryObject,
    ) -> Result<&mut ObjectState, ContractViolation> {
        let cow_key = self.cow_key;
        let pair = self
            .objects
            .get_mut(&ObjectKey::of(object))
            .ok_or(ContractViolation::NotBound(object.id))?;
        if pair.state.is_read_only() {
            return Err(ContractViolation::ReadOnly(object.id));
        }
        if pair.state.owner != cow_key {
            let mut copy = ObjectState::clone(&pair.state);
            copy.owner = cow_key;
            pair.state = Arc::new(copy);
        }
        Ok(Arc::make_mut(&mut pair.state))
    }

    fn lookup_previous(&self, address: u64) -> Option<&ObjectPair> {
        self.objects
            .range(..=ObjectKey::upper(address))
            .next_back()
            .map(|(_, pair)| pair)
    }

    fn in_bounds(object: &MemoryObject, pointer: Expr, gep: Option<GepBase>) -> Expr {
        let check = object.bounds_check_pointer(pointer);
        match gep {
            Some(gep) if gep.base != pointer => {
                Expr::and(check, object.bounds_check_pointer(gep.base))
            }
            _ => check,
        }
    }

    /// Object containing the concrete `address`, if any.
    pub fn resolve_one_concrete(
        &self,
        solver: &mut dyn Solver,
        constraints: &ConstraintSet,
        address: u64,
        gep: Option<GepBase>,
    ) -> Result<Option<ObjectPair>, SolverError> {
        let Some(pair) = self.lookup_previous(address) else {
            return Ok(None);
        };
        let object = &pair.object;
        let hit = match object.concrete_size() {
            Some(size) if gep.is_none() => {
                object.contains_concrete(address, size)
            }
            _ => {
                let check = Self::in_bounds(object, Expr::pointer(address), gep);
                solver.may_be_true(constraints, check)?
            }
        };
        Ok(hit.then(|| pair.clone()))
    }

    /// Some object `pointer` may point into, searching outward from one feasible example
    /// value.
    pub fn resolve_one(
        &self,
        solver: &mut dyn Solver,
        constraints: &ConstraintSet,
        pointer: Expr,
        predicate: &ObjectPredicate,
        gep: Option<GepBase>,
    ) -> Result<Option<ObjectPair>, SolverError> {
        let started = Instant::now();
        let result = self.resolve_one_inner(solver, constraints, pointer, predicate, gep);
        stats::record_resolution(started.elapsed());
        result
    }

    fn resolve_one_inner(
        &self,
        solver: &mut dyn Solver,
        constraints: &ConstraintSet,
        pointer: Expr,
        predicate: &ObjectPredicate,
        gep: Option<GepBase>,
    ) -> Result<Option<ObjectPair>, SolverError> {
        if let Some(address) = pointer.as_constant() {
            let found = self.resolve_one_concrete(solver, constraints, address as u64, gep)?;
            return Ok(found.filter(|pair| predicate.matches(&pair.object)));
        }

        let example = solver.get_value(constraints, pointer)? as u64;
        if let Some(pair) = self.resolve_one_concrete(solver, constraints, example, gep)? {
            if predicate.matches(&pair.object) {
                tracing::debug!(
                    "[RESOLVE] example {:#x} hit object {} directly",
                    example,
                    pair.object.id
                );
                return Ok(Some(pair));
            }
        }

        let pivot = ObjectKey::upper(example);
        for (_, pair) in self.objects.range(..=pivot).rev() {
            let object = &pair.object;
            if !predicate.matches(object) {
                continue;
            }
            let check = Self::in_bounds(object, pointer, gep);
            if solver.may_be_true(constraints, check)? {
                return Ok(Some(pair.clone()));
            }
            if solver.must_be_true(constraints, Expr::uge(pointer, object.base))? {
                break;
            }
        }

        for (_, pair) in self
            .objects
            .range((Bound::Excluded(pivot), Bound::Unbounded))
        {
            let object = &pair.object;
            if !predicate.matches(object) {
                continue;
            }
            if solver.must_be_true(constraints, Expr::ult(pointer, object.base))? {
                break;
            }
            let check = Self::in_bounds(object, pointer, gep);
            if solver.may_be_true(constraints, check)? {
                return Ok(Some(pair.clone()));
            }
        }
        Ok(None)
    }

    fn probe(
        solver: &mut dyn Solver,
        constraints: &ConstraintSet,
        pair: &ObjectPair,
        pointer: Expr,
        gep: Option<GepBase>,
        max_resolutions: usize,
        list: &mut ResolutionList,
    ) -> Result<Probe, SolverError> {
        let check = Self::in_bounds(&pair.object, pointer, gep);
        if !solver.may_be_true(constraints, check)? {
            return Ok(Probe::Continue);
        }
        list.objects.push(pair.clone());
        if list.objects.len() == 1 && solver.must_be_true(constraints, check)? {
            return Ok(Probe::Complete);
        }
        if max_resolutions != 0 && list.objects.len() >= max_resolutions {
            return Ok(Probe::Incomplete);
        }
        Ok(Probe::Continue)
    }

    /// Every object `pointer` may point into, up to `max_resolutions` (0 for no cap).
    ///
    /// Hitting the cap or the wall-clock `timeout` yields an incomplete list. Solver failures
    /// abort the whole resolution.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        &self,
        solver: &mut dyn Solver,
        constraints: &ConstraintSet,
        pointer: Expr,
        predicate: &ObjectPredicate,
        max_resolutions: usize,
        timeout: Option<Duration>,
        gep: Option<GepBase>,
    ) -> Result<ResolutionList, SolverError> {
        let started = Instant::now();
        let result = self.resolve_inner(
            solver,
            constraints,
            pointer,
            predicate,
            max_resolutions,
            timeout,
            gep,
            started,
        );
        stats::record_resolution(started.elapsed());
        if let Ok(list) = &result {
            tracing::debug!(
                "[RESOLVE] {} candidate(s) for {} (incomplete: {})",
                list.objects.len(),
                pointer,
                list.incomplete
            );
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_inner(
        &self,
        solver: &mut dyn Solver,
        constraints: &ConstraintSet,
        pointer: Expr,
        predicate: &ObjectPredicate,
        max_resolutions: usize,
        timeout: Option<Duration>,
        gep: Option<GepBase>,
        started: Instant,
    ) -> Result<ResolutionList, SolverError> {
        let mut list = ResolutionList::default();
        if let Some(address) = pointer.as_constant() {
            if let Some(pair) =
                self.resolve_one_concrete(solver, constraints, address as u64, gep)?
            {
                if predicate.matches(&pair.object) {
                    list.objects.push(pair);
                }
            }
            return Ok(list);
        }

        let expired = || timeout.is_some_and(|limit| started.elapsed() > limit);
        let example = solver.get_value(constraints, pointer)? as u64;
        let pivot = ObjectKey::upper(example);

        for (_, pair) in self.objects.range(..=pivot).rev() {
            if expired() {
                list.incomplete = true;
                return Ok(list);
            }
            if !predicate.matches(&pair.object) {
                continue;
            }
            match Self::probe(
                solver,
                constraints,
                pair,
                pointer,
                gep,
                max_resolutions,
                &mut list,
            )? {
                Probe::Complete => return Ok(list),
                Probe::Incomplete => {
                    list.incomplete = true;
                    return Ok(list);
                }
                Probe::Continue => {}
            }
            if solver.must_be_true(constraints, Expr::uge(pointer, pair.object.base))? {
                break;
            }
        }

        for (_, pair) in self
            .objects
            .range((Bound::Excluded(pivot), Bound::Unbounded))
        {
            if expired() {
                list.incomplete = true;
                return Ok(list);
            }
            if !predicate.matches(&pair.object) {
                continue;
            }
            if solver.must_be_true(constraints, Expr::ult(pointer, pair.object.base))? {
                break;
            }
            match Self::probe(
                solver,
                constraints,
                pair,
                pointer,
                gep,
                max_resolutions,
                &mut list,
            )? {
                Probe::Complete => return Ok(list),
                Probe::Incomplete => {
                    list.incomplete = true;
                    return Ok(list);
                }
                Probe::Continue => {}
            }
        }
        Ok(list)
    }

    /// Writes the concrete cache of every non-user-specified, writable object out to `host`.
    /// Read-only objects are expected to already hold their contents on the host side.
    pub fn copy_out_concretes(&self, host: &mut dyn HostMemory) {
        for pair in self.objects.values() {
            if pair.object.flags.is_user_specified || pair.state.is_read_only() {
                continue;
            }
            host.write(pair.object.address, pair.state.concrete_store());
        }
    }

    /// Pulls host bytes back into every non-user-specified object. Fails if the host changed
    /// a read-only object.
    pub fn copy_in_concretes(&mut self, host: &dyn HostMemory) -> Result<(), ContractViolation> {
        let candidates: Vec<Arc<MemoryObject>> = self
            .objects
            .values()
            .filter(|pair| !pair.object.flags.is_user_specified)
            .map(|pair| Arc::clone(&pair.object))
            .collect();
        for object in candidates {
            let Some(pair) = self.find(&object) else {
                continue;
            };
            let current = pair.state.concrete_store();
            let incoming = host.read(object.address, current.len());
            if incoming.as_slice() == current {
                continue;
            }
            if pair.state.is_read_only() {
                tracing::warn!(
                    "[MEMORY] external write to read-only object {} at {:#x}",
                    object.id,
                    object.address
                );
                return Err(ContractViolation::ReadOnly(object.id));
            }
            let state = self.get_writeable(&object)?;
            state.concrete_store_mut().copy_from_slice(&incoming);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::{AllocationRequest, MemoryManager};

    fn bound(
        space: &mut AddressSpace,
        manager: &mut MemoryManager,
        size: u64,
    ) -> Arc<MemoryObject> {
        let mo = manager.allocate(AllocationRequest::new(size)).unwrap();
        space.bind(Arc::clone(&mo), ObjectState::new(&mo)).unwrap();
        mo
    }

    #[test]
    fn bind_then_find_returns_state() {
        let mut manager = MemoryManager::default();
        let mut space = AddressSpace::new(ResolutionConfig::default());
        let mo = bound(&mut space, &mut manager, 8);
        assert_eq!(space.find(&mo).unwrap().object.id, mo.id);
        assert_eq!(space.find_by_id(mo.id).unwrap().state.owner(), space.cow_key());
        assert!(space.unbind(&mo).is_some());
        assert!(space.find_by_id(mo.id).is_none());
    }

    #[test]
    fn bind_rejects_foreign_owner() {
        let mut manager = MemoryManager::default();
        let mut first = AddressSpace::new(ResolutionConfig::default());
        let mut second = AddressSpace::new(ResolutionConfig::default());
        let mo = bound(&mut first, &mut manager, 4);
        let owned = ObjectState::clone(&first.find(&mo).unwrap().state);
        assert!(matches!(
            second.bind(Arc::clone(&mo), owned),
            Err(ContractViolation::AlreadyOwned { .. })
        ));
    }

    #[test]
    fn get_writeable_is_stable_within_epoch_and_copies_across() {
        let mut manager = MemoryManager::default();
        let mut space = AddressSpace::new(ResolutionConfig::default());
        let mo = bound(&mut space, &mut manager, 4);
        space
            .get_writeable(&mo)
            .unwrap()
            .write_bytes(0, &[1, 2, 3, 4])
            .unwrap();

        let first: *const ObjectState = space.get_writeable(&mo).unwrap();
        let second: *const ObjectState = space.get_writeable(&mo).unwrap();
        assert_eq!(first, second);

        let mut child = space.branch();
        let shared: *const ObjectState = Arc::as_ptr(&child.find(&mo).unwrap().state);
        let copied = child.get_writeable(&mo).unwrap();
        assert_ne!(copied as *const ObjectState, shared);
        assert_eq!(copied.concrete_store(), &[1, 2, 3, 4]);
        copied.write8(0, Expr::constant(9, 8)).unwrap();
        assert_eq!(space.find(&mo).unwrap().state.concrete_store()[0], 1);
    }

    #[test]
    fn host_round_trip_and_read_only_guard() {
        let mut manager = MemoryManager::default();
        let mut space = AddressSpace::new(ResolutionConfig::default());
        let rw = bound(&mut space, &mut manager, 4);
        let ro = bound(&mut space, &mut manager, 2);
        space.get_writeable(&rw).unwrap().write_bytes(0, &[1, 2, 3, 4]).unwrap();
        space.get_writeable(&ro).unwrap().write_bytes(0, &[5, 6]).unwrap();
        space.get_writeable(&ro).unwrap().set_read_only(true);

        let mut host = HostBuffer::default();
        space.copy_out_concretes(&mut host);
        assert_eq!(host.read(rw.address, 4), vec![1, 2, 3, 4]);
        assert_eq!(host.read(ro.address, 2), vec![0, 0]);

        host.write(ro.address, &[5, 6]);
        host.write(rw.address, &[7, 7, 7, 7]);
        space.copy_in_concretes(&host).unwrap();
        assert_eq!(space.find(&rw).unwrap().state.concrete_store(), &[7, 7, 7, 7]);

        host.write(ro.address, &[0]);
        assert_eq!(
            space.copy_in_concretes(&host),
            Err(ContractViolation::ReadOnly(ro.id))
        );
    }
}
