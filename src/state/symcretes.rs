//! Symcrete bookkeeping for one execution state.
//!
//! A symcrete is a symbolic array (an object's size or address) temporarily pinned to concrete
//! bytes. Pinning is expressed as an equality constraint in a secondary, substituted
//! constraint set; every constraint in that set remembers which bound arrays it was derived
//! from so the repair engine can later tell which bindings a proof leaned on.

use std::collections::BTreeSet;
use std::sync::Arc;

use im::{HashMap, OrdMap};

use crate::error::ContractViolation;
use crate::expr::{ArrayId, ConstraintSet, Expr, MAX_WIDTH};
use crate::memory::{MemoryObject, ObjectId};

/// Substituted constraint -> bound arrays it depends on.
pub type Dependencies = HashMap<Expr, BTreeSet<ArrayId>>;

/// `array == bytes`, read little-endian as one value when it fits in an expression.
pub fn binding_equality(array: ArrayId, bytes: &[u8]) -> Expr {
    if !bytes.is_empty() && bytes.len() * 8 <= MAX_WIDTH as usize {
        let value = bytes
            .iter()
            .rev()
            .fold(0u128, |acc, byte| (acc << 8) | *byte as u128);
        let read = Expr::whole_array(array);
        return Expr::equal(read, Expr::constant(value, read.width()));
    }
    Expr::all(bytes.iter().enumerate().map(|(i, byte)| {
        Expr::equal(
            Expr::read(array, Expr::pointer(i as u64)),
            Expr::constant(*byte as u128, 8),
        )
    }))
}

/// Merges `arrays` into the dependencies of `key`. Constants other than `false` carry no
/// information and are never keys.
pub(crate) fn register(dependencies: &mut Dependencies, key: Expr, arrays: BTreeSet<ArrayId>) {
    if arrays.is_empty() || (key.is_constant() && !key.is_false()) {
        return;
    }
    let mut merged = dependencies.get(&key).cloned().unwrap_or_default();
    merged.extend(arrays);
    dependencies.insert(key, merged);
}

#[derive(Clone, Debug, Default)]
pub struct Symcretes {
    bindings: OrdMap<ArrayId, Vec<u8>>,
    evaluated: ConstraintSet,
    dependencies: Dependencies,
    size_objects: OrdMap<ArrayId, Arc<MemoryObject>>,
    address_arrays: OrdMap<ObjectId, ArrayId>,
}

impl Symcretes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bindings(&self) -> &OrdMap<ArrayId, Vec<u8>> {
        &self.bindings
    }

    pub fn is_bound(&self, array: ArrayId) -> bool {
        self.bindings.contains_key(&array)
    }

    pub fn binding(&self, array: ArrayId) -> Option<&[u8]> {
        self.bindings.get(&array).map(Vec::as_slice)
    }

    pub fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    /// Constraints after substituting every binding, symcrete equalities included.
    pub fn constraints(&self) -> &ConstraintSet {
        &self.evaluated
    }

    pub fn is_size_symcrete(&self, array: ArrayId) -> bool {
        self.size_objects.contains_key(&array)
    }

    pub fn object_of_size(&self, array: ArrayId) -> Option<&Arc<MemoryObject>> {
        self.size_objects.get(&array)
    }

    pub fn address_array(&self, object: ObjectId) -> Option<ArrayId> {
        self.address_arrays.get(&object).copied()
    }

    pub fn size_arrays(&self) -> impl Iterator<Item = ArrayId> + '_ {
        self.size_objects.keys().copied()
    }

    /// Substitutes the bound bytes into `expr`; reads of unbound arrays are kept.
    pub fn evaluate(&self, expr: Expr) -> Expr {
        if self.bindings.is_empty() {
            return expr;
        }
        expr.map_reads(|array, index| {
            let bytes = self.bindings.get(&array)?;
            let offset = usize::try_from(index.as_constant()?).ok()?;
            bytes
                .get(offset)
                .map(|byte| Expr::constant(*byte as u128, 8))
        })
    }

    fn bound_arrays(&self, expr: Expr) -> BTreeSet<ArrayId> {
        expr.arrays()
            .into_iter()
            .filter(|array| self.is_bound(*array))
            .collect()
    }

    /// Pins `array` to `bytes`.
    pub fn add(&mut self, array: ArrayId, bytes: Vec<u8>) -> Result<(), ContractViolation> {
        if !array.is_symbolic() {
            return Err(ContractViolation::NotSymbolicArray(array.name()));
        }
        if array.size() != bytes.len() as u64 {
            return Err(ContractViolation::SymcreteLengthMismatch {
                array: array.name(),
                declared: array.size(),
                actual: bytes.len(),
            });
        }
        if self.is_bound(array) {
            return Err(ContractViolation::SymcreteAlreadyBound(array.name()));
        }

        let equality = binding_equality(array, &bytes);
        let evaluated = self.evaluate(equality);
        self.bindings.insert(array, bytes);
        self.evaluated.add(evaluated);
        let depends = self.bound_arrays(equality);
        register(&mut self.dependencies, evaluated, depends);
        tracing::debug!("[SYMCRETE] bound {} ({})", array.name(), evaluated);
        Ok(())
    }

    /// Substitutes the current bindings into `constraint`, records the result and returns it.
    pub fn add_constraint(&mut self, constraint: Expr) -> Expr {
        let evaluated = self.evaluate(constraint);
        self.evaluated.add(evaluated);
        let depends = self.bound_arrays(constraint);
        register(&mut self.dependencies, evaluated, depends);
        evaluated
    }

    /// Drops every binding together with the substituted constraints and their dependencies.
    /// Object bookkeeping is kept. Returns the dropped bindings.
    pub(crate) fn clear(&mut self) -> OrdMap<ArrayId, Vec<u8>> {
        self.evaluated = ConstraintSet::new();
        self.dependencies = Dependencies::new();
        std::mem::take(&mut self.bindings)
    }

    pub(crate) fn register_object(
        &mut self,
        size: ArrayId,
        address: ArrayId,
        object: Arc<MemoryObject>,
    ) {
        self.address_arrays.insert(object.id, address);
        self.size_objects.insert(size, object);
    }

    /// Points the bookkeeping of `size` (and its address array) at `object`.
    pub(crate) fn move_object(&mut self, size: ArrayId, object: Arc<MemoryObject>) {
        if let Some(previous) = self.size_objects.insert(size, Arc::clone(&object)) {
            if let Some(address) = self.address_arrays.remove(&previous.id) {
                self.address_arrays.insert(object.id, address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{u64_to_bytes, ArraySource};

    #[test]
    fn add_checks_source_length_and_rebinding() {
        let mut symcretes = Symcretes::new();
        let sized = ArrayId::new("n", 4, ArraySource::SymbolicSize);
        assert!(matches!(
            symcretes.add(sized, vec![1, 2, 3]),
            Err(ContractViolation::SymcreteLengthMismatch { declared: 4, actual: 3, .. })
        ));
        symcretes.add(sized, vec![1, 0, 0, 0]).unwrap();
        assert!(matches!(
            symcretes.add(sized, vec![2, 0, 0, 0]),
            Err(ContractViolation::SymcreteAlreadyBound(_))
        ));

        let constant = ArrayId::new("k", 1, ArraySource::Constant(vec![7]));
        assert!(matches!(
            symcretes.add(constant, vec![7]),
            Err(ContractViolation::NotSymbolicArray(_))
        ));
    }

    #[test]
    fn constraints_are_substituted_and_tracked() {
        let mut symcretes = Symcretes::new();
        let size = ArrayId::new("size", 8, ArraySource::SymbolicSize);
        let input = ArrayId::new("input", 1, ArraySource::Symbolic);
        symcretes.add(size, u64_to_bytes(5, 8)).unwrap();

        let equality = binding_equality(size, &u64_to_bytes(5, 8));
        assert!(symcretes.constraints().contains(equality));
        assert_eq!(
            symcretes.dependencies().get(&equality),
            Some(&BTreeSet::from([size]))
        );

        let byte = Expr::read(input, Expr::pointer(0));
        let mixed = Expr::ult(Expr::zext(byte, 64), Expr::whole_array(size));
        let evaluated = symcretes.add_constraint(mixed);
        assert_eq!(evaluated, Expr::ult(Expr::zext(byte, 64), Expr::pointer(5)));
        assert_eq!(
            symcretes.dependencies().get(&evaluated),
            Some(&BTreeSet::from([size]))
        );

        let free = Expr::ule(byte, Expr::constant(9, 8));
        assert_eq!(symcretes.add_constraint(free), free);
        assert!(symcretes.dependencies().get(&free).is_none());
    }

    #[test]
    fn clear_keeps_object_bookkeeping() {
        let mut symcretes = Symcretes::new();
        let size = ArrayId::new("s", 8, ArraySource::SymbolicSize);
        let address = ArrayId::new("a", 8, ArraySource::SymbolicAddress);
        let mut manager = crate::memory::MemoryManager::default();
        let object = manager
            .allocate(crate::memory::AllocationRequest::new(4))
            .unwrap();
        symcretes.register_object(size, address, Arc::clone(&object));
        symcretes.add(size, u64_to_bytes(4, 8)).unwrap();

        let dropped = symcretes.clear();
        assert_eq!(dropped.len(), 1);
        assert!(symcretes.bindings().is_empty());
        assert!(symcretes.constraints().is_empty());
        assert!(symcretes.is_size_symcrete(size));
        assert_eq!(symcretes.address_array(object.id), Some(address));
    }
}
