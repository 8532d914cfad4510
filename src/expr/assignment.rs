use serde::Serialize;
use std::collections::BTreeMap;

use super::{ArrayId, Expr};

/// Concrete bytes for a set of arrays.
///
/// Evaluation is partial: reads from arrays without a binding (or past the end of a binding)
/// stay symbolic, so an assignment over a subset of arrays simplifies rather than closes a term.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Assignment {
    bindings: BTreeMap<ArrayId, Vec<u8>>,
}

impl Assignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bindings(bindings: impl IntoIterator<Item = (ArrayId, Vec<u8>)>) -> Self {
        Self {
            bindings: bindings.into_iter().collect(),
        }
    }

    pub fn bind(&mut self, array: ArrayId, bytes: Vec<u8>) -> Option<Vec<u8>> {
        self.bindings.insert(array, bytes)
    }

    pub fn get(&self, array: ArrayId) -> Option<&[u8]> {
        self.bindings.get(&array).map(Vec::as_slice)
    }

    pub fn contains(&self, array: ArrayId) -> bool {
        self.bindings.contains_key(&array)
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArrayId, &[u8])> {
        self.bindings.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    /// Little-endian value of a binding of at most 8 bytes.
    pub fn value_u64(&self, array: ArrayId) -> Option<u64> {
        self.get(array).map(bytes_to_u64)
    }

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

    /// True when every constraint evaluates to `true` under this assignment.
    pub fn satisfies(&self, constraints: impl IntoIterator<Item = Expr>) -> bool {
        constraints.into_iter().all(|c| self.evaluate(c).is_true())
    }
}

pub fn bytes_to_u64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | ((*b as u64) << (8 * i)))
}

pub fn u64_to_bytes(value: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| if i < 8 { (value >> (8 * i)) as u8 } else { 0 })
        .collect()
}
