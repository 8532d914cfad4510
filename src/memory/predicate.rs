use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::object::{MemoryObject, ObjectId};

type Filter = Arc<dyn Fn(&MemoryObject) -> bool + Send + Sync>;

/// Conjunction of candidate filters applied during pointer resolution. Objects failing any
/// filter are skipped without a solver probe.
#[derive(Clone, Default)]
pub struct ObjectPredicate {
    filters: Vec<Filter>,
}

impl ObjectPredicate {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn from_fn(filter: impl Fn(&MemoryObject) -> bool + Send + Sync + 'static) -> Self {
        Self {
            filters: vec![Arc::new(filter)],
        }
    }

    /// Objects allocated no later than `timestamp`.
    pub fn with_max_timestamp(timestamp: u64) -> Self {
        Self::from_fn(move |mo| mo.timestamp <= timestamp)
    }

    pub fn only_objects(ids: HashSet<ObjectId>) -> Self {
        Self::from_fn(move |mo| ids.contains(&mo.id))
    }

    pub fn and(mut self, other: ObjectPredicate) -> Self {
        self.filters.extend(other.filters);
        self
    }

    pub fn matches(&self, object: &MemoryObject) -> bool {
        self.filters.iter().all(|filter| filter(object))
    }

    pub fn is_trivial(&self) -> bool {
        self.filters.is_empty()
    }
}

impl fmt::Debug for ObjectPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPredicate({} filters)", self.filters.len())
    }
}
