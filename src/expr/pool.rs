//! Process-wide interning pool backing `Expr` and `ArrayId` handles.
//!
//! Nodes are append-only: a handle stays valid for the life of the process. The dedup map is a
//! `DashMap` so concurrent states intern without a global lock; the node vector only takes its
//! write lock on a miss.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use super::{Array, ArrayId, Expr, ExprKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Node {
    pub kind: ExprKind,
    pub width: u32,
}

struct ExprPool {
    nodes: RwLock<Vec<Node>>,
    interned: DashMap<Node, Expr>,
    arrays: RwLock<Vec<Arc<Array>>>,
}

static POOL: LazyLock<ExprPool> = LazyLock::new(|| ExprPool {
    nodes: RwLock::new(Vec::with_capacity(1 << 12)),
    interned: DashMap::with_capacity(1 << 12),
    arrays: RwLock::new(Vec::new()),
});

pub(crate) fn intern(kind: ExprKind, width: u32) -> Expr {
    let node = Node { kind, width };
    if let Some(existing) = POOL.interned.get(&node) {
        return *existing;
    }
    match POOL.interned.entry(node) {
        Entry::Occupied(slot) => *slot.get(),
        Entry::Vacant(slot) => {
            let mut nodes = POOL.nodes.write().unwrap_or_else(PoisonError::into_inner);
            let handle = Expr(nodes.len() as u32);
            nodes.push(node);
            slot.insert(handle);
            handle
        }
    }
}

pub(crate) fn node(expr: Expr) -> Node {
    POOL.nodes.read().unwrap_or_else(PoisonError::into_inner)[expr.0 as usize]
}

pub(crate) fn declare_array(array: Array) -> ArrayId {
    let mut arrays = POOL.arrays.write().unwrap_or_else(PoisonError::into_inner);
    let id = ArrayId(arrays.len() as u32);
    arrays.push(Arc::new(array));
    id
}

pub(crate) fn array(id: ArrayId) -> Arc<Array> {
    Arc::clone(&POOL.arrays.read().unwrap_or_else(PoisonError::into_inner)[id.0 as usize])
}
