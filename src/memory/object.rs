use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::expr::Expr;

pub type ObjectId = u64;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn fresh_object_id() -> ObjectId {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Source position attached to an allocation site.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocationInfo {
    pub file: Arc<str>,
    pub line: u32,
    pub column: u32,
}

/// Opaque identity of the code that requested an allocation. Stored and compared, never
/// interpreted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllocSite {
    #[default]
    Unknown,
    Instruction {
        id: u64,
        location: Option<LocationInfo>,
    },
    Global {
        name: Arc<str>,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectFlags {
    pub is_local: bool,
    pub is_global: bool,
    pub is_lazy_initialized: bool,
    pub is_user_specified: bool,
}

/// One allocation. Immutable once created; growth produces a new object whose `parent` points
/// back here.
pub struct MemoryObject {
    pub id: ObjectId,
    pub timestamp: u64,
    /// Representative address: the current concretization of `base`, used as the sort key.
    pub address: u64,
    /// Concrete byte capacity of the backing state.
    pub capacity: u64,
    pub base: Expr,
    pub size: Expr,
    pub flags: ObjectFlags,
    pub site: AllocSite,
    pub alignment: u64,
    pub parent: Option<Arc<MemoryObject>>,
}

impl MemoryObject {
    pub fn concrete_size(&self) -> Option<u64> {
        self.size.as_constant().map(|v| v as u64)
    }

    pub fn has_symbolic_size(&self) -> bool {
        !self.size.is_constant()
    }

    pub fn has_symbolic_base(&self) -> bool {
        !self.base.is_constant()
    }

    pub fn offset_expr(&self, pointer: Expr) -> Expr {
        Expr::sub(pointer, self.base)
    }

    pub fn bounds_check_offset(&self, offset: Expr) -> Expr {
        if self.concrete_size() == Some(0) {
            Expr::is_zero(offset)
        } else {
            Expr::ult(offset, self.size)
        }
    }

    /// `offset .. offset + bytes` lies inside the object.
    pub fn bounds_check_offset_bytes(&self, offset: Expr, bytes: u64) -> Expr {
        match self.concrete_size() {
            Some(size) if bytes <= size => {
                Expr::ult(offset, Expr::pointer(size - bytes + 1))
            }
            Some(_) => Expr::false_(),
            None => {
                let bytes = Expr::pointer(bytes);
                Expr::and(
                    Expr::ule(bytes, self.size),
                    Expr::ule(offset, Expr::sub(self.size, bytes)),
                )
            }
        }
    }

    pub fn bounds_check_pointer(&self, pointer: Expr) -> Expr {
        self.bounds_check_offset(self.offset_expr(pointer))
    }

    pub fn bounds_check_pointer_bytes(&self, pointer: Expr, bytes: u64) -> Expr {
        self.bounds_check_offset_bytes(self.offset_expr(pointer), bytes)
    }

    /// Concrete containment of `address` for an object of `size` bytes. Zero-size objects
    /// only contain their own address.
    pub fn contains_concrete(&self, address: u64, size: u64) -> bool {
        if address < self.address {
            return false;
        }
        (size == 0 && address == self.address) || address - self.address < size
    }

    /// Parent chain, nearest ancestor first.
    pub fn ancestors(&self) -> impl Iterator<Item = &Arc<MemoryObject>> {
        std::iter::successors(self.parent.as_ref(), |mo| mo.parent.as_ref())
    }
}

impl fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryObject")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("address", &format_args!("{:#x}", self.address))
            .field("capacity", &self.capacity)
            .field("size", &self.size)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .finish()
    }
}

impl PartialEq for MemoryObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MemoryObject {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ArrayId, ArraySource};

    fn object(address: u64, size: Expr, capacity: u64) -> MemoryObject {
        MemoryObject {
            id: fresh_object_id(),
            timestamp: 0,
            address,
            capacity,
            base: Expr::pointer(address),
            size,
            flags: ObjectFlags::default(),
            site: AllocSite::Unknown,
            alignment: 8,
            parent: None,
        }
    }

    #[test]
    fn concrete_bounds_checks_fold() {
        let mo = object(0x100, Expr::pointer(10), 10);
        assert!(mo.bounds_check_pointer(Expr::pointer(0x109)).is_true());
        assert!(mo.bounds_check_pointer(Expr::pointer(0x10a)).is_false());
        assert!(mo.bounds_check_pointer_bytes(Expr::pointer(0x106), 4).is_true());
        assert!(mo.bounds_check_pointer_bytes(Expr::pointer(0x107), 4).is_false());
        assert!(mo.bounds_check_pointer_bytes(Expr::pointer(0x100), 11).is_false());
    }

    #[test]
    fn zero_sized_objects_match_only_their_base() {
        let mo = object(0x200, Expr::pointer(0), 0);
        assert!(mo.bounds_check_pointer(Expr::pointer(0x200)).is_true());
        assert!(mo.bounds_check_pointer(Expr::pointer(0x201)).is_false());
        assert!(mo.contains_concrete(0x200, 0));
        assert!(!mo.contains_concrete(0x201, 0));
    }

    #[test]
    fn symbolic_size_leaves_check_open() {
        let size = ArrayId::new("size", 8, ArraySource::SymbolicSize);
        let mo = object(0x300, Expr::whole_array(size), 16);
        assert!(!mo.bounds_check_pointer(Expr::pointer(0x304)).is_constant());
        assert!(mo.has_symbolic_size());
    }
}
