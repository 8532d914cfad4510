use std::sync::Arc;

use crate::error::ContractViolation;
use crate::expr::Expr;
use crate::utils::config::SpaceConfig;

use super::object::{fresh_object_id, AllocSite, MemoryObject, ObjectFlags};

pub const DEFAULT_ARENA_BASE: u64 = 0x1000_0000;
pub const DEFAULT_ARENA_LIMIT: u64 = 0x7fff_0000_0000;
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 1 << 30;
const RED_ZONE: u64 = 16;
const DEFAULT_ALIGNMENT: u64 = 8;

/// Parameters of one allocation.
#[derive(Clone, Debug)]
pub struct AllocationRequest {
    pub capacity: u64,
    /// Symbolic size; defaults to the constant capacity.
    pub size: Option<Expr>,
    /// Symbolic base; defaults to the constant representative address.
    pub base: Option<Expr>,
    pub flags: ObjectFlags,
    pub site: AllocSite,
    pub alignment: u64,
    pub timestamp: u64,
    pub parent: Option<Arc<MemoryObject>>,
}

impl AllocationRequest {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            size: None,
            base: None,
            flags: ObjectFlags::default(),
            site: AllocSite::Unknown,
            alignment: DEFAULT_ALIGNMENT,
            timestamp: 0,
            parent: None,
        }
    }

    pub fn with_size(mut self, size: Expr) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_base(mut self, base: Expr) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_flags(mut self, flags: ObjectFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_site(mut self, site: AllocSite) -> Self {
        self.site = site;
        self
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_parent(mut self, parent: Arc<MemoryObject>) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Deterministic bump allocator for representative addresses.
///
/// Objects never share an address: every allocation is followed by a red zone, so even
/// zero-capacity objects keep distinct keys in the address space.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    next_address: u64,
    limit: u64,
    max_object_size: u64,
    used: u64,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_ARENA_BASE, DEFAULT_ARENA_LIMIT)
    }
}

impl MemoryManager {
    pub fn new(base: u64, limit: u64) -> Self {
        Self {
            next_address: base,
            limit,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            used: 0,
        }
    }

    pub fn from_config(config: &SpaceConfig) -> Self {
        Self::new(config.arena_base, config.arena_limit)
            .with_max_object_size(config.max_object_size)
    }

    /// Largest capacity `allocate` accepts. Object contents are materialized eagerly, so this
    /// bounds the memory a single solver-chosen size can claim.
    pub fn with_max_object_size(mut self, max_object_size: u64) -> Self {
        self.max_object_size = max_object_size;
        self
    }

    pub fn max_object_size(&self) -> u64 {
        self.max_object_size
    }

    pub fn allocate(
        &mut self,
        request: AllocationRequest,
    ) -> Result<Arc<MemoryObject>, ContractViolation> {
        let alignment = request.alignment.max(1);
        if !alignment.is_power_of_two() {
            return Err(ContractViolation::InvalidAlignment(request.alignment));
        }
        if request.capacity > self.max_object_size {
            return Err(ContractViolation::ObjectTooLarge {
                size: request.capacity,
                limit: self.max_object_size,
            });
        }
        let exhausted = ContractViolation::AddressSpaceExhausted {
            size: request.capacity,
            limit: self.limit,
        };
        let address = self
            .next_address
            .checked_add(alignment - 1)
            .map(|a| a & !(alignment - 1))
            .ok_or_else(|| exhausted.clone())?;
        let end = address
            .checked_add(request.capacity.max(1))
            .filter(|end| *end <= self.limit)
            .ok_or(exhausted)?;
        self.next_address = end.saturating_add(RED_ZONE);
        self.used = self.used.saturating_add(request.capacity);

        let object = MemoryObject {
            id: fresh_object_id(),
            timestamp: request.timestamp,
            address,
            capacity: request.capacity,
            base: request.base.unwrap_or_else(|| Expr::pointer(address)),
            size: request
                .size
                .unwrap_or_else(|| Expr::pointer(request.capacity)),
            flags: request.flags,
            site: request.site,
            alignment,
            parent: request.parent,
        };
        tracing::debug!(
            "[MEMORY] allocated object {} at {:#x} ({} bytes)",
            object.id,
            object.address,
            object.capacity
        );
        Ok(Arc::new(object))
    }

    /// Object at a caller-chosen address, outside the bump arena's bookkeeping. Marked
    /// user-specified so concrete synchronization leaves it alone.
    pub fn allocate_fixed(
        &mut self,
        address: u64,
        capacity: u64,
        site: AllocSite,
    ) -> Arc<MemoryObject> {
        Arc::new(MemoryObject {
            id: fresh_object_id(),
            timestamp: 0,
            address,
            capacity,
            base: Expr::pointer(address),
            size: Expr::pointer(capacity),
            flags: ObjectFlags {
                is_user_specified: true,
                ..ObjectFlags::default()
            },
            site,
            alignment: 1,
            parent: None,
        })
    }

    /// Total bytes handed out by `allocate`.
    pub fn used_deterministic_size(&self) -> u64 {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut manager = MemoryManager::new(0x1001, 0x10_0000);
        let a = manager
            .allocate(AllocationRequest::new(10).with_alignment(16))
            .unwrap();
        let b = manager.allocate(AllocationRequest::new(0)).unwrap();
        let c = manager.allocate(AllocationRequest::new(3)).unwrap();
        assert_eq!(a.address % 16, 0);
        assert!(b.address >= a.address + 10);
        assert!(c.address > b.address);
        assert!(a.id < b.id && b.id < c.id);
        assert_eq!(manager.used_deterministic_size(), 13);
    }

    #[test]
    fn rejects_bad_alignment_and_exhaustion() {
        let mut manager = MemoryManager::new(0x100, 0x200);
        assert_eq!(
            manager
                .allocate(AllocationRequest::new(4).with_alignment(3))
                .unwrap_err(),
            ContractViolation::InvalidAlignment(3)
        );
        assert!(matches!(
            manager.allocate(AllocationRequest::new(0x1000)),
            Err(ContractViolation::AddressSpaceExhausted { .. })
        ));
    }

    #[test]
    fn rejects_objects_above_size_limit() {
        let config = SpaceConfig {
            max_object_size: 64,
            ..SpaceConfig::default()
        };
        let mut manager = MemoryManager::from_config(&config);
        assert!(manager.allocate(AllocationRequest::new(64)).is_ok());
        assert_eq!(
            manager.allocate(AllocationRequest::new(1 << 40)).unwrap_err(),
            ContractViolation::ObjectTooLarge {
                size: 1 << 40,
                limit: 64
            }
        );
        assert_eq!(manager.used_deterministic_size(), 64);
    }

    #[test]
    fn fixed_objects_are_user_specified() {
        let mut manager = MemoryManager::default();
        let mo = manager.allocate_fixed(0x4000, 32, AllocSite::Unknown);
        assert!(mo.flags.is_user_specified);
        assert_eq!(mo.address, 0x4000);
        assert_eq!(manager.used_deterministic_size(), 0);
    }
}
