use crate::error::ContractViolation;
use crate::expr::{ArrayId, Expr};

use super::object::{MemoryObject, ObjectId};

/// Byte contents of one `MemoryObject`.
///
/// Concrete bytes live in a flat cache; bytes that currently hold a symbolic value carry an
/// override expression. `owner` is the address-space epoch allowed to mutate this instance in
/// place, `0` while unbound.
#[derive(Clone, Debug)]
pub struct ObjectState {
    object: ObjectId,
    concrete: Vec<u8>,
    symbolic: Option<Vec<Option<Expr>>>,
    pub(crate) owner: u64,
    read_only: bool,
}

impl ObjectState {
    /// Zero-filled contents sized to the object's capacity.
    pub fn new(object: &MemoryObject) -> Self {
        Self {
            object: object.id,
            concrete: vec![0; object.capacity as usize],
            symbolic: None,
            owner: 0,
            read_only: false,
        }
    }

    /// Contents where byte `i` is `array[i]`.
    pub fn with_array(object: &MemoryObject, array: ArrayId) -> Self {
        let mut state = Self::new(object);
        let bytes = (0..object.capacity)
            .map(|i| Some(Expr::read(array, Expr::pointer(i))))
            .collect();
        state.symbolic = Some(bytes);
        state
    }

    /// Same contents re-homed onto a (larger) object.
    ///
    /// Bytes past the old size are zero, or `array[i]` when the object holds the symbolic
    /// input `array`, so the extension stays unconstrained input.
    pub fn grown_from(
        object: &MemoryObject,
        previous: &ObjectState,
        array: Option<ArrayId>,
    ) -> Self {
        let mut state = match array {
            Some(array) => Self::with_array(object, array),
            None => Self::new(object),
        };
        let len = previous.concrete.len().min(state.concrete.len());
        state.concrete[..len].copy_from_slice(&previous.concrete[..len]);
        match (&previous.symbolic, state.symbolic.as_mut()) {
            (Some(overrides), Some(grown)) => grown[..len].copy_from_slice(&overrides[..len]),
            (Some(overrides), None) => {
                let mut grown = vec![None; state.concrete.len()];
                grown[..len].copy_from_slice(&overrides[..len]);
                state.symbolic = Some(grown);
            }
            (None, Some(grown)) => grown[..len].fill(None),
            (None, None) => {}
        }
        state.read_only = previous.read_only;
        state
    }

    pub fn object_id(&self) -> ObjectId {
        self.object
    }

    pub fn size(&self) -> u64 {
        self.concrete.len() as u64
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn is_byte_concrete(&self, offset: u64) -> bool {
        self.symbolic
            .as_ref()
            .and_then(|bytes| bytes.get(offset as usize))
            .map_or(true, Option::is_none)
    }

    pub fn is_fully_concrete(&self) -> bool {
        self.symbolic
            .as_ref()
            .map_or(true, |bytes| bytes.iter().all(Option::is_none))
    }

    /// Concrete byte cache. Entries under a symbolic override are stale.
    pub fn concrete_store(&self) -> &[u8] {
        &self.concrete
    }

    pub(crate) fn concrete_store_mut(&mut self) -> &mut [u8] {
        &mut self.concrete
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), ContractViolation> {
        if offset.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(ContractViolation::OffsetOutOfRange {
                object: self.object,
                offset,
                size: self.size(),
            });
        }
        Ok(())
    }

    pub fn read8(&self, offset: u64) -> Result<Expr, ContractViolation> {
        self.check_range(offset, 1)?;
        let i = offset as usize;
        if let Some(Some(expr)) = self.symbolic.as_ref().map(|bytes| bytes[i]) {
            return Ok(expr);
        }
        Ok(Expr::constant(self.concrete[i] as u128, 8))
    }

    pub fn write8(&mut self, offset: u64, value: Expr) -> Result<(), ContractViolation> {
        debug_assert_eq!(value.width(), 8);
        if self.read_only {
            return Err(ContractViolation::ReadOnly(self.object));
        }
        self.check_range(offset, 1)?;
        let i = offset as usize;
        match value.as_constant() {
            Some(byte) => {
                self.concrete[i] = byte as u8;
                if let Some(bytes) = self.symbolic.as_mut() {
                    bytes[i] = None;
                }
            }
            None => {
                let len = self.concrete.len();
                self.symbolic.get_or_insert_with(|| vec![None; len])[i] = Some(value);
            }
        }
        Ok(())
    }

    /// Little-endian read of `bytes` bytes.
    pub fn read(&self, offset: u64, bytes: u32) -> Result<Expr, ContractViolation> {
        self.check_range(offset, bytes as u64)?;
        let mut result = self.read8(offset)?;
        for i in 1..bytes as u64 {
            result = Expr::concat(self.read8(offset + i)?, result);
        }
        Ok(result)
    }

    /// Little-endian write of a value whose width is a whole number of bytes.
    pub fn write(&mut self, offset: u64, value: Expr) -> Result<(), ContractViolation> {
        let width = value.width();
        debug_assert_eq!(width % 8, 0);
        let bytes = (width / 8) as u64;
        self.check_range(offset, bytes)?;
        for i in 0..bytes {
            self.write8(offset + i, Expr::extract(value, (i * 8) as u32, 8))?;
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<(), ContractViolation> {
        self.check_range(offset, bytes.len() as u64)?;
        for (i, byte) in bytes.iter().enumerate() {
            self.write8(offset + i as u64, Expr::constant(*byte as u128, 8))?;
        }
        Ok(())
    }
}
