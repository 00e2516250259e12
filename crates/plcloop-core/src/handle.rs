//! Generation-checked handles.
//!
//! Callers never hold references into a [`System`](crate::system::System).
//! They hold small `Copy` handles that encode the owning system, a slot index
//! and the slot's generation. Destroying an object bumps the slot generation,
//! so every outstanding handle to it stops resolving. A slot whose generation
//! would wrap is retired instead of reused, so a handle can never resolve to a
//! later object.

use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::error::SystemError;

/// Source of process-unique system identifiers. Holds no other state.
static NEXT_SYSTEM_ID: AtomicU32 = AtomicU32::new(1);

/// Identity of one [`System`](crate::system::System) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(u32);

impl SystemId {
    /// Allocate a fresh identifier.
    pub(crate) fn next() -> Self {
        Self(NEXT_SYSTEM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw identifier value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sys{}", self.0)
    }
}

/// Untyped handle: owning system, slot index, slot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RawHandle {
    system: SystemId,
    index: u32,
    generation: u32,
}

/// Opaque handle to a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(RawHandle);

impl ConnectionHandle {
    /// System that issued this handle.
    pub fn system(self) -> SystemId {
        self.0.system
    }

    /// Packed `index | generation << 32` value, unique within the issuing
    /// system.
    pub fn to_bits(self) -> u64 {
        u64::from(self.0.index) | (u64::from(self.0.generation) << 32)
    }

    pub(crate) fn from_raw(raw: RawHandle) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> RawHandle {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/conn{}.{}", self.0.system, self.0.index, self.0.generation)
    }
}

/// Opaque handle to a registered driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverHandle(RawHandle);

impl DriverHandle {
    /// System that issued this handle.
    pub fn system(self) -> SystemId {
        self.0.system
    }

    /// Packed `index | generation << 32` value, unique within the issuing
    /// system.
    pub fn to_bits(self) -> u64 {
        u64::from(self.0.index) | (u64::from(self.0.generation) << 32)
    }

    pub(crate) fn from_raw(raw: RawHandle) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> RawHandle {
        self.0
    }
}

impl fmt::Display for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/drv{}.{}", self.0.system, self.0.index, self.0.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot table mapping [`RawHandle`]s to values.
///
/// # Invariants
///
/// - A handle resolves iff its system matches, its slot is occupied and the
///   slot generation equals the handle generation.
/// - `len` equals the number of occupied slots.
#[derive(Debug)]
pub(crate) struct HandleTable<T> {
    system: SystemId,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> HandleTable<T> {
    /// Create a table with room for `capacity` entries before reallocating.
    pub(crate) fn with_capacity(system: SystemId, capacity: usize) -> Result<Self, SystemError> {
        let mut slots = Vec::new();
        slots.try_reserve(capacity).map_err(|_| SystemError::NoMemory("handle table"))?;
        Ok(Self { system, slots, free: Vec::new(), len: 0 })
    }

    /// Store a value and return its handle.
    pub(crate) fn insert(&mut self, value: T) -> Result<RawHandle, SystemError> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none());
            slot.value = Some(value);
            self.len += 1;
            return Ok(RawHandle { system: self.system, index, generation: slot.generation });
        }

        let index = u32::try_from(self.slots.len())
            .map_err(|_| SystemError::NoMemory("handle table index space"))?;
        self.slots.try_reserve(1).map_err(|_| SystemError::NoMemory("handle table slot"))?;
        self.slots.push(Slot { generation: 0, value: Some(value) });
        self.len += 1;
        Ok(RawHandle { system: self.system, index, generation: 0 })
    }

    fn slot(&self, handle: RawHandle) -> Option<&Slot<T>> {
        if handle.system != self.system {
            return None;
        }
        self.slots.get(handle.index as usize).filter(|slot| slot.generation == handle.generation)
    }

    pub(crate) fn get(&self, handle: RawHandle) -> Option<&T> {
        self.slot(handle)?.value.as_ref()
    }

    pub(crate) fn get_mut(&mut self, handle: RawHandle) -> Option<&mut T> {
        if handle.system != self.system {
            return None;
        }
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?
            .value
            .as_mut()
    }

    pub(crate) fn contains(&self, handle: RawHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Remove a value, invalidating every handle to it.
    pub(crate) fn remove(&mut self, handle: RawHandle) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        let slot = &mut self.slots[handle.index as usize];
        let value = slot.value.take();
        self.len -= 1;

        // Retire the slot rather than let the generation wrap onto old handles.
        if let Some(next) = slot.generation.checked_add(1) {
            slot.generation = next;
            self.free.push(handle.index);
        }
        value
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Occupied entries in slot order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (RawHandle, &T)> {
        let system = self.system;
        self.slots.iter().enumerate().filter_map(move |(index, slot)| {
            let value = slot.value.as_ref()?;
            Some((RawHandle { system, index: index as u32, generation: slot.generation }, value))
        })
    }

    /// Drop every entry, invalidating all handles.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                values.push(value);
                if let Some(next) = slot.generation.checked_add(1) {
                    slot.generation = next;
                    self.free.push(index as u32);
                }
            }
        }
        self.len = 0;
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> HandleTable<&'static str> {
        HandleTable::with_capacity(SystemId::next(), 4).unwrap()
    }

    #[test]
    fn insert_and_resolve() {
        let mut table = table();
        let a = table.insert("a").unwrap();
        let b = table.insert("b").unwrap();

        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.get(b), Some(&"b"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn removed_handle_never_resolves_again() {
        let mut table = table();
        let a = table.insert("a").unwrap();
        assert_eq!(table.remove(a), Some("a"));

        // Slot is reused with a new generation.
        let c = table.insert("c").unwrap();
        assert_eq!(c.index, a.index);
        assert_ne!(c.generation, a.generation);

        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());
        assert_eq!(table.get(c), Some(&"c"));
    }

    #[test]
    fn foreign_system_handle_rejected() {
        let mut first = table();
        let second: HandleTable<&str> = table();
        let handle = first.insert("x").unwrap();

        assert!(second.get(handle).is_none());
        assert!(first.get_mut(handle).is_some());
    }

    #[test]
    fn exhausted_generation_retires_slot() {
        let mut table = table();
        let handle = table.insert("a").unwrap();
        table.slots[handle.index as usize].generation = u32::MAX;
        let maxed = RawHandle { generation: u32::MAX, ..handle };

        assert_eq!(table.remove(maxed), Some("a"));
        assert!(table.free.is_empty());

        let next = table.insert("b").unwrap();
        assert_ne!(next.index, handle.index);
    }

    #[test]
    fn drain_invalidates_everything() {
        let mut table = table();
        let a = table.insert("a").unwrap();
        let b = table.insert("b").unwrap();

        let values = table.drain();
        assert_eq!(values, vec!["a", "b"]);
        assert!(table.is_empty());
        assert!(!table.contains(a));
        assert!(!table.contains(b));
    }

    #[test]
    fn handle_bits_and_display() {
        let mut table = table();
        table.insert("a").unwrap();
        let raw = table.insert("b").unwrap();
        let handle = ConnectionHandle::from_raw(raw);

        assert_eq!(handle.to_bits(), 1);
        assert!(handle.to_string().ends_with("/conn1.0"));
    }
}
