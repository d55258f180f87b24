use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::object::ObjHeader;

/// Object subgraph is immutable. Monotonic: never cleared once set.
pub const FROZEN: u32 = 1 << 0;
/// Object must never be frozen; poisons any freeze attempt reaching it.
pub const NEVER_FROZEN: u32 = 1 << 1;

/// Side record for rarely-needed per-object metadata: flag bits and a slot
/// for an associated foreign (native) object pointer. Installed lazily on
/// first need.
pub struct ExtraObjectData {
    flags: AtomicU32,
    foreign_handle: AtomicUsize,
}

impl ExtraObjectData {
    fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
            foreign_handle: AtomicUsize::new(0),
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn foreign_handle(&self) -> usize {
        self.foreign_handle.load(Ordering::Acquire)
    }

    pub fn set_foreign_handle(&self, handle: usize) {
        self.foreign_handle.store(handle, Ordering::Release);
    }
}

/// Heap-owned table of [`ExtraObjectData`] records, keyed by object
/// identity (header address). Entries are shared `Arc`s so flag reads and
/// writes happen outside the table lock.
pub struct ExtraObjectTable {
    map: Mutex<HashMap<usize, Arc<ExtraObjectData>>>,
}

impl ExtraObjectTable {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, obj: *const ObjHeader) -> Option<Arc<ExtraObjectData>> {
        self.map.lock().get(&(obj as usize)).cloned()
    }

    pub fn get_or_install(&self, obj: *const ObjHeader) -> Arc<ExtraObjectData> {
        self.map
            .lock()
            .entry(obj as usize)
            .or_insert_with(|| Arc::new(ExtraObjectData::new()))
            .clone()
    }

    pub fn has_flag(&self, obj: *const ObjHeader, flag: u32) -> bool {
        self.get(obj).map_or(false, |e| e.has_flag(flag))
    }

    /// Drops every record whose object lived in `[start, end)`. Called when
    /// an arena is disposed; flag state must not outlive the object it was
    /// recorded for, or a later object at a recycled address would inherit
    /// it.
    pub(crate) fn purge_range(&self, start: usize, end: usize) {
        self.map
            .lock()
            .retain(|&addr, _| addr < start || addr >= end);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }
}

impl Default for ExtraObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_lazy_and_idempotent() {
        let table = ExtraObjectTable::new();
        let key = 0x1000 as *const ObjHeader;

        assert!(table.get(key).is_none());
        assert!(!table.has_flag(key, FROZEN));

        let data = table.get_or_install(key);
        assert_eq!(table.len(), 1);
        let again = table.get_or_install(key);
        assert!(Arc::ptr_eq(&data, &again));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn flags_are_sticky() {
        let table = ExtraObjectTable::new();
        let key = 0x2000 as *const ObjHeader;

        let data = table.get_or_install(key);
        data.set_flag(NEVER_FROZEN);
        data.set_flag(FROZEN);
        assert!(data.has_flag(FROZEN));
        assert!(data.has_flag(NEVER_FROZEN));
        assert!(table.has_flag(key, FROZEN | NEVER_FROZEN));
    }

    #[test]
    fn purge_drops_only_the_given_range() {
        let table = ExtraObjectTable::new();
        let inside = 0x4010 as *const ObjHeader;
        let outside = 0x5000 as *const ObjHeader;

        table.get_or_install(inside).set_flag(FROZEN);
        table.get_or_install(outside).set_flag(FROZEN);

        table.purge_range(0x4000, 0x4800);
        assert_eq!(table.len(), 1);
        assert!(!table.has_flag(inside, FROZEN));
        assert!(table.has_flag(outside, FROZEN));
    }

    #[test]
    fn foreign_handle_slot() {
        let table = ExtraObjectTable::new();
        let key = 0x3000 as *const ObjHeader;

        let data = table.get_or_install(key);
        assert_eq!(data.foreign_handle(), 0);
        data.set_foreign_handle(0xdead);
        assert_eq!(data.foreign_handle(), 0xdead);
    }
}
