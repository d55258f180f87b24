use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{ArenaId, ArenaTable, ARENA_ALIGNMENT};
use crate::extra::ExtraObjectTable;
use crate::foreign::ForeignRefRecord;
use crate::freeze::FreezeHooks;
use crate::gc::GcPolicy;
use crate::object::{ObjHeader, TypeInfo, TypeKind};
use crate::utils::formatted_size;

/// Heap construction parameters.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemoryConfig {
    /// Default capacity of arenas created for mutator allocation.
    pub arena_size: usize,
    /// When off, `freeze::is_frozen` reports false for every object and
    /// mutation checks are skipped. Escape hatch for performance-sensitive
    /// builds.
    pub freezing_checks_enabled: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            arena_size: 64 * 1024,
            freezing_checks_enabled: true,
        }
    }
}

/// Shared heap context: the arena table, per-object side metadata, the set
/// of published objects, native-interop root registries and the active GC
/// policy. Passed explicitly; there is no process-wide heap singleton.
pub struct Heap {
    config: MemoryConfig,
    arenas: ArenaTable,
    extra: ExtraObjectTable,
    freeze_hooks: FreezeHooks,
    gc: Box<dyn GcPolicy>,

    /// Published objects, keyed by header address, valued by full footprint.
    published: Mutex<HashMap<usize, usize>>,
    published_size: AtomicUsize,
    published_payload: AtomicUsize,

    /// Buffers backing permanent objects; freed with the heap.
    permanent: Mutex<Vec<(usize, Layout)>>,

    pub(crate) stable_refs: Mutex<HashMap<u64, usize>>,
    pub(crate) foreign_refs: Mutex<HashMap<u64, ForeignRefRecord>>,
    pub(crate) next_root_key: AtomicU64,
}

impl Heap {
    pub fn new(config: MemoryConfig, gc: Box<dyn GcPolicy>) -> Arc<Self> {
        Arc::new(Self {
            config,
            arenas: ArenaTable::new(),
            extra: ExtraObjectTable::new(),
            freeze_hooks: FreezeHooks::new(),
            gc,
            published: Mutex::new(HashMap::new()),
            published_size: AtomicUsize::new(0),
            published_payload: AtomicUsize::new(0),
            permanent: Mutex::new(Vec::new()),
            stable_refs: Mutex::new(HashMap::new()),
            foreign_refs: Mutex::new(HashMap::new()),
            next_root_key: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn arenas(&self) -> &ArenaTable {
        &self.arenas
    }

    pub fn extra(&self) -> &ExtraObjectTable {
        &self.extra
    }

    pub fn freeze_hooks(&self) -> &FreezeHooks {
        &self.freeze_hooks
    }

    pub fn gc(&self) -> &dyn GcPolicy {
        &*self.gc
    }

    /// Requests an asynchronous collection pass from the active policy.
    pub fn schedule_gc(&self) {
        self.gc.schedule(self);
    }

    /// Requests a collection pass and does not return until it completed.
    pub fn schedule_and_wait_full_gc(&self) {
        self.gc.schedule_and_wait_full_gc(self);
    }

    /// As [`Heap::schedule_and_wait_full_gc`], additionally waiting for
    /// object finalization.
    pub fn schedule_and_wait_full_gc_with_finalizers(&self) {
        self.gc.schedule_and_wait_full_gc_with_finalizers(self);
    }

    /// Flushes a batch of thread-local allocations into the globally
    /// visible object set. Takes the set lock once per batch.
    pub(crate) fn publish_objects(&self, objs: &[*mut ObjHeader]) {
        if objs.is_empty() {
            return;
        }
        let mut size = 0usize;
        let mut payload = 0usize;
        {
            let mut published = self.published.lock();
            for &obj in objs {
                let footprint = unsafe { (*obj).heap_size() };
                let fresh = published.insert(obj as usize, footprint).is_none();
                debug_assert!(fresh, "object published twice");
                if fresh {
                    size += footprint;
                    payload += unsafe { (*obj).payload_size() };
                }
            }
        }
        self.published_size.fetch_add(size, Ordering::AcqRel);
        self.published_payload.fetch_add(payload, Ordering::AcqRel);
        log::trace!(
            target: "mm-heap",
            "published {} objects ({})",
            objs.len(),
            formatted_size(size)
        );
    }

    /// Full footprint (headers and padding included) of all published
    /// objects. Unpublished thread-local allocations are not reflected.
    pub fn allocated_heap_size(&self) -> usize {
        self.published_size.load(Ordering::Acquire)
    }

    /// Sum of payload sizes of all published objects.
    pub fn total_heap_objects_size_bytes(&self) -> usize {
        self.published_payload.load(Ordering::Acquire)
    }

    pub fn published_object_count(&self) -> usize {
        self.published.lock().len()
    }

    pub fn is_published(&self, obj: *const ObjHeader) -> bool {
        self.published.lock().contains_key(&(obj as usize))
    }

    /// Enumerates published objects. The seam a whole-heap collector or
    /// heap dumper plugs into.
    pub fn for_each_published(&self, mut f: impl FnMut(*mut ObjHeader)) {
        let addrs: Vec<usize> = self.published.lock().keys().copied().collect();
        for addr in addrs {
            f(addr as *mut ObjHeader);
        }
    }

    /// Force-frees an arena and drops the per-object metadata of everything
    /// that lived in it: extra-data records and published-set entries keyed
    /// by addresses inside the buffer. Without the purge, a later arena
    /// whose buffer lands at a recycled address would inherit stale frozen
    /// flags and dangling published entries. Same caller contract as
    /// [`ArenaTable::dispose`].
    pub fn dispose_arena(&self, id: ArenaId) {
        if let Some((start, end)) = self.arenas.span(id) {
            self.extra.purge_range(start, end);

            let mut size = 0usize;
            let mut payload = 0usize;
            {
                let mut published = self.published.lock();
                published.retain(|&addr, &mut footprint| {
                    if addr < start || addr >= end {
                        return true;
                    }
                    size += footprint;
                    // Buffer is still live; the header is readable here.
                    payload += unsafe { (*(addr as *const ObjHeader)).payload_size() };
                    false
                });
            }
            self.published_size.fetch_sub(size, Ordering::AcqRel);
            self.published_payload.fetch_sub(payload, Ordering::AcqRel);
        }
        self.arenas.dispose(id);
    }

    /// Allocates a permanent (compile-time constant) object. Permanent
    /// objects are frozen by definition, belong to no arena and live until
    /// the heap is dropped.
    pub fn alloc_permanent(&self, ti: &'static TypeInfo) -> *mut ObjHeader {
        debug_assert!(matches!(ti.kind, TypeKind::Plain));
        let size = ti.instance_size(0);
        let layout = Layout::from_size_align(size, ARENA_ALIGNMENT)
            .expect("permanent object size overflows Layout");
        unsafe {
            let mem = alloc_zeroed(layout);
            assert!(!mem.is_null(), "permanent allocation failed");
            let obj = mem as *mut ObjHeader;
            obj.write(ObjHeader::new(ti, ArenaId::PERMANENT));
            self.permanent.lock().push((mem as usize, layout));
            obj
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            published_objects: self.published_object_count(),
            allocated_size: self.allocated_heap_size(),
            objects_payload_size: self.total_heap_objects_size_bytes(),
            stable_ref_count: self.stable_refs.lock().len(),
            foreign_ref_count: self.foreign_refs.lock().len(),
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for (addr, layout) in self.permanent.lock().drain(..) {
            unsafe { dealloc(addr as *mut u8, layout) }
        }
    }
}

#[derive(Debug)]
pub struct HeapStats {
    pub published_objects: usize,
    pub allocated_size: usize,
    pub objects_payload_size: usize,
    pub stable_ref_count: usize,
    pub foreign_ref_count: usize,
}

impl std::fmt::Display for HeapStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "heap statistics:")?;
        writeln!(f, "  published objects: {}", self.published_objects)?;
        writeln!(f, "  allocated: {}", formatted_size(self.allocated_size))?;
        writeln!(
            f,
            "  objects payload: {}",
            formatted_size(self.objects_payload_size)
        )?;
        writeln!(f, "  stable refs: {}", self.stable_ref_count)?;
        writeln!(f, "  foreign refs: {}", self.foreign_ref_count)?;
        Ok(())
    }
}
