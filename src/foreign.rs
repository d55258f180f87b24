use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::freeze::frozen_bit_set;
use crate::heap::Heap;
use crate::object::{ArenaRef, ObjHeader};

/// Opaque handle keeping a managed object reachable (a GC root) until
/// disposed. The handle is what native host code carries across the runtime
/// boundary.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StableRef {
    key: u64,
    obj: *mut ObjHeader,
}

/// Registry entry for a foreign-reference binding.
pub(crate) struct ForeignRefRecord {
    pub(crate) obj: usize,
    pub(crate) owner: ThreadId,
    pub(crate) shared: bool,
}

/// Context binding an object to the thread/scope allowed to dereference it
/// from native code. Check [`is_foreign_ref_accessible`] before every
/// native-side dereference.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ForeignRefContext {
    key: u64,
}

fn next_key(heap: &Heap) -> u64 {
    heap.next_root_key.fetch_add(1, Ordering::Relaxed)
}

/// Creates a handle that keeps `obj` alive until the handle is disposed.
pub fn create_stable_pointer(heap: &Heap, obj: *mut ObjHeader) -> StableRef {
    debug_assert!(!obj.is_null());
    unsafe {
        heap.arenas().add_ref((*obj).arena());
    }
    let key = next_key(heap);
    heap.stable_refs.lock().insert(key, obj as usize);
    log::trace!(target: "mm-foreign", "stable pointer {} -> {:p}", key, obj);
    StableRef { key, obj }
}

pub fn is_stable_pointer_valid(heap: &Heap, handle: StableRef) -> bool {
    heap.stable_refs.lock().get(&handle.key) == Some(&(handle.obj as usize))
}

/// Returns the handle's target. Dereferencing a disposed handle is a usage
/// error, fatal in debug builds.
pub fn deref_stable_pointer(heap: &Heap, handle: StableRef) -> *mut ObjHeader {
    debug_assert!(
        is_stable_pointer_valid(heap, handle),
        "deref of a disposed stable pointer"
    );
    handle.obj
}

/// Releases the handle's keep-alive obligation. Disposing twice is a usage
/// error, fatal in debug builds.
pub fn dispose_stable_pointer(heap: &Heap, handle: StableRef) {
    if heap.stable_refs.lock().remove(&handle.key).is_some() {
        unsafe {
            heap.arenas().release((*handle.obj).arena());
        }
        log::trace!(target: "mm-foreign", "stable pointer {} disposed", handle.key);
    } else {
        debug_assert!(false, "double dispose of a stable pointer");
    }
}

/// Transfers the handle's keep-alive obligation to the returned reference,
/// disposing the handle itself. The arena count taken at handle creation
/// moves into the [`ArenaRef`].
pub fn adopt_stable_pointer(heap: &Arc<Heap>, handle: StableRef) -> ArenaRef {
    let removed = heap.stable_refs.lock().remove(&handle.key);
    debug_assert!(removed.is_some(), "adopt of a disposed stable pointer");
    ArenaRef::from_adopted(heap, handle.obj)
}

/// Enumerates every object currently pinned by a stable pointer. Root-set
/// seam for a tracing policy.
pub fn for_each_stable_root(heap: &Heap, mut f: impl FnMut(*mut ObjHeader)) {
    let roots: Vec<usize> = heap.stable_refs.lock().values().copied().collect();
    for addr in roots {
        f(addr as *mut ObjHeader);
    }
}

fn init_ref(heap: &Heap, obj: *mut ObjHeader, shared: bool) -> ForeignRefContext {
    debug_assert!(!obj.is_null());
    unsafe {
        heap.arenas().add_ref((*obj).arena());
    }
    let key = next_key(heap);
    heap.foreign_refs.lock().insert(
        key,
        ForeignRefRecord {
            obj: obj as usize,
            owner: std::thread::current().id(),
            shared,
        },
    );
    ForeignRefContext { key }
}

/// Binds `obj` for cross-thread native access: the creating thread may
/// always dereference, other threads only once the object is frozen (or
/// permanent).
pub fn init_foreign_ref(heap: &Heap, obj: *mut ObjHeader) -> ForeignRefContext {
    init_ref(heap, obj, true)
}

/// Binds `obj` to the current thread only; the context never becomes
/// accessible elsewhere, frozen or not.
pub fn init_local_foreign_ref(heap: &Heap, obj: *mut ObjHeader) -> ForeignRefContext {
    init_ref(heap, obj, false)
}

/// Whether the current execution context may dereference `obj` through
/// `ctx`. Native code dereferencing without this check passing is a fatal
/// usage error, not a tolerated race.
pub fn is_foreign_ref_accessible(heap: &Heap, obj: *const ObjHeader, ctx: ForeignRefContext) -> bool {
    let refs = heap.foreign_refs.lock();
    match refs.get(&ctx.key) {
        Some(rec) if rec.obj == obj as usize => {
            rec.owner == std::thread::current().id()
                || (rec.shared && frozen_bit_set(heap, obj))
        }
        _ => false,
    }
}

/// Releases the binding. The context must not be used with `obj` again;
/// double deinit or a mismatched object is fatal in debug builds.
pub fn deinit_foreign_ref(heap: &Heap, obj: *mut ObjHeader, ctx: ForeignRefContext) {
    match heap.foreign_refs.lock().remove(&ctx.key) {
        Some(rec) => {
            debug_assert_eq!(rec.obj, obj as usize, "foreign ref deinit with wrong object");
            unsafe {
                heap.arenas().release((*obj).arena());
            }
        }
        None => debug_assert!(false, "foreign ref context deinitialized twice"),
    }
}

/// Takes ownership of a reference previously stored by another thread into
/// a variable with sharing semantics. Only frozen (or permanent) objects are
/// safe to pick up this way; adopting a thread-confined mutable object is
/// undefined behavior and rejected in debug builds.
pub fn adopt_reference_from_shared_variable(heap: &Heap, obj: *mut ObjHeader) -> *mut ObjHeader {
    debug_assert!(
        obj.is_null() || frozen_bit_set(heap, obj),
        "adopting a non-frozen reference from a shared variable"
    );
    obj
}

/// Associates a native object pointer with a managed object, stored in its
/// lazily installed side record.
pub fn set_associated_object(heap: &Heap, obj: *mut ObjHeader, handle: usize) {
    heap.extra().get_or_install(obj).set_foreign_handle(handle);
}

pub fn associated_object(heap: &Heap, obj: *const ObjHeader) -> usize {
    heap.extra().get(obj).map_or(0, |e| e.foreign_handle())
}
