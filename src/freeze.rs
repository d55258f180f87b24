use std::collections::HashSet;

use parking_lot::Mutex;

use crate::extra::{FROZEN, NEVER_FROZEN};
use crate::heap::Heap;
use crate::object::ObjHeader;
use crate::traverse::traverse_referred_objects;

/// Extension point run once for every newly visited object during a freeze
/// walk, before the freezability decision. A hook may mutate only the object
/// it is handed, never the wider graph, and must not call back into the
/// freezing subsystem.
pub type FreezeHook = Box<dyn Fn(*mut ObjHeader) + Send + Sync>;

/// Hook context owned by the heap. Explicit state, not a process-wide
/// static; the default is no hook.
pub struct FreezeHooks {
    hook: Mutex<Option<FreezeHook>>,
}

impl FreezeHooks {
    pub fn new() -> Self {
        Self {
            hook: Mutex::new(None),
        }
    }

    /// Installs (or clears) the hook. Test harness entry point; production
    /// embedders install their hook right after heap construction.
    pub fn set_for_testing(&self, hook: Option<FreezeHook>) {
        *self.hook.lock() = hook;
    }

    fn run(&self, obj: *mut ObjHeader) {
        if let Some(hook) = &*self.hook.lock() {
            hook(obj);
        }
    }
}

impl Default for FreezeHooks {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw frozen bit, independent of the configuration escape hatch: permanent
/// objects count as frozen, otherwise the FROZEN flag decides.
pub(crate) fn frozen_bit_set(heap: &Heap, obj: *const ObjHeader) -> bool {
    unsafe { (*obj).is_permanent() || heap.extra().has_flag(obj, FROZEN) }
}

/// Whether the object is immutable: a permanent constant, or carrying the
/// FROZEN flag. Reports `false` unconditionally when freezing checks are
/// disabled in the heap configuration.
pub fn is_frozen(heap: &Heap, obj: *const ObjHeader) -> bool {
    if !heap.config().freezing_checks_enabled || obj.is_null() {
        return false;
    }
    frozen_bit_set(heap, obj)
}

/// Freezes the whole subgraph reachable from `root`.
///
/// Walks the mutable frontier iteratively (already-frozen objects are not
/// re-traversed into), running the freeze hook exactly once per newly
/// visited object, then decides: if any collected object carries the
/// NEVER_FROZEN poison flag the operation aborts, returns that object, and
/// no flags change anywhere, all or nothing. On success every collected
/// object gets FROZEN set and `None` is returned.
///
/// The caller must hold exclusive mutation access to the subgraph for the
/// duration of the call; no locks are taken on the objects themselves.
pub fn freeze_subgraph(heap: &Heap, root: *mut ObjHeader) -> Option<*mut ObjHeader> {
    if root.is_null() {
        return None;
    }

    let mut stack = vec![root];
    let mut visited = HashSet::new();
    let mut collected = Vec::new();

    while let Some(obj) = stack.pop() {
        if frozen_bit_set(heap, obj) {
            // Its subgraph is already immutable; stop-list.
            continue;
        }
        if !visited.insert(obj as usize) {
            continue;
        }
        heap.freeze_hooks().run(obj);
        collected.push(obj);
        unsafe {
            traverse_referred_objects(obj, |field| stack.push(field));
        }
    }

    for &obj in &collected {
        if heap.extra().has_flag(obj, NEVER_FROZEN) {
            log::trace!(
                target: "mm-freeze",
                "freeze of {:p} aborted: {:p} is marked never-frozen",
                root,
                obj
            );
            return Some(obj);
        }
    }

    for &obj in &collected {
        heap.extra().get_or_install(obj).set_flag(FROZEN);
    }
    log::trace!(
        target: "mm-freeze",
        "froze {} objects reachable from {:p}",
        collected.len(),
        root
    );
    None
}

/// Marks the object as never freezable. Returns `false` without touching
/// flags if the object is already frozen; freezing is monotonic and cannot
/// be undone.
pub fn ensure_never_frozen(heap: &Heap, obj: *mut ObjHeader) -> bool {
    if frozen_bit_set(heap, obj) {
        return false;
    }
    heap.extra().get_or_install(obj).set_flag(NEVER_FROZEN);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::NoOpGc;
    use crate::heap::MemoryConfig;
    use crate::object::{alloc_object, set_ref_field, TypeInfo};
    use memoffset::offset_of;
    use once_cell::sync::Lazy;
    use std::mem::size_of;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[repr(C)]
    struct Link {
        next: *mut ObjHeader,
        other: *mut ObjHeader,
        value: u64,
    }

    static LINK_TYPE: Lazy<TypeInfo> = Lazy::new(|| {
        TypeInfo::plain(
            "Link",
            size_of::<Link>(),
            Box::leak(vec![offset_of!(Link, next), offset_of!(Link, other)].into_boxed_slice()),
        )
    });

    struct Fixture {
        heap: Arc<Heap>,
        arena: crate::arena::ArenaId,
    }

    impl Fixture {
        fn new() -> Self {
            let heap = Heap::new(MemoryConfig::default(), Box::new(NoOpGc));
            let arena = heap.arenas().create(8192);
            Self { heap, arena }
        }

        fn link(&self) -> *mut ObjHeader {
            let obj = alloc_object(&self.heap, self.arena, &LINK_TYPE);
            assert!(!obj.is_null());
            obj
        }

        fn connect(&self, from: *mut ObjHeader, to: *mut ObjHeader) {
            unsafe { set_ref_field(&self.heap, from, offset_of!(Link, next), to) }
        }
    }

    #[test]
    fn freezing_is_monotonic() {
        let f = Fixture::new();
        let obj = f.link();

        assert!(!is_frozen(&f.heap, obj));
        assert!(freeze_subgraph(&f.heap, obj).is_none());
        assert!(is_frozen(&f.heap, obj));

        // Re-freezing an already frozen root is a no-op success.
        assert!(freeze_subgraph(&f.heap, obj).is_none());
        assert!(is_frozen(&f.heap, obj));
    }

    #[test]
    fn cyclic_graphs_terminate_and_hooks_fire_once() {
        let f = Fixture::new();
        let a = f.link();
        let b = f.link();
        f.connect(a, b);
        f.connect(b, a);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        f.heap.freeze_hooks().set_for_testing(Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(freeze_subgraph(&f.heap, a).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(is_frozen(&f.heap, a));
        assert!(is_frozen(&f.heap, b));
    }

    #[test]
    fn poisoned_chain_aborts_with_no_flag_changes() {
        let f = Fixture::new();
        let a = f.link();
        let b = f.link();
        let c = f.link();
        f.connect(a, b);
        f.connect(b, c);

        assert!(ensure_never_frozen(&f.heap, c));
        let poisoned = freeze_subgraph(&f.heap, a);
        assert_eq!(poisoned, Some(c));

        assert!(!is_frozen(&f.heap, a));
        assert!(!is_frozen(&f.heap, b));
        assert!(!is_frozen(&f.heap, c));
        // Retrying always fails the same way while the poison is reachable.
        assert_eq!(freeze_subgraph(&f.heap, a), Some(c));
    }

    #[test]
    fn never_frozen_refuses_frozen_objects() {
        let f = Fixture::new();
        let obj = f.link();

        assert!(freeze_subgraph(&f.heap, obj).is_none());
        assert!(!ensure_never_frozen(&f.heap, obj));
        assert!(!f.heap.extra().has_flag(obj, NEVER_FROZEN));
    }

    #[test]
    fn frozen_frontier_is_not_retraversed() {
        let f = Fixture::new();
        let shared = f.link();
        assert!(freeze_subgraph(&f.heap, shared).is_none());

        let root = f.link();
        f.connect(root, shared);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        f.heap.freeze_hooks().set_for_testing(Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(freeze_subgraph(&f.heap, root).is_none());
        // Only the mutable frontier is visited, not the frozen subgraph.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shared_diamond_node_is_visited_once() {
        let f = Fixture::new();
        let bottom = f.link();
        let left = f.link();
        let right = f.link();
        let top = f.link();
        f.connect(top, left);
        unsafe { set_ref_field(&f.heap, top, offset_of!(Link, other), right) }
        f.connect(left, bottom);
        f.connect(right, bottom);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        f.heap.freeze_hooks().set_for_testing(Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(freeze_subgraph(&f.heap, top).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn disabled_checks_report_nothing_as_frozen() {
        let heap = Heap::new(
            MemoryConfig {
                freezing_checks_enabled: false,
                ..Default::default()
            },
            Box::new(NoOpGc),
        );
        let arena = heap.arenas().create(4096);
        let obj = alloc_object(&heap, arena, &LINK_TYPE);

        assert!(freeze_subgraph(&heap, obj).is_none());
        assert!(!is_frozen(&heap, obj));
    }

    #[test]
    fn null_root_is_a_trivial_success() {
        let f = Fixture::new();
        assert!(freeze_subgraph(&f.heap, std::ptr::null_mut()).is_none());
    }
}
