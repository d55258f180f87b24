use std::sync::Arc;
use std::thread::ThreadId;

use crate::arena::ArenaId;
use crate::heap::Heap;
use crate::object::{alloc_array, alloc_object, ObjHeader, TypeInfo};
use crate::utils::formatted_size;

/// Lifecycle of a mutator thread's attachment to the heap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MutatorState {
    /// Attached, nothing allocated yet.
    Created,
    /// Allocating / running between safepoints.
    Active,
    /// Flushing the local queue into the shared heap.
    Publishing,
    /// Detached; no further allocation is legal.
    Detached,
}

/// Per-mutator allocation context: a thread-confined set of arenas and a
/// queue of allocations not yet published to the shared heap.
///
/// `ThreadData` is deliberately not `Send`; it belongs to the thread that
/// attached it. Allocation never blocks on other threads under the no-op
/// policy: a full arena is replaced by a fresh one, never compacted.
pub struct ThreadData {
    heap: Arc<Heap>,
    id: ThreadId,
    state: MutatorState,
    /// Arena currently receiving allocations.
    current: Option<ArenaId>,
    /// Every arena this mutator ever created. They stay alive after detach;
    /// reclamation of their objects is the GC policy's job.
    arenas: Vec<ArenaId>,
    /// Allocations deferred for publication at the next safepoint.
    queue: Vec<*mut ObjHeader>,
}

impl ThreadData {
    pub fn attach(heap: &Arc<Heap>) -> Self {
        let id = std::thread::current().id();
        log::trace!(target: "mm-thread", "mutator attached on {:?}", id);
        Self {
            heap: heap.clone(),
            id,
            state: MutatorState::Created,
            current: None,
            arenas: Vec::new(),
            queue: Vec::new(),
        }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn state(&self) -> MutatorState {
        self.state
    }

    pub fn thread_id(&self) -> ThreadId {
        self.id
    }

    /// Number of allocations awaiting publication.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Allocates a plain object of type `ti` in the thread-local space.
    /// O(1) amortized; grows by a fresh arena on exhaustion.
    pub fn create_object(&mut self, ti: &'static TypeInfo) -> *mut ObjHeader {
        let size = ti.instance_size(0);
        self.safepoint_allocation(size);
        self.allocate(size, |heap, arena| alloc_object(heap, arena, ti))
    }

    /// Allocates an array of `count` elements in the thread-local space.
    /// Returns null for element counts whose footprint overflows.
    pub fn create_array(&mut self, ti: &'static TypeInfo, count: usize) -> *mut ObjHeader {
        let size = match ti.checked_instance_size(count) {
            Some(size) => size,
            None => return std::ptr::null_mut(),
        };
        self.safepoint_allocation(size);
        self.allocate(size, |heap, arena| alloc_array(heap, arena, ti, count))
    }

    fn allocate(
        &mut self,
        size: usize,
        alloc: impl Fn(&Heap, ArenaId) -> *mut ObjHeader,
    ) -> *mut ObjHeader {
        debug_assert!(
            self.state != MutatorState::Detached,
            "allocation on a detached mutator"
        );
        self.state = MutatorState::Active;

        let arena = match self.current {
            Some(id) => id,
            None => self.grow(size),
        };
        let mut obj = alloc(&self.heap, arena);
        if obj.is_null() {
            let arena = self.grow(size);
            obj = alloc(&self.heap, arena);
            debug_assert!(!obj.is_null(), "fresh arena cannot satisfy allocation");
        }
        if !obj.is_null() {
            self.queue.push(obj);
        }
        obj
    }

    /// Creates a fresh arena sized to hold at least `size` and makes it the
    /// current allocation target.
    fn grow(&mut self, size: usize) -> ArenaId {
        let capacity = self.heap.config().arena_size.max(size);
        let id = self.heap.arenas().create(capacity);
        log::trace!(
            target: "mm-thread",
            "{:?}: new allocation arena {:?} ({})",
            self.id,
            id,
            formatted_size(capacity)
        );
        self.arenas.push(id);
        self.current = Some(id);
        id
    }

    /// Flushes the thread-local allocation queue into the globally visible
    /// object set. After this call the flushed objects show up in heap
    /// introspection and whole-heap enumeration; ownership and mutability
    /// rules are unchanged.
    pub fn publish(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        debug_assert!(self.state != MutatorState::Detached);
        self.state = MutatorState::Publishing;
        self.heap.publish_objects(&self.queue);
        self.queue.clear();
        self.state = MutatorState::Active;
    }

    /// Publishes pending allocations and detaches the mutator. Its arenas
    /// stay alive; published objects may outlive the thread.
    pub fn detach(&mut self) {
        if self.state == MutatorState::Detached {
            return;
        }
        self.publish();
        self.state = MutatorState::Detached;
        log::trace!(target: "mm-thread", "mutator detached on {:?}", self.id);
    }

    /// Cooperative suspension point at function return.
    pub fn safepoint_function_epilogue(&mut self) {
        let heap = self.heap.clone();
        heap.gc().safepoint_function_epilogue(self);
    }

    /// Cooperative suspension point at loop back-edges.
    pub fn safepoint_loop_body(&mut self) {
        let heap = self.heap.clone();
        heap.gc().safepoint_loop_body(self);
    }

    /// Cooperative suspension point while unwinding an exception.
    pub fn safepoint_exception_unwind(&mut self) {
        let heap = self.heap.clone();
        heap.gc().safepoint_exception_unwind(self);
    }

    fn safepoint_allocation(&mut self, size: usize) {
        let heap = self.heap.clone();
        heap.gc().safepoint_allocation(self, size);
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::NoOpGc;
    use crate::heap::MemoryConfig;
    use crate::object::TypeKind;

    static NODE_TYPE: TypeInfo = TypeInfo::plain("Node", 24, &[]);
    static BYTE_ARRAY_TYPE: TypeInfo = TypeInfo::prim_array("ByteArray", 1);

    fn new_heap() -> Arc<Heap> {
        Heap::new(MemoryConfig::default(), Box::new(NoOpGc))
    }

    #[test]
    fn allocations_invisible_until_publish() {
        let heap = new_heap();
        let mut mutator = ThreadData::attach(&heap);
        assert_eq!(mutator.state(), MutatorState::Created);

        let n = 10;
        for _ in 0..n {
            assert!(!mutator.create_object(&NODE_TYPE).is_null());
        }
        assert_eq!(mutator.state(), MutatorState::Active);
        assert_eq!(mutator.pending(), n);
        assert_eq!(heap.published_object_count(), 0);
        assert_eq!(heap.total_heap_objects_size_bytes(), 0);

        mutator.publish();
        assert_eq!(mutator.pending(), 0);
        assert_eq!(heap.published_object_count(), n);
        assert_eq!(heap.total_heap_objects_size_bytes(), n * NODE_TYPE.size);
        assert_eq!(
            heap.allocated_heap_size(),
            n * NODE_TYPE.instance_size(0)
        );
    }

    #[test]
    fn arrays_record_their_element_count() {
        let heap = new_heap();
        let mut mutator = ThreadData::attach(&heap);

        let arr = mutator.create_array(&BYTE_ARRAY_TYPE, 100);
        assert!(!arr.is_null());
        unsafe {
            assert_eq!((*arr).count(), 100);
            assert_eq!((*arr).payload_size(), 100);
            assert!(matches!(
                (*arr).type_info().kind,
                TypeKind::PrimArray { elem_size: 1 }
            ));
        }
    }

    #[test]
    fn exhausted_arena_grows_without_failing() {
        let heap = Heap::new(
            MemoryConfig {
                arena_size: 256,
                ..Default::default()
            },
            Box::new(NoOpGc),
        );
        let mut mutator = ThreadData::attach(&heap);

        for _ in 0..64 {
            assert!(!mutator.create_object(&NODE_TYPE).is_null());
        }
        // An allocation bigger than the configured arena size still works.
        let big = mutator.create_array(&BYTE_ARRAY_TYPE, 4096);
        assert!(!big.is_null());
    }

    #[test]
    fn overflowing_array_count_returns_null() {
        let heap = new_heap();
        let mut mutator = ThreadData::attach(&heap);

        // Footprint of count * elem_size + headers exceeds usize.
        let arr = mutator.create_array(&BYTE_ARRAY_TYPE, usize::MAX - 4);
        assert!(arr.is_null());
        assert_eq!(mutator.pending(), 0);

        // The mutator stays usable afterwards.
        assert!(!mutator.create_object(&NODE_TYPE).is_null());
    }

    #[test]
    fn detach_publishes_leftovers() {
        let heap = new_heap();
        {
            let mut mutator = ThreadData::attach(&heap);
            mutator.create_object(&NODE_TYPE);
            mutator.create_object(&NODE_TYPE);
            // Dropped without an explicit publish.
        }
        assert_eq!(heap.published_object_count(), 2);
    }

    #[test]
    fn safepoints_are_callable_under_noop_policy() {
        let heap = new_heap();
        let mut mutator = ThreadData::attach(&heap);
        mutator.create_object(&NODE_TYPE);
        mutator.safepoint_function_epilogue();
        mutator.safepoint_loop_body();
        mutator.safepoint_exception_unwind();
        mutator.publish();
        mutator.detach();
        assert_eq!(mutator.state(), MutatorState::Detached);
    }

    #[test]
    fn concurrent_mutators_do_not_corrupt_the_heap() {
        let _ = env_logger::builder().is_test(true).try_init();

        let heap = new_heap();
        let per_thread = 100;
        let handles = (0..8)
            .map(|_| {
                let heap = heap.clone();
                std::thread::spawn(move || {
                    let mut mutator = ThreadData::attach(&heap);
                    for i in 0..per_thread {
                        assert!(!mutator.create_object(&NODE_TYPE).is_null());
                        if i % 10 == 9 {
                            mutator.publish();
                        }
                        mutator.safepoint_loop_body();
                    }
                    mutator.detach();
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(heap.published_object_count(), 8 * per_thread);
        assert_eq!(
            heap.total_heap_objects_size_bytes(),
            8 * per_thread * NODE_TYPE.size
        );
    }
}
