use crate::heap::Heap;
use crate::thread::ThreadData;

/// Pluggable collection strategy. One implementation is selected at heap
/// construction; the allocation fast path never goes through dynamic
/// dispatch, only safepoints and schedule requests do.
///
/// The safepoint hooks are the only places a mutator may be asked to pause;
/// a conforming policy must not suspend mutators anywhere else. A policy
/// claiming [`GcPolicy::supports_multiple_mutators`] must guarantee that
/// allocation and publish on one thread never corrupt state observed by
/// another.
pub trait GcPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_multiple_mutators(&self) -> bool {
        true
    }

    /// Cooperative suspension point at function return.
    fn safepoint_function_epilogue(&self, _mutator: &mut ThreadData) {}

    /// Cooperative suspension point at loop back-edges.
    fn safepoint_loop_body(&self, _mutator: &mut ThreadData) {}

    /// Cooperative suspension point while unwinding an exception.
    fn safepoint_exception_unwind(&self, _mutator: &mut ThreadData) {}

    /// Cooperative suspension point on the allocation path, with the size
    /// about to be allocated.
    fn safepoint_allocation(&self, _mutator: &mut ThreadData, _size: usize) {}

    /// Requests an asynchronous collection pass.
    fn schedule(&self, heap: &Heap);

    /// Requests a collection pass and returns only once it has completed.
    fn schedule_and_wait_full_gc(&self, heap: &Heap);

    /// As [`GcPolicy::schedule_and_wait_full_gc`], additionally waiting for
    /// object finalization.
    fn schedule_and_wait_full_gc_with_finalizers(&self, heap: &Heap);
}

/// The minimal legal policy: never pauses mutators and never reclaims
/// memory. Synchronous schedule requests complete trivially (the requested
/// pass does nothing) and return immediately. Heap size only grows under
/// this policy; that is a conformance level, not an error.
pub struct NoOpGc;

impl GcPolicy for NoOpGc {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn schedule(&self, heap: &Heap) {
        log::trace!(
            target: "mm-gc",
            "noop gc: schedule requested, allocated {}",
            crate::utils::formatted_size(heap.allocated_heap_size())
        );
    }

    fn schedule_and_wait_full_gc(&self, heap: &Heap) {
        log::trace!(
            target: "mm-gc",
            "noop gc: full gc requested, allocated {}",
            crate::utils::formatted_size(heap.allocated_heap_size())
        );
    }

    fn schedule_and_wait_full_gc_with_finalizers(&self, heap: &Heap) {
        log::trace!(target: "mm-gc", "noop gc: full gc with finalizers requested");
    }
}
