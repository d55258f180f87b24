//! Memory manager for a managed-language native runtime.
//!
//! The crate provides per-thread object allocation into refcounted bump
//! arenas, a pluggable garbage-collection policy (with a no-op reference
//! policy), a freezing mechanism that turns a mutable thread-confined object
//! subgraph into an immutable snapshot shareable across mutator threads, and
//! stable/foreign reference handles for native interop code.
//!
//! Entry points: build a [`heap::Heap`], attach a [`thread::ThreadData`] per
//! mutator thread, allocate through it, and [`thread::ThreadData::publish`]
//! at safepoints to make allocations visible to whole-heap operations.

pub mod arena;
pub mod extra;
pub mod foreign;
pub mod freeze;
pub mod gc;
pub mod heap;
pub mod object;
pub mod thread;
pub mod traverse;
pub mod utils;

pub use arena::ArenaId;
pub use foreign::{
    adopt_reference_from_shared_variable, adopt_stable_pointer, create_stable_pointer,
    deinit_foreign_ref, deref_stable_pointer, dispose_stable_pointer, init_foreign_ref,
    init_local_foreign_ref, is_foreign_ref_accessible, ForeignRefContext, StableRef,
};
pub use freeze::{ensure_never_frozen, freeze_subgraph, is_frozen, FreezeHook, FreezeHooks};
pub use gc::{GcPolicy, NoOpGc};
pub use heap::{Heap, HeapStats, MemoryConfig};
pub use object::{ArenaRef, ArrayHeader, ObjHeader, TypeInfo, TypeKind};
pub use thread::{MutatorState, ThreadData};
pub use traverse::traverse_referred_objects;
pub use utils::formatted_size;
