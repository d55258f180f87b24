use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::utils::formatted_size;

/// Alignment of arena buffers and of every allocation cut out of them.
pub const ARENA_ALIGNMENT: usize = 16;

/// Index of an arena inside its heap's [`ArenaTable`].
///
/// Object headers carry this id instead of a back-pointer to the arena, so
/// refcount updates go through a table lookup rather than chasing a raw
/// pointer into freed memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ArenaId(u32);

impl ArenaId {
    /// Sentinel for permanent (compile-time constant) objects. Permanent
    /// objects live outside any arena and are never refcounted.
    pub const PERMANENT: ArenaId = ArenaId(u32::MAX);

    #[inline]
    pub fn is_permanent(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One arena slot: a contiguous zero-initialized buffer with a bump cursor
/// and a reference count.
///
/// `buf` is null once the arena has been disposed; every operation on a
/// disposed slot degrades to a no-op so that destructor races against
/// teardown cannot touch freed memory.
struct ArenaEntry {
    buf: AtomicPtr<u8>,
    capacity: usize,
    cursor: AtomicUsize,
    refcount: AtomicUsize,
}

// Buffers are handed out raw; the allocation discipline (arenas are bump-only
// and thread-confined for allocation) is enforced by the callers in
// `thread::ThreadData`.
unsafe impl Send for ArenaEntry {}
unsafe impl Sync for ArenaEntry {}

impl ArenaEntry {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        let layout = Layout::from_size_align(capacity, ARENA_ALIGNMENT)
            .expect("arena capacity overflows Layout");
        let buf = unsafe { alloc_zeroed(layout) };
        assert!(!buf.is_null(), "arena buffer allocation failed");
        Self {
            buf: AtomicPtr::new(buf),
            capacity,
            cursor: AtomicUsize::new(0),
            refcount: AtomicUsize::new(0),
        }
    }

    /// Bump-allocates `size` bytes. Returns `None` on exhaustion without
    /// advancing the cursor, so a failed allocation leaves no partial object
    /// behind.
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let buf = self.buf.load(Ordering::Acquire);
        if buf.is_null() {
            return None;
        }

        let mut cur = self.cursor.load(Ordering::Relaxed);
        loop {
            let end = match cur.checked_add(size) {
                Some(end) if end <= self.capacity => end,
                _ => return None,
            };
            match self.cursor.compare_exchange_weak(
                cur,
                end,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return unsafe { Some(NonNull::new_unchecked(buf.add(cur))) },
                Err(c) => cur = c,
            }
        }
    }

    /// Frees the buffer regardless of the refcount. Idempotent.
    fn dispose(&self) {
        let buf = self.buf.swap(null_mut(), Ordering::AcqRel);
        if buf.is_null() {
            return;
        }
        debug_assert_eq!(
            self.refcount.load(Ordering::Relaxed),
            0,
            "arena disposed with outstanding references"
        );
        unsafe {
            dealloc(
                buf,
                Layout::from_size_align_unchecked(self.capacity, ARENA_ALIGNMENT),
            );
        }
        self.refcount.store(0, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.buf.load(Ordering::Acquire).is_null()
    }
}

impl Drop for ArenaEntry {
    fn drop(&mut self) {
        let buf = self.buf.swap(null_mut(), Ordering::AcqRel);
        if !buf.is_null() {
            unsafe {
                dealloc(
                    buf,
                    Layout::from_size_align_unchecked(self.capacity, ARENA_ALIGNMENT),
                );
            }
        }
    }
}

/// Heap-owned table of arenas addressed by [`ArenaId`].
///
/// Disposed slots go on a free list and are reused by later `create` calls;
/// this is sound because `dispose` is only legal once the caller has proven
/// no outstanding refs exist (see [`ArenaTable::dispose`]).
pub struct ArenaTable {
    slots: RwLock<Vec<Box<ArenaEntry>>>,
    free: Mutex<Vec<u32>>,
}

impl ArenaTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Creates a new arena with the given byte capacity.
    pub fn create(&self, capacity: usize) -> ArenaId {
        let entry = Box::new(ArenaEntry::new(capacity));

        let id = {
            let mut slots = self.slots.write();
            if let Some(ix) = self.free.lock().pop() {
                slots[ix as usize] = entry;
                ix
            } else {
                slots.push(entry);
                (slots.len() - 1) as u32
            }
        };

        log::trace!(target: "mm-arena", "created arena #{} ({})", id, formatted_size(capacity));
        ArenaId(id)
    }

    /// Bump-allocates `size` bytes inside the arena; `None` on exhaustion.
    /// The caller is responsible for alignment of `size` and for writing the
    /// object header into the returned memory.
    pub fn alloc(&self, id: ArenaId, size: usize) -> Option<NonNull<u8>> {
        if id.is_permanent() {
            return None;
        }
        let slots = self.slots.read();
        slots.get(id.index())?.alloc(size)
    }

    /// Increments the arena's refcount. No-op for permanent ids and for
    /// arenas that have already been disposed.
    pub fn add_ref(&self, id: ArenaId) {
        if id.is_permanent() {
            return;
        }
        let slots = self.slots.read();
        if let Some(entry) = slots.get(id.index()) {
            if !entry.is_disposed() {
                entry.refcount.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Decrements the arena's refcount, saturating at zero. Does not free
    /// the buffer; deallocation is explicit via [`ArenaTable::dispose`].
    pub fn release(&self, id: ArenaId) {
        if id.is_permanent() {
            return;
        }
        let slots = self.slots.read();
        if let Some(entry) = slots.get(id.index()) {
            if !entry.is_disposed() {
                let _ = entry
                    .refcount
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
            }
        }
    }

    /// Force-frees the arena's buffer and zeroes its refcount regardless of
    /// outstanding holders.
    ///
    /// Unsafe in spirit: reserved for teardown paths (stack-scoped arenas)
    /// where the caller has proven no other code holds a reference into the
    /// arena. Stack-scoped arenas are thread-confined and must only be
    /// disposed from their owning thread. Heap-attached callers go through
    /// `Heap::dispose_arena`, which also purges per-object metadata keyed
    /// by addresses inside the buffer.
    pub fn dispose(&self, id: ArenaId) {
        if id.is_permanent() {
            return;
        }
        let slots = self.slots.read();
        if let Some(entry) = slots.get(id.index()) {
            if !entry.is_disposed() {
                entry.dispose();
                self.free.lock().push(id.index() as u32);
                log::trace!(target: "mm-arena", "disposed arena #{}", id.index());
            }
        }
    }

    pub fn ref_count(&self, id: ArenaId) -> usize {
        if id.is_permanent() {
            return 0;
        }
        let slots = self.slots.read();
        slots
            .get(id.index())
            .map_or(0, |e| e.refcount.load(Ordering::Acquire))
    }

    /// Bytes bumped so far in the arena.
    pub fn used(&self, id: ArenaId) -> usize {
        if id.is_permanent() {
            return 0;
        }
        let slots = self.slots.read();
        slots
            .get(id.index())
            .map_or(0, |e| e.cursor.load(Ordering::Relaxed))
    }

    pub fn capacity(&self, id: ArenaId) -> usize {
        if id.is_permanent() {
            return 0;
        }
        let slots = self.slots.read();
        slots.get(id.index()).map_or(0, |e| e.capacity)
    }

    /// Address range `[start, end)` of the arena's buffer. `None` for
    /// permanent ids and disposed arenas.
    pub(crate) fn span(&self, id: ArenaId) -> Option<(usize, usize)> {
        if id.is_permanent() {
            return None;
        }
        let slots = self.slots.read();
        let entry = slots.get(id.index())?;
        let buf = entry.buf.load(Ordering::Acquire);
        if buf.is_null() {
            return None;
        }
        Some((buf as usize, buf as usize + entry.capacity))
    }

    pub fn is_disposed(&self, id: ArenaId) -> bool {
        if id.is_permanent() {
            return false;
        }
        let slots = self.slots.read();
        slots.get(id.index()).map_or(true, |e| e.is_disposed())
    }
}

impl Default for ArenaTable {
    fn default() -> Self {
        Self::new()
    }
}
