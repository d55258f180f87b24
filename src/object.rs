use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::Arc;

use crate::arena::{ArenaId, ARENA_ALIGNMENT};
use crate::freeze;
use crate::heap::Heap;
use crate::utils::align_usize;

/// Alignment of every object placed in an arena, headers included.
pub const OBJECT_ALIGNMENT: usize = ARENA_ALIGNMENT;

/// Shape of a managed type's instances.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TypeKind {
    /// Fixed-size object; reference fields are listed in `owned_ref_offsets`.
    Plain,
    /// Array whose every element slot is an owned reference.
    ObjArray,
    /// Array of raw scalars; holds no references.
    PrimArray { elem_size: usize },
}

/// Minimal per-type descriptor consumed by allocation and graph traversal.
///
/// `owned_ref_offsets` lists the byte offset (relative to the payload start)
/// of every reference-typed field. The list must be exhaustive: graph walks
/// silently miss reachable objects for every offset left out.
pub struct TypeInfo {
    pub type_name: &'static str,
    /// Payload size in bytes for `Plain` types; ignored for arrays.
    pub size: usize,
    pub kind: TypeKind,
    pub owned_ref_offsets: &'static [usize],
}

impl TypeInfo {
    pub const fn plain(
        type_name: &'static str,
        size: usize,
        owned_ref_offsets: &'static [usize],
    ) -> Self {
        Self {
            type_name,
            size,
            kind: TypeKind::Plain,
            owned_ref_offsets,
        }
    }

    pub const fn obj_array(type_name: &'static str) -> Self {
        Self {
            type_name,
            size: 0,
            kind: TypeKind::ObjArray,
            owned_ref_offsets: &[],
        }
    }

    pub const fn prim_array(type_name: &'static str, elem_size: usize) -> Self {
        Self {
            type_name,
            size: 0,
            kind: TypeKind::PrimArray { elem_size },
            owned_ref_offsets: &[],
        }
    }

    pub fn element_size(&self) -> usize {
        match self.kind {
            TypeKind::Plain => 0,
            TypeKind::ObjArray => size_of::<*mut ObjHeader>(),
            TypeKind::PrimArray { elem_size } => elem_size,
        }
    }

    /// Total footprint of an instance with `count` elements, headers
    /// included, rounded up to [`OBJECT_ALIGNMENT`].
    pub fn instance_size(&self, count: usize) -> usize {
        let raw = match self.kind {
            TypeKind::Plain => size_of::<ObjHeader>() + self.size,
            TypeKind::ObjArray | TypeKind::PrimArray { .. } => {
                size_of::<ArrayHeader>() + count * self.element_size()
            }
        };
        align_usize(raw, OBJECT_ALIGNMENT)
    }

    /// As [`TypeInfo::instance_size`], but `None` when the footprint does
    /// not fit in `usize`. Array counts come in from untrusted callers, so
    /// allocation paths size instances through this instead.
    pub fn checked_instance_size(&self, count: usize) -> Option<usize> {
        let raw = match self.kind {
            TypeKind::Plain => size_of::<ObjHeader>().checked_add(self.size)?,
            TypeKind::ObjArray | TypeKind::PrimArray { .. } => count
                .checked_mul(self.element_size())?
                .checked_add(size_of::<ArrayHeader>())?,
        };
        raw.checked_add(OBJECT_ALIGNMENT - 1)
            .map(|r| r & !(OBJECT_ALIGNMENT - 1))
    }
}

/// Header preceding every managed object's payload: the type descriptor and
/// the id of the owning arena.
#[repr(C)]
pub struct ObjHeader {
    type_info: *const TypeInfo,
    arena: ArenaId,
}

/// Header preceding array payloads; extends [`ObjHeader`] with the element
/// count fixed at allocation time.
#[repr(C)]
pub struct ArrayHeader {
    pub obj: ObjHeader,
    pub count: usize,
}

impl ObjHeader {
    pub(crate) fn new(type_info: &'static TypeInfo, arena: ArenaId) -> Self {
        Self {
            type_info,
            arena,
        }
    }

    pub fn type_info(&self) -> &'static TypeInfo {
        unsafe { &*self.type_info }
    }

    pub fn arena(&self) -> ArenaId {
        self.arena
    }

    pub fn is_permanent(&self) -> bool {
        self.arena.is_permanent()
    }

    pub fn is_array(&self) -> bool {
        !matches!(self.type_info().kind, TypeKind::Plain)
    }

    /// Element count; zero for non-array objects.
    pub fn count(&self) -> usize {
        if self.is_array() {
            unsafe { (*(self as *const Self as *const ArrayHeader)).count }
        } else {
            0
        }
    }

    /// First byte of the object's data, past the (array) header.
    pub fn payload(&self) -> *mut u8 {
        let base = self as *const Self as usize;
        let hdr = if self.is_array() {
            size_of::<ArrayHeader>()
        } else {
            size_of::<ObjHeader>()
        };
        (base + hdr) as *mut u8
    }

    pub fn payload_size(&self) -> usize {
        let ti = self.type_info();
        match ti.kind {
            TypeKind::Plain => ti.size,
            _ => self.count() * ti.element_size(),
        }
    }

    /// Total footprint including headers and alignment padding.
    pub fn heap_size(&self) -> usize {
        self.type_info().instance_size(self.count())
    }
}

/// Allocates a plain object of type `ti` inside `arena`, writing its header.
/// Returns null on arena exhaustion; the caller picks a grow policy.
pub fn alloc_object(heap: &Heap, arena: ArenaId, ti: &'static TypeInfo) -> *mut ObjHeader {
    debug_assert!(matches!(ti.kind, TypeKind::Plain));
    let size = ti.instance_size(0);
    match heap.arenas().alloc(arena, size) {
        Some(mem) => unsafe {
            let obj = mem.as_ptr() as *mut ObjHeader;
            obj.write(ObjHeader {
                type_info: ti,
                arena,
            });
            obj
        },
        None => null_mut(),
    }
}

/// Allocates an array object with `count` elements inside `arena`.
/// Returns null on arena exhaustion or when the requested footprint
/// overflows.
pub fn alloc_array(
    heap: &Heap,
    arena: ArenaId,
    ti: &'static TypeInfo,
    count: usize,
) -> *mut ObjHeader {
    debug_assert!(!matches!(ti.kind, TypeKind::Plain));
    let size = match ti.checked_instance_size(count) {
        Some(size) => size,
        None => return null_mut(),
    };
    match heap.arenas().alloc(arena, size) {
        Some(mem) => unsafe {
            let arr = mem.as_ptr() as *mut ArrayHeader;
            arr.write(ArrayHeader {
                obj: ObjHeader {
                    type_info: ti,
                    arena,
                },
                count,
            });
            arr as *mut ObjHeader
        },
        None => null_mut(),
    }
}

/// Get/set view of a single field, bound to a byte offset inside the
/// payload. This is the seam generated accessor code goes through; it is not
/// meant to be hand-rolled per object type.
pub struct FieldView<'h, T> {
    heap: &'h Heap,
    obj: *mut ObjHeader,
    ptr: *mut T,
}

impl<'h, T: Copy> FieldView<'h, T> {
    pub fn get(&self) -> T {
        unsafe { self.ptr.read() }
    }

    pub fn set(&self, value: T) {
        debug_assert!(
            !freeze::is_frozen(self.heap, self.obj),
            "mutation of a frozen object"
        );
        unsafe { self.ptr.write(value) }
    }
}

/// Builds a [`FieldView`] for the field at `offset` bytes into the payload.
///
/// # Safety
/// `obj` must point to a live object of this heap and `offset` must name a
/// field of type `T` within its payload.
pub unsafe fn field_at<'h, T>(heap: &'h Heap, obj: *mut ObjHeader, offset: usize) -> FieldView<'h, T> {
    debug_assert!(offset + size_of::<T>() <= (*obj).payload_size());
    FieldView {
        heap,
        obj,
        ptr: (*obj).payload().add(offset) as *mut T,
    }
}

/// Reads the owned-reference field at `offset`.
///
/// # Safety
/// Same contract as [`field_at`] with `T = *mut ObjHeader`.
pub unsafe fn ref_field(obj: *const ObjHeader, offset: usize) -> *mut ObjHeader {
    ((*obj).payload().add(offset) as *const *mut ObjHeader).read()
}

/// Stores `target` into the owned-reference field at `offset`. Reference
/// fields inside objects carry no refcount of their own; only [`ArenaRef`]
/// wrappers and `copy_to` touch arena refcounts.
///
/// # Safety
/// Same contract as [`field_at`].
pub unsafe fn set_ref_field(
    heap: &Heap,
    obj: *mut ObjHeader,
    offset: usize,
    target: *mut ObjHeader,
) {
    debug_assert!(
        !freeze::is_frozen(heap, obj),
        "mutation of a frozen object"
    );
    ((*obj).payload().add(offset) as *mut *mut ObjHeader).write(target);
}

/// Owning reference to a managed object, counted against the object's arena
/// rather than the object itself. Construction add-refs the owning arena,
/// drop releases it; null and permanent objects are not counted.
pub struct ArenaRef {
    heap: Arc<Heap>,
    obj: *mut ObjHeader,
}

impl ArenaRef {
    /// # Safety
    /// `obj` must be null or point to a live object allocated in `heap`
    /// whose arena has not been disposed.
    pub unsafe fn new(heap: &Arc<Heap>, obj: *mut ObjHeader) -> Self {
        if !obj.is_null() {
            heap.arenas().add_ref((*obj).arena());
        }
        Self {
            heap: heap.clone(),
            obj,
        }
    }

    /// Wraps an object whose arena count was already taken on the caller's
    /// behalf (stable-pointer adoption); does not add-ref.
    pub(crate) fn from_adopted(heap: &Arc<Heap>, obj: *mut ObjHeader) -> Self {
        Self {
            heap: heap.clone(),
            obj,
        }
    }

    pub fn get(&self) -> *mut ObjHeader {
        self.obj
    }

    pub fn is_null(&self) -> bool {
        self.obj.is_null()
    }

    /// Replaces the referent: add-refs the new arena, releases the old one.
    ///
    /// # Safety
    /// Same contract as [`ArenaRef::new`] for `obj`.
    pub unsafe fn assign(&mut self, obj: *mut ObjHeader) {
        if !obj.is_null() {
            self.heap.arenas().add_ref((*obj).arena());
        }
        if !self.obj.is_null() {
            self.heap.arenas().release((*self.obj).arena());
        }
        self.obj = obj;
    }

    /// Field view bound to `offset` bytes into the referent's payload.
    ///
    /// # Safety
    /// `offset` must name a field of type `T`; the referent must be non-null.
    pub unsafe fn at<T>(&self, offset: usize) -> FieldView<'_, T> {
        field_at(&self.heap, self.obj, offset)
    }

    /// Byte-copies the referent's payload into `dst`'s referent, then walks
    /// the owned-reference offsets add-refing the arena of every reference
    /// that was copied. Shallow copy with refcount fixup, not a deep clone.
    pub fn copy_to(&self, dst: &ArenaRef) {
        unsafe {
            assert!(!self.obj.is_null() && !dst.obj.is_null());
            let src = &*self.obj;
            let ti = src.type_info();
            debug_assert!(std::ptr::eq(ti, (*dst.obj).type_info()));
            debug_assert_eq!(src.count(), (*dst.obj).count());
            debug_assert!(
                !freeze::is_frozen(&self.heap, dst.obj),
                "mutation of a frozen object"
            );

            std::ptr::copy_nonoverlapping(
                src.payload(),
                (*dst.obj).payload(),
                src.payload_size(),
            );

            crate::traverse::traverse_referred_objects(dst.obj, |field| {
                self.heap.arenas().add_ref((*field).arena());
            });
        }
    }
}

impl Clone for ArenaRef {
    fn clone(&self) -> Self {
        unsafe { Self::new(&self.heap, self.obj) }
    }
}

impl Drop for ArenaRef {
    fn drop(&mut self) {
        if !self.obj.is_null() {
            unsafe {
                self.heap.arenas().release((*self.obj).arena());
            }
        }
    }
}
