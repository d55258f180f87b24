use crate::object::{ObjHeader, TypeKind};

/// Invokes `visitor` once for every non-null owned reference held by `obj`:
/// the fields listed in the type's `owned_ref_offsets` for plain objects,
/// every element slot for object arrays. Visiting order is unspecified and
/// callers must not depend on it.
///
/// # Safety
/// `obj` must point to a live object whose reference fields hold either null
/// or valid object pointers.
pub unsafe fn traverse_referred_objects(
    obj: *const ObjHeader,
    mut visitor: impl FnMut(*mut ObjHeader),
) {
    let ti = (*obj).type_info();
    let payload = (*obj).payload();

    match ti.kind {
        TypeKind::Plain => {
            for &offset in ti.owned_ref_offsets {
                let field = (payload.add(offset) as *const *mut ObjHeader).read();
                if !field.is_null() {
                    visitor(field);
                }
            }
        }
        TypeKind::ObjArray => {
            let elements = payload as *const *mut ObjHeader;
            for i in 0..(*obj).count() {
                let field = elements.add(i).read();
                if !field.is_null() {
                    visitor(field);
                }
            }
        }
        TypeKind::PrimArray { .. } => {}
    }
}
