pub type FinalizationCallback = unsafe fn(*mut u8);

/// Destructor glue recorded per type. Types without drop glue record no callback
/// so sweeping them only releases storage.
pub trait FinalizeTrait<T> {
    const NON_TRIVIAL_DTOR: bool = core::mem::needs_drop::<T>();
    const CALLBACK: Option<FinalizationCallback> = if Self::NON_TRIVIAL_DTOR {
        Some(Self::finalize)
    } else {
        None
    };

    unsafe fn finalize(obj: *mut u8) {
        core::ptr::drop_in_place(obj.cast::<T>());
    }
}

impl<T> FinalizeTrait<T> for T {}
