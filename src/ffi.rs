//! C ABI over the process-wide collector.
//!
//! Mirrors the `gc_*` surface the rest of the toolchain links against.
//! Invariant violations (addref/delref of a foreign pointer, refcount
//! underflow) panic, which aborts at this boundary.

use crate::error::GCError;
use crate::gc::global;
use crate::object::Destructor;
use crate::GCResult;
use std::ffi::{c_int, c_void};

pub type CDestructor = Option<unsafe extern "C" fn(*mut c_void)>;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GCReturnCode {
    Success = 0,
    ErrorAlreadyInitialized = -1,
    ErrorNotInitialized = -2,
    ErrorShutDown = -3,
    ErrorAllocationFailed = -4,
    ErrorInternal = -5,
}

impl From<&GCError> for GCReturnCode {
    fn from(err: &GCError) -> Self {
        match err {
            GCError::AlreadyInitialized => GCReturnCode::ErrorAlreadyInitialized,
            GCError::NotInitialized => GCReturnCode::ErrorNotInitialized,
            GCError::ShutDown => GCReturnCode::ErrorShutDown,
            GCError::InvalidLayout(_) | GCError::AllocationFailed(_) => {
                GCReturnCode::ErrorAllocationFailed
            }
            GCError::Internal(_) => GCReturnCode::ErrorInternal,
        }
    }
}

impl<T> From<GCResult<T>> for GCReturnCode {
    fn from(result: GCResult<T>) -> Self {
        match result {
            Ok(_) => GCReturnCode::Success,
            Err(ref e) => e.into(),
        }
    }
}

/// Installs the process-wide collector, rooted at `stack_bottom`.
///
/// # Safety
///
/// `stack_bottom` must point at a local of the calling thread's outermost
/// frame that stays live until `gc_deinit`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gc_init(stack_bottom: *mut *mut c_void) -> GCReturnCode {
    // SAFETY: guaranteed by the caller.
    let result = unsafe { global::init(stack_bottom.cast_const().cast()) };
    result.into()
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_deinit() {
    global::deinit();
}

/// Returns null when the collector is missing, shut down, or out of memory.
#[unsafe(no_mangle)]
pub extern "C" fn gc_alloc(size: usize, destructor: CDestructor) -> *mut c_void {
    match global::allocate(size, destructor.map(Destructor::Foreign)) {
        Ok(payload) => payload.as_ptr().cast(),
        Err(err) => {
            log::error!("gc_alloc({size}) failed: {err}");
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_addref(ptr: *mut c_void) -> *mut c_void {
    global::addref(ptr.cast()).cast()
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_delref(ptr: *mut c_void) {
    global::delref(ptr.cast());
}

/// Stores `newref` into `*dest`, adding the new reference before dropping
/// the old one.
///
/// # Safety
///
/// `dest` must be null or valid for reads and writes of a pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gc_swapref(dest: *mut *mut c_void, newref: *mut c_void) {
    // SAFETY: guaranteed by the caller.
    let Some(slot) = (unsafe { dest.cast::<*mut u8>().as_mut() }) else {
        return;
    };
    global::swapref(slot, newref.cast());
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_collect() -> GCReturnCode {
    global::collect().into()
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_is_initialized() -> c_int {
    if global::is_initialized() { 1 } else { 0 }
}

/// Objects currently tracked by the process-wide collector.
#[unsafe(no_mangle)]
pub extern "C" fn gc_object_count() -> usize {
    global::with(|gc| gc.tracked_count()).unwrap_or(0)
}
