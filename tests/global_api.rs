use sclpl_gc::ffi::{
    GCReturnCode, gc_addref, gc_alloc, gc_collect, gc_deinit, gc_delref, gc_init,
    gc_is_initialized, gc_object_count, gc_swapref,
};
use sclpl_gc::gc::global;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

static DESTROYED: AtomicUsize = AtomicUsize::new(0);

#[repr(C)]
struct Token {
    text: *mut c_void,
}

unsafe extern "C" fn drop_token(payload: *mut c_void) {
    DESTROYED.fetch_add(1, Ordering::SeqCst);
    let token = unsafe { &*(payload as *const Token) };
    gc_delref(token.text);
}

#[inline(never)]
fn token_lifecycle() {
    let text = gc_alloc(16, None);
    let token = gc_alloc(std::mem::size_of::<Token>(), Some(drop_token));
    assert!(!text.is_null() && !token.is_null());
    let token = std::hint::black_box(&token);

    unsafe {
        gc_swapref(&raw mut (*token.cast::<Token>()).text, text);
        gc_swapref(std::ptr::null_mut(), text);
    }
    assert_eq!(
        global::with(|gc| gc.refcount(text.cast())).unwrap(),
        Some(1)
    );

    assert_eq!(gc_collect(), GCReturnCode::Success);
    assert_eq!(gc_object_count(), 2);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);

    gc_deinit();
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
    assert_eq!(gc_object_count(), 0);

    assert_eq!(gc_addref(text), text);
    gc_delref(text);
    assert!(gc_alloc(8, None).is_null());
}

#[test]
fn global_collector_lifecycle() {
    let _ = env_logger::builder().is_test(true).try_init();

    assert_eq!(gc_is_initialized(), 0);
    assert_eq!(gc_collect(), GCReturnCode::ErrorNotInitialized);
    assert!(gc_alloc(8, None).is_null());
    assert!(gc_addref(std::ptr::null_mut()).is_null());

    let mut stack_bottom: *mut c_void = std::ptr::null_mut();
    unsafe {
        assert_eq!(gc_init(&raw mut stack_bottom), GCReturnCode::Success);
        assert_eq!(
            gc_init(&raw mut stack_bottom),
            GCReturnCode::ErrorAlreadyInitialized
        );
    }
    assert_eq!(gc_is_initialized(), 1);

    token_lifecycle();
    std::hint::black_box(&stack_bottom);
}
