use crate::GCResult;
use crate::error::GCError;
use crate::gc::GarbageCollector;
use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

/// Which partition currently owns an object's table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Explicit refcount 0, held by the zero-count table.
    ZeroCount,
    /// Explicit refcount >= 1, held by the multi-ref table.
    MultiRef,
    /// Held by the working table while a pass or teardown is running.
    InCollection,
}

/// Callback run once on a payload right before its block is released.
///
/// It may `delref` the references its payload owns and may allocate, but it
/// must not keep the payload (or anything else being swept) alive.
#[derive(Clone, Copy)]
pub enum Destructor {
    Native(fn(&GarbageCollector, NonNull<u8>)),
    Foreign(unsafe extern "C" fn(*mut c_void)),
}

impl Destructor {
    pub(crate) fn run(self, gc: &GarbageCollector, payload: NonNull<u8>) {
        match self {
            Destructor::Native(f) => f(gc, payload),
            // SAFETY: foreign destructors are registered through the C ABI
            // together with the payload they were written for.
            Destructor::Foreign(f) => unsafe { f(payload.as_ptr().cast()) },
        }
    }
}

impl fmt::Debug for Destructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destructor::Native(func) => write!(f, "Native({:p})", *func as *const ()),
            Destructor::Foreign(func) => write!(f, "Foreign({:p})", *func as *const ()),
        }
    }
}

/// Bookkeeping stored immediately before every payload.
///
/// The alignment doubles as the payload alignment: the payload starts right
/// at the end of the header.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct ObjectHeader {
    refs: usize,
    size: usize,
    destructor: Option<Destructor>,
    state: ObjectState,
}

pub const PAYLOAD_ALIGN: usize = std::mem::align_of::<ObjectHeader>();

impl ObjectHeader {
    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn destructor(&self) -> Option<Destructor> {
        self.destructor
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn set_state(&mut self, state: ObjectState) {
        self.state = state;
    }

    /// Returns the new count.
    pub fn inc_ref(&mut self) -> usize {
        self.refs += 1;
        self.refs
    }

    /// Returns the new count. Panics on underflow.
    pub fn dec_ref(&mut self) -> usize {
        assert!(self.refs > 0, "reference count underflow");
        self.refs -= 1;
        self.refs
    }
}

fn block_layout(size: usize) -> GCResult<Layout> {
    let total = std::mem::size_of::<ObjectHeader>()
        .checked_add(size)
        .ok_or(GCError::InvalidLayout(size))?;
    Layout::from_size_align(total, PAYLOAD_ALIGN).map_err(|_| GCError::InvalidLayout(size))
}

/// Allocates a zeroed header + payload block and returns the payload.
pub(crate) fn allocate_block(
    size: usize,
    destructor: Option<Destructor>,
) -> GCResult<NonNull<u8>> {
    let layout = block_layout(size)?;
    // SAFETY: the layout always includes the header, so it is never zero-sized.
    let raw = unsafe { alloc::alloc_zeroed(layout) };
    let header = NonNull::new(raw.cast::<ObjectHeader>()).ok_or(GCError::AllocationFailed(size))?;

    // SAFETY: `header` is freshly allocated, aligned and large enough.
    unsafe {
        header.write(ObjectHeader {
            refs: 0,
            size,
            destructor,
            state: ObjectState::ZeroCount,
        });
    }
    Ok(payload_of(header))
}

/// Releases the block owning `payload`.
///
/// # Safety
///
/// `payload` must come from [`allocate_block`] and not have been freed.
pub(crate) unsafe fn free_block(payload: NonNull<u8>) {
    unsafe {
        let header = header_of(payload);
        let size = header.as_ref().size;
        let layout = Layout::from_size_align_unchecked(
            std::mem::size_of::<ObjectHeader>() + size,
            PAYLOAD_ALIGN,
        );
        alloc::dealloc(header.as_ptr().cast(), layout);
    }
}

pub fn payload_of(header: NonNull<ObjectHeader>) -> NonNull<u8> {
    // SAFETY: one-past-the-header stays inside (or at the end of) the block.
    unsafe { header.add(1).cast() }
}

/// # Safety
///
/// `payload` must be a live payload returned by [`allocate_block`].
pub unsafe fn header_of(payload: NonNull<u8>) -> NonNull<ObjectHeader> {
    unsafe { payload.cast::<ObjectHeader>().sub(1) }
}

/// # Safety
///
/// `payload` must be live, and no other reference to its header may be held
/// for the returned lifetime.
pub(crate) unsafe fn header_mut<'a>(payload: NonNull<u8>) -> &'a mut ObjectHeader {
    unsafe { header_of(payload).as_mut() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_block_initializes_header() {
        let payload = allocate_block(24, None).unwrap();
        assert_eq!(payload.as_ptr() as usize % PAYLOAD_ALIGN, 0);

        unsafe {
            let header = header_of(payload).as_ref();
            assert_eq!(header.refs(), 0);
            assert_eq!(header.size(), 24);
            assert_eq!(header.state(), ObjectState::ZeroCount);
            assert!(header.destructor().is_none());

            let bytes = std::slice::from_raw_parts(payload.as_ptr(), 24);
            assert!(bytes.iter().all(|&b| b == 0));

            free_block(payload);
        }
    }

    #[test]
    fn test_header_payload_round_trip() {
        let payload = allocate_block(0, None).unwrap();
        unsafe {
            let header = header_of(payload);
            assert_eq!(payload_of(header), payload);
            free_block(payload);
        }
    }

    #[test]
    fn test_refcount_transitions() {
        let payload = allocate_block(8, None).unwrap();
        unsafe {
            let header = header_mut(payload);
            assert_eq!(header.inc_ref(), 1);
            assert_eq!(header.inc_ref(), 2);
            assert_eq!(header.dec_ref(), 1);
            assert_eq!(header.dec_ref(), 0);
            free_block(payload);
        }
    }

    #[test]
    #[should_panic(expected = "reference count underflow")]
    fn test_dec_ref_underflow_panics() {
        let payload = allocate_block(8, None).unwrap();
        unsafe {
            header_mut(payload).dec_ref();
        }
    }

    #[test]
    fn test_oversized_layout_is_rejected() {
        assert_eq!(
            allocate_block(usize::MAX, None).unwrap_err(),
            GCError::InvalidLayout(usize::MAX)
        );
    }
}
