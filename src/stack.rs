//! Root discovery.
//!
//! The collector only asks a [`RootScanner`] for candidate words; whether
//! those come from a conservative walk of the native stack or from a set the
//! caller maintains is decided at construction time.

use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::{self, ThreadId};

const WORD: usize = std::mem::size_of::<usize>();

/// Source of candidate root words for one collection pass.
pub trait RootScanner {
    /// Hands every candidate word to `visit`. Called once per pass.
    fn scan(&self, visit: &mut dyn FnMut(usize));

    /// Whether `scan` may run on the calling thread. A pass is skipped when
    /// this is false.
    fn scannable_here(&self) -> bool {
        true
    }
}

/// Scanner that reports nothing; every zero-count object is garbage.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRoots;

impl RootScanner for NoRoots {
    fn scan(&self, _visit: &mut dyn FnMut(usize)) {}
}

/// Caller-maintained root set. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct ExplicitRoots {
    roots: Arc<Mutex<Vec<usize>>>,
}

impl ExplicitRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, ptr: NonNull<u8>) {
        self.roots.lock().push(ptr.as_ptr() as usize);
    }

    /// Removes one occurrence of `ptr`.
    pub fn remove(&self, ptr: NonNull<u8>) -> bool {
        let mut roots = self.roots.lock();
        match roots.iter().position(|&r| r == ptr.as_ptr() as usize) {
            Some(index) => {
                roots.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.roots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.roots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.lock().is_empty()
    }
}

impl RootScanner for ExplicitRoots {
    fn scan(&self, visit: &mut dyn FnMut(usize)) {
        let roots = self.roots.lock().clone();
        for root in roots {
            visit(root);
        }
    }
}

/// Conservative scanner over the native stack of the thread that built it.
#[derive(Debug, Clone, Copy)]
pub struct StackScanner {
    base: usize,
    owner: ThreadId,
}

impl StackScanner {
    /// Scanner for the calling thread, rooted at `stack_bottom`.
    ///
    /// # Safety
    ///
    /// `stack_bottom` must be the address of a word on the calling thread's
    /// stack, in a frame that outlives every collection run with this
    /// scanner.
    pub unsafe fn new(stack_bottom: *const u8) -> Self {
        Self {
            base: stack_bottom as usize,
            owner: thread::current().id(),
        }
    }

    /// Uses the bounds of the current thread's stack as the base.
    #[cfg(all(target_os = "linux", not(miri)))]
    pub fn current_thread() -> Self {
        let bounds = get_stack_bounds();
        Self {
            base: bounds.bottom - WORD,
            owner: thread::current().id(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }
}

impl RootScanner for StackScanner {
    fn scan(&self, visit: &mut dyn FnMut(usize)) {
        if !self.scannable_here() {
            return;
        }
        spill_registers_and_scan(self.base, visit);
    }

    fn scannable_here(&self) -> bool {
        thread::current().id() == self.owner
    }
}

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy)]
pub struct StackBounds {
    /// Highest address (exclusive).
    pub bottom: usize,
    /// Lowest address.
    pub top: usize,
}

#[cfg(all(target_os = "linux", not(miri)))]
pub fn get_stack_bounds() -> StackBounds {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        let ret = pthread_getattr_np(pthread_self(), &raw mut attr);
        assert!(ret == 0, "pthread_getattr_np failed");

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        assert!(ret == 0, "pthread_attr_getstack failed");

        StackBounds {
            bottom: stackaddr as usize + stacksize,
            top: stackaddr as usize,
        }
    }
}

#[cfg(all(target_arch = "x86_64", not(miri)))]
const SPILL_WORDS: usize = 6;
#[cfg(all(target_arch = "aarch64", not(miri)))]
const SPILL_WORDS: usize = 11;
#[cfg(any(not(any(target_arch = "x86_64", target_arch = "aarch64")), miri))]
const SPILL_WORDS: usize = 32;

/// Copies the callee-saved registers into a stack buffer, then runs the
/// actual scan through an opaque function pointer so the buffer cannot be
/// optimized away before the scan reads it.
#[inline(never)]
fn spill_registers_and_scan(base: usize, visit: &mut dyn FnMut(usize)) {
    let mut regs = [usize::from_ne_bytes([0x55; WORD]); SPILL_WORDS];

    #[cfg(all(target_arch = "x86_64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
            options(nomem, nostack, preserves_flags),
        );
    }

    #[cfg(all(target_arch = "aarch64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "mov {0}, x19",
            "mov {1}, x20",
            "mov {2}, x21",
            "mov {3}, x22",
            "mov {4}, x23",
            "mov {5}, x24",
            "mov {6}, x25",
            "mov {7}, x26",
            "mov {8}, x27",
            "mov {9}, x28",
            "mov {10}, x29",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
            out(reg) regs[6],
            out(reg) regs[7],
            out(reg) regs[8],
            out(reg) regs[9],
            out(reg) regs[10],
            options(nomem, nostack, preserves_flags),
        );
    }

    std::hint::black_box(&mut regs);

    for &word in &regs {
        visit(word);
    }

    let scan = std::hint::black_box(scan_stack as fn(usize, &mut dyn FnMut(usize)));
    scan(base, visit);

    std::hint::black_box(&regs);
}

#[inline(never)]
fn scan_stack(base: usize, visit: &mut dyn FnMut(usize)) {
    if cfg!(miri) {
        return;
    }

    let marker = 0usize;
    let top = std::hint::black_box(&marker) as *const usize as usize;
    let (low, high) = if top < base { (top, base) } else { (base, top) };

    let mut cursor = low.next_multiple_of(WORD);
    while cursor <= high {
        // SAFETY: every word between the live frame and the recorded base
        // belongs to the current thread's stack.
        let word = unsafe { std::ptr::read_volatile(cursor as *const usize) };
        visit(word);
        cursor += WORD;
    }
}
