use crate::GCResult;
use crate::collector::Collector;
use crate::error::GCError;
use crate::hash::PRIMES;
use crate::object::{self, Destructor, ObjectState};
use crate::stack::{RootScanner, StackScanner};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

pub const DEFAULT_COLLECT_THRESHOLD: usize = 500;
pub const DEFAULT_CYCLE_THRESHOLD: usize = 5000;

#[derive(Debug, Clone)]
pub struct GCConfig {
    /// Zero-count population at which `allocate` runs a pass. 0 disables it.
    pub collect_threshold: usize,
    /// Bucket counts used by every table.
    pub bucket_primes: &'static [usize],
    /// Reclaim multi-ref cycles that nothing else owns.
    pub cycle_collection: bool,
    /// Multi-ref growth since the last cycle pass at which an automatic pass
    /// also looks for cycles. 0 leaves cycles to explicit `collect` calls.
    pub cycle_threshold: usize,
}

impl GCConfig {
    pub fn with_collect_threshold(mut self, threshold: usize) -> Self {
        self.collect_threshold = threshold;
        self
    }

    pub fn with_bucket_primes(mut self, primes: &'static [usize]) -> Self {
        self.bucket_primes = primes;
        self
    }

    pub fn with_cycle_collection(mut self, enabled: bool) -> Self {
        self.cycle_collection = enabled;
        self
    }

    pub fn with_cycle_threshold(mut self, threshold: usize) -> Self {
        self.cycle_threshold = threshold;
        self
    }
}

impl Default for GCConfig {
    fn default() -> Self {
        Self {
            collect_threshold: DEFAULT_COLLECT_THRESHOLD,
            bucket_primes: PRIMES,
            cycle_collection: true,
            cycle_threshold: DEFAULT_CYCLE_THRESHOLD,
        }
    }
}

/// Hybrid reference-counting collector.
///
/// Objects start at refcount 0 in the zero-count partition; `addref` and
/// `delref` move them across the 0 <-> 1 boundary. A pass only inspects the
/// zero-count partition (plus, with cycle collection on, multi-ref cycles
/// nothing else owns) and keeps whatever the root scanner reports.
///
/// The collector is single-threaded. A pass requested on a thread its
/// scanner cannot scan is skipped.
pub struct GarbageCollector {
    collector: RefCell<Collector>,
    scanner: Box<dyn RootScanner + Send>,
    config: GCConfig,
    shutdown: Cell<bool>,
}

// SAFETY: the tables exclusively own their entries and blocks, and the type
// is not `Sync`. Scanners tied to one thread's stack refuse to scan anywhere
// else, so moving the whole collector to another thread is sound.
unsafe impl Send for GarbageCollector {}

impl GarbageCollector {
    /// Collector rooted at `stack_bottom`, the address of a local in a frame
    /// that outlives every allocation.
    ///
    /// # Safety
    ///
    /// Same contract as [`StackScanner::new`]: `stack_bottom` is a live word
    /// on the calling thread's stack for as long as the collector is used.
    pub unsafe fn new(stack_bottom: *const u8) -> Self {
        // SAFETY: forwarded to the caller.
        let scanner = unsafe { StackScanner::new(stack_bottom) };
        Self::with_scanner(scanner, GCConfig::default())
    }

    pub fn with_scanner<S>(scanner: S, config: GCConfig) -> Self
    where
        S: RootScanner + Send + 'static,
    {
        Self {
            collector: RefCell::new(Collector::new(config.bucket_primes)),
            scanner: Box::new(scanner),
            config,
            shutdown: Cell::new(false),
        }
    }

    pub fn config(&self) -> &GCConfig {
        &self.config
    }

    pub fn set_collect_threshold(&mut self, threshold: usize) {
        self.config.collect_threshold = threshold;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.get()
    }

    /// Allocates a zeroed payload of `size` bytes at refcount 0.
    ///
    /// May run a collection pass before returning; the new payload always
    /// survives it.
    pub fn allocate(&self, size: usize, destructor: Option<Destructor>) -> GCResult<NonNull<u8>> {
        if self.shutdown.get() {
            log::warn!("allocation of {size} bytes refused after shutdown");
            return Err(GCError::ShutDown);
        }

        let payload = object::allocate_block(size, destructor)?;
        let needs_collection = {
            let mut collector = self.collector.borrow_mut();
            collector.track(payload);
            self.config.collect_threshold > 0
                && !collector.is_collecting()
                && collector.zero_count_len() >= self.config.collect_threshold
        };

        if needs_collection {
            self.run_collection(Some(payload));
        }
        Ok(payload)
    }

    /// Takes an explicit reference. Null pointers and calls after shutdown
    /// are ignored. Panics if `ptr` is not tracked here.
    pub fn addref(&self, ptr: *mut u8) -> *mut u8 {
        let Some(payload) = NonNull::new(ptr) else {
            return ptr;
        };
        if self.shutdown.get() {
            return ptr;
        }

        let mut collector = self.collector.borrow_mut();
        let payload = collector
            .locate(payload.as_ptr() as usize)
            .unwrap_or_else(|| panic!("addref of untracked pointer {ptr:p}"));

        // SAFETY: `locate` only returns payloads owned by a table.
        let header = unsafe { object::header_mut(payload) };
        if header.inc_ref() == 1 && header.state() == ObjectState::ZeroCount {
            collector.promote(payload.as_ptr() as usize);
        }
        ptr
    }

    /// Drops an explicit reference. Null pointers and calls after shutdown
    /// are ignored. Panics if `ptr` is not tracked here or its count is
    /// already 0.
    pub fn delref(&self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        if self.shutdown.get() {
            return;
        }

        let mut collector = self.collector.borrow_mut();
        let payload = collector
            .locate(payload.as_ptr() as usize)
            .unwrap_or_else(|| panic!("delref of untracked pointer {ptr:p}"));

        // SAFETY: `locate` only returns payloads owned by a table.
        let header = unsafe { object::header_mut(payload) };
        if header.dec_ref() == 0 && header.state() == ObjectState::MultiRef {
            collector.demote(payload.as_ptr() as usize);
        }
    }

    /// Stores `new_value` into `slot`, taking the new reference before
    /// releasing the old one.
    pub fn swapref(&self, slot: &mut *mut u8, new_value: *mut u8) {
        let old = *slot;
        *slot = self.addref(new_value);
        self.delref(old);
    }

    /// Runs one collection pass and returns the number of objects freed.
    ///
    /// Returns 0 without doing anything during another pass or after
    /// shutdown.
    pub fn collect(&self) -> usize {
        self.run_collection(None)
    }

    /// Explicit passes always look for cycles when enabled. Automatic ones
    /// (`pinned` set) wait for `cycle_threshold` new multi-ref objects.
    fn wants_cycle_pass(&self, collector: &Collector, automatic: bool) -> bool {
        if !self.config.cycle_collection {
            return false;
        }
        if !automatic {
            return true;
        }
        self.config.cycle_threshold > 0
            && collector.multi_ref_growth() >= self.config.cycle_threshold
    }

    fn run_collection(&self, pinned: Option<NonNull<u8>>) -> usize {
        if self.shutdown.get() {
            return 0;
        }
        if !self.scanner.scannable_here() {
            log::warn!("collection skipped: root scanner is bound to another thread");
            return 0;
        }

        let pending = {
            let mut guard = self.collector.borrow_mut();
            if guard.is_collecting() {
                return 0;
            }

            let collector = &mut *guard;
            let trace_cycles = self.wants_cycle_pass(collector, pinned.is_some());
            collector.begin_collection();
            if let Some(payload) = pinned {
                collector.rescue(payload.as_ptr() as usize);
            }

            let mut rooted = Vec::new();
            self.scanner.scan(&mut |word| {
                if !collector.rescue(word) && trace_cycles && collector.is_multi_ref(word) {
                    rooted.push(word);
                }
            });
            if trace_cycles {
                collector.condemn_cycles(&rooted);
            }
            collector.pending_destructors()
        };

        self.run_destructors(pending);
        self.collector.borrow_mut().finish_collection()
    }

    fn run_destructors(&self, pending: Vec<(NonNull<u8>, Destructor)>) {
        for (payload, destructor) in pending {
            log::trace!("destroying {payload:p}");
            destructor.run(self, payload);
        }
    }

    /// Destroys every tracked object regardless of reference counts and
    /// turns later `addref`/`delref` calls into no-ops.
    pub fn deinit(&self) {
        if self.shutdown.replace(true) {
            return;
        }

        let pending = {
            let mut collector = self.collector.borrow_mut();
            assert!(
                !collector.is_collecting(),
                "deinit called during a collection pass"
            );
            collector.condemn_all();
            collector.pending_destructors()
        };

        self.run_destructors(pending);
        let swept = self.collector.borrow_mut().sweep_working();
        log::debug!("teardown released {swept} objects");
    }

    pub fn is_tracked(&self, ptr: *const u8) -> bool {
        self.collector.borrow().locate(ptr as usize).is_some()
    }

    pub fn state_of(&self, ptr: *const u8) -> Option<ObjectState> {
        let payload = self.collector.borrow().locate(ptr as usize)?;
        // SAFETY: `locate` only returns payloads owned by a table.
        Some(unsafe { object::header_of(payload).as_ref().state() })
    }

    pub fn refcount(&self, ptr: *const u8) -> Option<usize> {
        let payload = self.collector.borrow().locate(ptr as usize)?;
        // SAFETY: as above.
        Some(unsafe { object::header_of(payload).as_ref().refs() })
    }

    pub fn zero_count_len(&self) -> usize {
        self.collector.borrow().zero_count_len()
    }

    pub fn multi_ref_len(&self) -> usize {
        self.collector.borrow().multi_ref_len()
    }

    pub fn tracked_count(&self) -> usize {
        self.collector.borrow().tracked_count()
    }

    pub fn get_stats(&self) -> crate::GCStats {
        self.collector.borrow().get_stats()
    }

    #[cfg(test)]
    fn verify_partitions(&self) {
        self.collector.borrow().verify_partitions();
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.deinit();
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("collector", &self.collector)
            .field("config", &self.config)
            .field("shutdown", &self.shutdown.get())
            .finish_non_exhaustive()
    }
}

/// Process-wide collector used by the C ABI.
///
/// A reentrant lock guards the instance so destructors running inside a pass
/// can call back into the facade on the same thread.
pub mod global {
    use super::*;
    use parking_lot::ReentrantMutex;
    use std::cell::OnceCell;

    static GC: ReentrantMutex<OnceCell<GarbageCollector>> =
        parking_lot::const_reentrant_mutex(OnceCell::new());

    /// Installs the collector and registers teardown at process exit.
    ///
    /// # Safety
    ///
    /// Same contract as [`GarbageCollector::new`]. Collections requested
    /// from other threads are skipped.
    pub unsafe fn init(stack_bottom: *const u8) -> GCResult<()> {
        let guard = GC.lock();
        if guard.get().is_some() {
            return Err(GCError::AlreadyInitialized);
        }

        // SAFETY: `teardown` is a plain `extern "C"` function with no
        // captured state.
        if unsafe { libc::atexit(teardown) } != 0 {
            return Err(GCError::Internal("failed to register atexit hook".to_string()));
        }

        // SAFETY: forwarded to the caller.
        let gc = unsafe { GarbageCollector::new(stack_bottom) };
        guard
            .set(gc)
            .map_err(|_| GCError::AlreadyInitialized)
    }

    extern "C" fn teardown() {
        deinit();
    }

    pub fn with<R>(f: impl FnOnce(&GarbageCollector) -> R) -> GCResult<R> {
        let guard = GC.lock();
        let gc = guard.get().ok_or(GCError::NotInitialized)?;
        Ok(f(gc))
    }

    pub fn is_initialized() -> bool {
        GC.lock().get().is_some()
    }

    pub fn deinit() {
        let _ = with(|gc| gc.deinit());
    }

    pub fn allocate(size: usize, destructor: Option<Destructor>) -> GCResult<NonNull<u8>> {
        with(|gc| gc.allocate(size, destructor))?
    }

    pub fn addref(ptr: *mut u8) -> *mut u8 {
        with(|gc| gc.addref(ptr)).unwrap_or(ptr)
    }

    pub fn delref(ptr: *mut u8) {
        let _ = with(|gc| gc.delref(ptr));
    }

    pub fn swapref(slot: &mut *mut u8, new_value: *mut u8) {
        let _ = with(|gc| gc.swapref(slot, new_value));
    }

    pub fn collect() -> GCResult<usize> {
        with(|gc| gc.collect())
    }

    pub fn get_stats() -> GCResult<crate::GCStats> {
        with(|gc| gc.get_stats())
    }
}
