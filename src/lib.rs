//! Memory manager for the sclpl toolchain.
//!
//! A hybrid collector: every allocation carries an explicit reference count,
//! and objects whose count is zero are reclaimed by periodic passes that keep
//! whatever a conservative scan of the native stack still points at.
//! Reference cycles among counted objects are found by trial deletion over
//! payload words.

pub mod collector;
pub mod error;
pub mod ffi;
pub mod gc;
pub mod hash;
pub mod object;
pub mod stack;
pub mod traversal;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GCStats {
    pub collections: usize,
    pub collected: usize,
    pub last_rescued: usize,
    pub last_collected: usize,
    pub zero_count: usize,
    pub multi_ref: usize,
}

pub use error::GCError;
pub use gc::{DEFAULT_COLLECT_THRESHOLD, DEFAULT_CYCLE_THRESHOLD, GCConfig, GarbageCollector};
pub use object::{Destructor, ObjectState};
pub use stack::{ExplicitRoots, NoRoots, RootScanner, StackScanner};

pub type GCResult<T> = Result<T, GCError>;
