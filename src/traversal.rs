//! Conservative payload traversal for the multi-ref cycle pass.
//!
//! Payloads carry no type information, so every pointer-aligned word of a
//! payload counts as a reference when it equals the address of a tracked
//! payload.

use crate::hash::{HashEntry, IdentityTable};
use crate::object::header_of;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;

const WORD: usize = std::mem::size_of::<usize>();

/// Iterates the pointer-aligned words of a payload.
///
/// # Safety
///
/// `payload` must be live for as long as the iterator is used.
pub unsafe fn payload_words(payload: NonNull<u8>) -> impl Iterator<Item = usize> {
    let words = unsafe { header_of(payload).as_ref().size() } / WORD;
    let base = payload.cast::<usize>();
    // SAFETY: payloads are zero-initialized and aligned to at least a word.
    (0..words).map(move |i| unsafe { base.add(i).read() })
}

/// Trial deletion over the multi-ref partition.
///
/// Only words inside multi-ref payloads count as internal references, so an
/// object owned from anywhere else keeps its explicit count as protection.
/// Both tables must hold only live payloads.
pub(crate) struct CycleDetector<'a> {
    zero_count: &'a IdentityTable,
    multi_ref: &'a IdentityTable,
}

impl<'a> CycleDetector<'a> {
    pub(crate) fn new(zero_count: &'a IdentityTable, multi_ref: &'a IdentityTable) -> Self {
        Self {
            zero_count,
            multi_ref,
        }
    }

    /// Counts, for every multi-ref object, the words of multi-ref payloads
    /// that point at it.
    fn internal_refs(&self) -> HashMap<usize, usize> {
        let mut internal: HashMap<usize, usize> =
            self.multi_ref.iter().map(|entry| (entry.address(), 0)).collect();

        for entry in self.multi_ref.iter() {
            for word in unsafe { payload_words(entry.object()) } {
                if let Some(count) = internal.get_mut(&word) {
                    *count += 1;
                }
            }
        }

        internal
    }

    /// Multi-ref objects whose count is not exactly their internal references.
    fn externally_owned(&self, internal: &HashMap<usize, usize>) -> Vec<NonNull<u8>> {
        self.multi_ref
            .iter()
            .filter(|entry| {
                let refs = unsafe { header_of(entry.object()).as_ref().refs() };
                internal.get(&entry.address()).copied() != Some(refs)
            })
            .map(|entry| entry.object())
            .collect()
    }

    /// Multi-ref objects reachable from a root word, from a live zero-count
    /// object or from an externally owned multi-ref object.
    fn find_reachable(
        &self,
        internal: &HashMap<usize, usize>,
        roots: &[usize],
    ) -> HashSet<usize> {
        let mut reachable = HashSet::new();
        let mut queue: VecDeque<NonNull<u8>> = self.zero_count.iter().map(|e| e.object()).collect();

        let rooted = roots
            .iter()
            .filter_map(|&word| self.multi_ref.get(word))
            .map(HashEntry::object);
        for root in rooted.chain(self.externally_owned(internal)) {
            if reachable.insert(root.as_ptr() as usize) {
                queue.push_back(root);
            }
        }

        while let Some(current) = queue.pop_front() {
            for word in unsafe { payload_words(current) } {
                if !internal.contains_key(&word) || !reachable.insert(word) {
                    continue;
                }
                if let Some(entry) = self.multi_ref.get(word) {
                    queue.push_back(entry.object());
                }
            }
        }

        reachable
    }

    /// Addresses of multi-ref objects kept alive only by each other.
    ///
    /// `roots` are the words the root scanner reported for this pass.
    pub(crate) fn find_unreachable(&self, roots: &[usize]) -> Vec<usize> {
        if self.multi_ref.is_empty() {
            return Vec::new();
        }

        let internal = self.internal_refs();
        let reachable = self.find_reachable(&internal, roots);

        internal
            .into_keys()
            .filter(|address| !reachable.contains(address))
            .collect()
    }
}
