use crate::hash::{HashEntry, IdentityTable};
use crate::object::{self, Destructor, ObjectState};
use crate::traversal::CycleDetector;
use std::ptr::NonNull;

/// The three partitions plus the counters of past passes.
///
/// Every tracked object has its entry in exactly one table, and its header
/// state names that table.
#[derive(Debug)]
pub struct Collector {
    zero_count: IdentityTable,
    multi_ref: IdentityTable,
    working: IdentityTable,
    primes: &'static [usize],
    collecting: bool,
    collections: usize,
    collected: usize,
    last_rescued: usize,
    last_collected: usize,
    cycle_baseline: usize,
}

impl Collector {
    pub fn new(primes: &'static [usize]) -> Self {
        Self {
            zero_count: IdentityTable::with_primes(primes),
            multi_ref: IdentityTable::with_primes(primes),
            working: IdentityTable::with_primes(primes),
            primes,
            collecting: false,
            collections: 0,
            collected: 0,
            last_rescued: 0,
            last_collected: 0,
            cycle_baseline: 0,
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    pub fn zero_count_len(&self) -> usize {
        self.zero_count.len()
    }

    pub fn multi_ref_len(&self) -> usize {
        self.multi_ref.len()
    }

    pub fn working_len(&self) -> usize {
        self.working.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.zero_count.len() + self.multi_ref.len() + self.working.len()
    }

    pub fn is_multi_ref(&self, address: usize) -> bool {
        self.multi_ref.contains(address)
    }

    /// Multi-ref objects added since the last cycle pass finished.
    pub fn multi_ref_growth(&self) -> usize {
        self.multi_ref.len().saturating_sub(self.cycle_baseline)
    }

    /// Finds the payload tracked under `address` in any partition.
    pub fn locate(&self, address: usize) -> Option<NonNull<u8>> {
        self.zero_count
            .get(address)
            .or_else(|| self.multi_ref.get(address))
            .or_else(|| self.working.get(address))
            .map(HashEntry::object)
    }

    /// Registers a freshly allocated payload in the zero-count partition.
    pub fn track(&mut self, payload: NonNull<u8>) {
        let displaced = self.zero_count.set(HashEntry::new(payload));
        assert!(displaced.is_none(), "object {payload:p} tracked twice");
    }

    /// Zero-count to multi-ref, on a 0 -> 1 transition.
    pub fn promote(&mut self, address: usize) {
        transfer(
            &mut self.zero_count,
            &mut self.multi_ref,
            address,
            ObjectState::MultiRef,
        );
    }

    /// Multi-ref to zero-count, on a 1 -> 0 transition.
    pub fn demote(&mut self, address: usize) {
        transfer(
            &mut self.multi_ref,
            &mut self.zero_count,
            address,
            ObjectState::ZeroCount,
        );
    }

    /// Swaps the zero-count table into the working slot and starts a pass.
    pub fn begin_collection(&mut self) {
        assert!(!self.collecting, "collection already in progress");
        self.collecting = true;
        self.last_rescued = 0;

        log::debug!(
            "BEFORE - ZCT: {} MRT: {} TOT: {}",
            self.zero_count.len(),
            self.multi_ref.len(),
            self.zero_count.len() + self.multi_ref.len()
        );

        debug_assert!(self.working.is_empty());
        self.working = std::mem::replace(
            &mut self.zero_count,
            IdentityTable::with_primes(self.primes),
        );
        for entry in self.working.iter() {
            set_state(entry.object(), ObjectState::InCollection);
        }
    }

    /// Moves the object at `word` back to the zero-count table if it is
    /// waiting in the working table.
    pub fn rescue(&mut self, word: usize) -> bool {
        match self.working.del(word) {
            Some(entry) => {
                set_state(entry.object(), ObjectState::ZeroCount);
                self.zero_count.set(entry);
                self.last_rescued += 1;
                true
            }
            None => false,
        }
    }

    /// Moves multi-ref objects owned only by each other into the working
    /// table. `roots` are this pass's scanned words. Returns how many were
    /// moved.
    pub fn condemn_cycles(&mut self, roots: &[usize]) -> usize {
        let unreachable =
            CycleDetector::new(&self.zero_count, &self.multi_ref).find_unreachable(roots);

        for &address in &unreachable {
            transfer(
                &mut self.multi_ref,
                &mut self.working,
                address,
                ObjectState::InCollection,
            );
        }
        self.cycle_baseline = self.multi_ref.len();

        if !unreachable.is_empty() {
            log::debug!("condemned {} cyclic multi-ref objects", unreachable.len());
        }
        unreachable.len()
    }

    /// Moves both persistent tables into the working table, regardless of
    /// reference counts.
    pub fn condemn_all(&mut self) {
        for table in [&mut self.zero_count, &mut self.multi_ref] {
            for entry in table.take_entries() {
                set_state(entry.object(), ObjectState::InCollection);
                let displaced = self.working.set(entry);
                assert!(displaced.is_none(), "object present in two partitions");
            }
        }
    }

    /// Destructors owed by the objects in the working table.
    pub fn pending_destructors(&self) -> Vec<(NonNull<u8>, Destructor)> {
        self.working
            .iter()
            .filter_map(|entry| {
                let payload = entry.object();
                // SAFETY: working entries are live until `sweep_working`.
                let destructor = unsafe { object::header_of(payload).as_ref().destructor() };
                destructor.map(|d| (payload, d))
            })
            .collect()
    }

    /// Frees every block left in the working table.
    pub fn sweep_working(&mut self) -> usize {
        let entries = self.working.take_entries();
        let swept = entries.len();
        for entry in entries {
            log::trace!("freeing {:p}", entry.object());
            // SAFETY: the entry was the block's only owner.
            unsafe { object::free_block(entry.object()) };
        }
        self.working = IdentityTable::with_primes(self.primes);
        swept
    }

    /// Sweeps and closes the pass opened by [`Collector::begin_collection`].
    pub fn finish_collection(&mut self) -> usize {
        let swept = self.sweep_working();
        self.collecting = false;
        self.collections += 1;
        self.collected += swept;
        self.last_collected = swept;

        log::debug!(
            "AFTER - ZCT: {} MRT: {} TOT: {} (rescued {}, swept {})",
            self.zero_count.len(),
            self.multi_ref.len(),
            self.zero_count.len() + self.multi_ref.len(),
            self.last_rescued,
            swept
        );
        swept
    }

    pub fn get_stats(&self) -> crate::GCStats {
        crate::GCStats {
            collections: self.collections,
            collected: self.collected,
            last_rescued: self.last_rescued,
            last_collected: self.last_collected,
            zero_count: self.zero_count.len(),
            multi_ref: self.multi_ref.len(),
        }
    }

    /// Panics unless every tracked object sits in exactly one table whose
    /// state matches its header.
    #[cfg(test)]
    pub fn verify_partitions(&self) {
        use std::collections::HashSet;

        let mut seen = HashSet::new();
        let tables = [
            (&self.zero_count, ObjectState::ZeroCount),
            (&self.multi_ref, ObjectState::MultiRef),
            (&self.working, ObjectState::InCollection),
        ];
        for (table, state) in tables {
            for entry in table.iter() {
                assert!(seen.insert(entry.address()), "object in two partitions");
                let header = unsafe { object::header_of(entry.object()).as_ref() };
                assert_eq!(header.state(), state);
                match state {
                    ObjectState::ZeroCount => assert_eq!(header.refs(), 0),
                    ObjectState::MultiRef => assert!(header.refs() >= 1),
                    ObjectState::InCollection => {}
                }
            }
        }
    }
}

fn set_state(payload: NonNull<u8>, state: ObjectState) {
    // SAFETY: only called on payloads owned by one of the tables.
    unsafe { object::header_mut(payload).set_state(state) };
}

fn transfer(from: &mut IdentityTable, to: &mut IdentityTable, address: usize, state: ObjectState) {
    let entry = from
        .del(address)
        .unwrap_or_else(|| panic!("object {address:#x} missing from its partition"));
    set_state(entry.object(), state);
    let displaced = to.set(entry);
    assert!(displaced.is_none(), "object {address:#x} present in two partitions");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::PRIMES;

    fn tracked(collector: &mut Collector, count: usize) -> Vec<NonNull<u8>> {
        (0..count)
            .map(|_| {
                let payload = object::allocate_block(16, None).unwrap();
                collector.track(payload);
                payload
            })
            .collect()
    }

    fn addr(payload: NonNull<u8>) -> usize {
        payload.as_ptr() as usize
    }

    #[test]
    fn test_track_lands_in_zero_count() {
        let mut collector = Collector::new(PRIMES);
        let objects = tracked(&mut collector, 3);

        assert_eq!(collector.zero_count_len(), 3);
        assert_eq!(collector.locate(addr(objects[1])), Some(objects[1]));
        collector.verify_partitions();

        collector.condemn_all();
        collector.sweep_working();
    }

    #[test]
    fn test_promote_and_demote() {
        let mut collector = Collector::new(PRIMES);
        let objects = tracked(&mut collector, 2);

        unsafe { object::header_mut(objects[0]).inc_ref() };
        collector.promote(addr(objects[0]));
        assert_eq!(collector.zero_count_len(), 1);
        assert_eq!(collector.multi_ref_len(), 1);
        collector.verify_partitions();

        unsafe { object::header_mut(objects[0]).dec_ref() };
        collector.demote(addr(objects[0]));
        assert_eq!(collector.zero_count_len(), 2);
        assert_eq!(collector.multi_ref_len(), 0);
        collector.verify_partitions();

        collector.condemn_all();
        collector.sweep_working();
    }

    #[test]
    #[should_panic(expected = "missing from its partition")]
    fn test_demote_absent_entry_panics() {
        let mut collector = Collector::new(PRIMES);
        let objects = tracked(&mut collector, 1);
        collector.demote(addr(objects[0]));
    }

    #[test]
    fn test_collection_pass_rescues_and_sweeps() {
        let mut collector = Collector::new(PRIMES);
        let objects = tracked(&mut collector, 10);

        collector.begin_collection();
        assert!(collector.is_collecting());
        assert_eq!(collector.zero_count_len(), 0);
        assert_eq!(collector.working_len(), 10);
        collector.verify_partitions();

        assert!(collector.rescue(addr(objects[3])));
        assert!(!collector.rescue(addr(objects[3])));
        assert!(collector.rescue(addr(objects[7])));
        assert!(!collector.rescue(0xdead_beef));
        collector.verify_partitions();

        assert_eq!(collector.finish_collection(), 8);
        assert!(!collector.is_collecting());
        assert_eq!(collector.zero_count_len(), 2);
        assert_eq!(collector.working_len(), 0);

        let stats = collector.get_stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.last_rescued, 2);
        assert_eq!(stats.last_collected, 8);

        collector.condemn_all();
        collector.sweep_working();
    }

    #[test]
    fn test_condemn_cycles_spares_rooted_cycle() {
        let mut collector = Collector::new(PRIMES);
        let objects = tracked(&mut collector, 2);
        let (a, b) = (objects[0], objects[1]);
        unsafe {
            a.cast::<usize>().write(addr(b));
            b.cast::<usize>().write(addr(a));
            object::header_mut(a).inc_ref();
            object::header_mut(b).inc_ref();
        }
        collector.promote(addr(a));
        collector.promote(addr(b));
        assert_eq!(collector.multi_ref_growth(), 2);

        collector.begin_collection();
        assert_eq!(collector.condemn_cycles(&[addr(b)]), 0);
        assert_eq!(collector.multi_ref_growth(), 0);
        assert_eq!(collector.finish_collection(), 0);
        assert!(collector.is_multi_ref(addr(a)));

        collector.begin_collection();
        assert_eq!(collector.condemn_cycles(&[]), 2);
        collector.verify_partitions();
        assert_eq!(collector.finish_collection(), 2);
        assert_eq!(collector.tracked_count(), 0);
    }

    #[test]
    fn test_condemn_all_ignores_refcounts() {
        let mut collector = Collector::new(PRIMES);
        let objects = tracked(&mut collector, 4);
        unsafe { object::header_mut(objects[2]).inc_ref() };
        collector.promote(addr(objects[2]));

        collector.condemn_all();
        assert_eq!(collector.tracked_count(), 4);
        assert_eq!(collector.working_len(), 4);
        collector.verify_partitions();

        assert_eq!(collector.sweep_working(), 4);
        assert_eq!(collector.tracked_count(), 0);
    }
}
