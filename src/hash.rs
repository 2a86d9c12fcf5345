//! Chained identity hash table keyed by payload address.
//!
//! Every tracked object owns exactly one [`HashEntry`]; the entry moves
//! between tables as the object changes partition. Bucket counts walk an
//! ascending prime sequence and never shrink.

use std::ptr::NonNull;

/// Ascending bucket counts. Once the last one is reached the table stops
/// growing and chains lengthen instead.
pub const PRIMES: &[usize] = &[
    5, 13, 23, 53, 97, 193, 389, 769, 1543, 3079, 6151, 12289, 24593, 49157, 98317, 196613,
    393241, 786433, 1572869, 3145739, 6291469, 12582917, 25165843, 50331653, 100663319,
    201326611, 402653189, 805306457, 1610612741,
];

/// 64-bit integer avalanche used to spread pointer values across buckets.
#[inline]
pub fn hash64(key: u64) -> u64 {
    let mut key = (!key).wrapping_add(key << 21);
    key ^= key >> 24;
    key = key.wrapping_add(key << 3).wrapping_add(key << 8);
    key ^= key >> 14;
    key = key.wrapping_add(key << 2).wrapping_add(key << 4);
    key ^= key >> 28;
    key.wrapping_add(key << 31)
}

#[derive(Debug)]
pub struct HashEntry {
    object: NonNull<u8>,
    hash: u64,
    next: Option<Box<HashEntry>>,
}

impl HashEntry {
    pub fn new(object: NonNull<u8>) -> Box<Self> {
        Box::new(Self {
            object,
            hash: hash64(object.as_ptr() as usize as u64),
            next: None,
        })
    }

    pub fn object(&self) -> NonNull<u8> {
        self.object
    }

    pub fn address(&self) -> usize {
        self.object.as_ptr() as usize
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    fn matches(&self, hash: u64, address: usize) -> bool {
        self.hash == hash && self.address() == address
    }
}

type Bucket = Option<Box<HashEntry>>;

#[derive(Debug)]
pub struct IdentityTable {
    len: usize,
    prime_index: usize,
    primes: &'static [usize],
    buckets: Vec<Bucket>,
}

impl IdentityTable {
    pub fn new() -> Self {
        Self::with_primes(PRIMES)
    }

    /// Builds an empty table whose bucket counts follow `primes`.
    ///
    /// Panics if `primes` is empty or contains a zero.
    pub fn with_primes(primes: &'static [usize]) -> Self {
        assert!(
            !primes.is_empty() && primes.iter().all(|&p| p > 0),
            "bucket prime sequence must be non-empty and positive"
        );

        Self {
            len: 0,
            prime_index: 0,
            primes,
            buckets: empty_buckets(primes[0]),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.primes[self.prime_index]
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash % self.bucket_count() as u64) as usize
    }

    /// Inserts `entry`, growing first if the table is at capacity.
    ///
    /// An entry already present for the same object is replaced and handed
    /// back to the caller.
    pub fn set(&mut self, entry: Box<HashEntry>) -> Option<Box<HashEntry>> {
        if self.len >= self.bucket_count() {
            self.rehash();
        }
        self.link(entry)
    }

    /// Unlinks and returns the entry tracking `address`, if any.
    pub fn del(&mut self, address: usize) -> Option<Box<HashEntry>> {
        let hash = hash64(address as u64);
        let index = self.bucket_of(hash);
        let removed = unlink(&mut self.buckets[index], hash, address);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub fn get(&self, address: usize) -> Option<&HashEntry> {
        let hash = hash64(address as u64);
        let mut node = self.buckets[self.bucket_of(hash)].as_deref();
        while let Some(entry) = node {
            if entry.matches(hash, address) {
                return Some(entry);
            }
            node = entry.next.as_deref();
        }
        None
    }

    pub fn contains(&self, address: usize) -> bool {
        self.get(address).is_some()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            buckets: self.buckets.iter(),
            node: None,
        }
    }

    /// Removes every entry, keeping the current bucket count.
    pub fn take_entries(&mut self) -> Vec<Box<HashEntry>> {
        let mut entries = Vec::with_capacity(self.len);
        for bucket in &mut self.buckets {
            let mut node = bucket.take();
            while let Some(mut entry) = node {
                node = entry.next.take();
                entries.push(entry);
            }
        }
        self.len = 0;
        entries
    }

    fn link(&mut self, entry: Box<HashEntry>) -> Option<Box<HashEntry>> {
        let index = self.bucket_of(entry.hash);
        let replaced = link(&mut self.buckets[index], entry);
        if replaced.is_none() {
            self.len += 1;
        }
        replaced
    }

    fn rehash(&mut self) {
        if self.prime_index + 1 >= self.primes.len() {
            return;
        }

        let entries = self.take_entries();
        self.prime_index += 1;
        self.buckets = empty_buckets(self.bucket_count());

        log::trace!(
            "rehashing {} entries into {} buckets",
            entries.len(),
            self.bucket_count()
        );

        for entry in entries {
            self.link(entry);
        }
    }
}

// Chains are unlinked one node at a time instead of dropping recursively.
impl Drop for IdentityTable {
    fn drop(&mut self) {
        for bucket in &mut self.buckets {
            let mut node = bucket.take();
            while let Some(mut entry) = node {
                node = entry.next.take();
            }
        }
    }
}

impl Default for IdentityTable {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_buckets(count: usize) -> Vec<Bucket> {
    std::iter::repeat_with(|| None).take(count).collect()
}

fn link(mut slot: &mut Bucket, mut entry: Box<HashEntry>) -> Option<Box<HashEntry>> {
    loop {
        match slot {
            Some(node) if node.matches(entry.hash, entry.address()) => {
                entry.next = node.next.take();
                return Some(std::mem::replace(node, entry));
            }
            Some(node) => slot = &mut node.next,
            None => {
                entry.next = None;
                *slot = Some(entry);
                return None;
            }
        }
    }
}

fn unlink(mut slot: &mut Bucket, hash: u64, address: usize) -> Option<Box<HashEntry>> {
    loop {
        match slot {
            Some(node) if node.matches(hash, address) => {
                let rest = node.next.take();
                return std::mem::replace(slot, rest);
            }
            Some(node) => slot = &mut node.next,
            None => return None,
        }
    }
}

pub struct Iter<'a> {
    buckets: std::slice::Iter<'a, Bucket>,
    node: Option<&'a HashEntry>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a HashEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.node {
                self.node = entry.next.as_deref();
                return Some(entry);
            }
            self.node = self.buckets.next()?.as_deref();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(address: usize) -> NonNull<u8> {
        NonNull::new(address as *mut u8).unwrap()
    }

    #[test]
    fn test_new_table() {
        let table = IdentityTable::new();
        assert!(table.is_empty());
        assert_eq!(table.bucket_count(), 5);
        assert!(table.get(0x1000).is_none());
    }

    #[test]
    fn test_set_and_get() {
        let mut table = IdentityTable::new();
        assert!(table.set(HashEntry::new(fake(0x1000))).is_none());
        assert!(table.set(HashEntry::new(fake(0x2000))).is_none());

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0x1000).map(HashEntry::address), Some(0x1000));
        assert!(table.contains(0x2000));
        assert!(!table.contains(0x3000));
    }

    #[test]
    fn test_set_replaces_same_object() {
        let mut table = IdentityTable::new();
        table.set(HashEntry::new(fake(0x1000)));
        let replaced = table.set(HashEntry::new(fake(0x1000)));

        assert_eq!(replaced.map(|e| e.address()), Some(0x1000));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_del() {
        let mut table = IdentityTable::new();
        table.set(HashEntry::new(fake(0x1000)));
        table.set(HashEntry::new(fake(0x2000)));

        let removed = table.del(0x1000).unwrap();
        assert_eq!(removed.address(), 0x1000);
        assert_eq!(table.len(), 1);
        assert!(!table.contains(0x1000));
        assert!(table.del(0x1000).is_none());
    }

    #[test]
    fn test_rehash_walks_primes() {
        let mut table = IdentityTable::new();
        for i in 1..=6 {
            table.set(HashEntry::new(fake(i * 16)));
        }
        assert_eq!(table.bucket_count(), 13);

        for i in 7..=14 {
            table.set(HashEntry::new(fake(i * 16)));
        }
        assert_eq!(table.bucket_count(), 23);
        assert_eq!(table.len(), 14);

        for i in 1..=14 {
            assert!(table.contains(i * 16), "lost entry {i} after rehash");
        }
        for i in (1..=14).step_by(2) {
            assert!(table.del(i * 16).is_some());
        }
        assert_eq!(table.len(), 7);
        for i in (2..=14).step_by(2) {
            assert!(table.contains(i * 16));
        }
    }

    #[test]
    fn test_growth_capped_at_last_prime() {
        static SHORT: &[usize] = &[2, 3];
        let mut table = IdentityTable::with_primes(SHORT);
        for i in 1..=50 {
            table.set(HashEntry::new(fake(i * 8)));
        }

        assert_eq!(table.bucket_count(), 3);
        assert_eq!(table.len(), 50);
        assert_eq!(table.iter().count(), 50);
        for i in 1..=50 {
            assert!(table.del(i * 8).is_some());
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_long_chain_on_small_stack() {
        static SINGLE: &[usize] = &[1];
        let worker = std::thread::Builder::new()
            .stack_size(64 * 1024)
            .spawn(|| {
                let mut table = IdentityTable::with_primes(SINGLE);
                for i in 1..=5000 {
                    table.set(HashEntry::new(fake(i * 16)));
                }
                assert_eq!(table.bucket_count(), 1);
                assert!(table.set(HashEntry::new(fake(5000 * 16))).is_some());
                assert!(table.del(5000 * 16).is_some());
                assert!(table.del(16).is_some());
                assert_eq!(table.len(), 4998);
                drop(table);
            })
            .unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_take_entries() {
        let mut table = IdentityTable::new();
        for i in 1..=20 {
            table.set(HashEntry::new(fake(i * 32)));
        }
        let buckets = table.bucket_count();

        let entries = table.take_entries();
        assert_eq!(entries.len(), 20);
        assert!(table.is_empty());
        assert_eq!(table.bucket_count(), buckets);
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn test_hash64_spreads_aligned_pointers() {
        assert_eq!(hash64(0x1000), hash64(0x1000));
        let hashes: std::collections::HashSet<u64> =
            (1..=64u64).map(|i| hash64(i * 16) % 13).collect();
        assert!(hashes.len() > 8);
    }
}
