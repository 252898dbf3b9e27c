//! A single k-bucket: active contacts plus a bounded replacement cache.

use std::fmt::{self, Debug, Formatter};
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::common::{Contact, Id};

#[derive(Debug, Clone)]
pub(crate) struct BucketEntry {
    pub contact: Contact,
    /// Consecutive send failures since the last successful sighting.
    pub failures: usize,
}

/// Holds up to `k` active contacts sharing an identifier-prefix range, and a
/// bounded cache of overflow contacts used to backfill evictions.
pub struct Bucket {
    k: usize,
    entries: Vec<BucketEntry>,
    cache: LruCache<Id, Contact>,
}

impl Bucket {
    pub(crate) fn new(k: usize, cache_size: NonZeroUsize) -> Bucket {
        Bucket {
            k,
            entries: Vec::with_capacity(k),
            cache: LruCache::new(cache_size),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.k
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.iter().any(|entry| entry.contact.id() == id)
    }

    pub fn get(&self, id: &Id) -> Option<&Contact> {
        self.entries
            .iter()
            .find(|entry| entry.contact.id() == id)
            .map(|entry| &entry.contact)
    }

    pub fn cached(&self, id: &Id) -> Option<&Contact> {
        self.cache.peek(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.entries.iter().map(|entry| &entry.contact)
    }

    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.cache.len()
    }

    // === Crate-private mutators ===

    /// Insert a new active contact. Returns `false` if the bucket is full or
    /// the contact is already present.
    pub(crate) fn insert(&mut self, contact: Contact) -> bool {
        if self.is_full() || self.contains(contact.id()) {
            return false;
        }

        self.entries.push(BucketEntry {
            contact,
            failures: 0,
        });
        true
    }

    pub(crate) fn restore(&mut self, entry: BucketEntry) -> bool {
        if self.is_full() || self.contains(entry.contact.id()) {
            return false;
        }

        self.entries.push(entry);
        true
    }

    /// Swap the record of an already present contact, returning the previous
    /// one. An active sighting resets the failure count.
    pub(crate) fn replace(&mut self, contact: Contact, reset_failures: bool) -> Option<Contact> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.contact.id() == contact.id())?;

        if reset_failures {
            entry.failures = 0;
        }

        Some(std::mem::replace(&mut entry.contact, contact))
    }

    pub(crate) fn remove(&mut self, id: &Id) -> Option<Contact> {
        let index = self.entries.iter().position(|entry| entry.contact.id() == id)?;

        Some(self.entries.remove(index).contact)
    }

    /// Merge a contact into the replacement cache.
    pub(crate) fn insert_cache(&mut self, contact: Contact) {
        let merged = match self.cache.pop(contact.id()) {
            Some(cached) => cached.merge(&contact),
            None => contact,
        };

        self.cache.put(*merged.id(), merged);
    }

    pub(crate) fn take_cached(&mut self, id: &Id) -> Option<Contact> {
        self.cache.pop(id)
    }

    /// Pop the most recently seen cache contact to backfill an eviction.
    pub(crate) fn take_replacement(&mut self) -> Option<Contact> {
        let id = *self.cache.iter().next().map(|(id, _)| id)?;

        self.cache.pop(&id)
    }

    /// Record a failed send and return the new consecutive failure count.
    pub(crate) fn record_failure(&mut self, id: &Id) -> Option<usize> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.contact.id() == id)?;

        entry.failures += 1;
        Some(entry.failures)
    }

    /// The entry with the most consecutive failures at or above `threshold`.
    pub(crate) fn most_failed(&self, threshold: usize) -> Option<Id> {
        self.entries
            .iter()
            .filter(|entry| entry.failures >= threshold)
            .max_by_key(|entry| entry.failures)
            .map(|entry| *entry.contact.id())
    }

    pub(crate) fn into_parts(self) -> (Vec<BucketEntry>, Vec<Contact>) {
        let cached = self.cache.iter().map(|(_, contact)| contact.clone()).collect();

        (self.entries, cached)
    }
}

impl Debug for Bucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Bucket {{")?;
        for entry in &self.entries {
            writeln!(f, "  {:?} failures={}", entry.contact.id(), entry.failures)?;
        }
        write!(f, "}} cached={}", self.cache.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bucket() -> Bucket {
        Bucket::new(4, NonZeroUsize::new(2).unwrap())
    }

    #[test]
    fn insert_until_full() {
        let mut bucket = bucket();

        for _ in 0..4 {
            assert!(bucket.insert(Contact::random()));
        }

        assert!(bucket.is_full());
        assert!(!bucket.insert(Contact::random()));
    }

    #[test]
    fn insert_is_a_set() {
        let mut bucket = bucket();
        let contact = Contact::random();

        assert!(bucket.insert(contact.clone()));
        assert!(!bucket.insert(contact));
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn replacement_is_most_recently_cached() {
        let mut bucket = bucket();

        let first = Contact::random();
        let second = Contact::random();

        bucket.insert_cache(first);
        bucket.insert_cache(second.clone());

        assert_eq!(bucket.take_replacement(), Some(second));
        assert_eq!(bucket.cache_len(), 1);
    }

    #[test]
    fn cache_is_bounded() {
        let mut bucket = bucket();

        for _ in 0..5 {
            bucket.insert_cache(Contact::random());
        }

        assert_eq!(bucket.cache_len(), 2);
    }

    #[test]
    fn failures_accumulate_and_reset() {
        let mut bucket = bucket();
        let contact = Contact::random();

        bucket.insert(contact.clone());

        assert_eq!(bucket.record_failure(contact.id()), Some(1));
        assert_eq!(bucket.record_failure(contact.id()), Some(2));
        assert_eq!(bucket.most_failed(2), Some(*contact.id()));
        assert_eq!(bucket.most_failed(3), None);

        bucket.replace(contact.clone(), true);
        assert_eq!(bucket.record_failure(contact.id()), Some(1));
    }
}
