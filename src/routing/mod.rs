//! Kademlia routing table with prefix-splitting k-buckets.

mod bucket;

use std::net::SocketAddr;
use std::num::NonZeroUsize;

use tracing::{debug, trace};

use crate::common::{Contact, Id, ID_BITS};
use crate::rpc::ClosestContacts;

pub use bucket::Bucket;

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// Default size of a bucket's replacement cache.
pub const DEFAULT_CACHE_SIZE: usize = 16;

/// Default number of consecutive send failures before a contact is evicted.
pub const DEFAULT_MAX_FAILURES: usize = 5;

#[derive(Debug, Clone)]
/// Notification of a routing table membership change.
///
/// Subscribed receivers ([RoutingTable::subscribe]) get one event per
/// add/update/remove of an active contact; [crate::storage::StoreForward] is
/// the in-crate consumer.
pub enum RoutingEvent {
    Added(Contact),
    Updated { previous: Contact, current: Contact },
    Removed(Contact),
}

#[derive(Debug)]
/// Partition of the identifier space into k-buckets, ranked by XOR proximity
/// to the local contact.
///
/// Bucket `i` holds contacts sharing exactly `i` leading bits with the local
/// identifier; the last bucket covers the remaining (closest) range and is
/// the only one that splits when full. Buckets are disjoint and cover the
/// whole space.
pub struct RoutingTable {
    local: Contact,
    k: usize,
    cache_size: NonZeroUsize,
    max_failures: usize,
    buckets: Vec<Bucket>,
    subscribers: Vec<flume::Sender<RoutingEvent>>,
}

impl RoutingTable {
    pub fn new(local: Contact) -> RoutingTable {
        let cache_size = NonZeroUsize::new(DEFAULT_CACHE_SIZE).expect("non zero");

        RoutingTable {
            local,
            k: MAX_BUCKET_SIZE_K,
            cache_size,
            max_failures: DEFAULT_MAX_FAILURES,
            buckets: vec![Bucket::new(MAX_BUCKET_SIZE_K, cache_size)],
            subscribers: Vec::new(),
        }
    }

    // === Options ===

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self.rebuild();
        self
    }

    pub fn with_cache_size(mut self, cache_size: NonZeroUsize) -> Self {
        self.cache_size = cache_size;
        self.rebuild();
        self
    }

    pub fn with_max_failures(mut self, max_failures: usize) -> Self {
        self.max_failures = max_failures;
        self
    }

    // === Getters ===

    /// The local contact distances are measured from.
    pub fn local(&self) -> &Contact {
        &self.local
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// The number of active contacts in the table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.buckets[self.bucket_index(id)].contains(id)
    }

    /// Exact lookup among active then cached contacts.
    pub fn get(&self, id: &Id) -> Option<&Contact> {
        let bucket = &self.buckets[self.bucket_index(id)];

        bucket.get(id).or_else(|| bucket.cached(id))
    }

    /// All active contacts in the table.
    pub fn to_vec(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect()
    }

    /// Up to `count` active contacts ordered by ascending XOR distance to
    /// `target`; no duplicate identifiers.
    pub fn select(&self, target: &Id, count: usize) -> Vec<Contact> {
        let mut closest = ClosestContacts::new(*target);

        for bucket in &self.buckets {
            for contact in bucket.iter() {
                closest.add(contact.clone());
            }
        }

        closest.take(count)
    }

    // === Public Methods ===

    /// Register a listener notified of membership changes.
    pub fn subscribe(&mut self) -> flume::Receiver<RoutingEvent> {
        let (sender, receiver) = flume::unbounded();
        self.subscribers.push(sender);
        receiver
    }

    /// Insert or merge a sighted contact.
    ///
    /// Active contacts go into their bucket; when the bucket is full, the
    /// bucket covering the local identifier splits one more prefix bit and
    /// the insert is retried, while any other bucket evicts a member past the
    /// failure threshold or overflows into its replacement cache. Inactive
    /// (hearsay) contacts only ever reach the cache.
    ///
    /// Returns `true` if the contact is now among the active entries.
    pub fn add(&mut self, contact: Contact) -> bool {
        if contact.id() == self.local.id() {
            return false;
        }

        // Split the home bucket for as long as the new contact needs it.
        while self.needs_split(&contact) {
            self.split();
        }

        let index = self.bucket_index(contact.id());
        let bucket = &mut self.buckets[index];
        let mut events = Vec::new();

        let added = if let Some(existing) = bucket.get(contact.id()).cloned() {
            let merged = existing.merge(&contact);
            bucket.replace(merged.clone(), contact.is_active());
            events.push(RoutingEvent::Updated {
                previous: existing,
                current: merged,
            });
            true
        } else if !contact.is_active() {
            bucket.insert_cache(contact);
            false
        } else {
            // An earlier hearsay record may be waiting in the cache.
            let contact = match bucket.take_cached(contact.id()) {
                Some(cached) => cached.merge(&contact),
                None => contact,
            };

            if !bucket.is_full() {
                bucket.insert(contact.clone());
                events.push(RoutingEvent::Added(contact));
                true
            } else if let Some(stale) = bucket.most_failed(self.max_failures) {
                if let Some(removed) = bucket.remove(&stale) {
                    trace!(id = ?removed.id(), "Evicting failed contact");
                    events.push(RoutingEvent::Removed(removed));
                }
                bucket.insert(contact.clone());
                events.push(RoutingEvent::Added(contact));
                true
            } else {
                bucket.insert_cache(contact);
                false
            }
        };

        self.emit(events);

        added
    }

    /// Record a failed send to a contact; evicts it after
    /// [DEFAULT_MAX_FAILURES] consecutive failures, backfilling from the
    /// bucket's replacement cache.
    ///
    /// The address must match the known record, so a stale failure for a
    /// readdressed contact is ignored.
    pub fn failure(&mut self, id: &Id, address: &SocketAddr) {
        let max_failures = self.max_failures;
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        let mut events = Vec::new();

        let known = match bucket.get(id) {
            Some(contact) if contact.address() == *address => true,
            _ => false,
        };

        if known {
            if let Some(failures) = bucket.record_failure(id) {
                if failures >= max_failures {
                    if let Some(removed) = bucket.remove(id) {
                        debug!(?id, failures, "Evicting contact after repeated failures");
                        events.push(RoutingEvent::Removed(removed));
                    }

                    if let Some(replacement) = bucket.take_replacement() {
                        bucket.insert(replacement.clone());
                        events.push(RoutingEvent::Added(replacement));
                    }
                }
            }
        }

        self.emit(events);
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let index = self.bucket_index(id);
        let removed = self.buckets[index].remove(id);

        if let Some(removed) = removed.clone() {
            self.emit(vec![RoutingEvent::Removed(removed)]);
        }

        removed
    }

    /// Recompute bucket boundaries, re-inserting every known contact.
    ///
    /// Used after configuration changes; failure counts reset and no events
    /// are emitted.
    pub fn rebuild(&mut self) {
        let subscribers = std::mem::take(&mut self.subscribers);
        let old = std::mem::replace(
            &mut self.buckets,
            vec![Bucket::new(self.k, self.cache_size)],
        );

        for bucket in old {
            let (entries, cached) = bucket.into_parts();

            for entry in entries {
                self.add(entry.contact);
            }
            for contact in cached {
                self.add(contact);
            }
        }

        self.subscribers = subscribers;
    }

    // === Private Methods ===

    fn bucket_index(&self, id: &Id) -> usize {
        self.local
            .id()
            .common_prefix_length(id)
            .min(self.buckets.len() - 1)
    }

    fn needs_split(&self, contact: &Contact) -> bool {
        let index = self.bucket_index(contact.id());
        let home = index == self.buckets.len() - 1;
        let bucket = &self.buckets[index];

        contact.is_active()
            && home
            && bucket.is_full()
            && !bucket.contains(contact.id())
            && self.buckets.len() < ID_BITS
    }

    /// Split the bucket covering the local identifier along one further
    /// prefix bit.
    fn split(&mut self) {
        // Entries sharing at least `boundary` leading bits with the local id
        // move into the new home bucket.
        let boundary = self.buckets.len();

        let old = match self.buckets.pop() {
            Some(bucket) => bucket,
            None => return,
        };

        let mut stay = Bucket::new(self.k, self.cache_size);
        let mut deeper = Bucket::new(self.k, self.cache_size);
        let (entries, cached) = old.into_parts();

        for entry in entries {
            if self.local.id().common_prefix_length(entry.contact.id()) >= boundary {
                deeper.restore(entry);
            } else {
                stay.restore(entry);
            }
        }

        for contact in cached {
            if self.local.id().common_prefix_length(contact.id()) >= boundary {
                deeper.insert_cache(contact);
            } else {
                stay.insert_cache(contact);
            }
        }

        trace!(buckets = self.buckets.len() + 2, "Split home bucket");

        self.buckets.push(stay);
        self.buckets.push(deeper);
    }

    fn emit(&mut self, events: Vec<RoutingEvent>) {
        for event in events {
            self.subscribers
                .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::ContactKind;

    /// An id sharing exactly `prefix` leading bits with `local`, random after.
    fn id_at_depth(local: &Id, prefix: usize) -> Id {
        let mut bytes = *local.as_bytes();
        let random = Id::random();

        for bit in prefix + 1..ID_BITS {
            let byte = bit / 8;
            let mask = 0x80 >> (bit % 8);
            bytes[byte] = (bytes[byte] & !mask) | (random.as_bytes()[byte] & mask);
        }

        // Flip the boundary bit so the shared prefix is exactly `prefix` long.
        bytes[prefix / 8] ^= 0x80 >> (prefix % 8);

        Id::from(bytes)
    }

    fn table() -> RoutingTable {
        RoutingTable::new(Contact::random())
    }

    #[test]
    fn table_is_empty() {
        let mut table = table();
        assert!(table.is_empty());

        table.add(Contact::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn should_not_add_self() {
        let mut table = table();
        let node = Contact::random().with_id(*table.local().id());

        assert!(!table.add(node));
        assert!(table.is_empty());
    }

    #[test]
    fn re_adding_merges_instead_of_duplicating() {
        let mut table = table();
        let contact = Contact::random();

        table.add(contact.clone());

        std::thread::sleep(std::time::Duration::from_millis(2));

        let again = Contact::unsolicited(*contact.id(), contact.instance_id(), contact.address());
        table.add(again.clone());

        assert_eq!(table.size(), 1);

        let merged = table.get(contact.id()).unwrap();
        assert_eq!(merged.created_at(), contact.created_at());
        assert_eq!(merged.last_seen(), again.last_seen());
    }

    #[test]
    fn hearsay_contacts_only_reach_the_cache() {
        let mut table = table();
        let contact = Contact::unknown(Id::random(), 0, Contact::random().address());

        assert!(!table.add(contact.clone()));
        assert_eq!(table.size(), 0);

        // Still findable by exact lookup.
        assert!(table.get(contact.id()).is_some());

        // A direct sighting promotes it.
        assert!(table.add(contact.clone().with_kind(ContactKind::Solicited)));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn home_bucket_splits_when_full() {
        let local = Contact::random();
        let mut table = RoutingTable::new(local.clone()).with_k(4);

        // Contacts spread across depths all land in the home bucket first,
        // forcing it to split rather than overflow.
        for depth in 0..12 {
            for _ in 0..2 {
                table.add(Contact::solicited(
                    id_at_depth(local.id(), depth),
                    0,
                    local.address(),
                ));
            }
        }

        assert!(table.buckets().len() > 1);
        assert!(table.size() > 4, "splitting must retain more than k contacts");

        // Invariant: every bucket holds at most k active contacts, and every
        // contact sits in the bucket matching its prefix length.
        let buckets = table.buckets();
        for (index, bucket) in buckets.iter().enumerate() {
            assert!(bucket.len() <= 4);

            for contact in bucket.iter() {
                let prefix = local.id().common_prefix_length(contact.id());
                let expected = prefix.min(buckets.len() - 1);
                assert_eq!(expected, index);
            }
        }
    }

    #[test]
    fn full_far_bucket_overflows_into_cache() {
        let local = Contact::random();
        let mut table = RoutingTable::new(local.clone()).with_k(2);

        // Fill depth 0 (far half of the space), then overflow it.
        for _ in 0..3 {
            table.add(Contact::solicited(
                id_at_depth(local.id(), 0),
                0,
                local.address(),
            ));
        }
        // Make depth 0 a non-home bucket.
        for depth in 1..4 {
            for _ in 0..2 {
                table.add(Contact::solicited(
                    id_at_depth(local.id(), depth),
                    0,
                    local.address(),
                ));
            }
        }

        let overflow = Contact::solicited(id_at_depth(local.id(), 0), 0, local.address());
        assert!(!table.add(overflow.clone()));
        assert!(table.get(overflow.id()).is_some(), "cached, not dropped");
    }

    #[test]
    fn select_orders_by_distance_without_duplicates() {
        let mut table = table();

        for _ in 0..50 {
            table.add(Contact::random());
        }

        let target = Id::random();
        let selected = table.select(&target, 20);

        assert!(selected.len() <= 20);
        assert!(selected.len() <= table.size());

        let mut ids: Vec<&Id> = selected.iter().map(|c| c.id()).collect();
        ids.dedup();
        assert_eq!(ids.len(), selected.len(), "no duplicate identifiers");

        let distances: Vec<_> = selected.iter().map(|c| c.id().xor(&target)).collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted, "ascending XOR distance");
    }

    #[test]
    fn select_is_bounded_by_count() {
        let mut table = table();

        for _ in 0..10 {
            table.add(Contact::random());
        }

        assert_eq!(table.select(&Id::random(), 3).len(), 3);
        assert_eq!(table.select(&Id::random(), 100).len(), 10);
    }

    #[test]
    fn failures_evict_and_backfill_from_cache() {
        let local = Contact::random();
        let mut table = RoutingTable::new(local.clone())
            .with_k(2)
            .with_max_failures(2);

        // Fill a far bucket and cache one replacement.
        let mut members = Vec::new();
        for _ in 0..2 {
            let contact = Contact::solicited(id_at_depth(local.id(), 0), 0, local.address());
            table.add(contact.clone());
            members.push(contact);
        }
        // Make the far bucket non-home so the next insert lands in its cache.
        for depth in 1..4 {
            table.add(Contact::solicited(
                id_at_depth(local.id(), depth),
                0,
                local.address(),
            ));
            table.add(Contact::solicited(
                id_at_depth(local.id(), depth),
                0,
                local.address(),
            ));
        }
        let replacement = Contact::solicited(id_at_depth(local.id(), 0), 0, local.address());
        table.add(replacement.clone());

        let victim = &members[0];
        table.failure(victim.id(), &victim.address());
        assert!(table.contains(victim.id()), "below the threshold");

        table.failure(victim.id(), &victim.address());
        assert!(!table.contains(victim.id()), "evicted at the threshold");
        assert!(table.contains(replacement.id()), "backfilled from cache");
    }

    #[test]
    fn failure_with_wrong_address_is_ignored() {
        let mut table = RoutingTable::new(Contact::random()).with_max_failures(1);
        let contact = Contact::random();

        table.add(contact.clone());

        let wrong = SocketAddr::from(([10, 9, 9, 9], 1));
        table.failure(contact.id(), &wrong);

        assert!(table.contains(contact.id()));
    }

    #[test]
    fn subscribers_observe_membership_changes() {
        let mut table = RoutingTable::new(Contact::random()).with_max_failures(1);
        let events = table.subscribe();

        let contact = Contact::random();
        table.add(contact.clone());
        table.add(contact.clone());
        table.failure(contact.id(), &contact.address());

        assert!(matches!(events.try_recv(), Ok(RoutingEvent::Added(_))));
        assert!(matches!(
            events.try_recv(),
            Ok(RoutingEvent::Updated { .. })
        ));
        assert!(matches!(events.try_recv(), Ok(RoutingEvent::Removed(_))));
    }

    #[test]
    fn rebuild_retains_contacts() {
        let mut table = table();

        for _ in 0..30 {
            table.add(Contact::random());
        }

        let before = table.size();
        table.rebuild();

        assert_eq!(table.size(), before);
    }
}
