//! Stored key/value unit with provenance and version metadata.

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;

use crate::common::{Contact, Id};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Version marker for stored values.
///
/// Each writer ticks its own component; a clock descends from another if
/// every component is at least as large.
pub struct VectorClock(BTreeMap<Id, u64>);

impl VectorClock {
    pub fn new() -> VectorClock {
        VectorClock(BTreeMap::new())
    }

    /// Increment the component of the given writer and return the new clock.
    pub fn tick(mut self, writer: &Id) -> VectorClock {
        *self.0.entry(*writer).or_insert(0) += 1;
        self
    }

    pub fn counter(&self, writer: &Id) -> u64 {
        self.0.get(writer).copied().unwrap_or(0)
    }

    /// Returns `true` if this clock descends from (is at least as new as) `other`.
    pub fn descends(&self, other: &VectorClock) -> bool {
        other
            .0
            .iter()
            .all(|(writer, counter)| self.counter(writer) >= *counter)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Id, &u64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Id, u64)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (Id, u64)>>(iter: T) -> VectorClock {
        VectorClock(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone)]
/// A stored value: key, payload and provenance. Immutable once created.
///
/// An empty payload is a tombstone; storing it deletes the key.
pub struct ValueTuple {
    key: Id,
    value: Bytes,
    creator: Contact,
    sender: Contact,
    created_at: Instant,
    clock: VectorClock,
}

impl ValueTuple {
    /// A fresh value created locally; the creator is also the first sender.
    pub fn new(creator: Contact, key: Id, value: Bytes) -> ValueTuple {
        let clock = VectorClock::new().tick(creator.id());

        ValueTuple {
            key,
            value,
            sender: creator.clone(),
            creator,
            created_at: Instant::now(),
            clock,
        }
    }

    /// A tombstone deleting `key`.
    pub fn tombstone(creator: Contact, key: Id) -> ValueTuple {
        ValueTuple::new(creator, key, Bytes::new())
    }

    /// Rebuild a tuple received from the network with an explicit clock.
    pub fn received(
        creator: Contact,
        sender: Contact,
        key: Id,
        value: Bytes,
        clock: VectorClock,
    ) -> ValueTuple {
        ValueTuple {
            key,
            value,
            creator,
            sender,
            created_at: Instant::now(),
            clock,
        }
    }

    /// The same value as re-sent by `sender`, e.g. when store-forwarding.
    pub fn forwarded(&self, sender: Contact) -> ValueTuple {
        ValueTuple {
            sender,
            ..self.clone()
        }
    }

    // === Getters ===

    pub fn key(&self) -> &Id {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn creator(&self) -> &Contact {
        &self.creator
    }

    pub fn sender(&self) -> &Contact {
        &self.sender
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}
