//! Local key/value storage behind the STORE and FIND_VALUE handlers.

mod store_forward;

use std::collections::HashMap;
use std::fmt::Debug;

use crate::common::{Id, ValueTuple};

pub use store_forward::{Forward, StoreForward};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of a store operation, reported back to the requester.
pub enum Condition {
    Success,
    Failure,
}

impl Condition {
    pub fn is_success(&self) -> bool {
        matches!(self, Condition::Success)
    }
}

/// Key/value storage consulted by the request handlers.
///
/// Implementations decide whether to accept a value; the default in-memory
/// database accepts everything and treats an empty payload as a delete.
pub trait Database: Debug + Send {
    /// The current value stored under `key`, if any.
    fn get(&self, key: &Id) -> Option<&ValueTuple>;

    /// Store (or delete, for an empty tuple) a value.
    fn store(&mut self, tuple: ValueTuple) -> Condition;

    /// All stored tuples whose keys ascend in XOR distance to `key`.
    fn select(&self, key: &Id) -> Vec<&ValueTuple>;

    /// All stored tuples, in no particular order.
    fn values(&self) -> Vec<&ValueTuple>;

    fn size(&self) -> usize;
}

#[derive(Debug, Default)]
/// Unbounded in-memory [Database].
pub struct MemoryDatabase {
    values: HashMap<Id, ValueTuple>,
}

impl MemoryDatabase {
    pub fn new() -> MemoryDatabase {
        MemoryDatabase::default()
    }
}

impl Database for MemoryDatabase {
    fn get(&self, key: &Id) -> Option<&ValueTuple> {
        self.values.get(key)
    }

    fn store(&mut self, tuple: ValueTuple) -> Condition {
        if tuple.is_empty() {
            self.values.remove(tuple.key());
        } else {
            self.values.insert(*tuple.key(), tuple);
        }

        Condition::Success
    }

    fn select(&self, key: &Id) -> Vec<&ValueTuple> {
        let mut tuples: Vec<&ValueTuple> = self.values.values().collect();
        tuples.sort_by(|a, b| key.cmp_distance(a.key(), b.key()));

        tuples
    }

    fn values(&self) -> Vec<&ValueTuple> {
        self.values.values().collect()
    }

    fn size(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::Contact;
    use bytes::Bytes;

    #[test]
    fn store_and_get() {
        let mut database = MemoryDatabase::new();
        let key = Id::random();
        let tuple = ValueTuple::new(Contact::random(), key, Bytes::from("hello"));

        assert_eq!(database.store(tuple), Condition::Success);
        assert_eq!(database.size(), 1);
        assert_eq!(database.get(&key).map(|t| t.value().clone()), Some(Bytes::from("hello")));
    }

    #[test]
    fn newer_value_overwrites() {
        let mut database = MemoryDatabase::new();
        let key = Id::random();

        database.store(ValueTuple::new(Contact::random(), key, Bytes::from("one")));
        database.store(ValueTuple::new(Contact::random(), key, Bytes::from("two")));

        assert_eq!(database.size(), 1);
        assert_eq!(database.get(&key).map(|t| t.value().clone()), Some(Bytes::from("two")));
    }

    #[test]
    fn select_orders_by_distance_to_the_key() {
        let mut database = MemoryDatabase::new();

        for _ in 0..10 {
            database.store(ValueTuple::new(
                Contact::random(),
                Id::random(),
                Bytes::from("x"),
            ));
        }

        let reference = Id::random();
        let selected = database.select(&reference);

        let distances: Vec<_> = selected
            .iter()
            .map(|tuple| tuple.key().xor(&reference))
            .collect();
        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(distances, sorted);
        assert_eq!(selected.len(), 10);
    }

    #[test]
    fn empty_value_deletes_the_key() {
        let mut database = MemoryDatabase::new();
        let key = Id::random();

        database.store(ValueTuple::new(Contact::random(), key, Bytes::from("hello")));
        assert_eq!(
            database.store(ValueTuple::tombstone(Contact::random(), key)),
            Condition::Success
        );

        assert!(database.get(&key).is_none());
        assert_eq!(database.size(), 0);
    }
}
