//! Contacts sorted by their distance to a target.

use crate::common::{Contact, Distance, Id};

#[derive(Debug, Clone)]
/// Simple wrapper over a sorted vector of contacts.
///
/// Useful to keep track of the closest contacts to a target while routing or
/// running an iterative lookup.
pub struct ClosestContacts {
    target: Id,
    contacts: Vec<Contact>,
}

impl ClosestContacts {
    pub fn new(target: Id) -> ClosestContacts {
        ClosestContacts {
            target,
            contacts: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.contacts.iter().any(|contact| contact.id() == id)
    }

    /// The distance of the `count`th closest contact, or max if fewer are known.
    pub fn distance_at(&self, count: usize) -> Distance {
        if count == 0 {
            return Distance::ZERO;
        }

        self.contacts
            .get(count - 1)
            .map(|contact| contact.id().xor(&self.target))
            .unwrap_or(Distance::MAX)
    }

    // === Public Methods ===

    /// Insert a contact, keeping the vector sorted by distance to the target.
    /// Re-adding an already known identifier is a no-op.
    pub fn add(&mut self, contact: Contact) {
        let distance = contact.id().xor(&self.target);

        let index = match self.contacts.binary_search_by(|other| {
            other
                .id()
                .xor(&self.target)
                .cmp(&distance)
                .then_with(|| other.id().cmp(contact.id()))
        }) {
            Ok(_) => return,
            Err(index) => index,
        };

        self.contacts.insert(index, contact);
    }

    /// The closest `count` contacts, in ascending distance.
    pub fn take(&self, count: usize) -> Vec<Contact> {
        self.contacts.iter().take(count).cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sorted_by_distance() {
        let target = Id::random();
        let mut closest = ClosestContacts::new(target);

        for _ in 0..32 {
            closest.add(Contact::random());
        }

        let distances: Vec<_> = closest
            .contacts()
            .iter()
            .map(|contact| contact.id().xor(&target))
            .collect();

        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(distances, sorted);
    }

    #[test]
    fn add_is_a_set() {
        let mut closest = ClosestContacts::new(Id::random());
        let contact = Contact::random();

        closest.add(contact.clone());
        closest.add(contact);

        assert_eq!(closest.len(), 1);
    }

    #[test]
    fn distance_at_saturates() {
        let mut closest = ClosestContacts::new(Id::random());

        assert_eq!(closest.distance_at(20), Distance::MAX);

        closest.add(Contact::random());
        assert_ne!(closest.distance_at(1), Distance::MAX);
        assert_eq!(closest.distance_at(20), Distance::MAX);
    }

    #[test]
    fn take_is_bounded() {
        let mut closest = ClosestContacts::new(Id::random());

        for _ in 0..10 {
            closest.add(Contact::random());
        }

        assert_eq!(closest.take(3).len(), 3);
        assert_eq!(closest.take(100).len(), 10);
    }
}
