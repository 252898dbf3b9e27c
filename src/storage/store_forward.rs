//! Replicates stored values to newly sighted nodes.
//!
//! Watches routing table membership; when a node appears (or restarts with a
//! new instance id) near a key this node is responsible for, the value is
//! forwarded to it.

use tracing::debug;

use crate::common::{Contact, ValueTuple};
use crate::routing::{RoutingEvent, RoutingTable};
use crate::storage::Database;

#[derive(Debug, Clone)]
/// A value that should be sent to a specific contact.
pub struct Forward {
    pub contact: Contact,
    pub tuple: ValueTuple,
}

#[derive(Debug)]
/// Drains [RoutingEvent]s and decides which stored values to replicate.
pub struct StoreForward {
    events: flume::Receiver<RoutingEvent>,
    enabled: bool,
}

impl StoreForward {
    pub fn new(events: flume::Receiver<RoutingEvent>, enabled: bool) -> StoreForward {
        StoreForward { events, enabled }
    }

    /// Process pending membership changes and return the values to forward.
    ///
    /// A value is forwarded to a contact when all three hold: the contact is
    /// new (first sighting, or a restart under a new instance id), the
    /// contact lies within the closest-k range of the key, and this node is
    /// responsible for the key (closest, or next after the new contact).
    pub fn tick(&self, table: &RoutingTable, database: &dyn Database) -> Vec<Forward> {
        let mut forwards = Vec::new();

        for event in self.events.try_iter() {
            if !self.enabled {
                continue;
            }

            let contact = match event {
                RoutingEvent::Added(contact) => contact,
                RoutingEvent::Updated { previous, current }
                    if previous.instance_id() != current.instance_id() =>
                {
                    current
                }
                _ => continue,
            };

            for tuple in database.values() {
                if self.should_forward(table, &contact, tuple) {
                    debug!(key = ?tuple.key(), to = ?contact.id(), "Forwarding value");

                    forwards.push(Forward {
                        contact: contact.clone(),
                        tuple: tuple.forwarded(table.local().clone()),
                    });
                }
            }
        }

        forwards
    }

    fn should_forward(&self, table: &RoutingTable, contact: &Contact, tuple: &ValueTuple) -> bool {
        let key = tuple.key();
        let closest = table.select(key, table.k());

        let Some(first) = closest.first() else {
            return false;
        };

        // The contact must fall within the closest-k range of the key.
        if closest.len() >= table.k() {
            let furthest = &closest[closest.len() - 1];

            if furthest.id() != contact.id() && furthest.id().is_closer_to(key, contact.id()) {
                return false;
            }
        }

        // This node must be responsible for the key: closest of all known
        // nodes, or next in line right after the new contact.
        let local = table.local().id();

        if local.is_closer_to(key, first.id()) {
            return true;
        }

        first.id() == contact.id()
            && match closest.get(1) {
                Some(second) => local.is_closer_to(key, second.id()),
                None => true,
            }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::{Contact, Id};
    use crate::storage::MemoryDatabase;
    use bytes::Bytes;

    fn setup() -> (RoutingTable, StoreForward, MemoryDatabase) {
        let mut table = RoutingTable::new(Contact::random());
        let events = table.subscribe();
        let store_forward = StoreForward::new(events, true);

        let mut database = MemoryDatabase::new();
        database.store(ValueTuple::new(
            table.local().clone(),
            Id::random(),
            Bytes::from("hello"),
        ));

        (table, store_forward, database)
    }

    #[test]
    fn forwards_to_a_new_contact() {
        let (mut table, store_forward, database) = setup();

        let contact = Contact::random();
        table.add(contact.clone());

        let forwards = store_forward.tick(&table, &database);

        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].contact, contact);
        assert_eq!(forwards[0].tuple.sender(), table.local());
    }

    #[test]
    fn repeated_sightings_do_not_re_forward() {
        let (mut table, store_forward, database) = setup();

        let contact = Contact::random();
        table.add(contact.clone());
        assert_eq!(store_forward.tick(&table, &database).len(), 1);

        // Same node, same instance: an update, not a new sighting.
        table.add(Contact::solicited(
            *contact.id(),
            contact.instance_id(),
            contact.address(),
        ));
        assert!(store_forward.tick(&table, &database).is_empty());

        // A restart under a new instance id forwards again.
        table.add(Contact::solicited(
            *contact.id(),
            contact.instance_id() + 1,
            contact.address(),
        ));
        assert_eq!(store_forward.tick(&table, &database).len(), 1);
    }

    #[test]
    fn disabled_drops_events() {
        let (mut table, _, database) = setup();

        let events = table.subscribe();
        let store_forward = StoreForward::new(events, false);

        table.add(Contact::random());

        assert!(store_forward.tick(&table, &database).is_empty());
    }
}
