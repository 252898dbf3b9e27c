//! Immutable entry describing another peer; the unit stored in the routing table.

use std::collections::BTreeMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use crate::common::Id;

/// Floor for adaptive timeouts derived from a contact's round trip time.
const MIN_ADAPTIVE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a contact was last observed.
pub enum ContactKind {
    /// Learned from a FIND_NODE or FIND_VALUE response's contact list; never heard from directly.
    Unknown,
    /// Sent us a request.
    Unsolicited,
    /// Sent us a response.
    Solicited,
}

impl ContactKind {
    /// Contacts we heard from directly count as active; hearsay does not.
    pub fn is_active(&self) -> bool {
        !matches!(self, ContactKind::Unknown)
    }
}

#[derive(Debug, Clone)]
/// A peer's identifier, address and liveness metadata.
///
/// Contacts are immutable values; every mutator returns a new contact and the
/// routing table swaps whole values instead of mutating shared state.
/// Equality and hashing go by [Id] alone.
pub struct Contact {
    id: Id,
    address: SocketAddr,
    instance_id: u32,
    kind: ContactKind,
    created_at: Instant,
    last_seen: Instant,
    round_trip_time: Option<Duration>,
    attributes: BTreeMap<String, String>,
}

impl Contact {
    pub fn new(kind: ContactKind, id: Id, instance_id: u32, address: SocketAddr) -> Contact {
        let now = Instant::now();

        Contact {
            id,
            address,
            instance_id,
            kind,
            created_at: now,
            last_seen: now,
            round_trip_time: None,
            attributes: BTreeMap::new(),
        }
    }

    /// A contact learned from another node's response.
    pub fn unknown(id: Id, instance_id: u32, address: SocketAddr) -> Contact {
        Contact::new(ContactKind::Unknown, id, instance_id, address)
    }

    /// A contact that sent us a request.
    pub fn unsolicited(id: Id, instance_id: u32, address: SocketAddr) -> Contact {
        Contact::new(ContactKind::Unsolicited, id, instance_id, address)
    }

    /// A contact that sent us a response.
    pub fn solicited(id: Id, instance_id: u32, address: SocketAddr) -> Contact {
        Contact::new(ContactKind::Solicited, id, instance_id, address)
    }

    /// Generate a random solicited contact, useful in tests and simulations.
    pub fn random() -> Contact {
        Contact::solicited(
            Id::random(),
            0,
            SocketAddr::V4(SocketAddrV4::new([127, 0, 0, 1].into(), 0)),
        )
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn kind(&self) -> ContactKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.kind.is_active()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|value| value.as_str())
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// A per request timeout derived from this contact's observed round trip
    /// time, clamped to the given default.
    pub fn adaptive_timeout(&self, default: Duration) -> Duration {
        match self.round_trip_time {
            Some(rtt) => (rtt * 2).clamp(MIN_ADAPTIVE_TIMEOUT, default),
            None => default,
        }
    }

    // === Derived-copy mutators ===

    pub fn with_id(mut self, id: Id) -> Contact {
        self.id = id;
        self
    }

    pub fn with_kind(mut self, kind: ContactKind) -> Contact {
        self.kind = kind;
        self
    }

    pub fn with_instance_id(mut self, instance_id: u32) -> Contact {
        self.instance_id = instance_id;
        self
    }

    pub fn with_address(mut self, address: SocketAddr) -> Contact {
        self.address = address;
        self
    }

    pub fn with_round_trip_time(mut self, rtt: Duration) -> Contact {
        self.round_trip_time = Some(rtt);
        self
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Contact {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Merge two sightings of the same contact into one record.
    ///
    /// Keeps the older creation time and the newer timestamp, instance id,
    /// address and round trip time; attributes are unioned with the newer
    /// sighting winning on key collisions. An [ContactKind::Unknown] sighting
    /// never demotes an active contact.
    pub fn merge(&self, other: &Contact) -> Contact {
        debug_assert_eq!(self.id, other.id, "merging contacts with different ids");

        let (older, newer) = if self.created_at <= other.created_at {
            (self, other)
        } else {
            (other, self)
        };

        let kind = if !newer.kind.is_active() && older.kind.is_active() {
            older.kind
        } else {
            newer.kind
        };

        let mut attributes = older.attributes.clone();
        for (key, value) in &newer.attributes {
            attributes.insert(key.clone(), value.clone());
        }

        Contact {
            id: older.id,
            address: newer.address,
            instance_id: newer.instance_id,
            kind,
            created_at: older.created_at,
            last_seen: older.last_seen.max(newer.last_seen),
            round_trip_time: newer.round_trip_time.or(older.round_trip_time),
            attributes,
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn equality_is_by_id() {
        let a = Contact::random();
        let b = a
            .clone()
            .with_address(SocketAddr::from(([10, 0, 0, 1], 9000)))
            .with_instance_id(42);

        assert_eq!(a, b);
    }

    #[test]
    fn merge_keeps_oldest_creation_and_newest_sighting() {
        let first = Contact::random();

        std::thread::sleep(Duration::from_millis(2));

        let second = Contact::unsolicited(
            *first.id(),
            first.instance_id() + 1,
            SocketAddr::from(([10, 0, 0, 1], 9000)),
        );

        let merged = first.merge(&second);

        assert_eq!(merged.created_at(), first.created_at());
        assert_eq!(merged.last_seen(), second.last_seen());
        assert_eq!(merged.instance_id(), second.instance_id());
        assert_eq!(merged.address(), second.address());
        assert_eq!(merged.kind(), ContactKind::Unsolicited);

        // Merging is symmetric in everything but argument order.
        let merged = second.merge(&first);
        assert_eq!(merged.created_at(), first.created_at());
        assert_eq!(merged.instance_id(), second.instance_id());
    }

    #[test]
    fn hearsay_does_not_demote_an_active_contact() {
        let solicited = Contact::random();

        std::thread::sleep(Duration::from_millis(2));

        let hearsay = Contact::unknown(
            *solicited.id(),
            solicited.instance_id(),
            solicited.address(),
        );

        assert_eq!(solicited.merge(&hearsay).kind(), ContactKind::Solicited);
    }

    #[test]
    fn merge_unions_attributes_newer_wins() {
        let first = Contact::random()
            .with_attribute("client", "kadex")
            .with_attribute("region", "eu");

        std::thread::sleep(Duration::from_millis(2));

        let second = Contact::solicited(*first.id(), first.instance_id(), first.address())
            .with_attribute("region", "us");

        let merged = first.merge(&second);

        assert_eq!(merged.attribute("client"), Some("kadex"));
        assert_eq!(merged.attribute("region"), Some("us"));
    }

    #[test]
    fn adaptive_timeout_is_clamped() {
        let default = Duration::from_secs(10);
        let contact = Contact::random();

        assert_eq!(contact.adaptive_timeout(default), default);

        let fast = contact.clone().with_round_trip_time(Duration::from_millis(80));
        assert_eq!(fast.adaptive_timeout(default), Duration::from_millis(160));

        let slow = contact.with_round_trip_time(Duration::from_secs(30));
        assert_eq!(slow.adaptive_timeout(default), default);
    }
}
