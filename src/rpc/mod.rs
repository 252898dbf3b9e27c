//! Single-threaded node core: request handling, lookups and stores.

mod closest;
mod dispatcher;
mod lookup;
mod store;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::common::{
    Contact, ContactKind, Id, Message, MessageType, PeerInfo, RequestSpecific, ResponseSpecific,
    SenderInfo, ValueTuple,
};
use crate::config::Config;
use crate::routing::RoutingTable;
use crate::storage::{Condition, Database, MemoryDatabase, StoreForward};
use crate::transport::Transport;
use crate::Result;

pub use closest::ClosestContacts;
pub use dispatcher::{Dispatcher, PendingRequest, ResponseMatch};
pub use lookup::{LookupKind, LookupOutcome, LookupQuery, LookupResult};
pub use store::{StoreError, StoreQuery, StoreResult};

/// Minimum pause between attempts to repopulate an empty routing table.
const POPULATE_COOLDOWN: Duration = Duration::from_secs(10);

/// A put waiting for its node lookup to finish.
#[derive(Debug)]
struct PendingPut {
    tuple: ValueTuple,
    lookup: flume::Receiver<LookupResult>,
    sender: flume::Sender<std::result::Result<StoreResult, StoreError>>,
}

#[derive(Debug)]
/// The node core. Owned and ticked by a single thread; every handler and
/// query state machine runs serialized on that thread.
pub struct Rpc {
    dispatcher: Dispatcher,
    routing_table: RoutingTable,
    database: Box<dyn Database>,
    store_forward: StoreForward,

    lookups: HashMap<(Id, LookupKind), LookupQuery>,
    stores: HashMap<u64, StoreQuery>,
    next_store_id: u64,
    pending_puts: Vec<PendingPut>,
    pings: Vec<(u64, flume::Sender<Contact>)>,

    config: Config,
    bootstrap: Vec<SocketAddr>,
    last_populate: Instant,
}

impl Rpc {
    pub fn new(config: Config, transport: Box<dyn Transport>) -> Result<Rpc> {
        let local = Contact::solicited(Id::random(), rand::random(), transport.local_addr());

        info!(id = ?local.id(), address = ?local.address(), "Starting node");

        let mut routing_table = RoutingTable::new(local.clone())
            .with_k(config.k)
            .with_max_failures(config.max_contact_failures);

        if let Some(cache_size) = std::num::NonZeroUsize::new(config.cache_size) {
            routing_table = routing_table.with_cache_size(cache_size);
        }

        let store_forward = StoreForward::new(routing_table.subscribe(), config.store_forward);

        let bootstrap = config
            .bootstrap
            .iter()
            .flat_map(|address| address.to_socket_addrs().into_iter().flatten())
            .collect();

        let dispatcher = Dispatcher::new(
            transport,
            SenderInfo::from_contact(&local),
            config.request_timeout,
        );

        Ok(Rpc {
            dispatcher,
            routing_table,
            database: Box::new(MemoryDatabase::new()),
            store_forward,
            lookups: HashMap::new(),
            stores: HashMap::new(),
            next_store_id: 0,
            pending_puts: Vec::new(),
            pings: Vec::new(),
            config,
            bootstrap,
            // Populate immediately on the first tick.
            last_populate: Instant::now()
                .checked_sub(POPULATE_COOLDOWN)
                .unwrap_or_else(Instant::now),
        })
    }

    // === Getters ===

    pub fn local(&self) -> &Contact {
        self.routing_table.local()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.dispatcher.local_addr()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn database(&self) -> &dyn Database {
        &*self.database
    }

    // === Public Methods ===

    /// One turn of the loop: expire requests, advance queries, replicate to
    /// newcomers, and process one incoming message.
    pub fn tick(&mut self) {
        self.handle_expired();
        self.advance_queries();
        self.replicate();
        self.populate();

        if let Some((message, from)) = self.dispatcher.recv() {
            self.handle_message(message, from);
        }
    }

    /// Ping an address; the contact is sent back once the pong arrives.
    pub fn ping(&mut self, address: SocketAddr, sender: flume::Sender<Contact>) {
        match self
            .dispatcher
            .request(None, address, RequestSpecific::Ping, None)
        {
            Ok(transaction_id) => self.pings.push((transaction_id, sender)),
            Err(error) => debug!(?error, ?address, "Failed to send ping"),
        }
    }

    /// Iterative node lookup for the closest contacts to `target`.
    pub fn find_node(&mut self, target: Id, sender: flume::Sender<LookupResult>) {
        self.lookup(target, LookupKind::Node, sender);
    }

    /// Iterative value lookup; resolves from the local database when possible.
    pub fn get(&mut self, key: Id, sender: flume::Sender<LookupResult>) {
        if let Some(tuple) = self.database.get(&key) {
            let _ = sender.send(LookupResult {
                target: key,
                outcome: LookupOutcome::Success,
                value: Some(tuple.clone()),
                closest: Vec::new(),
                queried: 0,
                elapsed: Duration::ZERO,
            });
            return;
        }

        self.lookup(key, LookupKind::Value, sender);
    }

    /// Store `value` under `key` at the closest nodes to `key`.
    pub fn put(
        &mut self,
        key: Id,
        value: Bytes,
        sender: flume::Sender<std::result::Result<StoreResult, StoreError>>,
    ) {
        let tuple = ValueTuple::new(self.local().clone(), key, value);

        let (lookup_sender, lookup_receiver) = flume::bounded(1);
        self.lookup(key, LookupKind::Node, lookup_sender);

        self.pending_puts.push(PendingPut {
            tuple,
            lookup: lookup_receiver,
            sender,
        });
    }

    /// All values in the local database.
    pub fn values(&self) -> Vec<ValueTuple> {
        self.database.values().into_iter().cloned().collect()
    }

    // === Private Methods ===

    fn lookup(&mut self, target: Id, kind: LookupKind, sender: flume::Sender<LookupResult>) {
        // Node and value lookups for the same target stay separate; only a
        // value lookup sends FIND_VALUE.
        if let Some(query) = self.lookups.get_mut(&(target, kind)) {
            query.add_sender(sender);
            return;
        }

        let mut query = LookupQuery::new(
            target,
            kind,
            self.config.alpha,
            self.config.k,
            self.config.lookup_timeout,
        );
        query.add_sender(sender);

        for contact in self.routing_table.select(&target, self.config.k) {
            query.add_candidate(contact);
        }

        if self.routing_table.is_empty() {
            for address in self.bootstrap.clone() {
                query.visit_address(&mut self.dispatcher, address);
            }
        }

        self.lookups.insert((target, kind), query);
    }

    fn handle_expired(&mut self) {
        for request in self.dispatcher.purge_expired() {
            trace!(transaction_id = request.transaction_id, "Request expired");

            if let Some(id) = request.to {
                self.routing_table.failure(&id, &request.address);
            }

            let transaction_id = request.transaction_id;

            if self
                .lookups
                .values_mut()
                .any(|query| query.on_timeout(transaction_id))
            {
                continue;
            }

            if self
                .stores
                .values_mut()
                .any(|query| query.on_timeout(transaction_id))
            {
                continue;
            }

            self.pings.retain(|(id, _)| *id != transaction_id);
        }
    }

    fn advance_queries(&mut self) {
        let dispatcher = &mut self.dispatcher;

        for query in self.lookups.values_mut() {
            query.tick(dispatcher);
        }
        self.lookups.retain(|_, query| !query.is_done());

        for query in self.stores.values_mut() {
            query.tick(dispatcher);
        }
        self.stores.retain(|_, query| !query.is_done());

        // Puts whose lookup settled graduate into store queries.
        let mut started = Vec::new();
        let k = self.config.k;
        let request_timeout = self.config.request_timeout;
        let store_timeout = self.config.store_timeout;

        self.pending_puts.retain(|put| match put.lookup.try_recv() {
            Ok(result) => {
                match StoreQuery::new(
                    put.tuple.clone(),
                    result.closest,
                    k,
                    request_timeout,
                    store_timeout,
                ) {
                    Ok(mut query) => {
                        query.add_sender(put.sender.clone());
                        started.push(query);
                    }
                    Err(error) => {
                        let _ = put.sender.send(Err(error));
                    }
                }
                false
            }
            Err(flume::TryRecvError::Empty) => true,
            Err(flume::TryRecvError::Disconnected) => false,
        });

        for query in started {
            self.insert_store(query);
        }
    }

    fn replicate(&mut self) {
        for forward in self.store_forward.tick(&self.routing_table, &*self.database) {
            match StoreQuery::new(
                forward.tuple,
                vec![forward.contact],
                self.config.k,
                self.config.request_timeout,
                self.config.store_timeout,
            ) {
                Ok(query) => self.insert_store(query),
                Err(error) => debug!(?error, "Failed to start forward"),
            }
        }
    }

    fn insert_store(&mut self, query: StoreQuery) {
        let id = self.next_store_id;
        self.next_store_id += 1;
        self.stores.insert(id, query);
    }

    /// Try to (re)fill an empty routing table from the bootstrap addresses.
    fn populate(&mut self) {
        if !self.routing_table.is_empty()
            || self.bootstrap.is_empty()
            || self.last_populate.elapsed() < POPULATE_COOLDOWN
        {
            return;
        }

        self.last_populate = Instant::now();

        debug!(id = ?self.local().id(), "Populating routing table");

        let target = *self.local().id();
        let (sender, _) = flume::bounded(1);
        self.lookup(target, LookupKind::Node, sender);
    }

    fn handle_message(&mut self, message: Message, from: SocketAddr) {
        match &message.message_type {
            MessageType::Request(request) => {
                let contact = message.sender.contact(ContactKind::Unsolicited, from);

                if message.sender.visible {
                    self.routing_table.add(contact.clone());
                }

                self.handle_request(message.transaction_id, contact, request.clone());
            }
            MessageType::Response(_) => self.handle_response(&message, from),
        }
    }

    fn handle_request(&mut self, transaction_id: u64, contact: Contact, request: RequestSpecific) {
        let response = match request {
            RequestSpecific::Ping => ResponseSpecific::Ping,
            RequestSpecific::FindNode { target } => ResponseSpecific::FindNode {
                contacts: self.closest_peers(&target),
            },
            RequestSpecific::FindValue { key } => match self.database.get(&key) {
                Some(tuple) => ResponseSpecific::FindValue {
                    value: Some(crate::common::ValueInfo::from_tuple(tuple)),
                    contacts: Vec::new(),
                },
                None => ResponseSpecific::FindValue {
                    value: None,
                    contacts: self.closest_peers(&key),
                },
            },
            RequestSpecific::Store { value } => {
                let tuple = value.into_tuple(contact.clone());
                let condition = self.database.store(tuple);

                ResponseSpecific::Store { condition }
            }
        };

        if let Err(error) = self
            .dispatcher
            .respond(contact.address(), transaction_id, response)
        {
            debug!(?error, to = ?contact.id(), "Failed to respond");
        }
    }

    fn handle_response(&mut self, message: &Message, from: SocketAddr) {
        let matched = self.dispatcher.match_response(message, from);

        let mut contact = message.sender.contact(ContactKind::Solicited, from);
        if let ResponseMatch::Matched {
            round_trip_time, ..
        } = &matched
        {
            contact = contact.with_round_trip_time(*round_trip_time);
        }

        // Late and mismatched responses still count as a sighting; they just
        // never resolve a query.
        if message.sender.visible {
            self.routing_table.add(contact.clone());
        }

        let (request, round_trip_time) = match matched {
            ResponseMatch::Matched {
                request,
                round_trip_time,
            } => (request, round_trip_time),
            ResponseMatch::MismatchedSender | ResponseMatch::Late => return,
        };

        let MessageType::Response(response) = &message.message_type else {
            return;
        };
        let transaction_id = request.transaction_id;

        for query in self.lookups.values_mut() {
            if !query.contains_request(transaction_id) {
                continue;
            }

            let (contacts, value) = match response {
                ResponseSpecific::FindNode { contacts } => (contacts.clone(), None),
                ResponseSpecific::FindValue { value, contacts } => (
                    contacts.clone(),
                    value.clone().map(|value| value.into_tuple(contact.clone())),
                ),
                _ => (Vec::new(), None),
            };

            let contacts = contacts.iter().map(PeerInfo::contact).collect();
            query.on_response(transaction_id, contact, contacts, value);
            return;
        }

        for query in self.stores.values_mut() {
            if !query.contains_request(transaction_id) {
                continue;
            }

            let condition = match response {
                ResponseSpecific::Store { condition } => *condition,
                _ => Condition::Failure,
            };

            query.on_response(transaction_id, &contact, condition, round_trip_time);
            return;
        }

        if let Some(index) = self.pings.iter().position(|(id, _)| *id == transaction_id) {
            let (_, sender) = self.pings.remove(index);
            let _ = sender.send(contact);
        }
    }

    fn closest_peers(&self, target: &Id) -> Vec<PeerInfo> {
        self.routing_table
            .select(target, self.config.k)
            .iter()
            .map(PeerInfo::from_contact)
            .collect()
    }
}
