//! Iterative lookup converging on the closest nodes to a target.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{Contact, Id, RequestSpecific, ValueTuple};
use crate::rpc::closest::ClosestContacts;
use crate::rpc::dispatcher::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    /// FIND_NODE: converge on the closest nodes.
    Node,
    /// FIND_VALUE: like [LookupKind::Node], but a returned value ends the
    /// lookup immediately.
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a lookup ended.
pub enum LookupOutcome {
    /// A value was found (value lookups only).
    Success,
    /// Every useful candidate was queried; the closest responders stand.
    Exhausted,
    /// The overall deadline passed first.
    Timeout,
}

#[derive(Debug, Clone)]
pub struct LookupResult {
    pub target: Id,
    pub outcome: LookupOutcome,
    /// The found value, for successful value lookups.
    pub value: Option<ValueTuple>,
    /// The closest responding nodes, ascending by distance, at most k.
    pub closest: Vec<Contact>,
    /// How many nodes were queried in total.
    pub queried: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
/// One in-flight iterative lookup.
///
/// Keeps up to `alpha` requests outstanding against the closest unqueried
/// candidates, folding each response's contact list back into the candidate
/// set, until no candidate can improve on the k closest responders.
pub struct LookupQuery {
    target: Id,
    kind: LookupKind,
    alpha: usize,
    k: usize,

    candidates: ClosestContacts,
    responders: ClosestContacts,
    queried: HashSet<Id>,
    /// Bootstrap addresses contacted before any node id was known.
    visited: HashSet<SocketAddr>,
    inflight: Vec<u64>,

    value: Option<ValueTuple>,
    started_at: Instant,
    timeout: Duration,
    senders: Vec<flume::Sender<LookupResult>>,
    done: bool,
}

impl LookupQuery {
    pub fn new(target: Id, kind: LookupKind, alpha: usize, k: usize, timeout: Duration) -> Self {
        LookupQuery {
            target,
            kind,
            alpha,
            k,
            candidates: ClosestContacts::new(target),
            responders: ClosestContacts::new(target),
            queried: HashSet::new(),
            visited: HashSet::new(),
            inflight: Vec::new(),
            value: None,
            started_at: Instant::now(),
            timeout,
            senders: Vec::new(),
            done: false,
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn contains_request(&self, transaction_id: u64) -> bool {
        self.inflight.contains(&transaction_id)
    }

    // === Public Methods ===

    /// Register a receiver for the result.
    pub fn add_sender(&mut self, sender: flume::Sender<LookupResult>) {
        self.senders.push(sender);
    }

    /// Offer a contact as a lookup candidate.
    pub fn add_candidate(&mut self, contact: Contact) {
        if !self.queried.contains(contact.id()) {
            self.candidates.add(contact);
        }
    }

    /// Query a bootstrap address whose node id is not known yet.
    pub fn visit_address(&mut self, dispatcher: &mut Dispatcher, address: SocketAddr) {
        if self.visited.contains(&address) {
            return;
        }

        match dispatcher.request(None, address, self.request(), None) {
            Ok(transaction_id) => {
                self.visited.insert(address);
                self.inflight.push(transaction_id);
            }
            Err(error) => debug!(?error, ?address, "Failed to visit bootstrap address"),
        }
    }

    /// Advance the lookup: enforce the deadline, keep `alpha` requests in
    /// flight, finish when no useful candidate remains.
    pub fn tick(&mut self, dispatcher: &mut Dispatcher) {
        if self.done {
            return;
        }

        if self.started_at.elapsed() >= self.timeout {
            self.finish(LookupOutcome::Timeout);
            return;
        }

        while self.inflight.len() < self.alpha {
            let Some(next) = self.next_candidate() else {
                break;
            };

            trace!(target = ?self.target, to = ?next.id(), "Visiting candidate");

            match dispatcher.request(Some(*next.id()), next.address(), self.request(), None) {
                Ok(transaction_id) => {
                    self.queried.insert(*next.id());
                    self.inflight.push(transaction_id);
                }
                Err(error) => {
                    debug!(?error, to = ?next.id(), "Failed to query candidate");
                    self.queried.insert(*next.id());
                }
            }
        }

        if self.inflight.is_empty() {
            let outcome = match self.value {
                Some(_) => LookupOutcome::Success,
                None => LookupOutcome::Exhausted,
            };
            self.finish(outcome);
        }
    }

    /// Fold a response into the lookup.
    pub fn on_response(
        &mut self,
        transaction_id: u64,
        responder: Contact,
        contacts: Vec<Contact>,
        value: Option<ValueTuple>,
    ) {
        if !self.take_inflight(transaction_id) {
            return;
        }

        self.queried.insert(*responder.id());
        self.responders.add(responder);

        for contact in contacts {
            self.add_candidate(contact);
        }

        if let Some(value) = value {
            if self.kind == LookupKind::Value {
                self.value = Some(value);
                self.finish(LookupOutcome::Success);
            }
        }
    }

    /// Drop a timed out request. Returns `false` if it was not ours.
    pub fn on_timeout(&mut self, transaction_id: u64) -> bool {
        self.take_inflight(transaction_id)
    }

    // === Private Methods ===

    fn request(&self) -> RequestSpecific {
        match self.kind {
            LookupKind::Node => RequestSpecific::FindNode {
                target: self.target,
            },
            LookupKind::Value => RequestSpecific::FindValue { key: self.target },
        }
    }

    /// The closest unqueried candidate that could still improve the result.
    fn next_candidate(&self) -> Option<Contact> {
        let kth = self.responders.distance_at(self.k);
        let saturated = self.responders.len() >= self.k;

        self.candidates
            .contacts()
            .iter()
            .find(|contact| {
                !self.queried.contains(contact.id())
                    && (!saturated || contact.id().xor(&self.target) < kth)
            })
            .cloned()
    }

    fn take_inflight(&mut self, transaction_id: u64) -> bool {
        match self.inflight.iter().position(|id| *id == transaction_id) {
            Some(index) => {
                self.inflight.swap_remove(index);
                true
            }
            None => false,
        }
    }

    fn finish(&mut self, outcome: LookupOutcome) {
        self.done = true;

        let result = LookupResult {
            target: self.target,
            outcome,
            value: self.value.clone(),
            closest: self.responders.take(self.k),
            queried: self.queried.len(),
            elapsed: self.started_at.elapsed(),
        };

        debug!(
            target = ?self.target,
            ?outcome,
            queried = result.queried,
            closest = result.closest.len(),
            "Lookup finished"
        );

        for sender in self.senders.drain(..) {
            let _ = sender.send(result.clone());
        }
    }
}
