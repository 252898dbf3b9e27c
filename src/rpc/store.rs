//! Replicates a value to the closest nodes found by a lookup.

use std::time::{Duration, Instant};
use std::vec::IntoIter;

use tracing::{debug, trace};

use crate::common::{Contact, Id, RequestSpecific, ValueInfo, ValueTuple};
use crate::rpc::dispatcher::Dispatcher;
use crate::storage::Condition;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Store operation failure.
pub enum StoreError {
    /// The preceding lookup produced no nodes to store at.
    #[error("Lookup found no nodes to store at")]
    NoClosestNodes,

    /// Every attempted node timed out or refused the value.
    #[error("No node acknowledged the store")]
    NoAcknowledgment,
}

#[derive(Debug, Clone)]
/// Successful store: at least one node acknowledged the value.
pub struct StoreResult {
    pub target: Id,
    /// Nodes that acknowledged, paired with how long each took.
    pub stored_at: Vec<(Id, Duration)>,
    /// How many nodes were attempted in total.
    pub attempted: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
/// One in-flight store operation.
///
/// Walks the candidate list closest first with a fan-out of `k / 4`
/// requests, retrying further candidates as attempts time out, until at
/// least one acknowledgment arrives or at most `k` nodes were tried.
pub struct StoreQuery {
    target: Id,
    tuple: ValueTuple,
    candidates: IntoIter<Contact>,
    parallelism: usize,
    max_attempts: usize,

    attempted: usize,
    inflight: Vec<u64>,
    acks: Vec<(Id, Duration)>,

    started_at: Instant,
    request_timeout: Duration,
    timeout: Duration,
    senders: Vec<flume::Sender<Result<StoreResult, StoreError>>>,
    done: bool,
}

impl StoreQuery {
    /// `candidates` must be in ascending distance to the tuple's key, as
    /// produced by a node lookup.
    pub fn new(
        tuple: ValueTuple,
        candidates: Vec<Contact>,
        k: usize,
        request_timeout: Duration,
        timeout: Duration,
    ) -> Result<StoreQuery, StoreError> {
        if candidates.is_empty() {
            return Err(StoreError::NoClosestNodes);
        }

        Ok(StoreQuery {
            target: *tuple.key(),
            tuple,
            candidates: candidates.into_iter(),
            parallelism: (k / 4).max(1),
            max_attempts: k,
            attempted: 0,
            inflight: Vec::new(),
            acks: Vec::new(),
            started_at: Instant::now(),
            request_timeout,
            timeout,
            senders: Vec::new(),
            done: false,
        })
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

    pub fn add_sender(&mut self, sender: flume::Sender<Result<StoreResult, StoreError>>) {
        self.senders.push(sender);
    }

    /// Advance the store: fill the request window, settle once it drains or
    /// the overall deadline passes.
    pub fn tick(&mut self, dispatcher: &mut Dispatcher) {
        if self.done {
            return;
        }

        if self.started_at.elapsed() >= self.timeout {
            self.finish();
            return;
        }

        while self.inflight.len() < self.parallelism && self.attempted < self.max_attempts {
            let Some(next) = self.candidates.next() else {
                break;
            };

            trace!(target = ?self.target, to = ?next.id(), "Storing at candidate");

            let request = RequestSpecific::Store {
                value: ValueInfo::from_tuple(&self.tuple),
            };
            // Known-fast nodes get a shorter deadline so slow ones do not
            // hold the window.
            let timeout = next.adaptive_timeout(self.request_timeout);

            match dispatcher.request(Some(*next.id()), next.address(), request, Some(timeout)) {
                Ok(transaction_id) => {
                    self.attempted += 1;
                    self.inflight.push(transaction_id);
                }
                Err(error) => {
                    debug!(?error, to = ?next.id(), "Failed to send store request");
                    self.attempted += 1;
                }
            }
        }

        if self.inflight.is_empty() {
            self.finish();
        }
    }

    /// Record a store response.
    pub fn on_response(
        &mut self,
        transaction_id: u64,
        responder: &Contact,
        condition: Condition,
        round_trip_time: Duration,
    ) {
        if !self.take_inflight(transaction_id) {
            return;
        }

        if condition.is_success() {
            self.acks.push((*responder.id(), round_trip_time));
        } else {
            debug!(target = ?self.target, node = ?responder.id(), "Store refused");
        }
    }

    /// Drop a timed out request. Returns `false` if it was not ours.
    pub fn on_timeout(&mut self, transaction_id: u64) -> bool {
        self.take_inflight(transaction_id)
    }

    // === Private Methods ===

    fn take_inflight(&mut self, transaction_id: u64) -> bool {
        match self.inflight.iter().position(|id| *id == transaction_id) {
            Some(index) => {
                self.inflight.swap_remove(index);
                true
            }
            None => false,
        }
    }

    fn finish(&mut self) {
        self.done = true;

        let result = if self.acks.is_empty() {
            Err(StoreError::NoAcknowledgment)
        } else {
            Ok(StoreResult {
                target: self.target,
                stored_at: self.acks.clone(),
                attempted: self.attempted,
                elapsed: self.started_at.elapsed(),
            })
        };

        debug!(
            target = ?self.target,
            acks = self.acks.len(),
            attempted = self.attempted,
            "Store finished"
        );

        for sender in self.senders.drain(..) {
            let _ = sender.send(result.clone());
        }
    }
}
