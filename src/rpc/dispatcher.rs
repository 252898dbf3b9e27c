//! Sends requests, correlates responses and expires the unanswered.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::common::{Id, Message, RequestSpecific, ResponseSpecific, SenderInfo};
use crate::transport::Transport;
use crate::Result;

#[derive(Debug, Clone)]
/// A request sent to a peer whose response has not arrived yet.
pub struct PendingRequest {
    pub transaction_id: u64,
    /// The identifier the response's sender must carry; `None` for requests
    /// to bootstrap addresses whose node id is not known yet.
    pub to: Option<Id>,
    pub address: SocketAddr,
    pub sent_at: Instant,
    pub timeout: Duration,
}

impl PendingRequest {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.sent_at) >= self.timeout
    }
}

#[derive(Debug, Default)]
/// Pending requests sorted by transaction id.
///
/// Transaction ids are issued from a wrapping counter, so inserts land at or
/// near the end and lookups binary search.
struct PendingRequests {
    requests: Vec<PendingRequest>,
}

impl PendingRequests {
    fn insert(&mut self, request: PendingRequest) {
        match self.position(request.transaction_id) {
            // A duplicate id would misroute responses; the counter makes this
            // unreachable short of a wraparound collision.
            Ok(_) => {
                debug_assert!(false, "duplicate transaction id");
                error!(
                    transaction_id = request.transaction_id,
                    "Refusing to re-register an in-flight transaction id"
                );
            }
            Err(index) => self.requests.insert(index, request),
        }
    }

    fn get(&self, transaction_id: u64) -> Option<&PendingRequest> {
        self.position(transaction_id)
            .ok()
            .map(|index| &self.requests[index])
    }

    fn take(&mut self, transaction_id: u64) -> Option<PendingRequest> {
        self.position(transaction_id)
            .ok()
            .map(|index| self.requests.remove(index))
    }

    fn position(&self, transaction_id: u64) -> std::result::Result<usize, usize> {
        self.requests
            .binary_search_by(|request| request.transaction_id.cmp(&transaction_id))
    }

    /// Remove and return every request past its deadline.
    fn purge_expired(&mut self) -> Vec<PendingRequest> {
        let now = Instant::now();
        let mut expired = Vec::new();

        self.requests.retain(|request| {
            if request.expired(now) {
                expired.push(request.clone());
                false
            } else {
                true
            }
        });

        expired
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.requests.len()
    }
}

#[derive(Debug)]
/// How an incoming response relates to the pending request table.
pub enum ResponseMatch {
    /// The response answers a pending request; the request is disarmed.
    Matched {
        request: PendingRequest,
        round_trip_time: Duration,
    },
    /// A response for a known transaction id but from the wrong node; the
    /// request stays armed for the real response.
    MismatchedSender,
    /// No pending request; either expired already or never ours.
    Late,
}

#[derive(Debug)]
/// The request/response correlation layer over a [Transport].
///
/// Owned and polled by a single thread; issues transaction ids, tracks
/// requests until their response or deadline, and refuses responses whose
/// sender does not match the queried node.
pub struct Dispatcher {
    transport: Box<dyn Transport>,
    pending: PendingRequests,
    /// Random high half of every transaction id, fixed per instance.
    base: u32,
    next_seq: u32,
    sender: SenderInfo,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        transport: Box<dyn Transport>,
        sender: SenderInfo,
        default_timeout: Duration,
    ) -> Dispatcher {
        Dispatcher {
            transport,
            pending: PendingRequests::default(),
            base: rand::random(),
            next_seq: 0,
            sender,
            default_timeout,
        }
    }

    // === Getters ===

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn sender(&self) -> &SenderInfo {
        &self.sender
    }

    // === Public Methods ===

    /// Send a request and arm its timeout; returns the transaction id.
    pub fn request(
        &mut self,
        to: Option<Id>,
        address: SocketAddr,
        request: RequestSpecific,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        let transaction_id = self.next_transaction_id();
        let message = Message::request(transaction_id, self.sender.clone(), request);

        trace!(?message, ?address, "Sending request");

        self.transport.send(address, &message.to_bytes()?)?;

        self.pending.insert(PendingRequest {
            transaction_id,
            to,
            address,
            sent_at: Instant::now(),
            timeout: timeout.unwrap_or(self.default_timeout),
        });

        Ok(transaction_id)
    }

    /// Send a response reusing the request's transaction id.
    pub fn respond(
        &mut self,
        address: SocketAddr,
        transaction_id: u64,
        response: ResponseSpecific,
    ) -> Result<()> {
        let message = Message::response(transaction_id, self.sender.clone(), response);

        trace!(?message, ?address, "Sending response");

        self.transport.send(address, &message.to_bytes()?)?;

        Ok(())
    }

    /// Receive and decode the next incoming message, if any.
    pub fn recv(&mut self) -> Option<(Message, SocketAddr)> {
        let (bytes, from) = self.transport.recv()?;

        if from.port() == 0 {
            trace!(?from, "Ignored message from port 0");
            return None;
        }

        match Message::from_bytes(&bytes) {
            Ok(message) => Some((message, from)),
            Err(error) => {
                debug!(?error, ?from, "Received invalid message");
                None
            }
        }
    }

    /// Correlate a response with its pending request.
    pub fn match_response(&mut self, message: &Message, from: SocketAddr) -> ResponseMatch {
        let Some(request) = self.pending.get(message.transaction_id) else {
            trace!(
                transaction_id = message.transaction_id,
                ?from,
                "Response without a pending request"
            );
            return ResponseMatch::Late;
        };

        let wrong_sender = match request.to {
            Some(expected) => expected != message.sender.id,
            None => false,
        };

        if wrong_sender || request.address != from {
            debug!(
                expected = ?request.to,
                got = ?message.sender.id,
                ?from,
                "Response from an unexpected sender"
            );
            return ResponseMatch::MismatchedSender;
        }

        match self.pending.take(message.transaction_id) {
            Some(request) => ResponseMatch::Matched {
                round_trip_time: request.sent_at.elapsed(),
                request,
            },
            None => ResponseMatch::Late,
        }
    }

    /// Expire requests past their deadline, returning them for failure
    /// accounting.
    pub fn purge_expired(&mut self) -> Vec<PendingRequest> {
        self.pending.purge_expired()
    }

    // === Private Methods ===

    fn next_transaction_id(&mut self) -> u64 {
        let transaction_id = ((self.base as u64) << 32) | (self.next_seq as u64);
        self.next_seq = self.next_seq.wrapping_add(1);

        transaction_id
    }
}
