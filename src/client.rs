//! Client-side request tracker.
//!
//! The tracker owns the set of in-flight requests: it assigns correlation
//! ids, transmits envelopes to the broker, correlates inbound replies,
//! retransmits expired requests with doubling timeouts, and reports retry
//! exhaustion. All of its maps live inside a [`Strand`], so requests may be
//! submitted from arbitrary concurrent callers while every state mutation
//! executes serialized and in order.
//!
//! The embedding application drives the tracker by calling
//! [`RequestTracker::update`] on a regular cadence; nothing here schedules
//! itself and no call blocks the caller.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use minstant::Instant;

use crate::dispatch::DispatchTable;
use crate::message::{Envelope, Message, RequestId, WorkerId};
use crate::net::{BrokerSocket, Endpoint};
use crate::strand::Strand;
use crate::trace::{debug, error, warn};

/// Timeout assigned to a freshly submitted request; doubles on each resend.
const TIMEOUT_INIT: Duration = Duration::from_secs(30);
/// Resend budget for each request.
const RETRIES_INIT: u32 = 3;

/// Configuration for a [`RequestTracker`].
pub struct TrackerConfig {
    /// Broker endpoint requests are transmitted to.
    pub broker: Endpoint,
    /// Timeout before the first resend. Doubles on every subsequent resend.
    pub initial_timeout: Duration,
    /// How many resends a request gets before it is reported as timed out.
    pub retries: u32,
}

impl TrackerConfig {
    /// Default tracker configuration aimed at `broker`.
    #[must_use]
    pub fn new(broker: Endpoint) -> Self {
        Self {
            broker,
            initial_timeout: TIMEOUT_INIT,
            retries: RETRIES_INIT,
        }
    }
}

/// Outcome delivered to a request's response handler, exactly once.
#[derive(Debug)]
pub enum Response<'a> {
    /// A correlated reply arrived.
    Reply {
        /// Opaque reply payload.
        payload: &'a [u8],
        /// Identity of the worker that answered.
        origin: &'a WorkerId,
    },
    /// The request's full retry budget elapsed with no reply.
    TimedOut,
}

/// Handler invoked exactly once with the request's outcome.
pub type ResponseHandler = Box<dyn FnOnce(Response<'_>) + Send>;

/// Handler invoked for every inbound envelope whose command matches,
/// regardless of correlation id.
pub type FilterHandler = Box<dyn FnMut(&[u8], &WorkerId) + Send>;

/// A request awaiting its reply.
struct InFlight {
    envelope: Envelope,
    sent_at: Instant,
    timeout: Duration,
    retries_left: u32,
}

/// Tracker state owned by the strand.
///
/// Invariant: `handlers` and `retry_queue` always hold exactly the same key
/// set — entries are inserted together and removed together.
struct TrackerState {
    socket: BrokerSocket,
    next_id: u32,
    handlers: HashMap<RequestId, ResponseHandler>,
    retry_queue: HashMap<RequestId, InFlight>,
    filters: DispatchTable<FilterHandler>,
    initial_timeout: Duration,
    retries: u32,
}

impl TrackerState {
    fn new(socket: BrokerSocket, config: &TrackerConfig) -> Self {
        Self {
            socket,
            next_id: 0,
            handlers: HashMap::new(),
            retry_queue: HashMap::new(),
            filters: DispatchTable::new(),
            initial_timeout: config.initial_timeout,
            retries: config.retries,
        }
    }

    /// Allocates a correlation id unique among current in-flight requests.
    fn allocate_id(&mut self) -> RequestId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            let id = RequestId::from(self.next_id);
            if !self.handlers.contains_key(&id) {
                return id;
            }
        }
    }

    fn transmit(&mut self, envelope: &Envelope) {
        if let Err(e) = self.socket.send(&Message::Envelope(envelope.clone())) {
            error!(id = %envelope.id, command = %envelope.command, error = %e, "transmit failed");
        }
    }

    /// Registers and transmits a new request.
    fn insert_request(&mut self, envelope: Envelope, handler: ResponseHandler) {
        debug!(id = %envelope.id, command = %envelope.command, dest = %envelope.origin, "request");
        self.transmit(&envelope);
        self.handlers.insert(envelope.id, handler);
        self.retry_queue.insert(
            envelope.id,
            InFlight {
                sent_at: Instant::now(),
                timeout: self.initial_timeout,
                retries_left: self.retries,
                envelope,
            },
        );
        debug_assert_eq!(self.handlers.len(), self.retry_queue.len());
    }

    /// Classifies and dispatches one inbound message.
    ///
    /// Filters take precedence: a command match suppresses reply correlation
    /// entirely, even for envelopes that also carry a tracked id. An
    /// envelope matching neither is a stray/duplicate/late reply and is
    /// dropped with no side effect.
    fn process(&mut self, msg: Message) {
        let envelope = match msg {
            Message::Signal(signal) => {
                debug!(%signal, "ignoring inbound signal");
                return;
            }
            Message::Envelope(envelope) => envelope,
        };
        if self.process_filters(&envelope) {
            return;
        }
        if self.process_as_reply(&envelope) {
            return;
        }
        debug!(id = %envelope.id, command = %envelope.command, "unknown envelope dropped");
    }

    fn process_filters(&mut self, envelope: &Envelope) -> bool {
        let Some(filter) = self.filters.get_mut(&envelope.command) else {
            return false;
        };
        filter(&envelope.payload, &envelope.origin);
        true
    }

    fn process_as_reply(&mut self, envelope: &Envelope) -> bool {
        // Unknown id: not in our map.
        let Some(handler) = self.handlers.remove(&envelope.id) else {
            return false;
        };
        handler(Response::Reply {
            payload: &envelope.payload,
            origin: &envelope.origin,
        });
        let removed = self.retry_queue.remove(&envelope.id);
        debug_assert!(removed.is_some());
        true
    }

    /// Resends every expired request, doubling its timeout and burning one
    /// retry. A request whose budget is exhausted is removed from both maps
    /// and its handler is invoked with [`Response::TimedOut`].
    fn resend_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .retry_queue
            .iter()
            .filter(|(_, request)| now.duration_since(request.sent_at) >= request.timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let Some(request) = self.retry_queue.get_mut(&id) else {
                continue;
            };
            if request.retries_left == 0 {
                warn!(id = %id, command = %request.envelope.command, "retries exhausted");
                self.retry_queue.remove(&id);
                if let Some(handler) = self.handlers.remove(&id) {
                    handler(Response::TimedOut);
                }
                continue;
            }
            request.timeout *= 2;
            request.retries_left -= 1;
            request.sent_at = now;
            let envelope = request.envelope.clone();
            debug!(id = %id, command = %envelope.command, "resending expired request");
            self.transmit(&envelope);
        }
        debug_assert_eq!(self.handlers.len(), self.retry_queue.len());
    }
}

/// Tracks requests issued to an addressable pool of workers via a broker.
pub struct RequestTracker {
    strand: Strand<TrackerState>,
    local_addr: Endpoint,
}

impl RequestTracker {
    /// Opens the broker socket and spawns the tracker's execution domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub fn connect(config: TrackerConfig) -> io::Result<Self> {
        let socket = BrokerSocket::connect(config.broker)?;
        let local_addr = socket.local_addr()?;
        let state = TrackerState::new(socket, &config);
        Ok(Self {
            strand: Strand::spawn("courier-tracker", state),
            local_addr,
        })
    }

    /// Submits a request addressed to any worker.
    ///
    /// Completion or failure is signaled only through `handler`, which is
    /// invoked exactly once with either the reply or a timeout.
    pub fn request<F>(&self, command: impl Into<String>, payload: Vec<u8>, handler: F)
    where
        F: FnOnce(Response<'_>) + Send + 'static,
    {
        self.request_to(command, payload, handler, WorkerId::any());
    }

    /// Submits a request addressed to a specific worker.
    pub fn request_to<F>(
        &self,
        command: impl Into<String>,
        payload: Vec<u8>,
        handler: F,
        dest: WorkerId,
    ) where
        F: FnOnce(Response<'_>) + Send + 'static,
    {
        let command = command.into();
        self.strand.submit(move |state| {
            let id = state.allocate_id();
            let envelope = Envelope::request(dest, command, id, payload);
            state.insert_request(envelope, Box::new(handler));
        });
    }

    /// Drives the tracker: drains at most one inbound envelope, then sweeps
    /// expirations. Must be called on a regular cadence; never blocks.
    pub fn update(&self) {
        self.strand.submit(|state| {
            match state.socket.poll_recv(Duration::ZERO) {
                Ok(Some(msg)) => state.process(msg),
                Ok(None) => {}
                Err(e) => error!(error = %e, "poll failed"),
            }
            state.resend_expired();
        });
    }

    /// Registers a filter: invoked for every inbound envelope whose command
    /// matches, bypassing reply correlation.
    pub fn append_filter<F>(&self, command: impl Into<String>, filter: F)
    where
        F: FnMut(&[u8], &WorkerId) + Send + 'static,
    {
        let command = command.into();
        self.strand.submit(move |state| {
            if state.filters.attach(command, Box::new(filter)).is_some() {
                debug!("filter replaced");
            }
        });
    }

    /// Local address of the tracker's socket.
    #[must_use]
    pub const fn local_addr(&self) -> Endpoint {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn test_state(initial_timeout: Duration, retries: u32) -> TrackerState {
        let config = TrackerConfig {
            broker: Endpoint::localhost(1),
            initial_timeout,
            retries,
        };
        let socket = BrokerSocket::connect(config.broker).unwrap();
        TrackerState::new(socket, &config)
    }

    fn counting_handler(calls: &Arc<AtomicUsize>) -> ResponseHandler {
        let calls = Arc::clone(calls);
        Box::new(move |_| {
            calls.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn inbound(command: &str, id: u32, payload: &[u8]) -> Message {
        Message::Envelope(Envelope {
            origin: WorkerId::from("worker"),
            command: command.into(),
            id: RequestId::from(id),
            payload: payload.to_vec(),
        })
    }

    #[test]
    fn reply_invokes_handler_exactly_once() {
        let mut state = test_state(Duration::from_secs(30), 3);
        let calls = Arc::new(AtomicUsize::new(0));

        let id = state.allocate_id();
        let envelope = Envelope::request(WorkerId::any(), "echo", id, vec![1, 2]);
        state.insert_request(envelope, counting_handler(&calls));

        state.process(inbound("echo", id.as_u32(), b"pong"));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(state.handlers.is_empty());
        assert!(state.retry_queue.is_empty());

        // A duplicate/late reply with the same id has no further effect.
        state.process(inbound("echo", id.as_u32(), b"pong"));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reply_payload_and_origin_reach_handler() {
        let mut state = test_state(Duration::from_secs(30), 3);
        let seen = Arc::new(Mutex::new(None));

        let id = state.allocate_id();
        let envelope = Envelope::request(WorkerId::any(), "echo", id, Vec::new());
        let seen_in = Arc::clone(&seen);
        state.insert_request(
            envelope,
            Box::new(move |response| {
                if let Response::Reply { payload, origin } = response {
                    *seen_in.lock().unwrap() = Some((payload.to_vec(), origin.clone()));
                }
            }),
        );

        state.process(inbound("echo", id.as_u32(), &[0xaa]));
        let seen = seen.lock().unwrap();
        let (payload, origin) = seen.as_ref().unwrap();
        assert_eq!(payload, &[0xaa]);
        assert_eq!(origin, &WorkerId::from("worker"));
    }

    #[test]
    fn filter_takes_precedence_over_reply_correlation() {
        let mut state = test_state(Duration::from_secs(30), 3);
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let filter_calls = Arc::new(AtomicUsize::new(0));

        // Contrived collision: an in-flight request whose command also has
        // a registered filter.
        let id = state.allocate_id();
        let envelope = Envelope::request(WorkerId::any(), "block.update", id, Vec::new());
        state.insert_request(envelope, counting_handler(&handler_calls));
        let filter_calls_in = Arc::clone(&filter_calls);
        state.filters.attach(
            "block.update",
            Box::new(move |_: &[u8], _: &WorkerId| {
                filter_calls_in.fetch_add(1, Ordering::Relaxed);
            }) as FilterHandler,
        );

        state.process(inbound("block.update", id.as_u32(), b"push"));

        assert_eq!(filter_calls.load(Ordering::Relaxed), 1);
        assert_eq!(handler_calls.load(Ordering::Relaxed), 0);
        // The in-flight entry is untouched.
        assert_eq!(state.handlers.len(), 1);
        assert_eq!(state.retry_queue.len(), 1);
    }

    #[test]
    fn filter_sees_unsolicited_pushes() {
        let mut state = test_state(Duration::from_secs(30), 3);
        let filter_calls = Arc::new(AtomicUsize::new(0));
        let filter_calls_in = Arc::clone(&filter_calls);
        state.filters.attach(
            "heartbeat.news",
            Box::new(move |_: &[u8], _: &WorkerId| {
                filter_calls_in.fetch_add(1, Ordering::Relaxed);
            }) as FilterHandler,
        );

        // No in-flight request anywhere; id is arbitrary.
        state.process(inbound("heartbeat.news", 999, b""));
        state.process(inbound("heartbeat.news", 1000, b""));
        assert_eq!(filter_calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn unknown_id_and_signal_have_no_side_effects() {
        let mut state = test_state(Duration::from_secs(30), 3);
        state.process(inbound("echo", 77, b"stray"));
        state.process(Message::Signal(crate::message::Signal::Heartbeat));
        assert!(state.handlers.is_empty());
        assert!(state.retry_queue.is_empty());
    }

    #[test]
    fn resend_doubles_timeout_and_burns_retry() {
        let mut state = test_state(Duration::from_millis(30), 3);
        let calls = Arc::new(AtomicUsize::new(0));

        let id = state.allocate_id();
        let envelope = Envelope::request(WorkerId::any(), "slow", id, Vec::new());
        state.insert_request(envelope, counting_handler(&calls));

        // Not yet expired: nothing changes.
        state.resend_expired();
        assert_eq!(state.retry_queue[&id].retries_left, 3);

        // Simulate elapsed time by back-dating the send timestamp.
        state.retry_queue.get_mut(&id).unwrap().sent_at =
            Instant::now() - Duration::from_millis(31);
        state.resend_expired();

        let request = &state.retry_queue[&id];
        assert_eq!(request.timeout, Duration::from_millis(60));
        assert_eq!(request.retries_left, 2);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn exhaustion_delivers_timeout_and_clears_state() {
        let mut state = test_state(Duration::from_millis(10), 2);
        let outcome = Arc::new(Mutex::new(Vec::new()));

        let id = state.allocate_id();
        let envelope = Envelope::request(WorkerId::any(), "lost", id, Vec::new());
        let outcome_in = Arc::clone(&outcome);
        state.insert_request(
            envelope,
            Box::new(move |response| {
                outcome_in
                    .lock()
                    .unwrap()
                    .push(matches!(response, Response::TimedOut));
            }),
        );

        // Expire through the full budget: two resends, then exhaustion.
        for expected_left in [1u32, 0] {
            state.retry_queue.get_mut(&id).unwrap().sent_at =
                Instant::now() - Duration::from_secs(1);
            state.resend_expired();
            assert_eq!(state.retry_queue[&id].retries_left, expected_left);
            assert!(outcome.lock().unwrap().is_empty());
        }

        state.retry_queue.get_mut(&id).unwrap().sent_at = Instant::now() - Duration::from_secs(1);
        state.resend_expired();

        assert_eq!(*outcome.lock().unwrap(), vec![true]);
        assert!(state.handlers.is_empty());
        assert!(state.retry_queue.is_empty());

        // A late reply after exhaustion is a no-op.
        state.process(inbound("lost", id.as_u32(), b"late"));
        assert_eq!(outcome.lock().unwrap().len(), 1);
    }

    #[test]
    fn allocate_id_skips_in_flight_ids() {
        let mut state = test_state(Duration::from_secs(30), 3);
        let first = state.allocate_id();
        let envelope = Envelope::request(WorkerId::any(), "echo", first, Vec::new());
        state.insert_request(envelope, Box::new(|_| {}));

        // Force the counter to collide with the in-flight id.
        state.next_id = first.as_u32().wrapping_sub(1);
        let second = state.allocate_id();
        assert_ne!(second, first);
    }
}
