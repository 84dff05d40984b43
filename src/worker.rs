//! Worker-side request engine with liveness tracking.
//!
//! A [`RequestWorker`] owns its broker socket, announces readiness,
//! dispatches inbound requests to a command registry, emits periodic
//! heartbeats, and detects broker silence — reconnecting with exponential
//! backoff when the broker goes quiet.
//!
//! State machine:
//!
//! ```text
//! Disconnected ──start()──> Connected (READY sent)
//!      ▲                        │
//!      │   silence threshold    │ requests / heartbeats
//!      └──── exceeded ◄─────────┘
//!        (socket replaced, READY re-sent, threshold doubled ≤ ceiling)
//! ```
//!
//! The embedding application calls [`RequestWorker::update`] in a loop;
//! each call performs one bounded poll and all due bookkeeping.

use std::collections::HashMap;
use std::io;
use std::net::AddrParseError;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::dispatch::DispatchTable;
use crate::message::{Envelope, Message, Signal, WorkerId};
use crate::net::{BrokerSocket, Endpoint};
use crate::trace::{debug, error, info, warn};

/// Cadence of outbound HEARTBEAT signals.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
/// Initial broker-silence threshold; doubles per outage up to the ceiling.
const SILENCE_FLOOR: Duration = Duration::from_secs(4);
/// Upper bound on the silence threshold.
const SILENCE_CEILING: Duration = Duration::from_secs(32);
/// Bound on the per-update inbound poll.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Configuration for a [`RequestWorker`].
pub struct WorkerConfig {
    /// Broker endpoint to connect to.
    pub service: Endpoint,
    /// Worker identity name; empty lets the transport assign one.
    pub name: String,
    /// How often a HEARTBEAT signal is emitted while connected.
    pub heartbeat_interval: Duration,
    /// Silence threshold after a fresh connect or any received traffic.
    pub silence_floor: Duration,
    /// Cap on the doubling silence threshold.
    pub silence_ceiling: Duration,
    /// Bound on the inbound poll performed by each `update()` call.
    pub poll_timeout: Duration,
}

impl WorkerConfig {
    /// Default worker configuration aimed at `service`.
    #[must_use]
    pub fn new(service: Endpoint) -> Self {
        Self {
            service,
            name: String::new(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            silence_floor: SILENCE_FLOOR,
            silence_ceiling: SILENCE_CEILING,
            poll_timeout: POLL_TIMEOUT,
        }
    }

    /// Builds a configuration from the `service`/`name` key/value surface.
    ///
    /// # Errors
    ///
    /// Returns an error if `service` is missing or not a `host:port`
    /// endpoint.
    pub fn from_map(config: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let service = config
            .get("service")
            .ok_or(ConfigError::MissingKey("service"))?
            .parse::<Endpoint>()?;
        let mut built = Self::new(service);
        if let Some(name) = config.get("name") {
            built.name = name.clone();
        }
        Ok(built)
    }
}

/// Errors reading the worker configuration surface.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key is absent.
    #[error("missing config key: {0}")]
    MissingKey(&'static str),
    /// The `service` value is not a valid endpoint.
    #[error("invalid service endpoint: {0}")]
    BadService(#[from] AddrParseError),
}

/// Errors starting a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The broker socket could not be opened.
    #[error("failed to open broker socket: {0}")]
    Socket(#[from] io::Error),
}

/// Handler for one inbound request command.
///
/// The handler is fully responsible for constructing and sending its own
/// reply envelope (echoing the request's id and origin); the engine never
/// auto-replies.
pub type CommandHandler = Box<dyn FnMut(&Envelope, &mut BrokerSocket) + Send>;

/// Worker-side protocol engine: command dispatch plus liveness.
pub struct RequestWorker {
    socket: BrokerSocket,
    identity: WorkerId,
    handlers: DispatchTable<CommandHandler>,
    last_activity: Instant,
    heartbeat_at: Instant,
    silence_threshold: Duration,
    config: WorkerConfig,
}

impl RequestWorker {
    /// Opens the broker connection, announces `READY`, and initializes the
    /// liveness clocks. Socket creation is eager.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker socket cannot be opened.
    pub fn start(config: WorkerConfig) -> Result<Self, WorkerError> {
        let identity = if config.name.is_empty() {
            WorkerId::generate()
        } else {
            WorkerId::from(config.name.as_str())
        };
        let mut socket = create_socket(config.service)?;
        announce(&mut socket);

        let now = Instant::now();
        Ok(Self {
            socket,
            identity,
            handlers: DispatchTable::new(),
            last_activity: now,
            heartbeat_at: now + config.heartbeat_interval,
            silence_threshold: config.silence_floor,
            config,
        })
    }

    /// Registers a command handler; re-registering the same command
    /// replaces the prior handler.
    pub fn attach<F>(&mut self, command: impl Into<String>, handler: F)
    where
        F: FnMut(&Envelope, &mut BrokerSocket) + Send + 'static,
    {
        self.handlers.attach(command, Box::new(handler));
    }

    /// This worker's identity.
    #[must_use]
    pub const fn identity(&self) -> &WorkerId {
        &self.identity
    }

    /// Local address of the worker's current socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.socket.local_addr()
    }

    /// Drives the worker: one bounded poll, then liveness bookkeeping.
    ///
    /// Per call, in order: drain at most one inbound message and dispatch
    /// it; if nothing arrived and the broker has been silent past the
    /// threshold, replace the socket and re-announce; independently, send a
    /// HEARTBEAT whenever one is due.
    pub fn update(&mut self) {
        match self.socket.poll_recv(self.config.poll_timeout) {
            Ok(Some(Message::Envelope(request))) => {
                self.last_activity = Instant::now();
                self.silence_threshold = self.config.silence_floor;
                self.dispatch(&request);
            }
            Ok(Some(Message::Signal(Signal::Heartbeat))) => {
                debug!("received heartbeat");
                self.last_activity = Instant::now();
                self.silence_threshold = self.config.silence_floor;
            }
            Ok(Some(Message::Signal(other))) => {
                warn!(signal = %other, "unexpected signal from broker");
                self.silence_threshold = self.config.silence_floor;
            }
            Ok(None) => {
                if Instant::now().duration_since(self.last_activity) > self.silence_threshold {
                    self.reconnect();
                }
            }
            Err(e) => error!(error = %e, "poll failed"),
        }

        // Send a heartbeat to the broker if it's time.
        let now = Instant::now();
        if now >= self.heartbeat_at {
            self.heartbeat_at = now + self.config.heartbeat_interval;
            debug!("sending heartbeat");
            if let Err(e) = self.socket.send(&Message::Signal(Signal::Heartbeat)) {
                warn!(error = %e, "heartbeat send failed");
            }
        }
    }

    fn dispatch(&mut self, request: &Envelope) {
        match self.handlers.get_mut(&request.command) {
            Some(handler) => {
                debug!(command = %request.command, origin = %request.origin, "dispatching request");
                handler(request, &mut self.socket);
            }
            None => {
                warn!(command = %request.command, origin = %request.origin, "unhandled request");
            }
        }
    }

    /// Declares an outage: doubles the silence threshold up to the ceiling
    /// and replaces the socket wholesale, re-announcing readiness.
    fn reconnect(&mut self) {
        warn!(
            threshold_ms = self.silence_threshold.as_millis() as u64,
            "broker silent, reconnecting"
        );
        if self.silence_threshold < self.config.silence_ceiling {
            self.silence_threshold *= 2;
        }
        match create_socket(self.config.service) {
            Ok(socket) => {
                // The old socket is dropped here; its in-flight I/O is
                // abandoned with it.
                self.socket = socket;
                announce(&mut self.socket);
            }
            Err(e) => error!(error = %e, "reconnect failed, will retry after next silence"),
        }
        self.last_activity = Instant::now();
    }
}

fn create_socket(service: Endpoint) -> Result<BrokerSocket, WorkerError> {
    debug!(%service, "connecting");
    Ok(BrokerSocket::connect(service)?)
}

/// Tells the broker we're ready for work.
fn announce(socket: &mut BrokerSocket) {
    info!("worker ready");
    if let Err(e) = socket.send(&Message::Signal(Signal::Ready)) {
        warn!(error = %e, "READY send failed");
    }
}
