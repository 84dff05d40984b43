//! Client/worker RPC over an asynchronous message-queue transport.
//!
//! Clients issue correlated requests to an addressable pool of workers
//! through a broker and receive asynchronous replies; workers advertise
//! liveness via heartbeats and recover from broker silence by reconnecting
//! with exponential backoff.
//!
//! # Architecture
//!
//! ```text
//! Client                     Broker                      Worker
//!   │                          │                           │
//!   │                          │   READY (on connect)      │
//!   │                          │<──────────────────────────│
//!   │  [dest][cmd][id][data]   │                           │
//!   │─────────────────────────>│   [origin][cmd][id][data] │
//!   │                          │──────────────────────────>│
//!   │                          │                           │ dispatch
//!   │  [origin][cmd][id][data] │   [origin][cmd][id][data] │
//!   │<─────────────────────────│<──────────────────────────│
//!   │  correlate by id         │                           │
//!   │                          │   HEARTBEAT (1s cadence)  │
//!   │                          │<─────────────────────────>│
//! ```
//!
//! The broker is not part of this crate: it is assumed to route envelopes
//! between peers, preserve frame structure, and deliver `READY`/`HEARTBEAT`
//! signal frames faithfully. Delivery is at-least-once; clients deduplicate
//! replies by correlation id.
//!
//! - [`message`]: wire framing — envelopes, signals, identities.
//! - [`net`]: endpoints and the broker-facing datagram socket.
//! - [`dispatch`]: command-name to handler tables.
//! - [`strand`]: serialized execution of tasks under concurrent submission.
//! - [`client`]: the request tracker — send, correlate, retry with backoff.
//! - [`worker`]: the heartbeat engine — dispatch, liveness, reconnect.

pub mod client;
pub mod dispatch;
pub mod message;
pub mod net;
pub mod strand;
pub mod worker;

pub(crate) mod trace;

pub use trace::init_tracing;

pub use client::{RequestTracker, Response, TrackerConfig};
pub use message::{Envelope, Message, RequestId, Signal, WorkerId};
pub use net::{BrokerSocket, Endpoint};
pub use worker::{RequestWorker, WorkerConfig};
