//! QUIC interception core
//!
//! This crate implements the protocol core of a man-in-the-middle QUIC
//! proxy: it terminates inbound QUIC from a real client, opens a second,
//! independent QUIC connection to the real server, and relays decrypted
//! stream and datagram payloads between the two while exposing every
//! handshake and data event to addon hooks. It does not own a socket —
//! datagrams go in, [`Command`](commands::Command)s come out, and the
//! embedding application is responsible for the actual UDP I/O and for
//! driving wakeups on the returned deadlines.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      QUIC interception core                     │
//! │                                                                  │
//! │  ┌────────────────┐                       ┌────────────────┐   │
//! │  │ ClientQuicLayer │──OpenConnection──────>│ ServerQuicLayer │   │
//! │  │ (terminates the │                       │ (dials the real │   │
//! │  │  real client)   │                       │  server)        │   │
//! │  └───────┬────────┘                       └────────┬────────┘   │
//! │          │              ┌──────────────┐            │            │
//! │          └─────────────>│StreamRelayLayer│<─────────┘            │
//! │                         │ (forwards data, │                      │
//! │                         │  applies hooks) │                      │
//! │                         └──────────────┘                        │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │     ConnectionIdTable (roaming) · ProxyRuntime (shared)   │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sans-IO engine boundary
//!
//! Both `QuicLayer`s drive an engine behind the [`QuicEngineAdapter`]
//! trait: [`QuinnEngineAdapter`](quinn_adapter::QuinnEngineAdapter) wraps a
//! real `quinn-proto` connection, and [`FakeEngine`](engine::FakeEngine) is
//! a deterministic in-memory stand-in used throughout this crate's own test
//! suite. Nothing in `layer` or `relay` depends on which one is behind the
//! handle.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quic_intercept_core::{ProxyOptions, ProxyRuntime};
//! use quic_intercept_core::layer::client::ClientQuicLayer;
//! use quic_intercept_core::addons::NoopHooks;
//!
//! let runtime = ProxyRuntime::new(ProxyOptions::default());
//! let mut client_layer = ClientQuicLayer::new(1, runtime, NoopHooks);
//! // feed `client_layer.datagram_received(...)` the first UDP datagram seen
//! // on a new flow, supplying a closure that builds a `QuinnEngineAdapter`.
//! ```

pub mod addons;
pub mod client_hello;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
pub mod layer;
pub mod quinn_adapter;
pub mod relay;
pub mod routing;
pub mod session;
pub mod stream;
pub mod wakeup;

pub use addons::{NoopHooks, ProxyHooks};
pub use commands::Command;
pub use config::{ProxyOptions, ProxyRuntime, SecretsLogger};
pub use engine::{EngineEvent, QuicEngineAdapter};
pub use error::{CoreError, CoreResult};
pub use events::Event;
pub use quinn_adapter::QuinnEngineAdapter;
pub use routing::{ConnectionIdTable, SessionId};
pub use session::Session;
