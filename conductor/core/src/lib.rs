//! Whist Conductor - Reactive Launcher Core
//!
//! This crate holds the launcher's business logic: a graph of named
//! triggers and reactive flows that takes a user from "application ready"
//! to "streaming protocol running". It has no UI dependencies; a renderer
//! attaches over line-delimited JSON IPC and a headless harness can drive
//! the same graph in tests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Renderer                                 │
//! │        trigger actions (up)          RendererState (down)         │
//! └───────────────────────────┬──────────────────────────────────────┘
//!                             │  IpcBridge
//! ┌───────────────────────────┼──────────────────────────────────────┐
//! │                    CONDUCTOR CORE                                 │
//! │  ┌────────────────────────┴─────────────────────────────────────┐ │
//! │  │                TriggerRegistry (named Signals)                │ │
//! │  └──────┬──────────────────┬───────────────────────┬─────────────┘ │
//! │         ▼                  ▼                       ▼               │
//! │  ┌────────────┐   ┌──────────────────┐   ┌──────────────────────┐  │
//! │  │   Flows    │   │  SessionMachine  │   │       Effects        │  │
//! │  │ auth, box, │──▶│ Idle → … →       │──▶│ windows, store,      │  │
//! │  │ host, ...  │   │ Streaming        │   │ protocol process     │  │
//! │  └─────┬──────┘   └──────────────────┘   └──────────────────────┘  │
//! │        ▼                                                           │
//! │   WhistApi (HTTP)                                                  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Signal`]: Multicast reactive value stream with composable operators
//! - [`TriggerRegistry`]: Name → signal map that joins flows together
//! - [`Flow`]: Named input → channels pipeline, optionally mocked
//! - [`FlowGraph`]: Composition root wiring every flow and effect
//! - [`SessionMachine`]: Explicit session establishment state
//! - [`Store`]: Persisted key-value store with change events
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use whist_conductor::{
//!     Dependencies, FlowContext, FlowGraph, ProcessSpawner, Store, TriggerRegistry, WebserverApi,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let api = Arc::new(WebserverApi::new("https://prod-server.whist.com"));
//!     let store = Store::open("/tmp/whist/store.json").await;
//!     let spawner = Arc::new(ProcessSpawner::new("WhistClient"));
//!
//!     let registry = TriggerRegistry::new();
//!     let graph = FlowGraph::build(&registry, Dependencies::new(FlowContext::new(api), store, spawner))
//!         .unwrap();
//!     graph.start().unwrap();
//!
//!     // Feed renderer actions through an IpcBridge, render graph.renderer_states()
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`signal`]: Reactive signal type and operators
//! - [`adapter`]: Bridges callback-style event sources into signals
//! - [`registry`]: Named trigger registry
//! - [`flow`]: Fork, channels and mockable flows
//! - [`mock`]: Named mock schemas overriding flow channels
//! - [`flows`]: The launcher's concrete flows
//! - [`api`]: Webserver and host service calls
//! - [`http`]: JSON-over-HTTP client returning `{status, json}`
//! - [`store`]: Persisted key-value store
//! - [`protocol`]: Streaming protocol process
//! - [`session`]: Session establishment state machine
//! - [`effects`]: Windows, credential persistence and the protocol supervisor
//! - [`graph`]: Composition root
//! - [`ipc`]: Renderer message protocol
//! - [`triggers`]: Well-known trigger names
//! - [`config`]: Layered launcher configuration
//! - [`logging`]: Redaction for logged payloads

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod adapter;
pub mod api;
pub mod config;
pub mod effects;
pub mod flow;
pub mod flows;
pub mod graph;
pub mod http;
pub mod ipc;
pub mod logging;
pub mod mock;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod signal;
pub mod store;
pub mod triggers;

// Reactive core
pub use adapter::{EventAdapter, NativeEmitter};
pub use registry::{Payload, RegistryError, TriggerRegistry};
pub use signal::{Signal, SignalValue, Subscription};

// Flow exports
pub use flow::{fork, Branches, Channels, Flow, FlowError, FlowId, Fork, FAILURE, SUCCESS, UNMATCHED};
pub use flows::FlowContext;
pub use mock::{MockSchema, MOCK_SCHEMA_ENV};

// Service exports
pub use api::{WebserverApi, WhistApi};
pub use http::{HttpClient, ServerResponse};
pub use protocol::{LaunchInfo, ProcessSpawner, ProtocolEvent, ProtocolHandle, ProtocolSpawner};
pub use store::{Credentials, Store, StoreError};

// Session and graph exports
pub use effects::{ProtocolSupervisor, WindowCommand, WindowKind, Windows};
pub use graph::{Dependencies, FlowGraph, GraphError};
pub use ipc::{IpcBridge, IpcError, OutboundMessage, RendererState};
pub use session::{ErrorStage, SessionEvent, SessionMachine, SessionState};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from, ConfigError, ConfigOverrides,
    ConfigSource, LauncherConfig, LauncherToml,
};
