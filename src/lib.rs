//! Client-side LSP driver core.
//!
//! This crate sits between a raw JSON-RPC transport and an editor caller.
//! It does not frame bytes, spawn processes, or know the LSP schema beyond
//! a handful of method tags; it owns the stateful part of talking to a
//! language server that an integration otherwise reimplements badly:
//! handshakes, lifecycle, crashes, and stream continuity.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Editor / IDE                          │
//! │   send_request · send_notification · event/caps streams      │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//! ┌──────────────────────────────▼───────────────────────────────┐
//! │                          Supervisor                          │
//! │  lazy spawn · open-document replay · restart throttling      │
//! │  ┌────────────────┐   ┌────────────────────────────────────┐ │
//! │  │ StreamTap      │   │ StreamTap                          │ │
//! │  │ (events)       │   │ (capabilities)                     │ │
//! │  └───────┬────────┘   └───────────────┬────────────────────┘ │
//! └──────────┼────────────────────────────┼──────────────────────┘
//!            │ rebound per incarnation    │
//! ┌──────────▼────────────────────────────▼──────────────────────┐
//! │                       LazyInitializer                        │
//! │  exactly-once handshake · capability snapshot + stream       │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//! ┌──────────────────────────────▼───────────────────────────────┐
//! │               ServerConnection (supplied by you)             │
//! │        JSON-RPC framing · subprocess · stdio piping          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each restart builds a fresh [`LazyInitializer`] over a fresh connection
//! from the configured provider and rebinds the supervisor's two
//! [`tap::StreamTap`]s, so consumers hold one event stream and one
//! capabilities stream for the whole session.

pub mod connection;
pub mod error;
pub mod initializer;
pub mod params;
pub mod registrations;
pub mod supervisor;
pub mod tap;

pub use connection::{
    InitializeParamsProvider, RequestId, ServerConnection, ServerConnectionProvider, ServerEvent,
    ServerRequestHandler, TextDocumentItemProvider,
};
pub use error::Error;
pub use initializer::LazyInitializer;
pub use params::{default_client_capabilities, default_initialize_params};
pub use supervisor::{Supervisor, SupervisorBuilder, DEFAULT_RESTART_COOL_DOWN};
pub use tap::StreamTap;
