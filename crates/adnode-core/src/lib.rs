#![allow(clippy::doc_markdown)]

//! adnode-core - campaign link attribution node library
//!
//! This crate holds everything about the miner node that does not touch a
//! socket: the link registry, the attribution engine, the durable store,
//! the two-factor book, the operator protocol and the upgrade state machine.
//! The `adnode-daemon` binary wires these to TLS, Unix sockets and process
//! handover; the `adnode` CLI speaks the operator protocol.
//!
//! # Modules
//!
//! - [`attribution`]: fingerprinting, dedup window and the attribution engine
//! - [`backoff`]: retry delay policies shared by forwarding and sync loops
//! - [`clock`]: monotonic time source used for dedup decisions
//! - [`config`]: `adnode.toml` parsing, environment overrides and validation
//! - [`forward`]: asynchronous crediting of accepted events to the backend
//! - [`ipc`]: operator socket request/response types and framing
//! - [`link`]: campaign link tokens and the [`link::LinkRegistry`]
//! - [`lock`]: the host-wide single-instance lock
//! - [`operator`]: the local operator command surface
//! - [`store`]: `SQLite` persistence for links, events and codes
//! - [`twofactor`]: delivered registration codes awaiting the operator
//! - [`update`]: manifests, versions and the [`update::UpdateSupervisor`]

pub mod attribution;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod forward;
pub mod ipc;
pub mod link;
pub mod lock;
pub mod operator;
pub mod store;
pub mod twofactor;
pub mod update;

mod humantime_serde;

/// Version of the running node, compared against update manifests.
pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");
