#![allow(clippy::doc_markdown)]

//! adnode-daemon - the miner node process
//!
//! Wires the `adnode-core` components to the outside world: the public
//! HTTPS endpoint, the campaign backend over HTTPS, the operator Unix
//! socket, Prometheus metrics and the in-place handover used by
//! self-update.
//!
//! # Modules
//!
//! - [`backend`]: hyper client for credits, campaigns, manifests and artifacts
//! - [`endpoint`]: TLS listener, routes and drain control
//! - [`handlers`]: operator request dispatch
//! - [`handover`]: launching and adopting a successor process
//! - [`metrics`]: Prometheus counters and the `/metrics` server
//! - [`operator`]: the operator socket server
//! - [`pidfile`]: atomic PID file handling
//! - [`state`]: shared node state
//! - [`tasks`]: campaign sync and reconciliation loops

pub mod backend;
pub mod endpoint;
pub mod handlers;
pub mod handover;
pub mod metrics;
pub mod operator;
pub mod pidfile;
pub mod state;
pub mod tasks;
