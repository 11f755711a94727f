//! Core library for the rbus message bus.
//!
//! This crate provides everything a peer needs to talk on the bus, and the
//! building blocks the daemon is assembled from:
//!
//! - [`wire`]: the binary message format (framing, alignment, signatures)
//! - [`auth`]: the line-oriented SASL handshake that precedes wire traffic
//! - [`ring`]: growable circular buffers for pending calls and outbound queues
//! - [`connection`]: the per-connection engine (reader, sender, workers)
//! - [`address`]: bus address parsing and generation
//! - [`match_rule`]: signal subscription filters
//! - [`bus`]: names and reply codes of the standard bus interface
//! - [`config`]: TOML configuration for connections and the daemon
//!
//! # Example
//!
//! ```rust,ignore
//! use rbus_core::connection::Connection;
//!
//! let conn = Connection::connect_bus("unix:path=/tmp/rbus-test").await?;
//! let names = conn.list_names().await?;
//! conn.disconnect().await;
//! ```

pub mod address;
pub mod auth;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod match_rule;
pub mod names;
pub mod ring;
pub mod wire;

pub use error::{BusError, BusResult};
