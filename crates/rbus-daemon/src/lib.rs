#![allow(clippy::doc_markdown)]

//! rbus-daemon - message bus daemon library
//!
//! The daemon accepts connections on one bus address, authenticates them,
//! assigns unique names and routes messages between them. It also implements
//! the `org.freedesktop.DBus` service itself.
//!
//! # Modules
//!
//! - [`daemon`]: lifecycle (bind, accept loop, shutdown, PID/address files)
//! - [`listener`]: Unix and TCP listening sockets with a connection limit
//! - [`connection_handler`]: server side of the SASL handshake
//! - [`peer`]: per-connection reader and sender tasks
//! - [`router`]: the routing actor owning all bus state
//! - [`bus_driver`]: the standard bus methods
//! - [`registry`]: name ownership and match rules
//! - [`fs_safe`]: atomic writes for the PID and address files
//! - [`error`]: daemon error types
//!
//! # Example
//!
//! ```rust,ignore
//! use rbus_core::address::BusAddress;
//! use rbus_daemon::daemon::{Daemon, DaemonSettings};
//!
//! let settings = DaemonSettings::new(BusAddress::tcp("127.0.0.1", 0));
//! let handle = Daemon::spawn(settings).await?;
//! println!("{}", handle.address());
//! handle.shutdown().await?;
//! ```

pub mod bus_driver;
pub mod connection_handler;
pub mod daemon;
pub mod error;
pub mod fs_safe;
pub mod listener;
pub mod peer;
pub mod registry;
pub mod router;

pub use daemon::{Daemon, DaemonHandle, DaemonSettings};
pub use error::{DaemonError, DaemonResult};
