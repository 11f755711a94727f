//! Daemon lifecycle: bind, accept, authenticate, route, shut down.
//!
//! ```text
//! BusListener ──accept──> connection task ──authenticate──> peer::run
//!                                 │                           │
//!                                 └──── RouterEvent ─────> Router
//! ```
//!
//! # Invariants
//!
//! - A stream reaches the router only after its handshake succeeded.
//! - The PID and address files are written after the socket is bound and
//!   removed when [`Daemon::run`] returns.
//! - Cancelling the shutdown token stops accepting, closes every peer's
//!   outbox and waits (bounded) for the connection tasks to finish.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rbus_core::address::BusAddress;
use rbus_core::auth::Mechanisms;
use rbus_core::config::{DaemonConfig, DEFAULT_QUEUE_CAPACITY};
use rbus_core::connection::BusStream;
use tokio::sync::mpsc::{self, Sender};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection_handler::{authenticate, AuthPolicy};
use crate::error::{DaemonError, DaemonResult};
use crate::fs_safe;
use crate::listener::{BusListener, ConnectionPermit, ListenerConfig};
use crate::peer::{self, Outbox, PeerId};
use crate::router::{Router, RouterEvent};

/// Time connection tasks get to finish after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Events buffered between peer readers and the router.
const ROUTER_QUEUE: usize = 1024;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything needed to start a daemon.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// Address to bind.
    pub address: BusAddress,
    /// Connection limit and socket mode.
    pub listener: ListenerConfig,
    /// Offered mechanisms; per-transport default when `None`.
    pub mechanisms: Option<Mechanisms>,
    /// Time allowed for a client handshake.
    pub handshake_timeout: Duration,
    /// Messages queued for one peer before it is disconnected.
    pub max_queued_messages: usize,
    /// Keyring directory for DBUS_COOKIE_SHA1.
    pub keyring_dir: Option<PathBuf>,
    /// File receiving the daemon PID.
    pub pid_file: Option<PathBuf>,
    /// File receiving the bound address.
    pub address_file: Option<PathBuf>,
}

impl DaemonSettings {
    /// Settings with defaults for everything but the address.
    #[must_use]
    pub fn new(address: BusAddress) -> Self {
        let config = DaemonConfig::default();
        Self {
            address,
            listener: ListenerConfig::default(),
            mechanisms: None,
            handshake_timeout: config.handshake_timeout(),
            max_queued_messages: config.max_queued_messages,
            keyring_dir: None,
            pid_file: None,
            address_file: None,
        }
    }

    /// Settings from the `[daemon]` table of a configuration file.
    pub fn from_config(config: &DaemonConfig, address: BusAddress) -> DaemonResult<Self> {
        Ok(Self {
            address,
            listener: ListenerConfig {
                max_connections: config.max_connections,
                socket_mode: config.socket_mode,
            },
            mechanisms: config.mechanisms()?,
            handshake_timeout: config.handshake_timeout(),
            max_queued_messages: config.max_queued_messages,
            keyring_dir: config.keyring_dir.clone(),
            pid_file: config.pid_file.clone(),
            address_file: config.address_file.clone(),
        })
    }

    /// Restricts the offered mechanisms.
    #[must_use]
    pub const fn with_mechanisms(mut self, mechanisms: Mechanisms) -> Self {
        self.mechanisms = Some(mechanisms);
        self
    }

    /// Caps the messages queued for each peer.
    #[must_use]
    pub const fn with_max_queued_messages(mut self, limit: usize) -> Self {
        self.max_queued_messages = limit;
        self
    }

    /// Writes the PID to `path` once bound.
    #[must_use]
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    /// Writes the bound address to `path` once bound.
    #[must_use]
    pub fn with_address_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.address_file = Some(path.into());
        self
    }
}

/// A bound, not yet running daemon.
pub struct Daemon {
    listener: BusListener,
    settings: DaemonSettings,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Binds the listen address and writes the PID and address files.
    pub async fn bind(settings: DaemonSettings) -> DaemonResult<Self> {
        let listener = BusListener::bind(&settings.address, &settings.listener).await?;

        if let Some(path) = &settings.pid_file {
            fs_safe::atomic_write(path, format!("{}\n", std::process::id()).as_bytes())?;
            info!(path = %path.display(), "PID file written");
        }
        if let Some(path) = &settings.address_file {
            fs_safe::atomic_write(path, format!("{}\n", listener.address()).as_bytes())?;
            info!(path = %path.display(), "address file written");
        }

        Ok(Self {
            listener,
            settings,
            shutdown: CancellationToken::new(),
        })
    }

    /// Address clients connect to, including the guid.
    #[must_use]
    pub const fn address(&self) -> &BusAddress {
        self.listener.address()
    }

    /// Token that stops [`Daemon::run`] when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves clients until the shutdown token is cancelled.
    pub async fn run(self) -> DaemonResult<()> {
        let guid = self.listener.guid().to_string();
        let policy = Arc::new(AuthPolicy {
            guid: guid.clone(),
            mechanisms: self.settings.mechanisms,
            timeout: self.settings.handshake_timeout,
            keyring_dir: self.settings.keyring_dir.clone(),
        });

        let (events_tx, events_rx) = mpsc::channel(ROUTER_QUEUE);
        let queue_limit = self.settings.max_queued_messages.max(1);
        let router = tokio::spawn(Router::new(guid).run(events_rx, self.shutdown.clone()));

        let next_peer = AtomicU64::new(1);
        let mut connections = JoinSet::new();
        info!(address = %self.listener.address(), "bus daemon running");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, permit)) => {
                        let peer = PeerId(next_peer.fetch_add(1, Ordering::Relaxed));
                        connections.spawn(serve_connection(
                            peer,
                            stream,
                            permit,
                            Arc::clone(&policy),
                            queue_limit,
                            events_tx.clone(),
                            self.shutdown.clone(),
                        ));
                    },
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    },
                },
            }
        }

        info!(connections = connections.len(), "shutting down");
        drop(events_tx);
        if let Err(e) = router.await {
            warn!(error = %e, "router task failed");
        }
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "aborting connections after grace period");
            connections.abort_all();
        }

        self.remove_files();
        self.listener.cleanup();
        Ok(())
    }

    /// Binds and runs the daemon on a background task.
    pub async fn spawn(settings: DaemonSettings) -> DaemonResult<DaemonHandle> {
        let daemon = Self::bind(settings).await?;
        let address = daemon.address().clone();
        let shutdown = daemon.shutdown_token();
        let task = tokio::spawn(daemon.run());
        Ok(DaemonHandle {
            address,
            shutdown,
            task,
        })
    }

    fn remove_files(&self) {
        for path in [&self.settings.pid_file, &self.settings.address_file]
            .into_iter()
            .flatten()
        {
            fs_safe::remove_file(path);
        }
    }
}

/// Handle to a daemon started with [`Daemon::spawn`].
pub struct DaemonHandle {
    address: BusAddress,
    shutdown: CancellationToken,
    task: JoinHandle<DaemonResult<()>>,
}

impl DaemonHandle {
    /// Address clients connect to.
    #[must_use]
    pub const fn address(&self) -> &BusAddress {
        &self.address
    }

    /// Stops the daemon and waits for it.
    pub async fn shutdown(self) -> DaemonResult<()> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| DaemonError::Io(std::io::Error::other(e.to_string())))?
    }
}

async fn serve_connection(
    peer: PeerId,
    mut stream: BusStream,
    permit: ConnectionPermit,
    policy: Arc<AuthPolicy>,
    queue_limit: usize,
    events: Sender<RouterEvent>,
    shutdown: CancellationToken,
) {
    let identity = tokio::select! {
        () = shutdown.cancelled() => return,
        result = authenticate(&mut stream, &policy) => result,
    };
    let identity = match identity {
        Ok(Some(identity)) => identity,
        Ok(None) => return,
        Err(e) => {
            debug!(%peer, error = %e, "closing unauthenticated connection");
            return;
        },
    };

    let outbox = Outbox::new(DEFAULT_QUEUE_CAPACITY, queue_limit);
    let connected = RouterEvent::Connected {
        peer,
        outbox: Arc::clone(&outbox),
        identity,
    };
    let sent = tokio::select! {
        () = shutdown.cancelled() => return,
        sent = events.send(connected) => sent,
    };
    if sent.is_err() {
        return;
    }
    peer::run(peer, stream, outbox, events, permit).await;
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_files_written_and_removed() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("run/rbus.pid");
        let address_file = tmp.path().join("run/rbus.address");
        let settings = DaemonSettings::new(BusAddress::unix_path(tmp.path().join("bus")))
            .with_pid_file(&pid_file)
            .with_address_file(&address_file);

        let handle = Daemon::spawn(settings).await.unwrap();
        let pid = std::fs::read_to_string(&pid_file).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
        let written = std::fs::read_to_string(&address_file).unwrap();
        assert_eq!(written.trim(), handle.address().to_string());
        assert!(handle.address().guid().is_some());

        handle.shutdown().await.unwrap();
        assert!(!pid_file.exists());
        assert!(!address_file.exists());
        assert!(!tmp.path().join("bus").exists());
    }
}
