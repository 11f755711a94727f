//! Listening sockets of the daemon.
//!
//! A [`BusListener`] binds one bus address and hands out authenticated-ready
//! streams together with a connection permit.
//!
//! # Security Considerations
//!
//! - Socket permissions are set AFTER binding
//! - The socket directory is created with mode 0700 when missing
//! - A stale socket file is removed before binding; any other file type at
//!   the path is refused
//! - The socket file is removed again on drop
//!
//! # Invariants
//!
//! - [`BusListener::address`] always carries a `guid` and, for TCP, the port
//!   actually bound
//! - At most `max_connections` accepted streams hold a permit at once

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rbus_core::address::{BusAddress, Endpoint};
use rbus_core::connection::BusStream;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::fs_safe;

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Concurrent connection limit.
    pub max_connections: usize,
    /// Mode applied to a Unix socket file after binding.
    pub socket_mode: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: rbus_core::config::DEFAULT_MAX_CONNECTIONS,
            socket_mode: rbus_core::config::DEFAULT_SOCKET_MODE,
        }
    }
}

enum Socket {
    Unix {
        listener: UnixListener,
        /// Filesystem path to clean up; `None` for abstract sockets.
        path: Option<PathBuf>,
    },
    Tcp(TcpListener),
}

/// Permit held for the lifetime of an accepted connection.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

/// A bound bus address.
pub struct BusListener {
    socket: Socket,
    address: BusAddress,
    connection_sem: Arc<Semaphore>,
}

impl BusListener {
    /// Binds `address`.
    ///
    /// A TCP port of 0 is replaced by the port the kernel picked, and a guid
    /// is added when the address has none.
    pub async fn bind(address: &BusAddress, config: &ListenerConfig) -> DaemonResult<Self> {
        let mut address = address.clone().ensure_guid();
        let socket = match address.endpoint()? {
            Endpoint::UnixPath(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs_safe::ensure_directory(parent)?;
                }
                Self::cleanup_socket(&path)?;
                let listener = UnixListener::bind(&path).map_err(|e| {
                    DaemonError::io_context(&e, format!("failed to bind {}", path.display()))
                })?;
                Self::set_socket_permissions(&path, config.socket_mode)?;
                Socket::Unix {
                    listener,
                    path: Some(path),
                }
            },
            Endpoint::UnixAbstract(name) => Socket::Unix {
                listener: bind_abstract(&name)?,
                path: None,
            },
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), port)).await.map_err(|e| {
                    DaemonError::io_context(&e, format!("failed to bind {host}:{port}"))
                })?;
                if port == 0 {
                    let bound = listener.local_addr()?.port();
                    address = address.with_param("port", bound.to_string());
                }
                Socket::Tcp(listener)
            },
        };

        info!(
            address = %address,
            max_connections = config.max_connections,
            "listening"
        );

        Ok(Self {
            socket,
            address,
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    /// Address clients should connect to.
    #[must_use]
    pub const fn address(&self) -> &BusAddress {
        &self.address
    }

    /// Guid of this bus.
    #[must_use]
    pub fn guid(&self) -> &str {
        self.address.guid().unwrap_or_default()
    }

    /// Returns `true` for Unix sockets.
    #[must_use]
    pub const fn is_unix(&self) -> bool {
        matches!(self.socket, Socket::Unix { .. })
    }

    /// Accepts the next connection, waiting for a free permit first.
    pub async fn accept(&self) -> DaemonResult<(BusStream, ConnectionPermit)> {
        let permit = Arc::clone(&self.connection_sem)
            .acquire_owned()
            .await
            .map_err(|_| DaemonError::Io(io::Error::other("connection semaphore closed")))?;

        let stream = match &self.socket {
            Socket::Unix { listener, .. } => BusStream::Unix(listener.accept().await?.0),
            Socket::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!(%peer, "accepted TCP connection");
                BusStream::Tcp(stream)
            },
        };
        Ok((stream, ConnectionPermit { _permit: permit }))
    }

    fn cleanup_socket(path: &Path) -> DaemonResult<()> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(DaemonError::io_context(&e, format!("stat {}", path.display())));
            },
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if !metadata.file_type().is_socket() {
                return Err(DaemonError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("path {} exists but is not a socket", path.display()),
                )));
            }
        }

        std::fs::remove_file(path).map_err(|e| {
            DaemonError::io_context(&e, format!("failed to remove stale socket {}", path.display()))
        })?;
        debug!(path = %path.display(), "removed stale socket file");
        Ok(())
    }

    #[cfg(unix)]
    fn set_socket_permissions(path: &Path, mode: u32) -> DaemonResult<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            DaemonError::io_context(&e, format!("failed to set permissions on {}", path.display()))
        })
    }

    #[cfg(not(unix))]
    fn set_socket_permissions(_path: &Path, _mode: u32) -> DaemonResult<()> {
        Ok(())
    }

    /// Removes the socket file, if any.
    pub fn cleanup(&self) {
        if let Socket::Unix {
            path: Some(path), ..
        } = &self.socket
        {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to remove socket file");
                } else {
                    info!(path = %path.display(), "removed socket file");
                }
            }
        }
    }
}

impl Drop for BusListener {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> DaemonResult<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = StdUnixListener::bind_addr(&addr)
        .map_err(|e| DaemonError::io_context(&e, format!("failed to bind abstract socket {name:?}")))?;
    listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(listener)?)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(name: &str) -> DaemonResult<UnixListener> {
    Err(DaemonError::unsupported(format!(
        "abstract socket {name:?} requires Linux"
    )))
}
