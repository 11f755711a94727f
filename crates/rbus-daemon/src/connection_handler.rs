//! Authentication of freshly accepted connections.
//!
//! Every stream runs the server side of the SASL handshake before any
//! binary message is read from it. Only streams that reach `BEGIN` within
//! the handshake timeout are promoted to peers.
//!
//! # Security Considerations
//!
//! - Kernel credentials are read from the socket before the handshake, never
//!   taken from the client
//! - TCP carries no credentials, so it offers only DBUS_COOKIE_SHA1 by
//!   default and EXTERNAL is refused there even when configured
//! - The handshake is bounded in time and in line length, so a silent or
//!   chatty client cannot hold a connection permit indefinitely
//! - A failed handshake closes the stream without further replies

use std::path::PathBuf;
use std::time::Duration;

use rbus_core::auth::{server_handshake, AuthError, Keyring, Mechanisms, ServerAuth};
use rbus_core::connection::BusStream;
use tracing::{debug, warn};

/// Mechanisms offered on a Unix socket when none are configured.
pub const DEFAULT_UNIX_MECHANISMS: Mechanisms = Mechanisms::EXTERNAL;

/// Mechanisms offered on TCP when none are configured.
pub const DEFAULT_TCP_MECHANISMS: Mechanisms = Mechanisms::COOKIE_SHA1;

/// How the daemon authenticates clients.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    /// Guid sent in `OK`.
    pub guid: String,
    /// Mechanisms offered; per-transport default when `None`.
    pub mechanisms: Option<Mechanisms>,
    /// Time allowed for the whole handshake.
    pub timeout: Duration,
    /// Keyring for DBUS_COOKIE_SHA1; the user's default when `None`.
    pub keyring_dir: Option<PathBuf>,
}

impl AuthPolicy {
    /// Mechanisms offered on `stream`.
    #[must_use]
    pub fn mechanisms_for(&self, stream: &BusStream) -> Mechanisms {
        self.mechanisms.unwrap_or(match stream {
            BusStream::Unix(_) => DEFAULT_UNIX_MECHANISMS,
            BusStream::Tcp(_) => DEFAULT_TCP_MECHANISMS,
        })
    }
}

/// Identity of an authenticated client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Authenticated uid; `None` for ANONYMOUS.
    pub uid: Option<u32>,
    /// Process id, when the transport supplies it.
    pub pid: Option<u32>,
}

/// Runs the server handshake on `stream`.
///
/// Returns `Ok(None)` when the client disconnects or fails to authenticate,
/// which is an ordinary outcome, not a daemon error.
pub async fn authenticate(
    stream: &mut BusStream,
    policy: &AuthPolicy,
) -> Result<Option<ClientIdentity>, AuthError> {
    let credentials = stream.peer_credentials();
    let keyring = policy
        .keyring_dir
        .as_ref()
        .map_or_else(Keyring::for_current_user, Keyring::new);
    let auth = ServerAuth::new(policy.guid.clone(), policy.mechanisms_for(stream))
        .with_peer_credentials(credentials)
        .with_keyring(keyring);

    let outcome = match tokio::time::timeout(policy.timeout, server_handshake(stream, auth)).await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(AuthError::ConnectionClosed | AuthError::Rejected)) => {
            debug!("client did not authenticate");
            return Ok(None);
        },
        Ok(Err(e)) => {
            warn!(error = %e, "handshake failed");
            return Err(e);
        },
        Err(_) => {
            let timeout_ms = u64::try_from(policy.timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(timeout_ms, "handshake timed out");
            return Err(AuthError::Timeout { timeout_ms });
        },
    };

    debug!(
        mechanism = %outcome.mechanism,
        uid = ?outcome.uid,
        pid = ?credentials.and_then(|c| c.pid),
        "client authenticated"
    );
    Ok(Some(ClientIdentity {
        uid: outcome.uid,
        pid: credentials.and_then(|c| c.pid),
    }))
}

#[cfg(test)]
mod tests {
    use rbus_core::auth::{client_handshake, ClientAuth};
    use tempfile::TempDir;
    use tokio::net::{TcpListener, TcpStream, UnixStream};

    use super::*;

    fn policy() -> AuthPolicy {
        AuthPolicy {
            guid: rbus_core::address::generate_guid(),
            mechanisms: None,
            timeout: Duration::from_secs(5),
            keyring_dir: None,
        }
    }

    #[tokio::test]
    async fn test_external_over_unix() {
        let (server, mut client) = UnixStream::pair().unwrap();
        let mut server = BusStream::Unix(server);
        let policy = policy();
        let (identity, guid) = tokio::join!(
            authenticate(&mut server, &policy),
            client_handshake(&mut client, ClientAuth::new(Mechanisms::ALL)),
        );
        let identity = identity.unwrap().unwrap();
        assert_eq!(identity.uid, Some(nix::unistd::getuid().as_raw()));
        assert_eq!(identity.pid, Some(std::process::id()));
        assert_eq!(guid.unwrap(), policy.guid);
    }

    #[tokio::test]
    async fn test_rejected_client_gets_no_identity() {
        let (server, mut client) = UnixStream::pair().unwrap();
        let mut server = BusStream::Unix(server);
        let policy = AuthPolicy {
            timeout: Duration::from_millis(500),
            ..policy()
        };
        let (identity, result) = tokio::join!(
            authenticate(&mut server, &policy),
            client_handshake(&mut client, ClientAuth::new(Mechanisms::ANONYMOUS)),
        );
        assert!(result.is_err());
        assert!(!matches!(identity, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let (server, _client) = UnixStream::pair().unwrap();
        let mut server = BusStream::Unix(server);
        let policy = AuthPolicy {
            timeout: Duration::from_millis(50),
            ..policy()
        };
        let err = authenticate(&mut server, &policy).await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout { timeout_ms: 50 }));
    }

    async fn tcp_pair() -> (BusStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (BusStream::Tcp(server), client)
    }

    #[tokio::test]
    async fn test_external_over_tcp_is_refused() {
        let keyring = TempDir::new().unwrap();
        let policy = AuthPolicy {
            timeout: Duration::from_millis(500),
            keyring_dir: Some(keyring.path().join("keyrings")),
            ..policy()
        };

        let (mut server, mut client) = tcp_pair().await;
        assert_eq!(policy.mechanisms_for(&server), Mechanisms::COOKIE_SHA1);
        let (identity, result) = tokio::join!(
            authenticate(&mut server, &policy),
            client_handshake(&mut client, ClientAuth::new(Mechanisms::EXTERNAL).with_uid(0)),
        );
        assert!(result.is_err());
        assert!(!matches!(identity, Ok(Some(_))));

        // Offering EXTERNAL explicitly does not help without credentials.
        let policy = AuthPolicy {
            mechanisms: Some(Mechanisms::EXTERNAL),
            ..policy
        };
        let (mut server, mut client) = tcp_pair().await;
        let uid = nix::unistd::getuid().as_raw();
        let (identity, result) = tokio::join!(
            authenticate(&mut server, &policy),
            client_handshake(&mut client, ClientAuth::new(Mechanisms::EXTERNAL).with_uid(uid)),
        );
        assert!(result.is_err());
        assert!(!matches!(identity, Ok(Some(_))));
        assert!(std::fs::read_dir(keyring.path()).unwrap().next().is_none());
    }
}
