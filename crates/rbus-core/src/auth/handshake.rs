//! Async handshake drivers.
//!
//! Lines are read one byte at a time so that nothing after `BEGIN` is
//! consumed from the socket; the first binary message may already be in
//! flight when the handshake ends.
//!
//! Steps that may touch the cookie keyring (`AUTH` on the server, `DATA` on
//! the client) run on the blocking pool, since the keyring is plain file
//! I/O behind a lock that may be held by another process.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::{
    AuthError, ClientAuth, ClientState, Command, Mechanism, ServerAuth, ServerState,
    MAX_LINE_LENGTH,
};

/// Result of a successful server-side handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Mechanism the client used.
    pub mechanism: Mechanism,
    /// Authenticated uid; `None` for ANONYMOUS.
    pub uid: Option<u32>,
}

/// Runs the server side of the handshake until `BEGIN`.
pub async fn server_handshake<S>(
    stream: &mut S,
    mut auth: ServerAuth,
) -> Result<AuthOutcome, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut nul = [0u8; 1];
    if stream.read(&mut nul).await? == 0 {
        return Err(AuthError::ConnectionClosed);
    }
    if nul[0] != 0 {
        return Err(AuthError::MissingNul);
    }

    loop {
        let Some(line) = read_line(stream).await? else {
            return Err(AuthError::ConnectionClosed);
        };
        trace!(%line, "SASL <-");
        let reply = match Command::parse(&line) {
            Ok(command @ Command::Auth { .. }) => {
                let (back, reply) = off_runtime(auth, move |a| a.handle(command)).await?;
                auth = back;
                reply
            },
            Ok(command) => auth.handle(command),
            Err(e) => {
                debug!(error = %e, "unparseable SASL line");
                Some(Command::Error(e.to_string()))
            },
        };
        if let Some(reply) = reply {
            write_line(stream, &reply).await?;
        }
        match auth.state() {
            ServerState::Authenticated => {
                let mechanism = auth.mechanism().ok_or_else(|| {
                    AuthError::Protocol("authenticated without a mechanism".to_string())
                })?;
                return Ok(AuthOutcome {
                    mechanism,
                    uid: auth.uid(),
                });
            },
            ServerState::Failed => return Err(AuthError::Rejected),
            ServerState::WaitAuth | ServerState::WaitData | ServerState::WaitBegin => {},
        }
    }
}

/// Runs the client side of the handshake, returning the server guid.
pub async fn client_handshake<S>(stream: &mut S, mut auth: ClientAuth) -> Result<String, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[0]).await?;
    let first = auth.start();
    write_line(stream, &first).await?;

    loop {
        let Some(line) = read_line(stream).await? else {
            return Err(AuthError::ConnectionClosed);
        };
        trace!(%line, "SASL <-");
        let reply = match Command::parse(&line)? {
            command @ Command::Data(_) => {
                let (back, reply) = off_runtime(auth, move |a| a.handle(command)).await?;
                auth = back;
                reply?
            },
            command => auth.handle(command)?,
        };
        if let Some(reply) = reply {
            write_line(stream, &reply).await?;
        }
        if auth.state() == ClientState::Authenticated {
            return auth
                .guid()
                .map(str::to_string)
                .ok_or_else(|| AuthError::Protocol("OK without guid".to_string()));
        }
    }
}

/// Runs one state machine step on the blocking pool.
async fn off_runtime<A, T, F>(mut auth: A, step: F) -> Result<(A, T), AuthError>
where
    A: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut A) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let out = step(&mut auth);
        (auth, out)
    })
    .await
    .map_err(|e| AuthError::Protocol(format!("authentication step failed: {e}")))
}

/// Reads one `\n`-terminated line, dropping `\r`.
///
/// Returns `None` on a clean EOF before any byte of the line.
async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>, AuthError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte).await? == 0 {
            return if line.is_empty() {
                Ok(None)
            } else {
                Err(AuthError::ConnectionClosed)
            };
        }
        match byte[0] {
            b'\n' => break,
            b'\r' => {},
            b => {
                if line.len() >= MAX_LINE_LENGTH {
                    return Err(AuthError::LineTooLong {
                        max: MAX_LINE_LENGTH,
                    });
                }
                line.push(b);
            },
        }
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| AuthError::Protocol("SASL line is not UTF-8".to_string()))
}

async fn write_line<W>(writer: &mut W, command: &Command) -> Result<(), AuthError>
where
    W: AsyncWrite + Unpin,
{
    trace!(%command, "SASL ->");
    writer.write_all(command.to_line().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use fs2::FileExt;
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::auth::{Keyring, Mechanisms, COOKIE_CONTEXT, LOCK_TIMEOUT};

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut client_io, mut server_io) = duplex(4096);
        let server = tokio::spawn(async move {
            let auth = ServerAuth::new("feedface", Mechanisms::ANONYMOUS);
            let outcome = server_handshake(&mut server_io, auth).await.unwrap();
            let mut rest = [0u8; 4];
            server_io.read_exact(&mut rest).await.unwrap();
            (outcome, rest)
        });

        let guid = client_handshake(&mut client_io, ClientAuth::new(Mechanisms::ALL))
            .await
            .unwrap();
        client_io.write_all(b"l\x01\x00\x01").await.unwrap();

        let (outcome, rest) = server.await.unwrap();
        assert_eq!(guid, "feedface");
        assert_eq!(outcome.mechanism, Mechanism::Anonymous);
        assert_eq!(outcome.uid, None);
        assert_eq!(&rest, b"l\x01\x00\x01");
    }

    #[tokio::test]
    async fn test_missing_nul() {
        let (mut client_io, mut server_io) = duplex(64);
        client_io.write_all(b"AUTH\r\n").await.unwrap();
        let err = server_handshake(&mut server_io, ServerAuth::new("g", Mechanisms::ALL))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingNul));
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let (mut client_io, mut server_io) = duplex(MAX_LINE_LENGTH * 2);
        let writer = tokio::spawn(async move {
            client_io.write_all(&[0]).await.unwrap();
            client_io
                .write_all(&vec![b'A'; MAX_LINE_LENGTH + 1])
                .await
                .unwrap();
            client_io
        });
        let err = server_handshake(&mut server_io, ServerAuth::new("g", Mechanisms::ALL))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::LineTooLong { .. }));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_mid_handshake() {
        let (mut client_io, mut server_io) = duplex(64);
        client_io.write_all(b"\0AUTH").await.unwrap();
        drop(client_io);
        let err = server_handshake(&mut server_io, ServerAuth::new("g", Mechanisms::ALL))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_garbage_line_gets_error_reply() {
        let (mut client_io, mut server_io) = duplex(256);
        let server = tokio::spawn(async move {
            server_handshake(&mut server_io, ServerAuth::new("g", Mechanisms::ANONYMOUS)).await
        });
        client_io.write_all(b"\0HELLO\r\n").await.unwrap();
        let mut buf = [0u8; 5];
        client_io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ERROR");
        drop(client_io);
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_keyring_lock_wait_leaves_runtime_free() {
        let dir = TempDir::new().unwrap();
        let lock = std::fs::File::create(dir.path().join(format!("{COOKIE_CONTEXT}.lock"))).unwrap();
        lock.lock_exclusive().unwrap();

        let (mut client_io, mut server_io) = duplex(4096);
        let keyring = Keyring::new(dir.path());
        let server = tokio::spawn(async move {
            let auth = ServerAuth::new("g", Mechanisms::COOKIE_SHA1)
                .with_local_uid(7)
                .with_keyring(keyring);
            server_handshake(&mut server_io, auth).await
        });
        client_io
            .write_all(format!("\0AUTH DBUS_COOKIE_SHA1 {}\r\n", hex::encode("7")).as_bytes())
            .await
            .unwrap();

        // The server is now waiting for the keyring lock; timers still fire.
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < LOCK_TIMEOUT / 2);

        let mut buf = [0u8; 8];
        client_io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"REJECTED");

        lock.unlock().unwrap();
        drop(client_io);
        assert!(server.await.unwrap().is_err());
    }
}
