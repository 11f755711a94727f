//! Client side of the SASL dialogue.

use tracing::debug;

use super::cookie::{random_hex, COOKIE_CONTEXT};
use super::server::cookie_digest;
use super::{AuthError, Command, Keyring, Mechanism, Mechanisms};

const CHALLENGE_BYTES: usize = 16;

/// Client handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Nothing sent yet.
    Initial,
    /// Waiting for the server's mechanism list.
    WaitReject,
    /// Waiting for a cookie challenge.
    WaitData,
    /// Waiting for `OK`.
    WaitOk,
    /// `BEGIN` sent.
    Authenticated,
    /// No mechanism left.
    Failed,
}

/// Client state machine.
///
/// [`ClientAuth::start`] yields the first line; every server line then goes
/// through [`ClientAuth::handle`].
pub struct ClientAuth {
    state: ClientState,
    allowed: Mechanisms,
    failed: Mechanisms,
    current: Option<Mechanism>,
    uid: u32,
    keyring: Keyring,
    guid: Option<String>,
}

impl ClientAuth {
    /// New client willing to use `allowed`.
    #[must_use]
    pub fn new(allowed: Mechanisms) -> Self {
        Self {
            state: ClientState::Initial,
            allowed,
            failed: Mechanisms::NONE,
            current: None,
            uid: nix::unistd::getuid().as_raw(),
            keyring: Keyring::for_current_user(),
            guid: None,
        }
    }

    /// Uid asserted by EXTERNAL and cookie authentication.
    #[must_use]
    pub const fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    /// Keyring used to answer cookie challenges.
    #[must_use]
    pub fn with_keyring(mut self, keyring: Keyring) -> Self {
        self.keyring = keyring;
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ClientState {
        self.state
    }

    /// Mechanism currently being tried.
    #[must_use]
    pub const fn mechanism(&self) -> Option<Mechanism> {
        self.current
    }

    /// Server guid received with `OK`.
    #[must_use]
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    /// First command: a bare `AUTH` asking for the server's mechanisms.
    pub fn start(&mut self) -> Command {
        self.state = ClientState::WaitReject;
        Command::Auth {
            mechanism: None,
            data: None,
        }
    }

    /// Processes one server command, returning the reply to send.
    pub fn handle(&mut self, command: Command) -> Result<Option<Command>, AuthError> {
        use ClientState::{Authenticated, Failed, Initial, WaitData, WaitOk, WaitReject};

        match (self.state, command) {
            (Initial | Authenticated | Failed, command) => {
                Err(AuthError::Protocol(format!("unexpected {command} in state {:?}", self.state)))
            },
            (_, Command::Rejected(offered)) => {
                if let Some(current) = self.current.take() {
                    self.failed.insert(current);
                }
                let offered = Mechanisms::from_names_lossy(offered.iter().map(String::as_str));
                match (offered & self.allowed).difference(self.failed).first() {
                    Some(next) => Ok(Some(self.try_mechanism(next))),
                    None => {
                        self.state = Failed;
                        Err(AuthError::Rejected)
                    },
                }
            },
            (WaitOk | WaitData, Command::Ok(guid)) => {
                self.guid = Some(guid);
                self.state = Authenticated;
                Ok(Some(Command::Begin))
            },
            (WaitData, Command::Data(data)) => {
                match self.answer_challenge(&data) {
                    Ok(response) => {
                        self.state = WaitOk;
                        Ok(Some(Command::Data(response)))
                    },
                    Err(e) => {
                        debug!(error = %e, "cannot answer cookie challenge");
                        self.state = WaitReject;
                        Ok(Some(Command::Error(e.to_string())))
                    },
                }
            },
            (WaitReject | WaitOk | WaitData, Command::Data(_) | Command::Error(_)) => {
                self.state = WaitReject;
                Ok(Some(Command::Cancel))
            },
            (state, command) => {
                self.state = Failed;
                Err(AuthError::Protocol(format!("unexpected {command} in state {state:?}")))
            },
        }
    }

    fn try_mechanism(&mut self, mechanism: Mechanism) -> Command {
        self.current = Some(mechanism);
        let (data, state) = match mechanism {
            Mechanism::External => (Some(hex::encode(self.uid.to_string())), ClientState::WaitOk),
            Mechanism::CookieSha1 => (Some(hex::encode(self.uid.to_string())), ClientState::WaitData),
            Mechanism::Anonymous => (None, ClientState::WaitOk),
        };
        self.state = state;
        Command::Auth {
            mechanism: Some(mechanism.name().to_string()),
            data,
        }
    }

    fn answer_challenge(&self, data: &str) -> Result<String, AuthError> {
        let bytes = hex::decode(data).map_err(|e| AuthError::Protocol(format!("bad challenge: {e}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| AuthError::Protocol("challenge is not UTF-8".to_string()))?;
        let mut parts = text.split(' ');
        let (Some(context), Some(id), Some(server_challenge), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Protocol(format!("malformed challenge {text:?}")));
        };
        if context != COOKIE_CONTEXT {
            debug!(context, "server uses a non-default cookie context");
        }
        let id: u64 = id
            .parse()
            .map_err(|_| AuthError::Protocol(format!("bad cookie id {id:?}")))?;
        let secret = self
            .keyring
            .find(context, id)?
            .ok_or_else(|| AuthError::cookie(format!("no valid cookie {id} in context {context}")))?;
        let client_challenge = random_hex(CHALLENGE_BYTES);
        let digest = cookie_digest(server_challenge, &client_challenge, &secret);
        Ok(hex::encode(format!("{client_challenge} {digest}")))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::auth::{Cookie, PeerCredentials, ServerAuth, ServerState, EXPIRE_KEYS_TIMEOUT_SECS};

    /// Runs both state machines against each other in memory.
    fn converse(client: &mut ClientAuth, server: &mut ServerAuth) -> Result<(), AuthError> {
        let mut to_server = Some(client.start());
        while let Some(line) = to_server.take() {
            let line = Command::parse(line.to_string().as_str())?;
            let Some(reply) = server.handle(line) else {
                break;
            };
            to_server = client.handle(Command::parse(&reply.to_string())?)?;
        }
        Ok(())
    }

    #[test]
    fn test_falls_back_to_next_mechanism() {
        let mut client = ClientAuth::new(Mechanisms::ALL).with_uid(0);
        let mut server = ServerAuth::new("g1", Mechanisms::EXTERNAL | Mechanisms::ANONYMOUS)
            .with_local_uid(1000);
        converse(&mut client, &mut server).unwrap();
        assert_eq!(client.state(), ClientState::Authenticated);
        assert_eq!(client.mechanism(), Some(Mechanism::Anonymous));
        assert_eq!(client.guid(), Some("g1"));
        assert_eq!(server.state(), ServerState::Authenticated);
    }

    #[test]
    fn test_external_first() {
        let mut client = ClientAuth::new(Mechanisms::ALL).with_uid(1000);
        let mut server = ServerAuth::new("g2", Mechanisms::ALL).with_peer_credentials(Some(
            PeerCredentials {
                uid: 1000,
                gid: 1000,
                pid: None,
            },
        ));
        converse(&mut client, &mut server).unwrap();
        assert_eq!(client.mechanism(), Some(Mechanism::External));
        assert_eq!(server.uid(), Some(1000));
    }

    #[test]
    fn test_no_common_mechanism() {
        let mut client = ClientAuth::new(Mechanisms::ANONYMOUS);
        let mut server = ServerAuth::new("g3", Mechanisms::EXTERNAL);
        let err = converse(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, AuthError::Rejected));
        assert_eq!(client.state(), ClientState::Failed);
    }

    #[test]
    fn test_cookie_sha1_shared_keyring() {
        let dir = TempDir::new().unwrap();
        let keyring = Keyring::new(dir.path());
        let mut client = ClientAuth::new(Mechanisms::COOKIE_SHA1)
            .with_uid(1000)
            .with_keyring(keyring.clone());
        let mut server = ServerAuth::new("g4", Mechanisms::COOKIE_SHA1)
            .with_local_uid(1000)
            .with_keyring(keyring);
        converse(&mut client, &mut server).unwrap();
        assert_eq!(client.state(), ClientState::Authenticated);
        assert_eq!(server.mechanism(), Some(Mechanism::CookieSha1));
    }

    #[test]
    fn test_cookie_missing_falls_back() {
        let server_dir = TempDir::new().unwrap();
        let client_dir = TempDir::new().unwrap();
        let mut client = ClientAuth::new(Mechanisms::COOKIE_SHA1 | Mechanisms::ANONYMOUS)
            .with_uid(1000)
            .with_keyring(Keyring::new(client_dir.path()));
        let mut server = ServerAuth::new("g5", Mechanisms::COOKIE_SHA1 | Mechanisms::ANONYMOUS)
            .with_local_uid(1000)
            .with_keyring(Keyring::new(server_dir.path()));
        converse(&mut client, &mut server).unwrap();
        assert_eq!(client.mechanism(), Some(Mechanism::Anonymous));
    }

    #[test]
    fn test_expired_cookie_is_not_used() {
        let dir = TempDir::new().unwrap();
        let keyring = Keyring::new(dir.path());
        let now = super::super::cookie::unix_now();
        keyring
            .add(
                COOKIE_CONTEXT,
                Cookie {
                    id: 1,
                    created: now,
                    secret: "abcd".to_string(),
                },
            )
            .unwrap();
        let client = ClientAuth::new(Mechanisms::COOKIE_SHA1).with_keyring(keyring.clone());
        let fresh = hex::encode(format!("{COOKIE_CONTEXT} 1 srv"));
        assert!(client.answer_challenge(&fresh).is_ok());

        let stale_dir = TempDir::new().unwrap();
        std::fs::write(
            stale_dir.path().join(COOKIE_CONTEXT),
            format!("1 {} abcd\n", now - EXPIRE_KEYS_TIMEOUT_SECS - 1),
        )
        .unwrap();
        let client = ClientAuth::new(Mechanisms::COOKIE_SHA1).with_keyring(Keyring::new(stale_dir.path()));
        assert!(matches!(
            client.answer_challenge(&fresh),
            Err(AuthError::Cookie(_))
        ));
    }

    #[test]
    fn test_unexpected_ok_before_start() {
        let mut client = ClientAuth::new(Mechanisms::ALL);
        assert!(client.handle(Command::Ok("x".to_string())).is_err());
    }
}
