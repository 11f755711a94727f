//! Server side of the SASL dialogue.

use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::cookie::{random_hex, COOKIE_CONTEXT};
use super::{Command, Keyring, Mechanism, Mechanisms, PeerCredentials, MAX_AUTH_ATTEMPTS};

const CHALLENGE_BYTES: usize = 16;

/// Server handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for an `AUTH` command.
    WaitAuth,
    /// A cookie challenge was sent; waiting for `DATA`.
    WaitData,
    /// `OK` was sent; waiting for `BEGIN`.
    WaitBegin,
    /// `BEGIN` received.
    Authenticated,
    /// The client is refused.
    Failed,
}

struct CookieChallenge {
    server_challenge: String,
    secret: String,
}

/// Server state machine.
///
/// Feed each parsed client line to [`ServerAuth::handle`] and send back
/// whatever it returns.
pub struct ServerAuth {
    state: ServerState,
    allowed: Mechanisms,
    guid: String,
    peer: Option<PeerCredentials>,
    local_uid: u32,
    keyring: Keyring,
    challenge: Option<CookieChallenge>,
    accepted: Option<Mechanism>,
    uid: Option<u32>,
    rejections: usize,
}

impl ServerAuth {
    /// New server offering `allowed` and answering `OK guid`.
    #[must_use]
    pub fn new(guid: impl Into<String>, allowed: Mechanisms) -> Self {
        Self {
            state: ServerState::WaitAuth,
            allowed,
            guid: guid.into(),
            peer: None,
            local_uid: nix::unistd::getuid().as_raw(),
            keyring: Keyring::for_current_user(),
            challenge: None,
            accepted: None,
            uid: None,
            rejections: 0,
        }
    }

    /// Credentials of the connecting process, when the transport has them.
    #[must_use]
    pub const fn with_peer_credentials(mut self, peer: Option<PeerCredentials>) -> Self {
        self.peer = peer;
        self
    }

    /// Uid that cookie clients must assert. Defaults to the uid of this
    /// process.
    #[must_use]
    pub const fn with_local_uid(mut self, uid: u32) -> Self {
        self.local_uid = uid;
        self
    }

    /// Keyring used for cookie challenges.
    #[must_use]
    pub fn with_keyring(mut self, keyring: Keyring) -> Self {
        self.keyring = keyring;
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ServerState {
        self.state
    }

    /// Mechanism that succeeded.
    #[must_use]
    pub const fn mechanism(&self) -> Option<Mechanism> {
        self.accepted
    }

    /// Uid the client authenticated as; `None` for ANONYMOUS.
    #[must_use]
    pub const fn uid(&self) -> Option<u32> {
        self.uid
    }

    /// Processes one client command, returning the reply to send.
    pub fn handle(&mut self, command: Command) -> Option<Command> {
        use ServerState::{Authenticated, Failed, WaitAuth, WaitBegin, WaitData};

        let reply = match (self.state, command) {
            (Authenticated | Failed, _) => return None,
            (WaitBegin, Command::Begin) => {
                self.state = Authenticated;
                return None;
            },
            (_, Command::Begin) => {
                debug!(state = ?self.state, "BEGIN before authentication");
                self.state = Failed;
                return None;
            },
            (WaitAuth, Command::Auth { mechanism, data }) => {
                self.auth(mechanism.as_deref(), data.as_deref())
            },
            (WaitData, Command::Data(data)) => self.verify_cookie(&data),
            (_, Command::Cancel | Command::Error(_)) => self.reject(),
            (state, command) => {
                debug!(?state, %command, "unexpected SASL command");
                Command::Error(format!("unexpected command in state {state:?}"))
            },
        };
        Some(reply)
    }

    fn auth(&mut self, mechanism: Option<&str>, data: Option<&str>) -> Command {
        let Some(mechanism) = mechanism
            .and_then(Mechanism::from_name)
            .filter(|m| self.allowed.contains(*m))
        else {
            return self.reject();
        };
        match mechanism {
            Mechanism::External => {
                let Some(peer) = self.peer else {
                    debug!("EXTERNAL needs credentials from the transport");
                    return self.reject();
                };
                match data.and_then(decode_uid) {
                    Some(uid) if bool::from(uid.ct_eq(&peer.uid)) => {
                        self.accept(Mechanism::External, Some(uid))
                    },
                    _ => self.reject(),
                }
            },
            Mechanism::Anonymous => self.accept(Mechanism::Anonymous, None),
            Mechanism::CookieSha1 => {
                if data.and_then(decode_uid) != Some(self.local_uid) {
                    return self.reject();
                }
                self.start_cookie()
            },
        }
    }

    fn start_cookie(&mut self) -> Command {
        let cookie = match self.keyring.current_or_create(COOKIE_CONTEXT) {
            Ok(cookie) => cookie,
            Err(e) => {
                debug!(error = %e, "cannot issue cookie challenge");
                return self.reject();
            },
        };
        let server_challenge = random_hex(CHALLENGE_BYTES);
        let data = format!("{COOKIE_CONTEXT} {} {server_challenge}", cookie.id);
        self.challenge = Some(CookieChallenge {
            server_challenge,
            secret: cookie.secret,
        });
        self.state = ServerState::WaitData;
        Command::Data(hex::encode(data))
    }

    fn verify_cookie(&mut self, data: &str) -> Command {
        let Some(challenge) = self.challenge.take() else {
            return self.reject();
        };
        let response = hex::decode(data)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        let Some((client_challenge, digest)) = response
            .as_deref()
            .and_then(|r| r.split_once(' '))
        else {
            return self.reject();
        };
        let expected = cookie_digest(&challenge.server_challenge, client_challenge, &challenge.secret);
        if bool::from(expected.as_bytes().ct_eq(digest.as_bytes())) {
            let uid = self.local_uid;
            self.accept(Mechanism::CookieSha1, Some(uid))
        } else {
            self.reject()
        }
    }

    fn accept(&mut self, mechanism: Mechanism, uid: Option<u32>) -> Command {
        self.accepted = Some(mechanism);
        self.uid = uid;
        self.state = ServerState::WaitBegin;
        Command::Ok(self.guid.clone())
    }

    fn reject(&mut self) -> Command {
        self.challenge = None;
        self.rejections += 1;
        self.state = if self.rejections >= MAX_AUTH_ATTEMPTS {
            ServerState::Failed
        } else {
            ServerState::WaitAuth
        };
        Command::Rejected(self.allowed.names().map(str::to_string).collect())
    }
}

/// Hex SHA-1 of `server:client:secret`.
pub(super) fn cookie_digest(server_challenge: &str, client_challenge: &str, secret: &str) -> String {
    hex::encode(Sha1::digest(
        format!("{server_challenge}:{client_challenge}:{secret}").as_bytes(),
    ))
}

/// Decodes a hex-encoded ASCII decimal uid.
fn decode_uid(data: &str) -> Option<u32> {
    let bytes = hex::decode(data).ok()?;
    std::str::from_utf8(&bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn auth(mechanism: &str, data: Option<&str>) -> Command {
        Command::Auth {
            mechanism: Some(mechanism.to_string()),
            data: data.map(str::to_string),
        }
    }

    fn peer(uid: u32) -> Option<PeerCredentials> {
        Some(PeerCredentials {
            uid,
            gid: uid,
            pid: Some(1),
        })
    }

    #[test]
    fn test_bare_auth_lists_mechanisms() {
        let mut server = ServerAuth::new("guid", Mechanisms::EXTERNAL | Mechanisms::ANONYMOUS);
        let reply = server.handle(Command::Auth {
            mechanism: None,
            data: None,
        });
        assert_eq!(
            reply,
            Some(Command::Rejected(vec![
                "EXTERNAL".to_string(),
                "ANONYMOUS".to_string()
            ]))
        );
        assert_eq!(server.state(), ServerState::WaitAuth);
    }

    #[test]
    fn test_external_matches_peer_uid() {
        let mut server =
            ServerAuth::new("abc", Mechanisms::EXTERNAL).with_peer_credentials(peer(1000));
        let reply = server.handle(auth("EXTERNAL", Some(&hex::encode("1000"))));
        assert_eq!(reply, Some(Command::Ok("abc".to_string())));
        assert_eq!(server.handle(Command::Begin), None);
        assert_eq!(server.state(), ServerState::Authenticated);
        assert_eq!(server.uid(), Some(1000));
        assert_eq!(server.mechanism(), Some(Mechanism::External));
    }

    #[test]
    fn test_external_rejects_wrong_uid() {
        let mut server =
            ServerAuth::new("abc", Mechanisms::EXTERNAL).with_peer_credentials(peer(1000));
        let reply = server.handle(auth("EXTERNAL", Some(&hex::encode("0"))));
        assert!(matches!(reply, Some(Command::Rejected(_))));
        let reply = server.handle(auth("EXTERNAL", None));
        assert!(matches!(reply, Some(Command::Rejected(_))));
    }

    #[test]
    fn test_external_without_credentials_is_rejected() {
        let mut server = ServerAuth::new("abc", Mechanisms::EXTERNAL).with_local_uid(42);
        let reply = server.handle(auth("EXTERNAL", Some(&hex::encode("42"))));
        assert!(matches!(reply, Some(Command::Rejected(_))));
        let reply = server.handle(auth("EXTERNAL", Some(&hex::encode("0"))));
        assert!(matches!(reply, Some(Command::Rejected(_))));
        assert_eq!(server.uid(), None);
        assert_eq!(server.mechanism(), None);
    }

    #[test]
    fn test_disallowed_mechanism_is_rejected() {
        let mut server = ServerAuth::new("abc", Mechanisms::EXTERNAL);
        let reply = server.handle(auth("ANONYMOUS", None));
        assert_eq!(reply, Some(Command::Rejected(vec!["EXTERNAL".to_string()])));
    }

    #[test]
    fn test_begin_too_early_fails() {
        let mut server = ServerAuth::new("abc", Mechanisms::ANONYMOUS);
        assert_eq!(server.handle(Command::Begin), None);
        assert_eq!(server.state(), ServerState::Failed);
    }

    #[test]
    fn test_unexpected_command_gets_error() {
        let mut server = ServerAuth::new("abc", Mechanisms::ANONYMOUS);
        let reply = server.handle(Command::Data("00".to_string()));
        assert!(matches!(reply, Some(Command::Error(_))));
        assert_eq!(server.state(), ServerState::WaitAuth);
    }

    #[test]
    fn test_cancel_returns_to_wait_auth() {
        let mut server = ServerAuth::new("abc", Mechanisms::ANONYMOUS);
        server.handle(auth("ANONYMOUS", None));
        assert_eq!(server.state(), ServerState::WaitBegin);
        let reply = server.handle(Command::Cancel);
        assert!(matches!(reply, Some(Command::Rejected(_))));
        assert_eq!(server.state(), ServerState::WaitAuth);
    }

    #[test]
    fn test_rejection_budget() {
        let mut server = ServerAuth::new("abc", Mechanisms::EXTERNAL);
        for _ in 0..MAX_AUTH_ATTEMPTS {
            server.handle(auth("ANONYMOUS", None));
        }
        assert_eq!(server.state(), ServerState::Failed);
        assert_eq!(server.handle(auth("EXTERNAL", None)), None);
    }

    #[test]
    fn test_cookie_exchange() {
        let dir = TempDir::new().unwrap();
        let keyring = Keyring::new(dir.path());
        let mut server = ServerAuth::new("abc", Mechanisms::COOKIE_SHA1)
            .with_local_uid(7)
            .with_keyring(keyring.clone());

        let Some(Command::Data(challenge)) =
            server.handle(auth("DBUS_COOKIE_SHA1", Some(&hex::encode("7"))))
        else {
            panic!("expected DATA");
        };
        let challenge = String::from_utf8(hex::decode(challenge).unwrap()).unwrap();
        let parts: Vec<&str> = challenge.split(' ').collect();
        assert_eq!(parts[0], COOKIE_CONTEXT);
        let secret = keyring
            .find(COOKIE_CONTEXT, parts[1].parse().unwrap())
            .unwrap()
            .unwrap();

        let digest = cookie_digest(parts[2], "clientnonce", &secret);
        let reply = server.handle(Command::Data(hex::encode(format!("clientnonce {digest}"))));
        assert_eq!(reply, Some(Command::Ok("abc".to_string())));
        assert_eq!(server.uid(), Some(7));
    }

    #[test]
    fn test_cookie_wrong_digest_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut server = ServerAuth::new("abc", Mechanisms::COOKIE_SHA1)
            .with_local_uid(7)
            .with_keyring(Keyring::new(dir.path()));
        server.handle(auth("DBUS_COOKIE_SHA1", Some(&hex::encode("7"))));
        let reply = server.handle(Command::Data(hex::encode("nonce deadbeef")));
        assert!(matches!(reply, Some(Command::Rejected(_))));
        assert_eq!(server.state(), ServerState::WaitAuth);
    }

    #[test]
    fn test_cookie_for_other_user_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut server = ServerAuth::new("abc", Mechanisms::COOKIE_SHA1)
            .with_local_uid(7)
            .with_keyring(Keyring::new(dir.path()));
        let reply = server.handle(auth("DBUS_COOKIE_SHA1", Some(&hex::encode("8"))));
        assert!(matches!(reply, Some(Command::Rejected(_))));
    }
}
