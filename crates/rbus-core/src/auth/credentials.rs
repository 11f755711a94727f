//! Peer credentials of a Unix socket.

use std::io;

use nix::unistd::{getgid, getpid, getuid};
use tokio::net::UnixStream;

/// Identity of the process at the other end of a Unix socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
    /// Process ID, when the platform reports it.
    pub pid: Option<u32>,
}

impl PeerCredentials {
    /// Credentials reported by the kernel for the peer of `stream`.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
        })
    }

    /// Credentials of this process.
    #[must_use]
    pub fn current_process() -> Self {
        Self {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            pid: u32::try_from(getpid().as_raw()).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_pair_reports_own_uid() {
        let (a, _b) = UnixStream::pair().unwrap();
        let creds = PeerCredentials::from_stream(&a).unwrap();
        let me = PeerCredentials::current_process();
        assert_eq!(creds.uid, me.uid);
        assert_eq!(creds.gid, me.gid);
    }
}
