//! `DBUS_COOKIE_SHA1` keyring.
//!
//! Each context has a file `<dir>/<context>` with one cookie per line:
//!
//! ```text
//! <id> <unix timestamp> <hex secret>
//! ```
//!
//! Writers serialize on `<dir>/<context>.lock` and replace the keyring file
//! atomically, dropping expired cookies on every write.
//!
//! # Security Considerations
//!
//! - The keyring directory is created with mode `0700` and the keyring file
//!   is written with mode `0600`.
//! - Context names are validated before they become file names, since the
//!   client receives them from the server.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use rand::RngCore;
use tracing::{debug, warn};

use super::AuthError;

/// Context used by the bus for every cookie.
pub const COOKIE_CONTEXT: &str = "org_freedesktop_general";

/// Cookies older than this are expired.
pub const EXPIRE_KEYS_TIMEOUT_SECS: i64 = 7 * 60;

/// A cookie younger than this is reused instead of creating a new one.
pub const NEW_KEY_TIMEOUT_SECS: i64 = 5 * 60;

/// Cookies dated further than this in the future are rejected.
pub const MAX_TIME_TRAVEL_SECS: i64 = 5 * 60;

/// How long a writer waits for the keyring lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);
const SECRET_BYTES: usize = 24;

/// One keyring entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Identifier sent in the server challenge.
    pub id: u64,
    /// Creation time in seconds since the epoch.
    pub created: i64,
    /// Hex-encoded secret.
    pub secret: String,
}

impl Cookie {
    /// Returns `true` if the cookie is usable at time `now`.
    #[must_use]
    pub const fn is_valid_at(&self, now: i64) -> bool {
        !(self.created < 0
            || now + MAX_TIME_TRAVEL_SECS < self.created
            || now - EXPIRE_KEYS_TIMEOUT_SECS > self.created)
    }

    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let id = parts.next()?.parse().ok()?;
        let created = parts.next()?.parse().ok()?;
        let secret = parts.next()?.to_string();
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            id,
            created,
            secret,
        })
    }
}

/// A directory of cookie files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyring {
    dir: PathBuf,
}

impl Keyring {
    /// Keyring rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Keyring at `~/.dbus-keyrings` of the current user.
    #[must_use]
    pub fn for_current_user() -> Self {
        Self::new(default_location())
    }

    /// Keyring directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Looks up the secret of cookie `id`, ignoring expired cookies.
    pub fn find(&self, context: &str, id: u64) -> Result<Option<String>, AuthError> {
        self.find_at(context, id, unix_now())
    }

    /// Like [`Keyring::find`] with an explicit clock.
    pub fn find_at(&self, context: &str, id: u64, now: i64) -> Result<Option<String>, AuthError> {
        Ok(self
            .load(context)?
            .into_iter()
            .find(|c| c.id == id && c.is_valid_at(now))
            .map(|c| c.secret))
    }

    /// Reads every well-formed entry of a context; a missing file is empty.
    pub fn load(&self, context: &str) -> Result<Vec<Cookie>, AuthError> {
        validate_context(context)?;
        let path = self.dir.join(context);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AuthError::cookie(format!(
                    "reading {}: {e}",
                    path.display()
                )));
            },
        };
        Ok(content
            .lines()
            .filter_map(|line| {
                let cookie = Cookie::parse(line);
                if cookie.is_none() && !line.trim().is_empty() {
                    debug!(path = %path.display(), "skipping malformed keyring line");
                }
                cookie
            })
            .collect())
    }

    /// Returns a recent cookie, creating one if none is young enough.
    pub fn current_or_create(&self, context: &str) -> Result<Cookie, AuthError> {
        let now = unix_now();
        self.with_lock(context, |cookies| {
            if let Some(cookie) = cookies
                .iter()
                .filter(|c| c.is_valid_at(now) && now - c.created < NEW_KEY_TIMEOUT_SECS)
                .max_by_key(|c| c.created)
            {
                return (cookie.clone(), false);
            }
            let id = cookies.iter().map(|c| c.id).max().unwrap_or(0) + 1;
            let cookie = Cookie {
                id,
                created: now,
                secret: random_hex(SECRET_BYTES),
            };
            cookies.push(cookie.clone());
            (cookie, true)
        })
    }

    /// Appends a cookie as-is.
    pub fn add(&self, context: &str, cookie: Cookie) -> Result<(), AuthError> {
        self.with_lock(context, |cookies| {
            cookies.push(cookie);
            ((), true)
        })
    }

    /// Runs `update` on the unexpired cookies under the keyring lock and
    /// rewrites the file if it reports a change.
    fn with_lock<T>(
        &self,
        context: &str,
        update: impl FnOnce(&mut Vec<Cookie>) -> (T, bool),
    ) -> Result<T, AuthError> {
        validate_context(context)?;
        create_dir_private(&self.dir)?;

        let lock_path = self.dir.join(format!("{context}.lock"));
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| AuthError::cookie(format!("opening {}: {e}", lock_path.display())))?;
        let deadline = Instant::now() + LOCK_TIMEOUT;
        while let Err(e) = lock.try_lock_exclusive() {
            if Instant::now() >= deadline {
                return Err(AuthError::cookie(format!(
                    "keyring {} is locked: {e}",
                    lock_path.display()
                )));
            }
            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }

        let now = unix_now();
        let before = self.load(context)?;
        let mut cookies: Vec<Cookie> = before.iter().filter(|c| c.is_valid_at(now)).cloned().collect();
        let pruned = cookies.len() != before.len();
        let (result, changed) = update(&mut cookies);
        if changed || pruned {
            self.write(context, &cookies)?;
        }
        if let Err(e) = lock.unlock() {
            warn!(path = %lock_path.display(), error = %e, "failed to release keyring lock");
        }
        Ok(result)
    }

    fn write(&self, context: &str, cookies: &[Cookie]) -> Result<(), AuthError> {
        let target = self.dir.join(context);
        let mut content = String::new();
        for cookie in cookies {
            content.push_str(&format!("{} {} {}\n", cookie.id, cookie.created, cookie.secret));
        }

        let temp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| AuthError::cookie(format!("creating temp file: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600)) {
                warn!(path = %temp.path().display(), error = %e, "failed to set keyring permissions");
            }
        }
        let mut file = temp.as_file();
        file.write_all(content.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| AuthError::cookie(format!("writing keyring: {e}")))?;
        temp.persist(&target)
            .map_err(|e| AuthError::cookie(format!("replacing {}: {}", target.display(), e.error)))?;
        Ok(())
    }
}

/// Default keyring directory of the current user.
fn default_location() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| {
            nix::unistd::User::from_uid(nix::unistd::getuid())
                .ok()
                .flatten()
                .map(|u| u.dir)
        })
        .unwrap_or_else(std::env::temp_dir);
    home.join(".dbus-keyrings")
}

fn validate_context(context: &str) -> Result<(), AuthError> {
    let valid = !context.is_empty()
        && !context.starts_with('.')
        && context
            .chars()
            .all(|c| !c.is_whitespace() && !c.is_control() && c != '/' && c != '\\');
    if valid {
        Ok(())
    } else {
        Err(AuthError::cookie(format!("invalid cookie context {context:?}")))
    }
}

fn create_dir_private(dir: &Path) -> Result<(), AuthError> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .map_err(|e| AuthError::cookie(format!("creating {}: {e}", dir.display())))
}

pub(super) fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub(super) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
