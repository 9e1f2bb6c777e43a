//! Read-only credential store with mtime-based auto-reload
//!
//! The on-disk format is one `NAME:hash` record per line; names are
//! uppercase ASCII (at most 30 bytes), hashes are PHC strings produced by
//! a memory-hard password hash. Verification is CPU-bound and therefore
//! runs on the blocking thread pool, never on the event loop.

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};

/// Longest acceptable username, matching the wire field.
pub const MAX_USERNAME: usize = 30;

/// Longest acceptable hash string (excluding the terminator the C side
/// of the ecosystem would add).
const MAX_HASH: usize = 255;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} line {line}: malformed record")]
    Malformed { path: PathBuf, line: usize },

    #[error("auto_reload_user_database requires RUNTIME_DIRECTORY")]
    NoRuntimeDirectory,

    #[error("database reload failed: {0}")]
    Reload(String),

    #[error("password verifier task failed")]
    Worker,
}

#[derive(Default)]
struct DbState {
    users: Option<Arc<HashMap<String, String>>>,
    last_mtime: Option<SystemTime>,
    /// A failed reload is remembered and re-raised until the file's
    /// mtime changes again.
    last_reload_error: Option<String>,
}

pub struct UserDatabase {
    /// Absent path means pass-through: every login is accepted.
    path: Option<PathBuf>,
    /// With auto-reload, checks stat the file and re-open a private copy
    /// under the runtime directory whenever the mtime moved.
    reload_copy: Option<PathBuf>,
    state: Mutex<DbState>,
}

impl UserDatabase {
    /// Opens the database. `runtime_dir` is required when `auto_reload`
    /// is enabled; the initial load happens here so startup fails loudly
    /// on a broken file.
    pub fn open(
        path: Option<&Path>,
        auto_reload: bool,
        runtime_dir: Option<&Path>,
    ) -> Result<Arc<Self>, DatabaseError> {
        let Some(path) = path else {
            info!("no user database configured, accepting all logins");
            return Ok(Arc::new(Self {
                path: None,
                reload_copy: None,
                state: Mutex::new(DbState::default()),
            }));
        };

        let reload_copy = if auto_reload {
            let dir = runtime_dir.ok_or(DatabaseError::NoRuntimeDirectory)?;
            Some(dir.join("user.db"))
        } else {
            None
        };

        let db = Self {
            path: Some(path.to_owned()),
            reload_copy,
            state: Mutex::new(DbState::default()),
        };
        db.reload()?;
        Ok(Arc::new(db))
    }

    /// Checks one credential pair. Usernames are ASCII case-insensitive;
    /// the expensive verification runs off-thread. Dropping the returned
    /// future abandons the check without observing its result.
    pub async fn check(&self, username: &str, password: &[u8]) -> Result<bool, DatabaseError> {
        let users = match self.current()? {
            Some(users) => users,
            None => return Ok(true),
        };

        if username.len() > MAX_USERNAME {
            return Ok(false);
        }

        let hash = match users.get(&username.to_ascii_uppercase()) {
            Some(hash) => hash.clone(),
            None => return Ok(false),
        };

        let password = password.to_vec();
        tokio::task::spawn_blocking(move || verify(&hash, &password))
            .await
            .map_err(|_| DatabaseError::Worker)
    }

    /// Returns the live user map, refreshing it first if auto-reload is
    /// enabled and the file changed on disk.
    fn current(&self) -> Result<Option<Arc<HashMap<String, String>>>, DatabaseError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        if self.reload_copy.is_none() {
            return Ok(self.state.lock().users.clone());
        }

        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|source| DatabaseError::Io {
                path: path.clone(),
                source,
            })?;

        {
            let state = self.state.lock();
            if state.last_mtime == Some(mtime) {
                if let Some(message) = &state.last_reload_error {
                    return Err(DatabaseError::Reload(message.clone()));
                }
                return Ok(state.users.clone());
            }
        }

        debug!(path = %path.display(), "user database changed, reloading");
        match self.reload() {
            Ok(()) => {
                let mut state = self.state.lock();
                state.last_mtime = Some(mtime);
                state.last_reload_error = None;
                Ok(state.users.clone())
            }
            Err(error) => {
                let mut state = self.state.lock();
                state.last_mtime = Some(mtime);
                state.last_reload_error = Some(error.to_string());
                Err(error)
            }
        }
    }

    /// Loads the database, via an atomically-replaced private copy when
    /// auto-reload is enabled.
    fn reload(&self) -> Result<(), DatabaseError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let read_from = match &self.reload_copy {
            Some(copy) => {
                copy_atomically(path, copy)?;
                copy.as_path()
            }
            None => path.as_path(),
        };

        let text = std::fs::read_to_string(read_from).map_err(|source| DatabaseError::Io {
            path: read_from.to_owned(),
            source,
        })?;
        let users = parse(&text, read_from)?;
        info!(
            path = %path.display(),
            users = users.len(),
            "user database loaded"
        );
        self.state.lock().users = Some(Arc::new(users));
        Ok(())
    }
}

/// The PHC-format verifier; success means the stored hash matches.
fn verify(hash: &str, password: &[u8]) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password, &parsed).is_ok(),
        Err(_) => false,
    }
}

fn copy_atomically(from: &Path, to: &Path) -> Result<(), DatabaseError> {
    let staging = to.with_extension("tmp");
    let result = std::fs::copy(from, &staging).and_then(|_| std::fs::rename(&staging, to));
    result.map_err(|source| DatabaseError::Io {
        path: to.to_owned(),
        source,
    })?;
    Ok(())
}

fn parse(text: &str, path: &Path) -> Result<HashMap<String, String>, DatabaseError> {
    let mut users = HashMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let malformed = || DatabaseError::Malformed {
            path: path.to_owned(),
            line: idx + 1,
        };

        let (name, hash) = line.split_once(':').ok_or_else(malformed)?;
        if name.is_empty()
            || name.len() > MAX_USERNAME
            || hash.is_empty()
            || hash.len() > MAX_HASH
        {
            return Err(malformed());
        }

        users.insert(name.to_ascii_uppercase(), hash.to_owned());
    }

    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn temp_dir(tag: &str) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "uologin_db_{tag}_{}_{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn hash_of(password: &str) -> String {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    fn bump_mtime(path: &Path) {
        let file = fs::File::options().append(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(2))
            .unwrap();
    }

    #[tokio::test]
    async fn pass_through_without_database() {
        let db = UserDatabase::open(None, false, None).unwrap();
        assert!(db.check("anyone", b"anything").await.unwrap());
    }

    #[tokio::test]
    async fn checks_credentials_case_insensitively() {
        let dir = temp_dir("check");
        let path = dir.join("user.db");
        fs::write(&path, format!("ALICE:{}\n", hash_of("secret"))).unwrap();

        let db = UserDatabase::open(Some(&path), false, None).unwrap();
        assert!(db.check("ALICE", b"secret").await.unwrap());
        assert!(db.check("alice", b"secret").await.unwrap());
        assert!(db.check("Alice", b"secret").await.unwrap());
        assert!(!db.check("ALICE", b"wrong").await.unwrap());
        assert!(!db.check("BOB", b"secret").await.unwrap());

        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn rejects_overlong_usernames() {
        let dir = temp_dir("long");
        let path = dir.join("user.db");
        fs::write(&path, format!("ALICE:{}\n", hash_of("secret"))).unwrap();

        let db = UserDatabase::open(Some(&path), false, None).unwrap();
        let long = "A".repeat(31);
        assert!(!db.check(&long, b"secret").await.unwrap());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn open_fails_on_malformed_file() {
        let dir = temp_dir("bad");
        let path = dir.join("user.db");
        fs::write(&path, "no separator here\n").unwrap();
        assert!(UserDatabase::open(Some(&path), false, None).is_err());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn auto_reload_requires_runtime_directory() {
        let dir = temp_dir("noruntime");
        let path = dir.join("user.db");
        fs::write(&path, format!("ALICE:{}\n", hash_of("secret"))).unwrap();
        assert!(matches!(
            UserDatabase::open(Some(&path), true, None),
            Err(DatabaseError::NoRuntimeDirectory)
        ));
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn auto_reload_picks_up_changes() {
        let dir = temp_dir("reload");
        let runtime = temp_dir("reload_runtime");
        let path = dir.join("user.db");
        fs::write(&path, format!("ALICE:{}\n", hash_of("secret"))).unwrap();

        let db = UserDatabase::open(Some(&path), true, Some(&runtime)).unwrap();
        assert!(db.check("ALICE", b"secret").await.unwrap());
        assert!(!db.check("BOB", b"hunter2").await.unwrap());

        // the private copy exists next to nothing else in the runtime dir
        assert!(runtime.join("user.db").exists());

        fs::write(
            &path,
            format!("ALICE:{}\nBOB:{}\n", hash_of("secret"), hash_of("hunter2")),
        )
        .unwrap();
        bump_mtime(&path);
        assert!(db.check("BOB", b"hunter2").await.unwrap());

        fs::remove_dir_all(dir).ok();
        fs::remove_dir_all(runtime).ok();
    }

    #[tokio::test]
    async fn reload_errors_are_latched_until_next_change() {
        let dir = temp_dir("latch");
        let runtime = temp_dir("latch_runtime");
        let path = dir.join("user.db");
        fs::write(&path, format!("ALICE:{}\n", hash_of("secret"))).unwrap();

        let db = UserDatabase::open(Some(&path), true, Some(&runtime)).unwrap();
        assert!(db.check("ALICE", b"secret").await.unwrap());

        fs::write(&path, "garbage\n").unwrap();
        bump_mtime(&path);
        assert!(db.check("ALICE", b"secret").await.is_err());
        // unchanged mtime: the saved error is re-raised
        assert!(matches!(
            db.check("ALICE", b"secret").await,
            Err(DatabaseError::Reload(_))
        ));

        fs::write(&path, format!("ALICE:{}\n", hash_of("secret"))).unwrap();
        bump_mtime(&path);
        assert!(db.check("ALICE", b"secret").await.unwrap());

        fs::remove_dir_all(dir).ok();
        fs::remove_dir_all(runtime).ok();
    }
}
