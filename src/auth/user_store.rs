use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use subtle::ConstantTimeEq;

use super::token_store::hash_token;
use super::{write_restricted, CredentialError};

#[derive(Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("user already exists")]
    Duplicate,

    #[error("user not found")]
    NotFound,

    #[error("password hash error: {0}")]
    Hash(String),
}

/// In-memory session bound to a user. Never persisted; survives store
/// reloads as long as the username survives.
#[derive(Debug, Clone)]
struct Session {
    token_hash: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    pub enabled: bool,
    #[serde(default)]
    pub annotation: String,
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(skip)]
    session: Option<Session>,
}

/// List entry; never carries the password hash or session material.
#[derive(Debug, Clone, Serialize)]
pub struct UserDisplay {
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub annotation: String,
    pub failed_attempts: u32,
    pub has_session: bool,
}

/// Issued on successful authentication. The token is shown once; only its
/// hash is kept in memory.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Hash of the session this login superseded, if one was live. A user
    /// has at most one session, so the caller must purge the old hash's
    /// connection pools.
    pub replaced_session_hash: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserFile {
    #[serde(default)]
    users: HashMap<String, User>,
}

/// On-disk user store. Sessions are in-memory only: a reload carries them
/// over for usernames that still exist and drops the rest.
pub struct UserStore {
    path: PathBuf,
    users: RwLock<HashMap<String, User>>,
}

fn hash_password(password: &str) -> Result<String, UserStoreError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| UserStoreError::Hash(e.to_string()))
}

fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn generate_session_token() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl UserStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, UserStoreError> {
        let path = path.into();
        let users = if path.exists() {
            Self::load_file(&path)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    fn load_file(path: &Path) -> Result<HashMap<String, User>, UserStoreError> {
        let raw = std::fs::read_to_string(path)?;
        let file: UserFile = serde_yaml::from_str(&raw)?;
        Ok(file.users)
    }

    fn save_locked(&self, users: &HashMap<String, User>) -> Result<(), UserStoreError> {
        let file = UserFile {
            users: users.clone(),
        };
        let raw = serde_yaml::to_string(&file)?;
        write_restricted(&self.path, raw.as_bytes())?;
        Ok(())
    }

    pub fn add_user(
        &self,
        username: &str,
        password: &str,
        annotation: &str,
    ) -> Result<(), UserStoreError> {
        let password_hash = hash_password(password)?;
        let mut users = self.users.write().unwrap();
        if users.contains_key(username) {
            return Err(UserStoreError::Duplicate);
        }
        users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password_hash,
                created_at: Utc::now(),
                last_login: None,
                enabled: true,
                annotation: annotation.to_string(),
                failed_attempts: 0,
                session: None,
            },
        );
        self.save_locked(&users)
    }

    pub fn update_user(
        &self,
        username: &str,
        new_password: Option<&str>,
        new_annotation: Option<&str>,
    ) -> Result<(), UserStoreError> {
        let password_hash = new_password.map(hash_password).transpose()?;
        let mut users = self.users.write().unwrap();
        let user = users.get_mut(username).ok_or(UserStoreError::NotFound)?;
        if let Some(hash) = password_hash {
            user.password_hash = hash;
        }
        if let Some(annotation) = new_annotation {
            user.annotation = annotation.to_string();
        }
        self.save_locked(&users)
    }

    pub fn set_enabled(&self, username: &str, enabled: bool) -> Result<(), UserStoreError> {
        let mut users = self.users.write().unwrap();
        let user = users.get_mut(username).ok_or(UserStoreError::NotFound)?;
        user.enabled = enabled;
        self.save_locked(&users)
    }

    /// Remove a user; returns the hash of their live session, if any, so
    /// the caller can purge its pools.
    pub fn remove_user(&self, username: &str) -> Result<Option<String>, UserStoreError> {
        let mut users = self.users.write().unwrap();
        let removed = users.remove(username).ok_or(UserStoreError::NotFound)?;
        self.save_locked(&users)?;
        Ok(removed.session.map(|s| s.token_hash))
    }

    pub fn reset_failed_attempts(&self, username: &str) -> Result<(), UserStoreError> {
        let mut users = self.users.write().unwrap();
        let user = users.get_mut(username).ok_or(UserStoreError::NotFound)?;
        user.failed_attempts = 0;
        self.save_locked(&users)
    }

    pub fn list(&self) -> Vec<UserDisplay> {
        let users = self.users.read().unwrap();
        let mut out: Vec<UserDisplay> = users
            .values()
            .map(|u| UserDisplay {
                username: u.username.clone(),
                created_at: u.created_at,
                last_login: u.last_login,
                enabled: u.enabled,
                annotation: u.annotation.clone(),
                failed_attempts: u.failed_attempts,
                has_session: u.session.is_some(),
            })
            .collect();
        out.sort_by(|a, b| a.username.cmp(&b.username));
        out
    }

    /// Verify credentials and mint a session token.
    ///
    /// Mismatches of every kind surface as the same generic error; the
    /// disabled variant is only reported when the password was correct.
    /// `max_failed_attempts == 0` disables lockout entirely.
    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
        max_failed_attempts: u32,
        session_ttl: Duration,
    ) -> Result<SessionGrant, CredentialError> {
        let mut users = self.users.write().unwrap();
        let Some(user) = users.get_mut(username) else {
            return Err(CredentialError::InvalidCredentials);
        };

        if !verify_password(password, &user.password_hash) {
            user.failed_attempts += 1;
            if max_failed_attempts > 0 && user.failed_attempts >= max_failed_attempts {
                user.enabled = false;
                tracing::warn!(username = %username, attempts = user.failed_attempts, "user locked out");
            }
            if let Err(e) = self.save_locked(&users) {
                tracing::warn!(error = %e, "failed to persist failed-attempt counter");
            }
            return Err(CredentialError::InvalidCredentials);
        }

        if !user.enabled {
            return Err(CredentialError::Disabled);
        }

        user.failed_attempts = 0;
        user.last_login = Some(Utc::now());
        let replaced_session_hash = user.session.take().map(|s| s.token_hash);
        let token = generate_session_token();
        let expires_at = Utc::now() + session_ttl;
        user.session = Some(Session {
            token_hash: hash_token(&token),
            expires_at,
        });
        if let Err(e) = self.save_locked(&users) {
            tracing::warn!(error = %e, "failed to persist last-login stamp");
        }
        Ok(SessionGrant {
            token,
            expires_at,
            replaced_session_hash,
        })
    }

    /// Resolve a session token to its username. Linear scan over users;
    /// the store is administrative, not elastic.
    pub fn validate_session_token(&self, token: &str) -> Result<String, CredentialError> {
        let candidate = hash_token(token);
        let users = self.users.read().unwrap();
        let now = Utc::now();
        for user in users.values() {
            let Some(session) = &user.session else {
                continue;
            };
            if candidate
                .as_bytes()
                .ct_eq(session.token_hash.as_bytes())
                .into()
            {
                if now >= session.expires_at {
                    return Err(CredentialError::Expired);
                }
                if !user.enabled {
                    return Err(CredentialError::Disabled);
                }
                return Ok(user.username.clone());
            }
        }
        Err(CredentialError::Unknown)
    }

    /// End the session with the given token hash. Returns the username it
    /// belonged to, if any.
    pub fn end_session(&self, token_hash: &str) -> Option<String> {
        let mut users = self.users.write().unwrap();
        for user in users.values_mut() {
            if user
                .session
                .as_ref()
                .is_some_and(|s| s.token_hash == token_hash)
            {
                user.session = None;
                return Some(user.username.clone());
            }
        }
        None
    }

    /// Re-read the backing file, preserving live sessions for usernames
    /// that still exist. Returns the session hashes that were dropped so
    /// their pools can be closed. On error the previous state is retained.
    pub fn reload(&self) -> Result<Vec<String>, UserStoreError> {
        let mut fresh = Self::load_file(&self.path)?;
        let mut users = self.users.write().unwrap();
        let mut dropped = Vec::new();
        for (username, old) in users.iter() {
            let Some(session) = &old.session else {
                continue;
            };
            match fresh.get_mut(username) {
                Some(new) => new.session = Some(session.clone()),
                None => dropped.push(session.token_hash.clone()),
            }
        }
        *users = fresh;
        Ok(dropped)
    }

    pub fn len(&self) -> usize {
        self.users.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(dir.path().join("users.yaml")).unwrap();
        (dir, store)
    }

    fn ttl() -> Duration {
        Duration::hours(24)
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!hash.contains("correct horse"));
    }

    #[test]
    fn authenticate_issues_session() {
        let (_dir, store) = temp_store();
        store.add_user("alice", "secret", "").unwrap();
        let grant = store.authenticate("alice", "secret", 0, ttl()).unwrap();
        assert!(grant.expires_at > Utc::now());
        assert!(grant.replaced_session_hash.is_none());
        assert_eq!(store.validate_session_token(&grant.token).unwrap(), "alice");
    }

    #[test]
    fn relogin_supersedes_the_previous_session() {
        let (_dir, store) = temp_store();
        store.add_user("alice", "secret", "").unwrap();
        let first = store.authenticate("alice", "secret", 0, ttl()).unwrap();
        let second = store.authenticate("alice", "secret", 0, ttl()).unwrap();

        // The old session's hash comes back so its pools can be purged.
        assert_eq!(
            second.replaced_session_hash.as_deref(),
            Some(hash_token(&first.token).as_str())
        );
        assert!(store.validate_session_token(&first.token).is_err());
        assert_eq!(store.validate_session_token(&second.token).unwrap(), "alice");
    }

    #[test]
    fn unknown_user_and_wrong_password_share_an_error() {
        let (_dir, store) = temp_store();
        store.add_user("alice", "secret", "").unwrap();
        let unknown = store.authenticate("bob", "secret", 0, ttl()).unwrap_err();
        let wrong = store.authenticate("alice", "nope", 0, ttl()).unwrap_err();
        assert_eq!(unknown, CredentialError::InvalidCredentials);
        assert_eq!(wrong, CredentialError::InvalidCredentials);
        assert_eq!(unknown.to_string(), wrong.to_string());
    }

    #[test]
    fn lockout_after_max_failed_attempts() {
        let (_dir, store) = temp_store();
        store.add_user("alice", "secret", "").unwrap();
        for _ in 0..3 {
            let err = store.authenticate("alice", "wrong", 3, ttl()).unwrap_err();
            assert_eq!(err, CredentialError::InvalidCredentials);
        }
        // Correct password now reports the lockout.
        let err = store.authenticate("alice", "secret", 3, ttl()).unwrap_err();
        assert_eq!(err, CredentialError::Disabled);
    }

    #[test]
    fn zero_max_attempts_disables_lockout() {
        let (_dir, store) = temp_store();
        store.add_user("alice", "secret", "").unwrap();
        for _ in 0..10 {
            store.authenticate("alice", "wrong", 0, ttl()).unwrap_err();
        }
        assert!(store.authenticate("alice", "secret", 0, ttl()).is_ok());
    }

    #[test]
    fn success_resets_failed_attempts() {
        let (_dir, store) = temp_store();
        store.add_user("alice", "secret", "").unwrap();
        store.authenticate("alice", "wrong", 5, ttl()).unwrap_err();
        store.authenticate("alice", "secret", 5, ttl()).unwrap();
        let user = &store.list()[0];
        assert_eq!(user.failed_attempts, 0);
        assert!(user.last_login.is_some());
    }

    #[test]
    fn disabled_user_cannot_authenticate_or_validate() {
        let (_dir, store) = temp_store();
        store.add_user("alice", "secret", "").unwrap();
        let grant = store.authenticate("alice", "secret", 0, ttl()).unwrap();
        store.set_enabled("alice", false).unwrap();
        assert_eq!(
            store.authenticate("alice", "secret", 0, ttl()).unwrap_err(),
            CredentialError::Disabled
        );
        assert_eq!(
            store.validate_session_token(&grant.token).unwrap_err(),
            CredentialError::Disabled
        );
    }

    #[test]
    fn session_expiry_boundary_is_closed() {
        let (_dir, store) = temp_store();
        store.add_user("alice", "secret", "").unwrap();
        let grant = store
            .authenticate("alice", "secret", 0, Duration::zero())
            .unwrap();
        // expires_at == now-at-issuance, so validation is already past it.
        assert_eq!(
            store.validate_session_token(&grant.token).unwrap_err(),
            CredentialError::Expired
        );
    }

    #[test]
    fn end_session_invalidates_token() {
        let (_dir, store) = temp_store();
        store.add_user("alice", "secret", "").unwrap();
        let grant = store.authenticate("alice", "secret", 0, ttl()).unwrap();
        let hash = hash_token(&grant.token);
        assert_eq!(store.end_session(&hash), Some("alice".to_string()));
        assert_eq!(
            store.validate_session_token(&grant.token).unwrap_err(),
            CredentialError::Unknown
        );
        // Ending again is a no-op.
        assert_eq!(store.end_session(&hash), None);
    }

    #[test]
    fn reload_preserves_sessions_for_surviving_users() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.yaml");
        let store = UserStore::open(&path).unwrap();
        store.add_user("alice", "secret", "original").unwrap();
        let grant = store.authenticate("alice", "secret", 0, ttl()).unwrap();

        // External edit: change the annotation, keep the username.
        let mut users = UserStore::load_file(&path).unwrap();
        users.get_mut("alice").unwrap().annotation = "edited".to_string();
        let raw = serde_yaml::to_string(&UserFile { users }).unwrap();
        std::fs::write(&path, raw).unwrap();

        let dropped = store.reload().unwrap();
        assert!(dropped.is_empty());
        assert_eq!(store.validate_session_token(&grant.token).unwrap(), "alice");
        assert_eq!(store.list()[0].annotation, "edited");

        // External edit: remove the user entirely.
        let raw = serde_yaml::to_string(&UserFile {
            users: HashMap::new(),
        })
        .unwrap();
        std::fs::write(&path, raw).unwrap();

        let dropped = store.reload().unwrap();
        assert_eq!(dropped, vec![hash_token(&grant.token)]);
        assert_eq!(
            store.validate_session_token(&grant.token).unwrap_err(),
            CredentialError::Unknown
        );
    }

    #[test]
    fn reload_picks_up_disabled_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.yaml");
        let store = UserStore::open(&path).unwrap();
        store.add_user("alice", "secret", "").unwrap();
        let grant = store.authenticate("alice", "secret", 0, ttl()).unwrap();

        let mut users = UserStore::load_file(&path).unwrap();
        users.get_mut("alice").unwrap().enabled = false;
        let raw = serde_yaml::to_string(&UserFile { users }).unwrap();
        std::fs::write(&path, raw).unwrap();

        store.reload().unwrap();
        assert_eq!(
            store.validate_session_token(&grant.token).unwrap_err(),
            CredentialError::Disabled
        );
    }

    #[test]
    fn save_load_round_trip_excludes_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.yaml");
        {
            let store = UserStore::open(&path).unwrap();
            store.add_user("alice", "secret", "ops").unwrap();
            let grant = store.authenticate("alice", "secret", 0, ttl()).unwrap();
            // Session token must not be written to disk.
            let raw = std::fs::read_to_string(&path).unwrap();
            assert!(!raw.contains(&grant.token));
            assert!(!raw.contains(&hash_token(&grant.token)));
        }
        let reopened = UserStore::open(&path).unwrap();
        let listed = reopened.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].username, "alice");
        assert_eq!(listed[0].annotation, "ops");
        assert!(!listed[0].has_session);
    }

    #[cfg(unix)]
    #[test]
    fn user_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, store) = temp_store();
        store.add_user("alice", "secret", "").unwrap();
        let mode = std::fs::metadata(dir.path().join("users.yaml"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
