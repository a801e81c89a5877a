use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use subtle::ConstantTimeEq;

use super::{write_restricted, CredentialError};

/// First 12 hex chars of the hash, shown in list output instead of the
/// full digest.
pub const DISPLAY_PREFIX_LEN: usize = 12;
/// Minimum identifier length accepted for removal by hash prefix.
pub const MIN_REMOVE_PREFIX_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("token already exists")]
    Duplicate,

    #[error("identifier matches {0} tokens, not removing any")]
    Ambiguous(usize),

    #[error("token not found")]
    NotFound,
}

/// A service token at rest. Only the SHA-256 digest of the bearer value is
/// stored; the plaintext exists once, at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceToken {
    pub hash: String,
    pub created_at: DateTime<Utc>,
    /// Absent means the token never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub annotation: String,
    /// Optional single-database scope for this token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_database: Option<String>,
}

impl ServiceToken {
    /// Closed interval: a token whose expiry equals `now` is expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }
}

/// List entry. Never carries the full hash.
#[derive(Debug, Clone, Serialize)]
pub struct TokenDisplay {
    pub id: String,
    pub hash_prefix: String,
    pub annotation: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
    pub bound_database: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemovedToken {
    pub id: String,
    pub hash: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: HashMap<String, ServiceToken>,
}

/// On-disk service-token store. The YAML file is the source of truth on
/// restart; the in-memory map is replaced wholesale on reload.
pub struct TokenStore {
    path: PathBuf,
    tokens: RwLock<HashMap<String, ServiceToken>>,
}

/// SHA-256 hash of a plaintext credential, returned as hex. The same
/// function keys service tokens, session tokens, and connection pools.
pub fn hash_token(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new plaintext bearer token with the `pgmcp_` prefix
/// (32 random bytes, URL-safe base64).
pub fn generate_token() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("pgmcp_{}", URL_SAFE_NO_PAD.encode(bytes))
}

impl TokenStore {
    /// Open the store, loading the file if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TokenStoreError> {
        let path = path.into();
        let tokens = if path.exists() {
            Self::load_file(&path)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            tokens: RwLock::new(tokens),
        })
    }

    fn load_file(path: &Path) -> Result<HashMap<String, ServiceToken>, TokenStoreError> {
        let raw = std::fs::read_to_string(path)?;
        let file: TokenFile = serde_yaml::from_str(&raw)?;
        Ok(file.tokens)
    }

    fn save_locked(&self, tokens: &HashMap<String, ServiceToken>) -> Result<(), TokenStoreError> {
        let file = TokenFile {
            tokens: tokens.clone(),
        };
        let raw = serde_yaml::to_string(&file)?;
        write_restricted(&self.path, raw.as_bytes())?;
        Ok(())
    }

    /// Emit fresh token material and its hash. The plaintext is returned
    /// exactly once and never stored.
    pub fn generate() -> (String, String) {
        let plaintext = generate_token();
        let hash = hash_token(&plaintext);
        (plaintext, hash)
    }

    /// Insert a token record and persist. Fails on a duplicate hash or id.
    pub fn add(
        &self,
        hash: &str,
        annotation: &str,
        expires_at: Option<DateTime<Utc>>,
        bound_database: Option<String>,
    ) -> Result<String, TokenStoreError> {
        let mut tokens = self.tokens.write().unwrap();
        if tokens.values().any(|t| t.hash == hash) {
            return Err(TokenStoreError::Duplicate);
        }
        let id = uuid::Uuid::new_v4().to_string();
        if tokens.contains_key(&id) {
            return Err(TokenStoreError::Duplicate);
        }
        tokens.insert(
            id.clone(),
            ServiceToken {
                hash: hash.to_string(),
                created_at: Utc::now(),
                expires_at,
                annotation: annotation.to_string(),
                bound_database,
            },
        );
        self.save_locked(&tokens)?;
        Ok(id)
    }

    /// Remove by full id or by a hash prefix of at least
    /// [`MIN_REMOVE_PREFIX_LEN`] chars. Ambiguous identifiers remove
    /// nothing. Returns the removed hash so pool entries can be purged.
    pub fn remove(&self, id_or_prefix: &str) -> Result<RemovedToken, TokenStoreError> {
        let mut tokens = self.tokens.write().unwrap();
        let matches: Vec<String> = tokens
            .iter()
            .filter(|(id, t)| {
                id.as_str() == id_or_prefix
                    || (id_or_prefix.len() >= MIN_REMOVE_PREFIX_LEN
                        && t.hash.starts_with(id_or_prefix))
            })
            .map(|(id, _)| id.clone())
            .collect();
        match matches.len() {
            0 => Err(TokenStoreError::NotFound),
            1 => {
                let id = matches.into_iter().next().unwrap();
                let removed = tokens.remove(&id).unwrap();
                self.save_locked(&tokens)?;
                Ok(RemovedToken {
                    id,
                    hash: removed.hash,
                })
            }
            n => Err(TokenStoreError::Ambiguous(n)),
        }
    }

    /// Hash the presented plaintext and compare against every stored hash
    /// without short-circuiting on the match.
    pub fn validate(&self, plaintext: &str) -> Result<(), CredentialError> {
        let candidate = hash_token(plaintext);
        let tokens = self.tokens.read().unwrap();
        let mut matched: Option<ServiceToken> = None;
        for token in tokens.values() {
            if candidate.as_bytes().ct_eq(token.hash.as_bytes()).into() {
                matched = Some(token.clone());
            }
        }
        match matched {
            None => Err(CredentialError::Unknown),
            Some(token) if token.is_expired_at(Utc::now()) => Err(CredentialError::Expired),
            Some(_) => Ok(()),
        }
    }

    /// Look up a token record by its full hash. Used to resolve a service
    /// token's database binding from a request context.
    pub fn get_by_hash(&self, hash: &str) -> Option<ServiceToken> {
        let tokens = self.tokens.read().unwrap();
        tokens.values().find(|t| t.hash == hash).cloned()
    }

    pub fn list(&self) -> Vec<TokenDisplay> {
        let now = Utc::now();
        let tokens = self.tokens.read().unwrap();
        let mut out: Vec<TokenDisplay> = tokens
            .iter()
            .map(|(id, t)| TokenDisplay {
                id: id.clone(),
                hash_prefix: t.hash.chars().take(DISPLAY_PREFIX_LEN).collect(),
                annotation: t.annotation.clone(),
                created_at: t.created_at,
                expires_at: t.expires_at,
                expired: t.is_expired_at(now),
                bound_database: t.bound_database.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Drop every expired token, persist, and return the removed hashes
    /// for pool purging.
    pub fn cleanup_expired(&self) -> Result<(usize, Vec<String>), TokenStoreError> {
        let now = Utc::now();
        let mut tokens = self.tokens.write().unwrap();
        let expired_ids: Vec<String> = tokens
            .iter()
            .filter(|(_, t)| t.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();
        let mut hashes = Vec::with_capacity(expired_ids.len());
        for id in &expired_ids {
            if let Some(t) = tokens.remove(id) {
                hashes.push(t.hash);
            }
        }
        if !hashes.is_empty() {
            self.save_locked(&tokens)?;
        }
        Ok((hashes.len(), hashes))
    }

    /// Re-read the backing file and replace the in-memory map in one step.
    /// Returns the hashes that disappeared so their pools can be closed.
    /// On error the previous in-memory state is retained.
    pub fn reload(&self) -> Result<Vec<String>, TokenStoreError> {
        let fresh = Self::load_file(&self.path)?;
        let mut tokens = self.tokens.write().unwrap();
        let new_hashes: std::collections::HashSet<&str> =
            fresh.values().map(|t| t.hash.as_str()).collect();
        let removed: Vec<String> = tokens
            .values()
            .filter(|t| !new_hashes.contains(t.hash.as_str()))
            .map(|t| t.hash.clone())
            .collect();
        *tokens = fresh;
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.tokens.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
