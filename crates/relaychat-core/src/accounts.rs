//! Account registry: username claims and password verification (spec
//! §3, §4.H).
//!
//! Passwords are never stored or compared in the clear — only their
//! `bcrypt` hash. `bcrypt` is a black box here; it is the one crate this
//! workspace carries beyond the teacher's dependency stack, grounded in
//! the original system's own use of `bcrypt.hashpw`/`bcrypt.checkpw` for
//! the same job.
//!
//! The registry models a username as `Option<hashed-password>`, not a
//! plain map to a hash: a freshly claimed (but not yet registered)
//! username maps to `None`. The claim happens at `LOGIN_1`, the moment
//! the username first appears, rather than at `LOGIN_2` when the
//! password is actually set — so two connections racing to claim the
//! same brand-new username both see it as already existing on their
//! second attempt, matching `original_source/server/handler.py`'s
//! `REQ_LOGIN_1` handler (`user_accounts[username] = None`).
//!
//! Unlike messages, accounts are never replicated between nodes — each
//! node's registry is authoritative only for itself, matching the
//! original system (it has no account-sync RPC at all).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

const BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed account file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("password hashing error: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
}

/// Username -> bcrypt password hash, or `None` for a claimed-but-not-yet-
/// registered username. Persisted as a single JSON object.
pub struct AccountRegistry {
    path: PathBuf,
    inner: Mutex<HashMap<String, Option<String>>>,
}

impl AccountRegistry {
    /// Loads the registry from `path`. A missing file is treated as an
    /// empty registry, not an error — a brand-new node has no accounts
    /// yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AccountError> {
        let path = path.into();
        let accounts = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, inner: Mutex::new(accounts) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if `username` is already known, claimed or fully registered.
    pub fn exists(&self, username: &str) -> bool {
        self.inner.lock().unwrap().contains_key(username)
    }

    /// Claims `username` if it isn't already known, inserting a `null`
    /// placeholder (spec §4.G `LOGIN_1`). Returns `true` if this call
    /// performed the claim, `false` if the username already existed —
    /// either claimed or fully registered.
    pub fn claim(&self, username: &str) -> Result<bool, AccountError> {
        let claimed = {
            let mut accounts = self.inner.lock().unwrap();
            if accounts.contains_key(username) {
                false
            } else {
                accounts.insert(username.to_string(), None);
                true
            }
        };
        if claimed {
            self.persist()?;
        }
        Ok(claimed)
    }

    /// True if `username` was claimed but has never had a password set.
    pub fn is_unset(&self, username: &str) -> bool {
        matches!(self.inner.lock().unwrap().get(username), Some(None))
    }

    /// Sets the password hash for a claimed username (spec §4.G
    /// `LOGIN_2`, the "bound account is null" branch).
    pub fn set_password(&self, username: &str, password: &str) -> Result<(), AccountError> {
        let hash = bcrypt::hash(password, BCRYPT_COST)?;
        self.inner.lock().unwrap().insert(username.to_string(), Some(hash));
        self.persist()
    }

    /// Verifies `password` against the stored hash for `username`.
    /// Returns `Ok(false)` (not an error) for an unknown username, a
    /// claimed-but-unset username, or a wrong password alike — the
    /// caller decides how to phrase that to the client.
    pub fn verify(&self, username: &str, password: &str) -> Result<bool, AccountError> {
        let hash = match self.inner.lock().unwrap().get(username).cloned().flatten() {
            Some(h) => h,
            None => return Ok(false),
        };
        Ok(bcrypt::verify(password, &hash)?)
    }

    /// Removes an account. A no-op (not an error) if it never existed.
    pub fn remove(&self, username: &str) -> Result<(), AccountError> {
        let removed = self.inner.lock().unwrap().remove(username).is_some();
        if removed {
            self.persist()?;
        }
        Ok(())
    }

    /// Every known username, sorted. Used for the `LOGIN_SUCCESS`
    /// response payload (spec §6 R02) and as the known-senders set for
    /// [`crate::store::Store::list_unread_counts`] (spec §6 R03).
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn persist(&self) -> Result<(), AccountError> {
        let accounts = self.inner.lock().unwrap();
        let json = serde_json::to_string_pretty(&*accounts)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
