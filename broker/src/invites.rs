//! Invite-token table: creation, validation, atomic consumption, and
//! persistence to a JSON sidecar file.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use common::time::TimestampSecs;
use rand::RngCore;
use tokio::sync::Mutex;

use crate::error::EnrollmentError;
use crate::persistence;
use crate::types::{EnrolledUser, InviteToken};

pub struct InviteStore {
    path: PathBuf,
    tokens: Mutex<HashMap<String, InviteToken>>,
}

impl InviteStore {
    /// Load the sidecar, dropping any already-expired entries and
    /// rewriting the file so the on-disk state matches what's loaded.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let now = TimestampSecs::now();

        let mut tokens: HashMap<String, InviteToken> = match persistence::read_if_exists(&path)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => HashMap::new(),
        };
        tokens.retain(|_, invite| !invite.is_expired(now));

        let store = Self {
            path,
            tokens: Mutex::new(tokens),
        };
        store.persist_sync()?;
        Ok(store)
    }

    /// Mint a new invite token with `≥256 bits` of entropy, valid for
    /// `expires_hours` hours and usable `max_uses` times.
    pub async fn generate(
        &self,
        created_by: &str,
        expires_hours: u32,
        max_uses: u32,
    ) -> anyhow::Result<(String, InviteToken)> {
        let value = generate_token_value();
        let now = TimestampSecs::now();
        let invite = InviteToken {
            created_at: now,
            expires_at: now.plus(std::time::Duration::from_secs(
                u64::from(expires_hours) * 3600,
            )),
            created_by: created_by.to_owned(),
            max_uses: max_uses.max(1),
            uses: 0,
            enrolled_users: Vec::new(),
        };

        let mut tokens = self.tokens.lock().await;
        tokens.insert(value.clone(), invite.clone());
        self.persist_locked(&tokens)?;
        Ok((value, invite))
    }

    /// Validate (without consuming) an invite token for `GET /enroll`.
    pub async fn check_valid(&self, value: &str) -> Result<(), EnrollmentError> {
        let tokens = self.tokens.lock().await;
        let now = TimestampSecs::now();
        match tokens.get(value) {
            None => Err(EnrollmentError::InviteInvalid("does not exist")),
            Some(invite) if invite.is_expired(now) => Err(EnrollmentError::InviteInvalid("expired")),
            Some(invite) if invite.is_exhausted() => Err(EnrollmentError::InviteInvalid("exhausted")),
            Some(_) => Ok(()),
        }
    }

    /// Atomically consume one use of `value` for `username`, persisting the
    /// mutation under the same critical section that performed the check.
    ///
    /// An exhausted invite is kept in the in-memory table (so a subsequent
    /// validation still reports "exhausted" rather than "does not exist")
    /// but is dropped from the next write of the sidecar file, per the
    /// "absent from the sidecar on next load" consumption invariant; it is
    /// removed from memory the ordinary way, by the expiry reaper, once its
    /// `expires_at` passes.
    pub async fn consume(&self, value: &str, username: &str) -> Result<(), EnrollmentError> {
        let mut tokens = self.tokens.lock().await;
        let now = TimestampSecs::now();

        let invite = tokens
            .get_mut(value)
            .ok_or(EnrollmentError::InviteInvalid("does not exist"))?;

        if invite.is_expired(now) {
            return Err(EnrollmentError::InviteInvalid("expired"));
        }
        if invite.is_exhausted() {
            return Err(EnrollmentError::InviteInvalid("used"));
        }

        invite.uses += 1;
        invite.enrolled_users.push(EnrolledUser {
            username: username.to_owned(),
            enrolled_at: now,
        });

        self.persist_locked(&tokens)
            .map_err(EnrollmentError::PersistenceFailed)
    }

    /// Drop expired tokens; called by the periodic invite reaper.
    pub async fn reap_expired(&self) -> anyhow::Result<usize> {
        let mut tokens = self.tokens.lock().await;
        let now = TimestampSecs::now();
        let before = tokens.len();
        tokens.retain(|_, invite| !invite.is_expired(now));
        let reaped = before - tokens.len();
        if reaped > 0 {
            self.persist_locked(&tokens)?;
        }
        Ok(reaped)
    }

    /// Serialize every non-exhausted invite. An exhausted single-use token
    /// stays valid to look up in memory (for error-message fidelity) but
    /// must never reappear after a restart, so it's excluded here rather
    /// than at removal time.
    fn persist_locked(&self, tokens: &HashMap<String, InviteToken>) -> anyhow::Result<()> {
        let persistable: HashMap<&String, &InviteToken> = tokens
            .iter()
            .filter(|(_, invite)| !invite.is_exhausted())
            .collect();
        let rendered = serde_json::to_vec_pretty(&persistable)?;
        persistence::write_atomic(&self.path, &rendered)
    }

    fn persist_sync(&self) -> anyhow::Result<()> {
        // Called only during `load`, before any other task can observe
        // `self`, so a blocking try_lock is always immediately available.
        let tokens = self.tokens.try_lock().expect("exclusive during load");
        self.persist_locked(&tokens)
    }
}

fn generate_token_value() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
