//! The two-phase self-enrollment protocol, keyed by invite token.
//!
//! Binding the user's authenticator app to the account before the
//! credential becomes usable (phase C then phase D) avoids leaving "ghost"
//! accounts behind if a user abandons setup mid-flow.

use std::collections::HashMap;
use std::sync::LazyLock;

use broker_api::totp;
use common::time::TimestampSecs;
use regex::Regex;
use tokio::sync::Mutex;

use crate::credentials::CredentialStore;
use crate::error::EnrollmentError;
use crate::invites::InviteStore;
use crate::types::{PendingEnrollment, UserCredential};

static USERNAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9]{3,32}$").unwrap());

pub struct EnrollmentService<'a> {
    pub invites: &'a InviteStore,
    pub credentials: &'a CredentialStore,
    pub pending: &'a Mutex<HashMap<String, PendingEnrollment>>,
    pub issuer: &'a str,
}

pub struct BeginEnrollmentResponse {
    pub secret: String,
    pub provisioning_uri: String,
}

impl<'a> EnrollmentService<'a> {
    /// Phase B: validate an invite without consuming it. An absent, invalid,
    /// expired, or exhausted token is a 400 (via the `EnrollmentError` ->
    /// `ApiRejection` mapping), not a 200 carrying a `valid: false` body —
    /// the reference client only advances past this check on a literal 200.
    pub async fn validate_invite(&self, token: &str) -> Result<(), EnrollmentError> {
        self.invites.check_valid(token).await
    }

    /// Phase C: begin enrollment. Generates a fresh TOTP secret and stashes
    /// it in the pending-enrollment map, keyed by invite token value.
    pub async fn begin(
        &self,
        token: &str,
        username: &str,
    ) -> Result<BeginEnrollmentResponse, EnrollmentError> {
        let username = username.to_lowercase();
        if !USERNAME_RE.is_match(&username) {
            return Err(EnrollmentError::UsernameMalformed);
        }
        if self.credentials.contains(&username).await {
            return Err(EnrollmentError::UsernameTaken);
        }
        self.invites.check_valid(token).await?;

        let secret = totp::generate_secret();
        let provisioning_uri = format!(
            "otpauth://totp/{issuer}:{username}?secret={secret}&issuer={issuer}",
            issuer = self.issuer,
        );

        let mut pending = self.pending.lock().await;
        pending.insert(
            token.to_owned(),
            PendingEnrollment {
                username: username.clone(),
                totp_secret: secret.clone(),
                created_at: TimestampSecs::now(),
            },
        );

        Ok(BeginEnrollmentResponse {
            secret,
            provisioning_uri,
        })
    }

    /// Phase D: confirm enrollment by verifying the first TOTP code against
    /// the pending secret, then atomically persisting the credential and
    /// consuming the invite.
    pub async fn confirm(
        &self,
        token: &str,
        username: &str,
        totp_code: &str,
    ) -> Result<(), EnrollmentError> {
        let username = username.to_lowercase();

        let pending_entry = {
            let mut pending = self.pending.lock().await;
            match pending.get(token) {
                Some(entry) if entry.username == username => pending.remove(token).unwrap(),
                _ => return Err(EnrollmentError::PendingNotFound),
            }
        };

        let verified = totp::verify_code(&pending_entry.totp_secret, totp_code)
            .map_err(|_| EnrollmentError::BadTotpCode)?;
        if !verified {
            return Err(EnrollmentError::BadTotpCode);
        }

        self.credentials
            .insert_and_persist(UserCredential {
                username: username.clone(),
                totp_secret: pending_entry.totp_secret,
            })
            .await
            .map_err(EnrollmentError::PersistenceFailed)?;

        self.invites.consume(token, &username).await
    }
}

/// Phase A's loopback check, applied to `/admin/generate-token`.
pub fn require_loopback(addr: std::net::IpAddr) -> Result<(), EnrollmentError> {
    if addr.is_loopback() {
        Ok(())
    } else {
        Err(EnrollmentError::NotLoopback)
    }
}
