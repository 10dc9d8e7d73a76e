//! Login and refresh: the TOTP + bearer-token authentication state machine.

use broker_api::auth::TokenSigner;
use broker_api::totp;
use common::time::TimestampSecs;

use crate::credentials::CredentialStore;
use crate::error::LoginError;

pub struct AuthService<'a> {
    pub credentials: &'a CredentialStore,
    pub signer: &'a TokenSigner,
}

impl<'a> AuthService<'a> {
    pub fn new(credentials: &'a CredentialStore, signer: &'a TokenSigner) -> Self {
        Self { credentials, signer }
    }

    /// `login(username, code) -> token`. Deliberately returns the same
    /// error for "unknown user" and "bad code" so the client can't
    /// enumerate valid usernames.
    pub async fn login(&self, username: &str, totp_code: &str) -> Result<(String, String), LoginError> {
        let username = username.to_lowercase();

        let credential = self
            .credentials
            .get(&username)
            .await
            .ok_or(LoginError::CredentialInvalid)?;

        let verified = totp::verify_code(&credential.totp_secret, totp_code)
            .map_err(|_| LoginError::CredentialInvalid)?;
        if !verified {
            return Err(LoginError::CredentialInvalid);
        }

        let token = self.signer.mint(&username, TimestampSecs::now());
        Ok((token, username))
    }

    /// `refresh(subject) -> token`. The caller has already been
    /// authenticated by the `BearerAuth` extractor; this just mints a
    /// fresh token with a new 15-minute window.
    pub fn refresh(&self, subject: &str) -> String {
        self.signer.mint(subject, TimestampSecs::now())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::UserCredential;

    #[tokio::test]
    async fn login_rejects_unknown_user_and_bad_code_identically() {
        let dir = tempfile::tempdir().unwrap();
        let credentials = CredentialStore::load(dir.path().join("credentials.env")).unwrap();
        credentials
            .insert_and_persist(UserCredential {
                username: "alice".to_owned(),
                totp_secret: "JBSWY3DPEHPK3PXP".to_owned(),
            })
            .await
            .unwrap();

        let signer = TokenSigner::new(b"secret");
        let auth = AuthService::new(&credentials, &signer);

        let unknown_user_err = auth.login("nobody", "000000").await.unwrap_err();
        let bad_code_err = auth.login("alice", "000000").await.unwrap_err();
        assert_eq!(unknown_user_err.to_string(), bad_code_err.to_string());
    }

    #[tokio::test]
    async fn login_succeeds_with_correct_totp_code() {
        let dir = tempfile::tempdir().unwrap();
        let credentials = CredentialStore::load(dir.path().join("credentials.env")).unwrap();
        let secret = broker_api::totp::generate_secret();
        credentials
            .insert_and_persist(UserCredential {
                username: "alice".to_owned(),
                totp_secret: secret.clone(),
            })
            .await
            .unwrap();

        let code = {
            let totp = totp_rs::TOTP::new(
                totp_rs::Algorithm::SHA1,
                6,
                1,
                30,
                totp_rs::Secret::Encoded(secret).to_bytes().unwrap(),
            )
            .unwrap();
            totp.generate_current().unwrap()
        };

        let signer = TokenSigner::new(b"secret");
        let auth = AuthService::new(&credentials, &signer);
        let (_, username) = auth.login("alice", &code).await.unwrap();
        assert_eq!(username, "alice");
    }
}
