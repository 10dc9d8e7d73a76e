//! TOTP (RFC 6238) verification, matching the original `pyotp` tolerance of
//! one 30-second step on either side of the server's clock.

use totp_rs::{Algorithm, Secret, TOTP};

/// Number of 30-second steps accepted on either side of "now", so that
/// minor clock drift between the broker and a user's authenticator app
/// doesn't lock the user out.
const VALID_WINDOW_STEPS: u64 = 1;
const STEP_SECONDS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum TotpError {
    #[error("malformed TOTP secret")]
    BadSecret,
}

/// Verify a 6-digit TOTP `code` against a base32-encoded `secret`, accepting
/// codes valid for the current step or the step immediately before/after it.
pub fn verify_code(secret_base32: &str, code: &str) -> Result<bool, TotpError> {
    let totp = build_totp(secret_base32)?;
    let now = chrono::Utc::now().timestamp() as u64;

    for step_offset in 0..=VALID_WINDOW_STEPS {
        let candidates = if step_offset == 0 {
            vec![now]
        } else {
            vec![
                now.saturating_sub(step_offset * STEP_SECONDS),
                now + step_offset * STEP_SECONDS,
            ]
        };
        for ts in candidates {
            if totp
                .check(code, ts)
            {
                return Ok(true);
            }
        }
    }

    Ok(false)
}

/// Generate a fresh random base32 TOTP secret, for use during enrollment.
pub fn generate_secret() -> String {
    Secret::generate_secret().to_encoded().to_string()
}

fn build_totp(secret_base32: &str) -> Result<TOTP, TotpError> {
    let secret = Secret::Encoded(secret_base32.to_owned())
        .to_bytes()
        .map_err(|_| TotpError::BadSecret)?;
    TOTP::new(Algorithm::SHA1, 6, 1, STEP_SECONDS, secret).map_err(|_| TotpError::BadSecret)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_secret_produces_verifiable_codes() {
        let secret = generate_secret();
        let totp = build_totp(&secret).unwrap();
        let now = chrono::Utc::now().timestamp() as u64;
        let code = totp.generate(now);
        assert!(verify_code(&secret, &code).unwrap());
    }

    #[test]
    fn wrong_code_is_rejected() {
        let secret = generate_secret();
        assert!(!verify_code(&secret, "000000").unwrap());
    }
}
