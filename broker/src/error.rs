//! Per-service error enums and their mapping onto the Gateway's uniform
//! `{"error": "..."}` envelope. Each variant corresponds to one row of the
//! error-disposition table: a client-visible message, an HTTP status, and
//! a log level are all fixed by the variant.

use broker_api::server::ApiRejection;
use http::StatusCode;
use tracing::{info, warn};

/// Errors from `/login`. `/refresh`'s own auth failures never reach this
/// type: they're handled upstream by the `BearerAuth` extractor, which maps
/// straight to [`ApiRejection`] before a handler body ever runs.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("invalid username or TOTP code")]
    CredentialInvalid,
}

impl From<LoginError> for ApiRejection {
    fn from(e: LoginError) -> Self {
        match e {
            LoginError::CredentialInvalid => {
                warn!("credential invalid");
                // Deliberately the same wording an expired/missing bearer
                // token would get: the client must not be able to
                // distinguish "unknown user" from "bad code".
                ApiRejection::unauthorized("invalid username or code")
            }
        }
    }
}

/// Errors from the enrollment endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("invite token is invalid, expired, or exhausted")]
    InviteInvalid(&'static str),
    #[error("username already enrolled")]
    UsernameTaken,
    #[error("username must be 3-32 lowercase alphanumeric characters")]
    UsernameMalformed,
    #[error("no pending enrollment for this token/username")]
    PendingNotFound,
    #[error("TOTP code did not verify")]
    BadTotpCode,
    #[error("request is not from an authorized loopback address")]
    NotLoopback,
    #[error("failed to persist enrollment: {0}")]
    PersistenceFailed(#[source] anyhow::Error),
}

impl From<EnrollmentError> for ApiRejection {
    fn from(e: EnrollmentError) -> Self {
        match &e {
            EnrollmentError::InviteInvalid(reason) => {
                info!("invite invalid: {reason}");
                ApiRejection::new(StatusCode::FORBIDDEN, format!("invite token {reason}"))
            }
            EnrollmentError::UsernameTaken => {
                info!("enrollment username already taken");
                ApiRejection::conflict("username already enrolled")
            }
            EnrollmentError::UsernameMalformed => {
                info!("enrollment username malformed");
                ApiRejection::bad_request(e.to_string())
            }
            EnrollmentError::PendingNotFound | EnrollmentError::BadTotpCode => {
                info!("enrollment confirmation rejected: {e}");
                ApiRejection::bad_request("enrollment confirmation failed")
            }
            EnrollmentError::NotLoopback => {
                warn!("admin endpoint called from non-loopback address");
                ApiRejection::new(StatusCode::FORBIDDEN, "forbidden")
            }
            EnrollmentError::PersistenceFailed(err) => {
                tracing::error!("enrollment persistence failed: {err:#}");
                ApiRejection::internal("failed to persist enrollment")
            }
        }
    }
}

/// Errors from session opening / hypervisor interaction.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no free ephemeral port available")]
    PortExhausted,
    #[error("upstream hypervisor unavailable: {0}")]
    UpstreamUnavailable(#[source] anyhow::Error),
}

impl From<SessionError> for ApiRejection {
    fn from(e: SessionError) -> Self {
        match &e {
            SessionError::PortExhausted => {
                tracing::error!("ephemeral port range exhausted");
                ApiRejection::new(StatusCode::SERVICE_UNAVAILABLE, "no capacity available")
            }
            SessionError::UpstreamUnavailable(err) => {
                tracing::error!("upstream hypervisor unavailable: {err:#}");
                ApiRejection::internal("upstream hypervisor unavailable")
            }
        }
    }
}
