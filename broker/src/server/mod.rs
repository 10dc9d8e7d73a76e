//! The HTTP Gateway: route table and handlers. Each handler is a thin
//! translation layer between axum's request/response types and the
//! service-layer calls defined in the sibling modules; none of the
//! actual TOTP, token, invite, session, or hypervisor logic lives here.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use broker_api::server::{ApiJson, ApiQuery, ApiRejection, BearerAuth};
use serde::{Deserialize, Serialize};

use crate::auth_service::AuthService;
use crate::enrollment::{self, EnrollmentService};
use crate::state::AppState;

pub fn router(state: AppState) -> Router<()> {
    Router::new()
        .route("/health", get(health))
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/offer", get(offer))
        .route("/spice/{node}/{vmid}", get(spice))
        .route("/sessions", get(sessions))
        .route("/enroll", get(enroll_validate).post(enroll_submit))
        .route("/admin/generate-token", post(admin_generate_token))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
}

async fn health(State(state): State<AppState>) -> ApiJson<HealthResponse> {
    ApiJson(HealthResponse {
        status: "ok",
        active_sessions: state.sessions.active_session_count().await,
    })
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    totp_code: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    user: String,
}

async fn login(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<LoginRequest>,
) -> Result<ApiJson<LoginResponse>, ApiRejection> {
    let auth = AuthService::new(&state.credentials, &state.signer);
    let (token, user) = auth.login(&body.username, &body.totp_code).await?;
    Ok(ApiJson(LoginResponse { token, user }))
}

#[derive(Serialize)]
struct RefreshResponse {
    token: String,
}

async fn refresh(State(state): State<AppState>, auth: BearerAuth) -> ApiJson<RefreshResponse> {
    let token = AuthService::new(&state.credentials, &state.signer).refresh(&auth.subject);
    ApiJson(RefreshResponse { token })
}

async fn offer(
    State(state): State<AppState>,
    _auth: BearerAuth,
) -> Result<ApiJson<Vec<crate::types::Guest>>, ApiRejection> {
    let guests = state.hypervisor.list_guests().await?;
    Ok(ApiJson(guests))
}

#[derive(Deserialize)]
struct SpiceParams {
    node: String,
    vmid: u32,
}

async fn spice(
    State(state): State<AppState>,
    auth: BearerAuth,
    Path(SpiceParams { node, vmid }): Path<SpiceParams>,
) -> Result<Response, ApiRejection> {
    let ticket = state.hypervisor.open_spice_ticket(&node, vmid).await?;

    // The Forwarder always relays to the hypervisor's own spiceproxy, never
    // to the ticket's `host`/`tls-port` (those identify the VM's raw TLS
    // socket and flow into the `.vv` descriptor below, unchanged).
    let upstream_addr = state
        .hypervisor
        .resolve_spice_upstream(state.config.pve_spice_port)
        .await?;

    let opened = state
        .sessions
        .open_session(&node, vmid, &auth.subject, upstream_addr)
        .await?;

    let descriptor = crate::hypervisor::render_descriptor(
        &ticket,
        &state.config.proxy_public_ip,
        opened.ephemeral_port,
    );

    let filename = format!("spice-{vmid}.vv");
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-virt-viewer".to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        descriptor,
    )
        .into_response())
}

async fn sessions(
    State(state): State<AppState>,
    _auth: BearerAuth,
) -> ApiJson<Vec<crate::types::SessionSnapshot>> {
    ApiJson(state.sessions.list_sessions().await)
}

#[derive(Deserialize)]
struct EnrollValidateQuery {
    token: String,
}

#[derive(Serialize)]
struct EnrollValidateResponse {
    valid: bool,
    message: String,
}

async fn enroll_validate(
    State(state): State<AppState>,
    query: Result<ApiQuery<EnrollValidateQuery>, ApiRejection>,
) -> Result<ApiJson<EnrollValidateResponse>, ApiRejection> {
    // A missing/malformed `token` query parameter and a present-but-invalid
    // one are both 400s: the reference client treats any non-200 response
    // as an error and only proceeds past this check on a literal 200.
    let ApiQuery(query) = query?;
    // Map straight to 400 here rather than via `EnrollmentError`'s shared
    // `ApiRejection` conversion: that conversion renders `InviteInvalid` as
    // 403 for Phase C's `begin` (an authorization-flavored rejection), but
    // Phase B validation must be 400 regardless of the reason.
    let outcome = EnrollmentService {
        invites: &state.invites,
        credentials: &state.credentials,
        pending: &state.pending,
        issuer: &state.config.enrollment_issuer,
    }
    .validate_invite(&query.token)
    .await;
    if let Err(crate::error::EnrollmentError::InviteInvalid(reason)) = outcome {
        return Err(ApiRejection::bad_request(format!("invite token {reason}")));
    }
    Ok(ApiJson(EnrollValidateResponse {
        valid: true,
        message: "invite token is valid".to_owned(),
    }))
}

#[derive(Deserialize)]
struct EnrollSubmitRequest {
    token: String,
    username: String,
    totp_code: Option<String>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum EnrollSubmitResponse {
    Pending {
        status: &'static str,
        secret: String,
        provisioning_uri: String,
    },
    Enrolled {
        status: &'static str,
        username: String,
    },
}

async fn enroll_submit(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<EnrollSubmitRequest>,
) -> Result<(StatusCode, ApiJson<EnrollSubmitResponse>), ApiRejection> {
    let service = EnrollmentService {
        invites: &state.invites,
        credentials: &state.credentials,
        pending: &state.pending,
        issuer: &state.config.enrollment_issuer,
    };

    match body.totp_code {
        None => {
            let begin = service.begin(&body.token, &body.username).await?;
            Ok((
                StatusCode::OK,
                ApiJson(EnrollSubmitResponse::Pending {
                    status: "pending_confirmation",
                    secret: begin.secret,
                    provisioning_uri: begin.provisioning_uri,
                }),
            ))
        }
        Some(totp_code) => {
            service
                .confirm(&body.token, &body.username, &totp_code)
                .await?;
            Ok((
                StatusCode::CREATED,
                ApiJson(EnrollSubmitResponse::Enrolled {
                    status: "enrolled",
                    username: body.username.to_lowercase(),
                }),
            ))
        }
    }
}

#[derive(Deserialize)]
struct GenerateTokenRequest {
    expires_hours: u32,
    max_uses: u32,
}

#[derive(Serialize)]
struct GenerateTokenResponse {
    token: String,
    expires_at: common::time::TimestampSecs,
    max_uses: u32,
}

async fn admin_generate_token(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ApiJson(body): ApiJson<GenerateTokenRequest>,
) -> Result<(StatusCode, ApiJson<GenerateTokenResponse>), ApiRejection> {
    enrollment::require_loopback(peer.ip())?;

    let (token, invite) = state
        .invites
        .generate("admin", body.expires_hours, body.max_uses)
        .await
        .map_err(|_| ApiRejection::internal("failed to persist invite token"))?;

    Ok((
        StatusCode::CREATED,
        ApiJson(GenerateTokenResponse {
            token,
            expires_at: invite.expires_at,
            max_uses: invite.max_uses,
        }),
    ))
}
