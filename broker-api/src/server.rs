//! The axum server builder and the extractors/rejections shared by every
//! handler: a uniform `{"error": "<message>"}` envelope, a bearer-auth
//! extractor that stands in for the original decorator-based auth guard,
//! and a layered `tower` stack (body limits, load shedding, concurrency
//! limiting, timeouts, request tracing).

use std::time::Duration;

use axum::{
    extract::{FromRequest, FromRequestParts, Query, Request},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    BoxError, Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::warn;

use crate::auth::{AuthError, TokenSigner};

/// Tunables for the middleware stack wrapped around every router.
/// Named fields with sane defaults, mirroring how most production axum
/// services configure their `tower` layers.
#[derive(Debug, Clone)]
pub struct LayerConfig {
    pub body_limit_bytes: usize,
    pub handling_timeout: Duration,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            body_limit_bytes: 16 * 1024,
            handling_timeout: Duration::from_secs(15),
        }
    }
}

/// Wrap `router` with the standard middleware stack and serve it on
/// `listener` until `shutdown` fires, waiting out any in-flight requests.
pub async fn serve(
    router: Router<()>,
    listener: TcpListener,
    layer_config: LayerConfig,
    shutdown: common::shutdown::ShutdownChannel,
) -> std::io::Result<()> {
    let router = router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::error_handling::HandleErrorLayer::new(handle_layer_error))
                .layer(TimeoutLayer::new(layer_config.handling_timeout))
                .layer(axum::extract::DefaultBodyLimit::max(
                    layer_config.body_limit_bytes,
                )),
        )
        .fallback(default_fallback);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.recv().await })
    .await
}

async fn handle_layer_error(err: BoxError) -> ApiRejection {
    warn!("middleware layer error: {err:#}");
    if err.is::<tower::timeout::error::Elapsed>() {
        ApiRejection::new(StatusCode::REQUEST_TIMEOUT, "request timed out")
    } else {
        ApiRejection::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

async fn default_fallback() -> ApiRejection {
    ApiRejection::new(StatusCode::NOT_FOUND, "no route for this request")
}

/// Uniform JSON success envelope. Plain [`axum::Json`] underneath; the
/// point of this wrapper is solely to pair with [`ApiRejection`] so every
/// handler's `Result<ApiJson<T>, ApiRejection>` renders consistently.
pub struct ApiJson<T>(pub T);

impl<T: Serialize> IntoResponse for ApiJson<T> {
    fn into_response(self) -> Response {
        Json(self.0).into_response()
    }
}

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiRejection;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

/// The uniform error envelope returned for any handler failure:
/// `{"error": "<message>"}`. Never carries a stack trace or internal detail.
#[derive(Debug)]
pub struct ApiRejection {
    status: StatusCode,
    message: String,
}

impl ApiRejection {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl IntoResponse for ApiRejection {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: &self.message })).into_response()
    }
}

impl From<axum::extract::rejection::JsonRejection> for ApiRejection {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        ApiRejection::bad_request(rejection.body_text())
    }
}

/// Uniform query-string extractor, mirroring [`ApiJson`]: a missing or
/// malformed query parameter renders through the `{"error": "..."}"`
/// envelope instead of axum's default plain-text rejection body.
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection: axum::extract::rejection::QueryRejection| {
                ApiRejection::bad_request(rejection.body_text())
            })?;
        Ok(ApiQuery(value))
    }
}

/// Any type that can hand out a [`TokenSigner`] reference, implemented by
/// the broker's top-level application state so [`BearerAuth`] can extract
/// directly from `State<AppState>` without every handler threading the
/// signer through by hand.
pub trait HasTokenSigner {
    fn token_signer(&self) -> &TokenSigner;
}

/// Extractor that verifies the `Authorization: Bearer <token>` header and
/// yields the authenticated subject. Replaces the original request
/// decorator: any handler that needs auth simply takes a `BearerAuth`
/// argument and axum rejects the request before the handler body runs if
/// the header is missing or the token doesn't verify.
pub struct BearerAuth {
    pub subject: String,
}

impl<S> FromRequestParts<S> for BearerAuth
where
    S: HasTokenSigner + Send + Sync,
{
    type Rejection = ApiRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let Some(header) = header else {
            return Err(ApiRejection::unauthorized("no token provided"));
        };

        let Some(token) = header.strip_prefix("Bearer ") else {
            return Err(ApiRejection::unauthorized("no token provided"));
        };

        match state.token_signer().verify(token) {
            Ok(claims) => Ok(BearerAuth { subject: claims.sub }),
            Err(AuthError::Expired) => {
                warn!("expired bearer token used");
                Err(ApiRejection::unauthorized("token expired"))
            }
            Err(AuthError::Invalid) => {
                warn!("invalid bearer token used");
                Err(ApiRejection::unauthorized("invalid token"))
            }
        }
    }
}

/// Helper for binding the listening socket ahead of building the server
/// future, so callers can observe the bound port (e.g. for tests that bind
/// to port 0) before `serve` takes ownership of it.
pub async fn bind(addr: std::net::SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}
