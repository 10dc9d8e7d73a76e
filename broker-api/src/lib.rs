//! HTTP plumbing shared by the broker binary: the axum server builder,
//! bearer-token minting/verification, and TOTP verification.

pub mod auth;
pub mod server;
pub mod totp;
