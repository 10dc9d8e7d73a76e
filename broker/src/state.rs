//! The broker's explicit application context, passed by reference into
//! every handler instead of relying on process-global state.

use std::collections::HashMap;
use std::sync::Arc;

use broker_api::auth::TokenSigner;
use broker_api::server::HasTokenSigner;
use common::shutdown::ShutdownChannel;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::hypervisor::HypervisorAdapter;
use crate::invites::InviteStore;
use crate::session::SessionManager;
use crate::types::PendingEnrollment;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub credentials: Arc<CredentialStore>,
    pub invites: Arc<InviteStore>,
    pub pending: Arc<Mutex<HashMap<String, PendingEnrollment>>>,
    pub signer: Arc<TokenSigner>,
    pub sessions: Arc<SessionManager>,
    pub hypervisor: Arc<HypervisorAdapter>,
    pub shutdown: ShutdownChannel,
}

impl HasTokenSigner for AppState {
    fn token_signer(&self) -> &TokenSigner {
        &self.signer
    }
}
