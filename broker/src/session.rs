//! Session Manager: allocates ephemeral ports, creates and tracks
//! forwarding sessions, and reaps ones that outlive their TTL.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use common::shutdown::ShutdownChannel;
use common::time::TimestampSecs;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::SessionError;
use crate::forwarder::Forwarder;
use crate::types::SessionSnapshot;

/// Port reservation + Forwarder retry budget, per the "retry up to 100
/// times" allocation contract.
const MAX_ALLOCATION_ATTEMPTS: usize = 100;

struct Session {
    session_id: String,
    node: String,
    vmid: u32,
    username: String,
    created_at: TimestampSecs,
    forwarder: Forwarder,
}

impl Session {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            node: self.node.clone(),
            vmid: self.vmid,
            username: self.username.clone(),
            created_at: self.created_at,
            ephemeral_port: self.forwarder.port(),
            active_connections: self.forwarder.active_connections(),
        }
    }
}

pub struct SessionManager {
    bind_ip: IpAddr,
    port_min: u16,
    port_max: u16,
    session_timeout: Duration,
    shutdown: ShutdownChannel,
    sessions: Mutex<HashMap<String, Session>>,
}

pub struct OpenedSession {
    pub session_id: String,
    pub ephemeral_port: u16,
}

impl SessionManager {
    pub fn new(
        bind_ip: IpAddr,
        port_min: u16,
        port_max: u16,
        session_timeout: Duration,
        shutdown: ShutdownChannel,
    ) -> Self {
        Self {
            bind_ip,
            port_min,
            port_max,
            session_timeout,
            shutdown,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an ephemeral port, stand up its Forwarder, and record the
    /// session — all under one critical section, so port uniqueness holds
    /// even under concurrent `open_session` calls.
    pub async fn open_session(
        &self,
        node: &str,
        vmid: u32,
        username: &str,
        upstream_addr: SocketAddr,
    ) -> Result<OpenedSession, SessionError> {
        let mut sessions = self.sessions.lock().await;

        let (port, listener) = self.reserve_port(&sessions).await?;

        let forwarder = Forwarder::spawn(
            listener,
            port,
            upstream_addr,
            self.session_timeout,
            self.shutdown.clone(),
        );

        let session_id = generate_session_id();
        sessions.insert(
            session_id.clone(),
            Session {
                session_id: session_id.clone(),
                node: node.to_owned(),
                vmid,
                username: username.to_owned(),
                created_at: TimestampSecs::now(),
                forwarder,
            },
        );

        info!(session_id, node, vmid, port, "opened session");
        Ok(OpenedSession {
            session_id,
            ephemeral_port: port,
        })
    }

    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .lock()
            .await
            .values()
            .map(Session::snapshot)
            .collect()
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Scan for sessions older than the configured TTL, stop their
    /// Forwarder, and drop them. Run on a 60-second tick by the caller.
    pub async fn reap_expired(&self) -> usize {
        let now = TimestampSecs::now();
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| {
                now.as_secs() - s.created_at.as_secs() > self.session_timeout.as_secs() as i64
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.forwarder.stop();
                info!(session_id = %id, "reaped expired session");
            }
        }
        expired.len()
    }

    /// Stop every live Forwarder, for use during graceful shutdown.
    pub async fn stop_all(&self) {
        let sessions = self.sessions.lock().await;
        for session in sessions.values() {
            session.forwarder.stop();
        }
    }

    async fn reserve_port(
        &self,
        sessions: &HashMap<String, Session>,
    ) -> Result<(u16, TcpListener), SessionError> {
        let range = self.port_max - self.port_min;
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let port = self.port_min + rand::thread_rng().gen_range(0..range);
            if sessions.values().any(|s| s.forwarder.port() == port) {
                continue;
            }
            match TcpListener::bind(SocketAddr::new(self.bind_ip, port)).await {
                Ok(listener) => return Ok((port, listener)),
                Err(_) => continue,
            }
        }
        Err(SessionError::PortExhausted)
    }
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
