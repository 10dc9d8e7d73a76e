//! Core data model: user credentials, invite tokens, pending enrollments,
//! and session snapshots. See each owning module (`credentials`, `invites`,
//! `enrollment`, `session`) for the behavior built on top of these shapes.

use common::time::TimestampSecs;
use serde::{Deserialize, Serialize};

/// `{username, totp_secret}`. Created by enrollment, never mutated.
#[derive(Debug, Clone)]
pub struct UserCredential {
    pub username: String,
    pub totp_secret: String,
}

/// One completed enrollment recorded against an invite token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledUser {
    pub username: String,
    pub enrolled_at: TimestampSecs,
}

/// A single- or multi-use invite token, persisted to the invite sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteToken {
    pub created_at: TimestampSecs,
    pub expires_at: TimestampSecs,
    pub created_by: String,
    pub max_uses: u32,
    pub uses: u32,
    pub enrolled_users: Vec<EnrolledUser>,
}

impl InviteToken {
    pub fn is_expired(&self, now: TimestampSecs) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.uses >= self.max_uses
    }
}

/// In-memory-only record created by enrollment phase C, consumed by phase D.
#[derive(Debug, Clone)]
pub struct PendingEnrollment {
    pub username: String,
    pub totp_secret: String,
    pub created_at: TimestampSecs,
}

/// A guest VM as reported by the hypervisor adapter's `list_guests`.
#[derive(Debug, Clone, Serialize)]
pub struct Guest {
    #[serde(rename = "type")]
    pub kind: String,
    pub node: String,
    pub name: String,
    pub vmid: u32,
    pub status: String,
}

/// A point-in-time, non-blocking snapshot of a live session, returned by
/// `GET /sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub node: String,
    pub vmid: u32,
    pub username: String,
    pub created_at: TimestampSecs,
    pub ephemeral_port: u16,
    pub active_connections: u32,
}
