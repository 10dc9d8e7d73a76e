//! User credential store: `username -> totp_secret`, loaded at startup from
//! an environment-style file and atomically rewritten on every new
//! enrollment.
//!
//! The original broker appended `TOTP_SECRET_<USER>=...` lines to a shared
//! config file on a best-effort basis; per the canonical design here (§9 of
//! the expanded spec) new credentials are written through the same
//! atomic-rename sidecar pattern used for invite tokens, so a crash mid-write
//! never corrupts or loses existing credentials.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::Mutex;

use crate::persistence;
use crate::types::UserCredential;

const PREFIX: &str = "TOTP_SECRET_";

pub struct CredentialStore {
    path: PathBuf,
    users: Mutex<HashMap<String, UserCredential>>,
}

impl CredentialStore {
    /// Load credentials from `path`, tolerating a missing file (first run).
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let users = match persistence::read_if_exists(&path)? {
            Some(bytes) => parse(&String::from_utf8(bytes)?),
            None => HashMap::new(),
        };
        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    pub async fn get(&self, username: &str) -> Option<UserCredential> {
        self.users.lock().await.get(username).cloned()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.users.lock().await.contains_key(username)
    }

    /// Insert a new credential and atomically rewrite the backing file.
    /// On a persistence failure, the in-memory map is rolled back so the
    /// two never disagree about which users are enrolled.
    pub async fn insert_and_persist(&self, cred: UserCredential) -> anyhow::Result<()> {
        let mut users = self.users.lock().await;
        let username = cred.username.clone();
        users.insert(username.clone(), cred);

        let rendered = render(&users);
        if let Err(e) = persistence::write_atomic(&self.path, rendered.as_bytes()) {
            users.remove(&username);
            return Err(e);
        }
        Ok(())
    }
}

fn parse(contents: &str) -> HashMap<String, UserCredential> {
    let mut users = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(rest) = line.strip_prefix(PREFIX) else {
            continue;
        };
        let Some((user_upper, secret)) = rest.split_once('=') else {
            continue;
        };
        let username = user_upper.to_lowercase();
        users.insert(
            username.clone(),
            UserCredential {
                username,
                totp_secret: secret.to_owned(),
            },
        );
    }
    users
}

fn render(users: &HashMap<String, UserCredential>) -> String {
    let mut usernames: Vec<&String> = users.keys().collect();
    usernames.sort();

    let mut out = String::new();
    for username in usernames {
        let cred = &users[username];
        out.push_str(PREFIX);
        out.push_str(&username.to_uppercase());
        out.push('=');
        out.push_str(&cred.totp_secret);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("credentials.env")).unwrap();
        assert!(!store.contains("alice").await);
    }

    #[tokio::test]
    async fn insert_then_reload_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.env");
        let store = CredentialStore::load(&path).unwrap();
        store
            .insert_and_persist(UserCredential {
                username: "alice".to_owned(),
                totp_secret: "JBSWY3DPEHPK3PXP".to_owned(),
            })
            .await
            .unwrap();

        let reloaded = CredentialStore::load(&path).unwrap();
        let cred = reloaded.get("alice").await.unwrap();
        assert_eq!(cred.totp_secret, "JBSWY3DPEHPK3PXP");
    }
}
