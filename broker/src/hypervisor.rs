//! Hypervisor Adapter: a thin outbound REST client against the upstream
//! hypervisor's API, plus SPICE `.vv` descriptor rendering.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::lookup_host;

use crate::error::SessionError;
use crate::types::Guest;

const LIST_TIMEOUT: Duration = Duration::from_secs(5);
const TICKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Keys recognized in an upstream `spiceproxy` response and carried through
/// into the rendered `.vv` descriptor, in the exact order they must appear.
/// `proxy` is always overwritten by the broker before rendering.
const VV_FILE_FIELDS: &[&str] = &[
    "release-cursor",
    "proxy",
    "secure-attention",
    "host-subject",
    "ca",
    "delete-this-file",
    "type",
    "title",
    "tls-port",
    "toggle-fullscreen",
    "host",
    "password",
];

pub struct HypervisorAdapter {
    client: reqwest::Client,
    host: String,
    api_token: String,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct NodeEntry {
    node: String,
}

#[derive(Deserialize)]
struct QemuEntry {
    vmid: u32,
    name: Option<String>,
    status: String,
}

impl HypervisorAdapter {
    pub fn new(host: String, api_token: String, tls_insecure: bool) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(tls_insecure)
            .build()?;
        Ok(Self {
            client,
            host,
            api_token,
        })
    }

    fn base_url(&self) -> String {
        format!("https://{}:8006/api2/json", self.host)
    }

    fn auth_header(&self) -> String {
        format!("PVEAPIToken={}", self.api_token)
    }

    /// Enumerate nodes, then enumerate QEMU guests per node, flattened.
    pub async fn list_guests(&self) -> Result<Vec<Guest>, SessionError> {
        let nodes_url = format!("{}/nodes", self.base_url());
        let nodes: DataEnvelope<Vec<NodeEntry>> = self
            .get_json(&nodes_url)
            .await
            .map_err(SessionError::UpstreamUnavailable)?;

        let mut guests = Vec::new();
        for node in nodes.data {
            let qemu_url = format!("{}/nodes/{}/qemu", self.base_url(), node.node);
            let qemu: DataEnvelope<Vec<QemuEntry>> = self
                .get_json(&qemu_url)
                .await
                .map_err(SessionError::UpstreamUnavailable)?;

            for entry in qemu.data {
                guests.push(Guest {
                    kind: "qemu".to_owned(),
                    node: node.node.clone(),
                    name: entry.name.unwrap_or_default(),
                    vmid: entry.vmid,
                    status: entry.status,
                });
            }
        }
        Ok(guests)
    }

    /// POST to the upstream `spiceproxy` endpoint and return its key/value
    /// map unchanged.
    pub async fn open_spice_ticket(
        &self,
        node: &str,
        vmid: u32,
    ) -> Result<HashMap<String, String>, SessionError> {
        let url = format!("{}/nodes/{node}/qemu/{vmid}/spiceproxy", self.base_url());
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .timeout(TICKET_TIMEOUT)
            .send()
            .await
            .map_err(|e| SessionError::UpstreamUnavailable(e.into()))?;

        if !response.status().is_success() {
            return Err(SessionError::UpstreamUnavailable(anyhow::anyhow!(
                "spiceproxy returned HTTP {}",
                response.status()
            )));
        }

        let envelope: DataEnvelope<HashMap<String, serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| SessionError::UpstreamUnavailable(e.into()))?;

        Ok(envelope
            .data
            .into_iter()
            .map(|(k, v)| (k, value_to_string(v)))
            .collect())
    }

    /// Resolve the fixed upstream the Forwarder relays every SPICE session
    /// to: the hypervisor's own `spiceproxy` listener, which validates the
    /// ticket on CONNECT. This is *not* the per-VM `host`/`tls-port` a
    /// ticket carries — those identify the VM's raw TLS socket and are only
    /// meaningful to the client embedded in the rendered `.vv` descriptor.
    pub async fn resolve_spice_upstream(&self, pve_spice_port: u16) -> Result<SocketAddr, SessionError> {
        lookup_host((self.host.as_str(), pve_spice_port))
            .await
            .map_err(|e| SessionError::UpstreamUnavailable(e.into()))?
            .next()
            .ok_or_else(|| {
                SessionError::UpstreamUnavailable(anyhow::anyhow!(
                    "no addresses resolved for hypervisor host {}",
                    self.host
                ))
            })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> anyhow::Result<T> {
        let response = self
            .client
            .get(url)
            .header("Authorization", self.auth_header())
            .timeout(LIST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("upstream returned HTTP {}", response.status());
        }

        Ok(response.json().await?)
    }
}

fn value_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Render a `[virt-viewer]` descriptor from a ticket's key/value map,
/// rewriting `proxy` to point at the broker's ephemeral endpoint and
/// passing through any other recognized key, in the fixed field order.
/// Keys not present in `ticket` are silently omitted.
pub fn render_descriptor(
    ticket: &HashMap<String, String>,
    proxy_public_ip: &str,
    ephemeral_port: u16,
) -> String {
    let mut lines = vec!["[virt-viewer]".to_owned()];

    for &key in VV_FILE_FIELDS {
        if key == "proxy" {
            lines.push(format!("proxy=http://{proxy_public_ip}:{ephemeral_port}"));
            continue;
        }
        if let Some(value) = ticket.get(key) {
            lines.push(format!("{key}={value}"));
        }
    }

    lines.join("\n")
}
