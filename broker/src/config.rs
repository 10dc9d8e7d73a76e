//! Environment-variable-driven configuration, loaded once at startup.

use std::net::IpAddr;

use common::env::{require_var, var_or};

#[derive(Debug, Clone)]
pub struct Config {
    /// Hypervisor REST API host (e.g. `pve.example.internal`), queried on
    /// port 8006 per the upstream's fixed API convention.
    pub hypervisor_host: String,
    /// Opaque `PVEAPIToken=...` value sent as the `Authorization` header on
    /// every upstream call.
    pub hypervisor_api_token: String,
    /// Skip TLS certificate verification against the hypervisor. Must be
    /// turned on explicitly; never a silent default.
    pub hypervisor_tls_insecure: bool,
    /// Fixed port the hypervisor's own `spiceproxy` listens on, validating
    /// the SPICE ticket on CONNECT. The Forwarder always relays here, never
    /// to the per-VM `tls-port` returned in a ticket (that port is for the
    /// `.vv` descriptor only). Proxmox's own default is 3128.
    pub pve_spice_port: u16,

    pub bind_addr: IpAddr,
    pub bind_port: u16,

    /// Public IP embedded in the `proxy` field of emitted `.vv` descriptors.
    pub proxy_public_ip: String,

    pub ephemeral_port_min: u16,
    pub ephemeral_port_max: u16,

    /// HMAC-SHA256 secret used to sign and verify bearer tokens.
    pub bearer_secret: String,

    pub session_timeout_secs: u64,
    pub invite_sidecar_path: String,
    pub credential_file_path: String,

    /// Issuer label embedded in `otpauth://` provisioning URIs.
    pub enrollment_issuer: String,
}

/// Accumulates env-var errors across every field instead of failing at the
/// first one, so a fresh deployment sees every missing/malformed variable
/// in one error rather than fixing them one at a time.
#[derive(Default)]
struct Errors(Vec<String>);

impl Errors {
    fn collect<T>(&mut self, result: anyhow::Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.0.push(e.to_string());
                None
            }
        }
    }

    fn into_result(self) -> anyhow::Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration:\n  {}", self.0.join("\n  "))
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut errors = Errors::default();

        let hypervisor_host = errors.collect(require_var("HYPERVISOR_HOST"));
        let hypervisor_api_token = errors.collect(require_var("HYPERVISOR_API_TOKEN"));
        let hypervisor_tls_insecure = errors.collect(var_or("HYPERVISOR_TLS_INSECURE", false));
        let pve_spice_port = errors.collect(var_or("PVE_SPICE_PORT", 3128u16));
        let bind_addr = errors.collect(require_var("BIND_ADDR"));
        let bind_port = errors.collect(require_var("BIND_PORT"));
        let proxy_public_ip = errors.collect(require_var("PROXY_PUBLIC_IP"));
        let ephemeral_port_min: Option<u16> = errors.collect(require_var("EPHEMERAL_PORT_MIN"));
        let ephemeral_port_max: Option<u16> = errors.collect(require_var("EPHEMERAL_PORT_MAX"));
        let bearer_secret = errors.collect(require_var("BEARER_SECRET"));
        let session_timeout_secs = errors.collect(var_or("SESSION_TIMEOUT_SECS", 300));
        let invite_sidecar_path =
            errors.collect(var_or("INVITE_SIDECAR_PATH", "./invites.json".to_owned()));
        let credential_file_path = errors.collect(var_or(
            "CREDENTIAL_FILE_PATH",
            "./credentials.env".to_owned(),
        ));
        let enrollment_issuer =
            errors.collect(var_or("ENROLLMENT_ISSUER", "spice-broker".to_owned()));

        if let (Some(min), Some(max)) = (ephemeral_port_min, ephemeral_port_max) {
            if min >= max {
                errors.0.push(format!(
                    "EPHEMERAL_PORT_MIN ({min}) must be < EPHEMERAL_PORT_MAX ({max})"
                ));
            }
        }

        errors.into_result()?;

        Ok(Self {
            hypervisor_host: hypervisor_host.unwrap(),
            hypervisor_api_token: hypervisor_api_token.unwrap(),
            hypervisor_tls_insecure: hypervisor_tls_insecure.unwrap(),
            pve_spice_port: pve_spice_port.unwrap(),
            bind_addr: bind_addr.unwrap(),
            bind_port: bind_port.unwrap(),
            proxy_public_ip: proxy_public_ip.unwrap(),
            ephemeral_port_min: ephemeral_port_min.unwrap(),
            ephemeral_port_max: ephemeral_port_max.unwrap(),
            bearer_secret: bearer_secret.unwrap(),
            session_timeout_secs: session_timeout_secs.unwrap(),
            invite_sidecar_path: invite_sidecar_path.unwrap(),
            credential_file_path: credential_file_path.unwrap(),
            enrollment_issuer: enrollment_issuer.unwrap(),
        })
    }

    pub fn session_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session_timeout_secs)
    }
}
