//! Connection profile generation and parsing.
//!
//! Format: `courier://v1?host=<endpoint>&psk=<base64url>&label=<label>`
//!
//! A profile is produced at controller setup and carried out of band to
//! wherever an agent is deployed; it is everything an agent needs to
//! find the controller and start staging.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::types::{CourierError, PreSharedKey, Result};

/// A parsed connection profile containing all fields.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    /// Endpoint the agent calls back to, e.g. `10.2.0.4:8443`.
    pub host: String,
    /// Pre-shared key bootstrapping every session's handshake.
    pub psk: PreSharedKey,
    /// Optional operator-facing label for the deployment.
    pub label: Option<String>,
}

impl ConnectionProfile {
    /// Creates a profile from existing parts.
    pub fn new(host: impl Into<String>, psk: PreSharedKey, label: Option<String>) -> Self {
        Self {
            host: host.into(),
            psk,
            label,
        }
    }

    /// Creates a profile with a freshly generated pre-shared key.
    pub fn generate(host: impl Into<String>, label: Option<String>) -> Self {
        Self::new(host, PreSharedKey::generate(), label)
    }

    /// Encodes the profile to its URI string.
    pub fn encode(&self) -> String {
        let psk_encoded = URL_SAFE_NO_PAD.encode(self.psk.as_bytes());
        let mut uri = format!(
            "courier://v1?host={}&psk={}",
            percent_encode(&self.host),
            psk_encoded
        );
        if let Some(ref label) = self.label {
            uri.push_str(&format!("&label={}", percent_encode(label)));
        }
        uri
    }

    /// Parses a profile URI string.
    ///
    /// # Arguments
    /// * `uri` - The URI string to parse
    ///
    /// # Returns
    /// A ConnectionProfile if parsing succeeds
    pub fn parse(uri: &str) -> Result<Self> {
        let prefix = "courier://v1?";
        if !uri.starts_with(prefix) {
            return Err(CourierError::InvalidProfile(
                "unknown profile scheme or version".to_string(),
            ));
        }

        let query = &uri[prefix.len()..];
        let params: std::collections::HashMap<&str, &str> = query
            .split('&')
            .filter_map(|p| {
                let mut parts = p.splitn(2, '=');
                Some((parts.next()?, parts.next()?))
            })
            .collect();

        let host = params
            .get("host")
            .ok_or_else(|| CourierError::InvalidProfile("missing 'host' parameter".to_string()))
            .and_then(|h| percent_decode(h))?;

        let psk_encoded = params
            .get("psk")
            .ok_or_else(|| CourierError::InvalidProfile("missing 'psk' parameter".to_string()))?;
        let psk_bytes = URL_SAFE_NO_PAD
            .decode(psk_encoded)
            .map_err(|e| CourierError::InvalidProfile(format!("invalid base64url psk: {}", e)))?;
        let psk = PreSharedKey::from_slice(&psk_bytes)?;

        let label = params.get("label").map(|l| percent_decode(l)).transpose()?;

        Ok(Self { host, psk, label })
    }
}

/// Percent-encodes everything outside the URI-unreserved set.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &byte in s.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Reverses [`percent_encode`], also accepting `+` for space.
fn percent_decode(s: &str) -> Result<String> {
    let raw = s.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'%' => {
                if i + 3 > raw.len() {
                    return Err(CourierError::InvalidProfile(
                        "truncated percent escape".to_string(),
                    ));
                }
                let value = std::str::from_utf8(&raw[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| {
                        CourierError::InvalidProfile("invalid percent escape".to_string())
                    })?;
                bytes.push(value);
                i += 3;
            }
            b'+' => {
                bytes.push(b' ');
                i += 1;
            }
            other => {
                bytes.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(bytes)
        .map_err(|_| CourierError::InvalidProfile("escape produced invalid UTF-8".to_string()))
}
