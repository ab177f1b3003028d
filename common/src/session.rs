use hmac::{Hmac, Mac};
use log::warn;
use sha2::Sha256;
use thiserror::Error;

use crate::{
    config::DeviceIdentity,
    protocol::{IdentifyPayload, OutboundMessage},
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("invalid HMAC key: {0}")]
    InvalidKey(#[from] hmac::digest::InvalidLength),
}

/// HMAC-SHA256 over `|`-joined fields, hex encoded.
#[derive(Clone)]
pub struct Signer {
    secret: Vec<u8>,
}

impl Signer {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    pub fn sign(&self, fields: &[&str]) -> Result<String, SignError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)?;
        mac.update(fields.join("|").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

/// Device and connection facts handed to every engine trigger.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub device: DeviceIdentity,
    signer: Option<Signer>,
    connected: bool,
}

impl SessionContext {
    pub fn new(device: DeviceIdentity, secret: Option<&str>) -> Self {
        Self {
            device,
            signer: secret.map(Signer::new),
            connected: false,
        }
    }

    pub fn mac(&self) -> &str {
        &self.device.mac
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// `None` when no shared secret is configured or signing failed.
    pub fn sign(&self, fields: &[&str]) -> Option<String> {
        let signer = self.signer.as_ref()?;
        match signer.sign(fields) {
            Ok(signature) => Some(signature),
            Err(err) => {
                warn!("message signing failed: {err}");
                None
            }
        }
    }

    pub fn identify(&self, now_ms: u64) -> OutboundMessage {
        let ts = now_ms.to_string();
        OutboundMessage::Identify(IdentifyPayload {
            mac: self.device.mac.clone(),
            name: self.device.name.clone(),
            firmware: self.device.firmware.clone(),
            ts: now_ms,
            sig: self.sign(&[&self.device.mac, &ts, &self.device.firmware]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_hex_hmac() {
        let signer = Signer::new("secret");
        let first = signer.sign(&["AA:BB", "1000", "4:1"]).unwrap();
        let second = signer.sign(&["AA:BB", "1000", "4:1"]).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert_ne!(signer.sign(&["AA:BB", "1000", "4:0"]).unwrap(), first);
        assert_ne!(
            Signer::new("other").sign(&["AA:BB", "1000", "4:1"]).unwrap(),
            first
        );
    }

    #[test]
    fn identify_is_signed_only_with_a_secret() {
        let plain = SessionContext::new(DeviceIdentity::default(), None);
        let OutboundMessage::Identify(payload) = plain.identify(42) else {
            panic!("expected identify");
        };
        assert_eq!(payload.sig, None);
        assert_eq!(payload.ts, 42);

        let signed = SessionContext::new(DeviceIdentity::default(), Some("secret"));
        let OutboundMessage::Identify(payload) = signed.identify(42) else {
            panic!("expected identify");
        };
        let expected = Signer::new("secret")
            .sign(&[&payload.mac, "42", &payload.firmware])
            .unwrap();
        assert_eq!(payload.sig, Some(expected));
    }
}
