//! Protocol schema descriptor handed to workers at spawn time.
//!
//! The worker cannot negotiate over the socket before it knows the message
//! layout, so the supervisor passes a descriptor through the environment and the
//! bridge refuses to start if it differs from its own.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ProtocolError;

/// Canonical description of every message crossing the bridge or the broker.
///
/// Any change to a wire type must be reflected here so the fingerprint changes.
const LAYOUT: &str = "\
WorkItem{request_id:str,method:str,path:str,headers:[(str,str)],query:[(str,str)],\
body:bytes,enqueued_at_ms:u64,expires_at_ms:u64,callback_channel:str};\
WorkResponse{request_id:str,status_code:u16,headers:[(str,str)],body:str,is_base64:bool};\
Severity=Debug|Info|Warn|Error;\
LogRecord{message:str,severity:Severity,timestamp_ms:u64};\
BridgeResponse{logs:[LogRecord],callback_data:WorkResponse};\
BridgeMessage=Invoke(WorkItem)|Response(BridgeResponse)";

/// Identifies the exact protocol a build speaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Frame protocol version.
    pub version: u16,
    /// Hex SHA-256 of the canonical message layout.
    pub fingerprint: String,
}

impl SchemaDescriptor {
    /// The descriptor of the protocol compiled into this build.
    #[must_use]
    pub fn current() -> Self {
        Self {
            version: crate::version::CURRENT,
            fingerprint: hex::encode(Sha256::digest(LAYOUT.as_bytes())),
        }
    }

    /// Serialises the descriptor for the spawn environment.
    pub fn to_base64(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_vec(self).map_err(|e| ProtocolError::Serialisation(e.to_string()))?;
        Ok(BASE64.encode(json))
    }

    /// Parses a descriptor from the spawn environment.
    pub fn from_base64(encoded: &str) -> Result<Self, ProtocolError> {
        let json = BASE64
            .decode(encoded.trim())
            .map_err(|e| ProtocolError::Deserialisation(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| ProtocolError::Deserialisation(e.to_string()))
    }

    /// Fails unless this descriptor matches the compiled-in protocol.
    pub fn ensure_compatible(&self) -> Result<(), ProtocolError> {
        let current = Self::current();
        if *self != current {
            return Err(ProtocolError::SchemaMismatch {
                expected: format!("v{}/{}", current.version, current.fingerprint),
                actual: format!("v{}/{}", self.version, self.fingerprint),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_descriptor_survives_the_environment() {
        let encoded = SchemaDescriptor::current().to_base64().unwrap();
        let decoded = SchemaDescriptor::from_base64(&encoded).unwrap();

        assert_eq!(decoded, SchemaDescriptor::current());
        assert!(decoded.ensure_compatible().is_ok());
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let descriptor = SchemaDescriptor::current();
        assert_eq!(descriptor.fingerprint.len(), 64);

        let digest = hex::decode(&descriptor.fingerprint).unwrap();
        assert_eq!(digest.as_slice(), Sha256::digest(LAYOUT.as_bytes()).as_slice());
    }

    #[test]
    fn mismatched_fingerprint_is_rejected() {
        let stale = SchemaDescriptor {
            version: crate::version::CURRENT,
            fingerprint: "00".repeat(32),
        };

        assert!(matches!(
            stale.ensure_compatible(),
            Err(ProtocolError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn garbage_is_a_deserialisation_error() {
        assert!(matches!(
            SchemaDescriptor::from_base64("not base64!"),
            Err(ProtocolError::Deserialisation(_))
        ));
    }
}
