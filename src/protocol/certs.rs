//! Certificate parsing
//!
//! The CERTS cell exchanged during the link handshake, and the Ed25519
//! certificate format it (and the hidden-service descriptor) carries.
//! Trust in a relay is anchored in the consensus identity; the certificate
//! checks here establish structural integrity, expiry, and that the chain
//! is internally consistent.

use crate::error::{Result, TorError};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::time::{SystemTime, UNIX_EPOCH};

/// Extension type carrying the key that signed the certificate
pub const EXT_SIGNED_WITH_ED25519_KEY: u8 = 0x04;

/// A parsed Ed25519 certificate (tor-cert format)
///
/// Layout:
/// - VERSION (1, always 0x01)
/// - CERT_TYPE (1)
/// - EXPIRATION (4, hours since epoch)
/// - CERT_KEY_TYPE (1)
/// - CERTIFIED_KEY (32)
/// - N_EXTENSIONS (1), then per extension:
///   ExtLength (2) | ExtType (1) | ExtFlags (1) | ExtData
/// - SIGNATURE (64, over everything before it)
#[derive(Debug, Clone)]
pub struct Ed25519Cert {
    pub version: u8,
    pub cert_type: u8,
    pub expiration_hours: u32,
    pub cert_key_type: u8,
    pub certified_key: [u8; 32],
    /// (ext_type, ext_data) pairs
    pub extensions: Vec<(u8, Vec<u8>)>,
    /// Bytes covered by the signature
    pub signed_portion: Vec<u8>,
    pub signature: [u8; 64],
}

impl Ed25519Cert {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 104 {
            return Err(TorError::CertChainInvalid(format!(
                "certificate too short: {} bytes",
                data.len()
            )));
        }

        let version = data[0];
        if version != 0x01 {
            return Err(TorError::CertChainInvalid(format!(
                "unknown certificate version {}",
                version
            )));
        }

        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let cert_key_type = data[6];

        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        let n_extensions = data[39];
        let mut offset = 40;
        let mut extensions = Vec::with_capacity(n_extensions as usize);

        for _ in 0..n_extensions {
            if offset + 4 > data.len() {
                return Err(TorError::CertChainInvalid(
                    "extension header truncated".into(),
                ));
            }
            let ext_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            let ext_type = data[offset + 2];
            if offset + 4 + ext_len > data.len() {
                return Err(TorError::CertChainInvalid("extension data truncated".into()));
            }
            extensions.push((ext_type, data[offset + 4..offset + 4 + ext_len].to_vec()));
            offset += 4 + ext_len;
        }

        if data.len() < offset + 64 {
            return Err(TorError::CertChainInvalid(
                "certificate signature truncated".into(),
            ));
        }

        let sig_start = data.len() - 64;
        if sig_start < offset {
            return Err(TorError::CertChainInvalid(
                "certificate extensions overlap signature".into(),
            ));
        }
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[sig_start..]);

        Ok(Self {
            version,
            cert_type,
            expiration_hours,
            cert_key_type,
            certified_key,
            extensions,
            signed_portion: data[..sig_start].to_vec(),
            signature,
        })
    }

    /// The signing key carried in the signed-with extension, if present
    pub fn signing_key_extension(&self) -> Option<[u8; 32]> {
        self.extensions
            .iter()
            .find(|(ext_type, data)| *ext_type == EXT_SIGNED_WITH_ED25519_KEY && data.len() == 32)
            .map(|(_, data)| {
                let mut key = [0u8; 32];
                key.copy_from_slice(data);
                key
            })
    }

    /// Verify the certificate signature under `signing_key`
    pub fn verify_signature(&self, signing_key: &[u8; 32]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(signing_key)
            .map_err(|e| TorError::CertChainInvalid(format!("invalid signing key: {}", e)))?;
        let signature = Signature::from_bytes(&self.signature);
        verifying_key
            .verify(&self.signed_portion, &signature)
            .map_err(|_| TorError::CertChainInvalid("certificate signature invalid".into()))
    }

    pub fn is_expired(&self) -> bool {
        let now_hours = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() / 3600)
            .unwrap_or(0) as u32;
        self.expiration_hours < now_hours
    }
}

/// One entry of a CERTS cell
#[derive(Debug, Clone)]
pub struct CertEntry {
    pub cert_type: u8,
    pub data: Vec<u8>,
}

/// Parsed CERTS cell payload
#[derive(Debug)]
pub struct CertsCell {
    pub certificates: Vec<CertEntry>,
    /// Ed25519 identity from the cross-cert (type 7), if present
    pub ed25519_identity: Option<[u8; 32]>,
    /// Ed25519 signing key from the type-4 certificate, if present
    pub ed25519_signing_key: Option<[u8; 32]>,
}

impl CertsCell {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(TorError::ProtocolViolation("empty CERTS cell".into()));
        }

        let n_certs = data[0] as usize;
        let mut offset = 1;
        let mut certificates = Vec::with_capacity(n_certs);

        for i in 0..n_certs {
            if offset + 3 > data.len() {
                return Err(TorError::ProtocolViolation(format!(
                    "CERTS cell truncated at certificate {}",
                    i
                )));
            }
            let cert_type = data[offset];
            let cert_len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
            offset += 3;
            if offset + cert_len > data.len() {
                return Err(TorError::ProtocolViolation(format!(
                    "certificate {} data truncated",
                    i
                )));
            }
            certificates.push(CertEntry {
                cert_type,
                data: data[offset..offset + cert_len].to_vec(),
            });
            offset += cert_len;
        }

        let mut ed25519_identity = None;
        let mut ed25519_signing_key = None;

        for cert in &certificates {
            match cert.cert_type {
                // Type 4: Ed25519 signing key, signed with the identity key
                4 => {
                    if let Ok(parsed) = Ed25519Cert::parse(&cert.data) {
                        ed25519_signing_key = Some(parsed.certified_key);
                        if ed25519_identity.is_none() {
                            ed25519_identity = parsed.signing_key_extension();
                        }
                    }
                }
                // Type 7: Ed25519 identity cross-certified by the RSA key
                7 => {
                    if cert.data.len() >= 32 {
                        let mut id = [0u8; 32];
                        id.copy_from_slice(&cert.data[..32]);
                        ed25519_identity = Some(id);
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            certificates,
            ed25519_identity,
            ed25519_signing_key,
        })
    }

    /// Structural verification of the Ed25519 chain.
    ///
    /// Checks the type-4 signing certificate parses, is not expired, and is
    /// signed by the identity it names. If `expected_identity` is known
    /// from the consensus, the certificate's identity must match it.
    pub fn verify_chain(&self, expected_identity: Option<&[u8; 32]>) -> Result<()> {
        let signing_cert = self
            .certificates
            .iter()
            .find(|c| c.cert_type == 4)
            .ok_or_else(|| {
                TorError::CertChainInvalid("missing Ed25519 signing certificate".into())
            })?;

        let cert = Ed25519Cert::parse(&signing_cert.data)?;
        if cert.is_expired() {
            return Err(TorError::CertChainInvalid(
                "signing certificate expired".into(),
            ));
        }

        let identity = cert.signing_key_extension().ok_or_else(|| {
            TorError::CertChainInvalid("signing certificate names no identity".into())
        })?;
        cert.verify_signature(&identity)?;

        if let Some(expected) = expected_identity {
            if &identity != expected {
                return Err(TorError::CertChainInvalid(
                    "certificate identity does not match consensus".into(),
                ));
            }
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::make_signing_cert;
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn far_future_hours() -> u32 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            / 3600;
        (now + 24 * 365) as u32
    }

    #[test]
    fn test_cert_roundtrip_and_verify() {
        let identity = SigningKey::generate(&mut OsRng);
        let certified = [0x42u8; 32];
        let bytes = make_signing_cert(&identity, &certified, 4, far_future_hours());

        let cert = Ed25519Cert::parse(&bytes).unwrap();
        assert_eq!(cert.cert_type, 4);
        assert_eq!(cert.certified_key, certified);
        assert_eq!(
            cert.signing_key_extension().unwrap(),
            *identity.verifying_key().as_bytes()
        );
        assert!(!cert.is_expired());
        cert.verify_signature(identity.verifying_key().as_bytes())
            .unwrap();
    }

    #[test]
    fn test_tampered_cert_rejected() {
        let identity = SigningKey::generate(&mut OsRng);
        let mut bytes = make_signing_cert(&identity, &[0x42; 32], 4, far_future_hours());
        bytes[10] ^= 0xFF;

        let cert = Ed25519Cert::parse(&bytes).unwrap();
        assert!(cert
            .verify_signature(identity.verifying_key().as_bytes())
            .is_err());
    }

    #[test]
    fn test_truncated_cert_rejected() {
        assert!(Ed25519Cert::parse(&[0x01; 50]).is_err());
    }

    #[test]
    fn test_certs_cell_parse_and_chain() {
        let identity = SigningKey::generate(&mut OsRng);
        let signing = SigningKey::generate(&mut OsRng);
        let cert_bytes = make_signing_cert(
            &identity,
            signing.verifying_key().as_bytes(),
            4,
            far_future_hours(),
        );

        let mut payload = vec![1u8]; // one certificate
        payload.push(4); // type 4
        payload.extend_from_slice(&(cert_bytes.len() as u16).to_be_bytes());
        payload.extend_from_slice(&cert_bytes);

        let certs = CertsCell::parse(&payload).unwrap();
        assert_eq!(
            certs.ed25519_signing_key,
            Some(*signing.verifying_key().as_bytes())
        );
        assert_eq!(
            certs.ed25519_identity,
            Some(*identity.verifying_key().as_bytes())
        );

        certs
            .verify_chain(Some(identity.verifying_key().as_bytes()))
            .unwrap();

        // Wrong expected identity must be rejected
        assert!(certs.verify_chain(Some(&[0u8; 32])).is_err());
    }
}
