//! Hidden-service descriptors
//!
//! Parsing and verification of the v3 descriptor: the signed outer
//! document whose signing-key certificate must chain to the blinded
//! identity, two nested encrypted layers keyed from the blinded key and
//! subcredential, and the introduction points in the inner plaintext.
//! Decrypted plaintext is zeroized once parsing is done, and verified
//! descriptors are cached under the blinded key for their stated
//! lifetime.

use crate::error::{Result, TorError};
use crate::path::RelayId;
use crate::protocol::Ed25519Cert;
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Digest, Sha3_256, Shake256,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Certificate type: descriptor signing key, signed with the blinded key
const CERT_TYPE_DESC_SIGNING: u8 = 0x08;
/// Certificate type: introduction point auth key
const CERT_TYPE_INTRO_AUTH: u8 = 0x09;

/// Prefix mixed into the outer signature
const SIG_PREFIX: &[u8] = b"Tor onion service descriptor sig v3";
/// KDF string for the outer encrypted layer
const STR_SUPERENCRYPTED: &[u8] = b"hsdir-superencrypted-data";
/// KDF string for the inner encrypted layer
const STR_ENCRYPTED: &[u8] = b"hsdir-encrypted-data";

/// Layer key material lengths: AES-256 key, IV, MAC key
const S_KEY_LEN: usize = 32;
const S_IV_LEN: usize = 16;
const MAC_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const MAC_LEN: usize = 32;

/// One introduction point from the inner layer
#[derive(Debug, Clone)]
pub struct IntroPoint {
    /// Raw encoded link-specifier list (NSPEC | specifiers), forwarded
    /// verbatim inside INTRODUCE1
    pub link_specifiers: Vec<u8>,
    /// IPv4/IPv6 endpoint parsed out of the specifiers
    pub address: Option<(IpAddr, u16)>,
    /// Legacy RSA identity from the specifiers
    pub legacy_identity: Option<RelayId>,
    /// Ed25519 identity from the specifiers
    pub ed_identity: Option<[u8; 32]>,
    /// The intro relay's ntor onion key (for extending to it)
    pub onion_key: [u8; 32],
    /// Session auth key for this introduction point
    pub auth_key: [u8; 32],
    /// The service's hs-ntor encryption key (B)
    pub enc_key: [u8; 32],
}

/// A parsed, verified, decrypted descriptor
#[derive(Debug, Clone)]
pub struct HsDescriptor {
    pub lifetime: Duration,
    pub revision: u64,
    pub intro_points: Vec<IntroPoint>,
}

/// Parse a descriptor document, verify its certificate chain and
/// signature against `blinded`, and decrypt both layers with
/// `subcredential`.
pub fn parse_descriptor(
    text: &str,
    blinded: &[u8; 32],
    subcredential: &[u8; 32],
) -> Result<HsDescriptor> {
    let outer = parse_outer(text)?;

    // Chain: the signing-key certificate must be issued by the blinded
    // identity, and the outer signature must verify under the certified
    // signing key. Verifying directly with the identity is not accepted.
    let cert = Ed25519Cert::parse(&outer.signing_cert)?;
    if cert.cert_type != CERT_TYPE_DESC_SIGNING {
        return Err(TorError::CertChainInvalid(format!(
            "descriptor cert has type {:#04x}",
            cert.cert_type
        )));
    }
    if cert.is_expired() {
        return Err(TorError::CertChainInvalid(
            "descriptor signing certificate expired".into(),
        ));
    }
    match cert.signing_key_extension() {
        Some(signer) if &signer == blinded => {}
        Some(_) => {
            return Err(TorError::CertChainInvalid(
                "descriptor cert not issued by the blinded identity".into(),
            ))
        }
        None => {
            return Err(TorError::CertChainInvalid(
                "descriptor cert names no issuer".into(),
            ))
        }
    }
    cert.verify_signature(blinded)?;

    let signing_key = VerifyingKey::from_bytes(&cert.certified_key)
        .map_err(|e| TorError::CertChainInvalid(format!("bad signing key: {}", e)))?;
    let mut signed_text = Vec::with_capacity(SIG_PREFIX.len() + outer.signed_len);
    signed_text.extend_from_slice(SIG_PREFIX);
    signed_text.extend_from_slice(&text.as_bytes()[..outer.signed_len]);
    let signature = Signature::from_slice(&outer.signature)
        .map_err(|e| TorError::DescriptorInvalid(format!("bad signature: {}", e)))?;
    signing_key
        .verify(&signed_text, &signature)
        .map_err(|_| TorError::DescriptorInvalid("outer signature invalid".into()))?;

    // Two layers of superencryption
    let middle = decrypt_layer(
        &outer.superencrypted,
        blinded,
        subcredential,
        outer.revision,
        STR_SUPERENCRYPTED,
    )?;
    let middle_text = String::from_utf8_lossy(&middle);
    let inner_blob = extract_block(&middle_text, "MESSAGE").ok_or_else(|| {
        TorError::DescriptorInvalid("middle layer carries no encrypted block".into())
    })?;
    let inner = decrypt_layer(
        &inner_blob,
        blinded,
        subcredential,
        outer.revision,
        STR_ENCRYPTED,
    )?;
    let inner_text = String::from_utf8_lossy(&inner);

    let intro_points = parse_intro_points(&inner_text, &cert.certified_key)?;
    if intro_points.is_empty() {
        return Err(TorError::DescriptorInvalid(
            "descriptor lists no introduction points".into(),
        ));
    }

    Ok(HsDescriptor {
        lifetime: Duration::from_secs(outer.lifetime_minutes * 60),
        revision: outer.revision,
        intro_points,
    })
}

/// Fields of the outer (plaintext) document
struct OuterDoc {
    lifetime_minutes: u64,
    revision: u64,
    signing_cert: Vec<u8>,
    superencrypted: Zeroizing<Vec<u8>>,
    signature: Vec<u8>,
    /// Bytes of `text` covered by the signature
    signed_len: usize,
}

fn parse_outer(text: &str) -> Result<OuterDoc> {
    if !text.starts_with("hs-descriptor 3") {
        return Err(TorError::DescriptorInvalid(
            "not a v3 hs-descriptor".into(),
        ));
    }

    let lifetime_minutes = keyword_arg(text, "descriptor-lifetime")?
        .parse::<u64>()
        .map_err(|_| TorError::DescriptorInvalid("bad descriptor-lifetime".into()))?;
    let revision = keyword_arg(text, "revision-counter")?
        .parse::<u64>()
        .map_err(|_| TorError::DescriptorInvalid("bad revision-counter".into()))?;

    let signing_cert = extract_block(text, "ED25519 CERT")
        .ok_or_else(|| TorError::DescriptorInvalid("missing signing-key cert".into()))?;
    let superencrypted = Zeroizing::new(
        extract_block(text, "MESSAGE")
            .ok_or_else(|| TorError::DescriptorInvalid("missing superencrypted block".into()))?,
    );

    let sig_pos = text
        .rfind("signature ")
        .ok_or_else(|| TorError::DescriptorInvalid("missing signature".into()))?;
    let sig_b64 = text[sig_pos + "signature ".len()..]
        .lines()
        .next()
        .unwrap_or("")
        .trim();
    let signature = BASE64
        .decode(sig_b64)
        .or_else(|_| BASE64.decode(format!("{}=", sig_b64)))
        .or_else(|_| BASE64.decode(format!("{}==", sig_b64)))
        .map_err(|e| TorError::DescriptorInvalid(format!("bad signature base64: {}", e)))?;

    Ok(OuterDoc {
        lifetime_minutes,
        revision,
        signing_cert,
        superencrypted,
        signature,
        signed_len: sig_pos + "signature ".len(),
    })
}

/// Decrypt one encryption layer.
///
/// Blob layout: `SALT (16) | CIPHERTEXT | MAC (32)`, with
/// `keys = SHAKE-256(blinded | subcredential | INT_8(revision) | salt | string_const)`
/// split into AES-256 key, IV, and MAC key, and
/// `MAC = SHA3-256(mac_key_len | mac_key | salt_len | salt | ciphertext)`.
fn decrypt_layer(
    blob: &[u8],
    blinded: &[u8; 32],
    subcredential: &[u8; 32],
    revision: u64,
    string_const: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if blob.len() < SALT_LEN + MAC_LEN + 1 {
        return Err(TorError::DescriptorInvalid(format!(
            "encrypted layer too short: {}",
            blob.len()
        )));
    }
    let salt = &blob[..SALT_LEN];
    let ciphertext = &blob[SALT_LEN..blob.len() - MAC_LEN];
    let mac = &blob[blob.len() - MAC_LEN..];

    let mut kdf = Shake256::default();
    kdf.update(blinded);
    kdf.update(subcredential);
    kdf.update(&revision.to_be_bytes());
    kdf.update(salt);
    kdf.update(string_const);
    let mut okm = Zeroizing::new([0u8; S_KEY_LEN + S_IV_LEN + MAC_KEY_LEN]);
    kdf.finalize_xof().read(okm.as_mut());

    let key = &okm[..S_KEY_LEN];
    let iv = &okm[S_KEY_LEN..S_KEY_LEN + S_IV_LEN];
    let mac_key = &okm[S_KEY_LEN + S_IV_LEN..];

    let mut hasher = Sha3_256::new();
    Digest::update(&mut hasher, (mac_key.len() as u64).to_be_bytes());
    Digest::update(&mut hasher, mac_key);
    Digest::update(&mut hasher, (salt.len() as u64).to_be_bytes());
    Digest::update(&mut hasher, salt);
    Digest::update(&mut hasher, ciphertext);
    let expected: [u8; 32] = hasher.finalize().into();

    let mac_ok: bool = expected.ct_eq(mac).into();
    if !mac_ok {
        return Err(TorError::DescriptorInvalid(
            "encrypted layer MAC mismatch".into(),
        ));
    }

    let mut plaintext = Zeroizing::new(ciphertext.to_vec());
    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(plaintext.as_mut());
    Ok(plaintext)
}

/// Parse the introduction points from the inner plaintext. Every auth-key
/// certificate must be issued by the descriptor signing key.
fn parse_intro_points(inner: &str, signing_key: &[u8; 32]) -> Result<Vec<IntroPoint>> {
    let mut points = Vec::new();

    for section in inner.split("introduction-point ").skip(1) {
        let spec_b64 = section.lines().next().unwrap_or("").trim();
        let link_specifiers = BASE64
            .decode(spec_b64)
            .map_err(|e| TorError::DescriptorInvalid(format!("bad link specifiers: {}", e)))?;

        let onion_key = keyword_key32(section, "onion-key ntor")?;
        let enc_key = keyword_key32(section, "enc-key ntor")?;

        let auth_cert_bytes = extract_block(section, "ED25519 CERT")
            .ok_or_else(|| TorError::DescriptorInvalid("missing auth-key cert".into()))?;
        let auth_cert = Ed25519Cert::parse(&auth_cert_bytes)?;
        if auth_cert.cert_type != CERT_TYPE_INTRO_AUTH {
            return Err(TorError::CertChainInvalid(format!(
                "auth-key cert has type {:#04x}",
                auth_cert.cert_type
            )));
        }
        auth_cert.verify_signature(signing_key)?;
        let auth_key = auth_cert.certified_key;

        let (address, legacy_identity, ed_identity) = parse_link_specifiers(&link_specifiers);

        points.push(IntroPoint {
            link_specifiers,
            address,
            legacy_identity,
            ed_identity,
            onion_key,
            auth_key,
            enc_key,
        });
    }

    Ok(points)
}

/// Pull the pieces we route on out of an encoded link-specifier list
fn parse_link_specifiers(
    raw: &[u8],
) -> (Option<(IpAddr, u16)>, Option<RelayId>, Option<[u8; 32]>) {
    let mut address = None;
    let mut legacy = None;
    let mut ed = None;

    if raw.is_empty() {
        return (address, legacy, ed);
    }
    let nspec = raw[0] as usize;
    let mut offset = 1;
    for _ in 0..nspec {
        if offset + 2 > raw.len() {
            break;
        }
        let spec_type = raw[offset];
        let len = raw[offset + 1] as usize;
        offset += 2;
        if offset + len > raw.len() {
            break;
        }
        let value = &raw[offset..offset + len];
        match (spec_type, len) {
            (0x00, 6) => {
                let ip: [u8; 4] = value[..4].try_into().expect("length checked");
                let port = u16::from_be_bytes([value[4], value[5]]);
                address = Some((IpAddr::from(ip), port));
            }
            (0x01, 18) => {
                let ip: [u8; 16] = value[..16].try_into().expect("length checked");
                let port = u16::from_be_bytes([value[16], value[17]]);
                if address.is_none() {
                    address = Some((IpAddr::from(ip), port));
                }
            }
            (0x02, 20) => {
                let mut id = [0u8; 20];
                id.copy_from_slice(value);
                legacy = Some(RelayId(id));
            }
            (0x03, 32) => {
                let mut id = [0u8; 32];
                id.copy_from_slice(value);
                ed = Some(id);
            }
            _ => {}
        }
        offset += len;
    }
    (address, legacy, ed)
}

fn keyword_arg<'a>(text: &'a str, keyword: &str) -> Result<&'a str> {
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(keyword) {
            if let Some(arg) = rest.strip_prefix(' ') {
                return Ok(arg.trim());
            }
        }
    }
    Err(TorError::DescriptorInvalid(format!(
        "missing {} line",
        keyword
    )))
}

fn keyword_key32(text: &str, keyword: &str) -> Result<[u8; 32]> {
    let b64 = keyword_arg(text, keyword)?;
    let bytes = BASE64
        .decode(b64)
        .or_else(|_| BASE64.decode(format!("{}=", b64)))
        .map_err(|e| TorError::DescriptorInvalid(format!("bad {}: {}", keyword, e)))?;
    if bytes.len() != 32 {
        return Err(TorError::DescriptorInvalid(format!(
            "{} must be 32 bytes",
            keyword
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Extract and decode a `-----BEGIN <label>-----` block
fn extract_block(text: &str, label: &str) -> Option<Vec<u8>> {
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);
    let start = text.find(&begin)? + begin.len();
    let stop = text[start..].find(&end)? + start;
    let body: String = text[start..stop]
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("");
    BASE64.decode(body).ok()
}

/// In-memory descriptor cache, keyed by blinded key, honouring the
/// descriptor lifetime.
pub struct DescriptorCache {
    entries: Mutex<HashMap<[u8; 32], CachedDescriptor>>,
}

struct CachedDescriptor {
    descriptor: HsDescriptor,
    expires: Instant,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, blinded: &[u8; 32]) -> Option<HsDescriptor> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(blinded) {
            Some(cached) if cached.expires > Instant::now() => Some(cached.descriptor.clone()),
            Some(_) => {
                entries.remove(blinded);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, blinded: [u8; 32], descriptor: HsDescriptor) {
        let expires = Instant::now() + descriptor.lifetime;
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .insert(blinded, CachedDescriptor { descriptor, expires });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DescriptorCache {
    fn default() -> Self {
        Self::new()
    }
}
