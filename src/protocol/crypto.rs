//! Per-hop onion cryptography
//!
//! Key material and live cipher/digest state for circuit hops:
//! - AES-128-CTR layer ciphers with running SHA-1 digests (ntor hops)
//! - AES-256-CTR layer ciphers with running SHA3-256 digests (the extra
//!   layer installed after a hidden-service rendezvous)
//! - HKDF-SHA256 key expansion for the ntor handshake
//! - KDF-TOR, the iterated-SHA-1 expansion used by legacy paths
//!
//! All key material is zeroized on drop.

use crate::error::{Result, TorError};
use aes::{Aes128, Aes256};
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use hkdf::Hkdf;
use sha1::{Digest as _, Sha1};
use sha2::Sha256;
use sha3::Sha3_256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;
/// AES-256-CTR cipher type
type Aes256Ctr = Ctr128BE<Aes256>;

/// HKDF expansion label for the ntor handshake
const NTOR_M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Key material for one ntor hop
///
/// Each hop has separate keys for the forward (client to relay) and
/// backward (relay to client) directions, plus the seeds for the two
/// running digests.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    /// Forward digest seed (Df, 20 bytes)
    pub forward_digest: [u8; 20],

    /// Backward digest seed (Db, 20 bytes)
    pub backward_digest: [u8; 20],

    /// Forward encryption key (Kf, AES-128)
    pub forward_key: [u8; 16],

    /// Backward encryption key (Kb, AES-128)
    pub backward_key: [u8; 16],
}

impl CircuitKeys {
    /// Derive hop keys from an ntor KEY_SEED.
    ///
    /// KEY_SEED is already a pseudorandom key, so per RFC 5869 the Extract
    /// step is skipped and the seed is used directly as the PRK:
    ///
    /// ```text
    /// K = HKDF-SHA256-Expand(KEY_SEED, m_expand, 72)
    /// K = Df (20) | Db (20) | Kf (16) | Kb (16)
    /// ```
    pub fn derive_ntor(key_seed: &[u8; 32]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| TorError::Crypto("invalid PRK length".into()))?;

        let mut okm = Zeroizing::new([0u8; 72]);
        hkdf.expand(NTOR_M_EXPAND, okm.as_mut())
            .map_err(|_| TorError::Crypto("ntor key expansion failed".into()))?;

        let mut keys = Self {
            forward_digest: [0u8; 20],
            backward_digest: [0u8; 20],
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
        };
        keys.forward_digest.copy_from_slice(&okm[0..20]);
        keys.backward_digest.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);

        Ok(keys)
    }
}

/// Key material for the end-to-end hidden-service layer
///
/// The rendezvous handshake yields wider material: SHA3-256 digest seeds
/// and AES-256 keys.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HsCircuitKeys {
    /// Forward digest seed (32 bytes)
    pub forward_digest: [u8; 32],

    /// Backward digest seed (32 bytes)
    pub backward_digest: [u8; 32],

    /// Forward encryption key (AES-256)
    pub forward_key: [u8; 32],

    /// Backward encryption key (AES-256)
    pub backward_key: [u8; 32],
}

impl HsCircuitKeys {
    /// Split a 128-byte expanded key block into hidden-service hop keys
    pub fn from_okm(okm: &[u8]) -> Result<Self> {
        if okm.len() < 128 {
            return Err(TorError::Crypto(format!(
                "hidden-service key block too short: {}",
                okm.len()
            )));
        }
        let mut keys = Self {
            forward_digest: [0u8; 32],
            backward_digest: [0u8; 32],
            forward_key: [0u8; 32],
            backward_key: [0u8; 32],
        };
        keys.forward_digest.copy_from_slice(&okm[0..32]);
        keys.backward_digest.copy_from_slice(&okm[32..64]);
        keys.forward_key.copy_from_slice(&okm[64..96]);
        keys.backward_key.copy_from_slice(&okm[96..128]);
        Ok(keys)
    }
}

/// KDF-TOR: legacy key expansion by iterated SHA-1.
///
/// Output block 0 is `SHA1(secret)`; block i (i >= 1) is
/// `SHA1(secret | [i])`. The concatenation is truncated to `len` bytes.
pub fn kdf_tor(secret: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(len + 20));
    let mut counter = 0u8;
    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        if counter > 0 {
            hasher.update([counter]);
        }
        out.extend_from_slice(&hasher.finalize());
        counter = counter.wrapping_add(1);
    }
    out.truncate(len);
    out
}

/// Live cryptographic state for one hop.
///
/// Holds the persistent CTR ciphers (IV starts at zero and the keystream
/// runs across cells) and the running digest contexts seeded with Df/Db.
pub enum HopCrypto {
    /// Standard ntor hop: AES-128-CTR + running SHA-1
    Ntor {
        forward_cipher: Aes128Ctr,
        backward_cipher: Aes128Ctr,
        forward_digest: Sha1,
        backward_digest: Sha1,
    },
    /// Hidden-service layer: AES-256-CTR + running SHA3-256
    HsV3 {
        forward_cipher: Aes256Ctr,
        backward_cipher: Aes256Ctr,
        forward_digest: Sha3_256,
        backward_digest: Sha3_256,
    },
}

impl HopCrypto {
    /// Install a standard ntor hop from derived key material
    pub fn ntor(keys: &CircuitKeys) -> Self {
        let zero_iv = [0u8; 16];

        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest);

        HopCrypto::Ntor {
            forward_cipher: Aes128Ctr::new((&keys.forward_key).into(), (&zero_iv).into()),
            backward_cipher: Aes128Ctr::new((&keys.backward_key).into(), (&zero_iv).into()),
            forward_digest,
            backward_digest,
        }
    }

    /// Install the hidden-service end-to-end layer
    pub fn hs_v3(keys: &HsCircuitKeys) -> Self {
        let zero_iv = [0u8; 16];

        let mut forward_digest = Sha3_256::new();
        forward_digest.update(keys.forward_digest);
        let mut backward_digest = Sha3_256::new();
        backward_digest.update(keys.backward_digest);

        HopCrypto::HsV3 {
            forward_cipher: Aes256Ctr::new((&keys.forward_key).into(), (&zero_iv).into()),
            backward_cipher: Aes256Ctr::new((&keys.backward_key).into(), (&zero_iv).into()),
            forward_digest,
            backward_digest,
        }
    }

    /// Apply this hop's forward keystream in place
    pub fn encrypt_forward(&mut self, data: &mut [u8]) {
        match self {
            HopCrypto::Ntor { forward_cipher, .. } => forward_cipher.apply_keystream(data),
            HopCrypto::HsV3 { forward_cipher, .. } => forward_cipher.apply_keystream(data),
        }
    }

    /// Strip this hop's backward keystream in place (CTR is symmetric)
    pub fn decrypt_backward(&mut self, data: &mut [u8]) {
        match self {
            HopCrypto::Ntor {
                backward_cipher, ..
            } => backward_cipher.apply_keystream(data),
            HopCrypto::HsV3 {
                backward_cipher, ..
            } => backward_cipher.apply_keystream(data),
        }
    }

    /// Fold `payload` into the forward running digest and return the
    /// low 4 bytes of the updated state
    pub fn update_forward_digest(&mut self, payload: &[u8]) -> [u8; 4] {
        match self {
            HopCrypto::Ntor { forward_digest, .. } => {
                forward_digest.update(payload);
                low4(&forward_digest.clone().finalize())
            }
            HopCrypto::HsV3 { forward_digest, .. } => {
                forward_digest.update(payload);
                low4(&forward_digest.clone().finalize())
            }
        }
    }

    /// Fold `payload` into the backward running digest and return the
    /// low 4 bytes of the updated state.
    ///
    /// The caller must pass the payload with the digest field zeroed. On a
    /// mismatch the caller rolls the state back by reinstalling a snapshot.
    pub fn update_backward_digest(&mut self, payload: &[u8]) -> [u8; 4] {
        match self {
            HopCrypto::Ntor {
                backward_digest, ..
            } => {
                backward_digest.update(payload);
                low4(&backward_digest.clone().finalize())
            }
            HopCrypto::HsV3 {
                backward_digest, ..
            } => {
                backward_digest.update(payload);
                low4(&backward_digest.clone().finalize())
            }
        }
    }

    /// Snapshot of the backward digest state, for rollback when a cell
    /// turns out to be destined for a later hop
    pub fn backward_digest_snapshot(&self) -> BackwardDigestSnapshot {
        match self {
            HopCrypto::Ntor {
                backward_digest, ..
            } => BackwardDigestSnapshot::Ntor(backward_digest.clone()),
            HopCrypto::HsV3 {
                backward_digest, ..
            } => BackwardDigestSnapshot::HsV3(backward_digest.clone()),
        }
    }

    /// Reinstall a previously taken backward digest snapshot
    pub fn restore_backward_digest(&mut self, snapshot: BackwardDigestSnapshot) {
        match (self, snapshot) {
            (
                HopCrypto::Ntor {
                    backward_digest, ..
                },
                BackwardDigestSnapshot::Ntor(saved),
            ) => *backward_digest = saved,
            (
                HopCrypto::HsV3 {
                    backward_digest, ..
                },
                BackwardDigestSnapshot::HsV3(saved),
            ) => *backward_digest = saved,
            _ => unreachable!("snapshot flavour matches its hop"),
        }
    }
}

/// Saved backward digest state (see `HopCrypto::backward_digest_snapshot`)
pub enum BackwardDigestSnapshot {
    Ntor(Sha1),
    HsV3(Sha3_256),
}

fn low4(digest: &[u8]) -> [u8; 4] {
    [digest[0], digest[1], digest[2], digest[3]]
}
