//! Hidden-service ntor handshake (client side)
//!
//! The rendezvous variant of ntor: the client encrypts introduction data
//! to the service's key from the descriptor inside INTRODUCE1, and on
//! RENDEZVOUS2 derives the end-to-end key material and verifies the
//! service's auth tag before any layer is installed. Unlike the link
//! handshake this one uses SHA3-256 and SHAKE-256 throughout.

use super::blinding::hs_mac;
use crate::error::{Result, TorError};
use crate::protocol::HsCircuitKeys;
use aes::Aes256;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use rand::rngs::OsRng;
use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake256,
};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

type Aes256Ctr = Ctr128BE<Aes256>;

const PROTOID: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1";
const T_HSENC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_extract";
const T_HSVERIFY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_verify";
const T_HSMAC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_mac";
const M_HSEXPAND: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_expand";

/// Length of the MAC trailing the INTRODUCE1 encrypted section
pub const INTRO_MAC_LEN: usize = 32;

/// What the client knows about the service before introducing: the
/// introduction point's encryption key (B) and auth key from the
/// descriptor, and the subcredential for the current period.
#[derive(Clone)]
pub struct HsServiceInfo {
    pub enc_key: PublicKey,
    pub auth_key: [u8; 32],
    pub subcredential: [u8; 32],
}

/// Client state across INTRODUCE1 and RENDEZVOUS2.
///
/// The ephemeral secret zeroizes when this is dropped, on both the
/// success and the failure path.
pub struct HsNtorClient {
    service: HsServiceInfo,
    x: StaticSecret,
    client_public: PublicKey,
}

impl HsNtorClient {
    pub fn new(service: HsServiceInfo) -> Self {
        let x = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&x);
        Self {
            service,
            x,
            client_public,
        }
    }

    /// The client's ephemeral public key (X), sent in INTRODUCE1
    pub fn client_public(&self) -> &PublicKey {
        &self.client_public
    }

    /// Encrypt the INTRODUCE1 plaintext and MAC the cell.
    ///
    /// `cell_prefix` is everything in the INTRODUCE1 cell before the
    /// encrypted section (key ids, extensions); the returned value is
    /// `X | ENCRYPTED(plaintext) | MAC` to be appended to it.
    pub fn seal_introduction(&self, cell_prefix: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let shared_bx = self.x.diffie_hellman(&self.service.enc_key);

        // intro_secret_hs_input = EXP(B,x) | AUTH_KEY | X | B | PROTOID
        let mut secret_input = Zeroizing::new(Vec::with_capacity(32 * 3 + 32 + PROTOID.len()));
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.service.auth_key);
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(self.service.enc_key.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        // hs_keys = KDF(intro_secret_hs_input | t_hsenc | info, 64)
        // info = m_hsexpand | subcredential
        let mut kdf = Shake256::default();
        kdf.update(&secret_input);
        kdf.update(T_HSENC);
        kdf.update(M_HSEXPAND);
        kdf.update(&self.service.subcredential);
        let mut okm = Zeroizing::new([0u8; 64]);
        kdf.finalize_xof().read(okm.as_mut());

        let enc_key = Zeroizing::new(<[u8; 32]>::try_from(&okm[0..32]).expect("split"));
        let mac_key = Zeroizing::new(<[u8; 32]>::try_from(&okm[32..64]).expect("split"));

        let mut encrypted = plaintext.to_vec();
        let zero_iv = [0u8; 16];
        let mut cipher = Aes256Ctr::new(enc_key.as_ref().into(), (&zero_iv).into());
        cipher.apply_keystream(&mut encrypted);

        // MAC covers the whole cell up to (and excluding) the MAC itself
        let mut out = Vec::with_capacity(32 + encrypted.len() + INTRO_MAC_LEN);
        out.extend_from_slice(self.client_public.as_bytes());
        out.extend_from_slice(&encrypted);

        let mut mac_input = Vec::with_capacity(cell_prefix.len() + out.len());
        mac_input.extend_from_slice(cell_prefix);
        mac_input.extend_from_slice(&out);
        let mac = hs_mac(mac_key.as_ref(), &mac_input);
        out.extend_from_slice(&mac);

        Ok(out)
    }

    /// Complete the handshake from a RENDEZVOUS2 payload (`Y | AUTH`).
    ///
    /// Verifies the service's auth tag in constant time, then expands the
    /// key seed into the end-to-end layer keys. Consumes the client state.
    pub fn complete(self, rendezvous2: &[u8]) -> Result<HsCircuitKeys> {
        if rendezvous2.len() < 64 {
            return Err(TorError::ProtocolViolation(format!(
                "RENDEZVOUS2 payload too short: {}",
                rendezvous2.len()
            )));
        }
        let mut server_public_bytes = [0u8; 32];
        server_public_bytes.copy_from_slice(&rendezvous2[0..32]);
        let server_public = PublicKey::from(server_public_bytes);
        let auth = &rendezvous2[32..64];

        let shared_yx = self.x.diffie_hellman(&server_public);
        let shared_bx = self.x.diffie_hellman(&self.service.enc_key);

        // rend_secret_hs_input = EXP(Y,x) | EXP(B,x) | AUTH_KEY | B | X | Y | PROTOID
        let mut secret_input = Zeroizing::new(Vec::with_capacity(32 * 6 + PROTOID.len()));
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.service.auth_key);
        secret_input.extend_from_slice(self.service.enc_key.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = Zeroizing::new(hs_mac(&secret_input, T_HSENC));
        let verify = hs_mac(&secret_input, T_HSVERIFY);

        // auth_input = verify | AUTH_KEY | B | Y | X | PROTOID | "Server"
        let mut auth_input = Vec::with_capacity(32 * 5 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.service.auth_key);
        auth_input.extend_from_slice(self.service.enc_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let expected = hs_mac(&auth_input, T_HSMAC);
        let auth_ok: bool = expected.ct_eq(auth).into();
        if !auth_ok {
            return Err(TorError::HandshakeRejected(
                "rendezvous auth tag mismatch".into(),
            ));
        }

        // keys = KDF(NTOR_KEY_SEED | m_hsexpand, 128)
        let mut kdf = Shake256::default();
        kdf.update(key_seed.as_ref());
        kdf.update(M_HSEXPAND);
        let mut okm = Zeroizing::new([0u8; 128]);
        kdf.finalize_xof().read(okm.as_mut());

        HsCircuitKeys::from_okm(okm.as_ref())
    }
}


#[cfg(test)]
mod tests {
    use super::service_side::SimulatedService;
    use super::*;

    #[test]
    fn test_full_rendezvous_handshake() {
        let service = SimulatedService::new();
        let client = HsNtorClient::new(service.info());
        let client_public = *client.client_public();

        let (rend2, service_keys) = service.rendezvous2(&client_public);
        let client_keys = client.complete(&rend2).expect("auth verifies");

        // Both sides derive identical layer keys
        assert_eq!(client_keys.forward_key, service_keys.forward_key);
        assert_eq!(client_keys.backward_key, service_keys.backward_key);
        assert_eq!(client_keys.forward_digest, service_keys.forward_digest);
        assert_eq!(client_keys.backward_digest, service_keys.backward_digest);
    }

    #[test]
    fn test_tampered_auth_rejected() {
        let service = SimulatedService::new();
        let client = HsNtorClient::new(service.info());
        let client_public = *client.client_public();

        let (mut rend2, _) = service.rendezvous2(&client_public);
        rend2[40] ^= 0x01;

        assert!(matches!(
            client.complete(&rend2),
            Err(TorError::HandshakeRejected(_))
        ));
    }

    #[test]
    fn test_short_rendezvous2_rejected() {
        let service = SimulatedService::new();
        let client = HsNtorClient::new(service.info());
        assert!(matches!(
            client.complete(&[0u8; 40]),
            Err(TorError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_seal_introduction_shape() {
        let service = SimulatedService::new();
        let client = HsNtorClient::new(service.info());

        let prefix = [0u8; 39];
        let plaintext = b"rendezvous cookie and specs";
        let sealed = client.seal_introduction(&prefix, plaintext).unwrap();

        // X | ciphertext | MAC
        assert_eq!(sealed.len(), 32 + plaintext.len() + INTRO_MAC_LEN);
        assert_eq!(&sealed[0..32], client.client_public().as_bytes());
        // Ciphertext must differ from the plaintext
        assert_ne!(&sealed[32..32 + plaintext.len()], plaintext.as_slice());
    }

    #[test]
    fn test_introduction_encryption_is_key_dependent() {
        let service_a = SimulatedService::new();
        let service_b = SimulatedService::new();
        let client_a = HsNtorClient::new(service_a.info());
        let client_b = HsNtorClient::new(service_b.info());

        let sealed_a = client_a.seal_introduction(&[], b"same plaintext").unwrap();
        let sealed_b = client_b.seal_introduction(&[], b"same plaintext").unwrap();
        assert_ne!(sealed_a[32..], sealed_b[32..]);
    }
}
