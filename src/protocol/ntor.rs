//! ntor handshake
//!
//! Client side of the ntor key exchange (handshake type 2) used for
//! CREATE2 and EXTEND2, based on X25519 Diffie-Hellman authenticated by
//! the relay's identity, plus the link-specifier encoding that names the
//! next hop in an EXTEND2 cell.
//!
//! Security: the ephemeral secret zeroizes on drop, and AUTH verification
//! uses constant-time comparison.

use crate::error::{Result, TorError};
use crate::protocol::crypto::CircuitKeys;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use std::net::{Ipv4Addr, Ipv6Addr};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// ntor handshake type tag in CREATE2/EXTEND2 cells
pub const HANDSHAKE_TYPE_NTOR: u16 = 0x0002;

/// Size of the client onionskin: ID (20) | B (32) | X (32)
pub const ONIONSKIN_LEN: usize = 84;

/// Client state for one ntor handshake
///
/// The ephemeral secret lives exactly as long as this value; x25519-dalek
/// zeroizes it on drop.
pub struct NtorHandshake {
    client_secret: StaticSecret,
    client_public: PublicKey,
}

impl NtorHandshake {
    /// Draw a fresh ephemeral keypair.
    ///
    /// Panics on evident RNG failure (an all-zero or degenerate public
    /// key); continuing without entropy would be worse than aborting.
    pub fn new() -> Self {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);

        let bytes = client_public.as_bytes();
        assert!(
            !bytes.iter().all(|&b| b == 0) && !bytes.iter().all(|&b| b == 0xFF),
            "RNG failure: degenerate X25519 key"
        );

        Self {
            client_secret,
            client_public,
        }
    }

    /// The client's ephemeral public key (X)
    pub fn client_public(&self) -> &PublicKey {
        &self.client_public
    }

    /// Build the client onionskin: `ID (20) | B (32) | X (32)`
    pub fn onionskin(
        &self,
        relay_identity: &[u8; 20],
        relay_onion_key: &PublicKey,
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(ONIONSKIN_LEN);
        data.extend_from_slice(relay_identity);
        data.extend_from_slice(relay_onion_key.as_bytes());
        data.extend_from_slice(self.client_public.as_bytes());
        data
    }

    /// Build a CREATE2 cell payload: `HTYPE (2) | HLEN (2) | onionskin`
    pub fn create2_payload(
        &self,
        relay_identity: &[u8; 20],
        relay_onion_key: &PublicKey,
    ) -> Vec<u8> {
        let onionskin = self.onionskin(relay_identity, relay_onion_key);
        let mut payload = Vec::with_capacity(4 + onionskin.len());
        payload.extend_from_slice(&HANDSHAKE_TYPE_NTOR.to_be_bytes());
        payload.extend_from_slice(&(onionskin.len() as u16).to_be_bytes());
        payload.extend_from_slice(&onionskin);
        payload
    }

    /// Complete the handshake with the relay's response and derive hop keys.
    ///
    /// ```text
    /// secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
    /// KEY_SEED    = HMAC-SHA256(t_key, secret_input)
    /// verify      = HMAC-SHA256(t_verify, secret_input)
    /// auth_input  = verify | ID | B | Y | X | PROTOID | "Server"
    /// AUTH        = HMAC-SHA256(t_mac, auth_input)
    /// ```
    ///
    /// The server's AUTH is checked in constant time; mismatch is
    /// `HandshakeRejected`. Consumes the handshake so the ephemeral secret
    /// is dropped (and zeroized) on every path out of this function.
    pub fn complete(
        self,
        relay_identity: &[u8; 20],
        relay_onion_key: &PublicKey,
        server_public: &PublicKey,
        server_auth: &[u8; 32],
    ) -> Result<CircuitKeys> {
        let shared_yx = self.client_secret.diffie_hellman(server_public);
        let shared_bx = self.client_secret.diffie_hellman(relay_onion_key);

        let mut secret_input = Zeroizing::new(Vec::with_capacity(32 * 4 + 20 + PROTOID.len()));
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(relay_identity);
        secret_input.extend_from_slice(relay_onion_key.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let mut mac = HmacSha256::new_from_slice(T_KEY).expect("HMAC accepts any key size");
        mac.update(&secret_input);
        let mut key_seed = Zeroizing::new([0u8; 32]);
        key_seed.copy_from_slice(&mac.finalize().into_bytes());

        let mut mac = HmacSha256::new_from_slice(T_VERIFY).expect("HMAC accepts any key size");
        mac.update(&secret_input);
        let verify = mac.finalize().into_bytes();

        let mut auth_input = Vec::with_capacity(verify.len() + 20 + 32 * 3 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(relay_identity);
        auth_input.extend_from_slice(relay_onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let mut mac = HmacSha256::new_from_slice(T_MAC).expect("HMAC accepts any key size");
        mac.update(&auth_input);
        let computed_auth = mac.finalize().into_bytes();

        let auth_ok: bool = computed_auth.as_slice().ct_eq(server_auth).into();
        if !auth_ok {
            return Err(TorError::HandshakeRejected(
                "server AUTH verification failed".into(),
            ));
        }

        CircuitKeys::derive_ntor(&key_seed)
    }
}

impl Default for NtorHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a CREATED2 or EXTENDED2 handshake response.
///
/// Layout: `HLEN (2) | HDATA (HLEN)`, where for ntor
/// `HDATA = Y (32) | AUTH (32)`.
pub fn parse_created2(payload: &[u8]) -> Result<(PublicKey, [u8; 32])> {
    if payload.len() < 2 {
        return Err(TorError::ProtocolViolation(
            "CREATED2 payload too short".into(),
        ));
    }
    let hlen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if hlen < 64 || payload.len() < 2 + hlen {
        return Err(TorError::ProtocolViolation(format!(
            "CREATED2 handshake data too short: {} bytes",
            hlen
        )));
    }
    let hdata = &payload[2..2 + hlen];

    let mut server_public_bytes = [0u8; 32];
    server_public_bytes.copy_from_slice(&hdata[0..32]);
    let mut server_auth = [0u8; 32];
    server_auth.copy_from_slice(&hdata[32..64]);

    Ok((PublicKey::from(server_public_bytes), server_auth))
}

/// A link specifier naming the next hop in an EXTEND2 cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpecifier {
    /// Type 0x00: TLS-over-TCP, IPv4 address and port
    Ipv4(Ipv4Addr, u16),
    /// Type 0x01: TLS-over-TCP, IPv6 address and port
    Ipv6(Ipv6Addr, u16),
    /// Type 0x02: legacy RSA identity fingerprint
    LegacyId([u8; 20]),
    /// Type 0x03: Ed25519 identity
    Ed25519Id([u8; 32]),
}

impl LinkSpecifier {
    /// Encode as `type (1) | length (1) | value`
    pub fn encode(&self) -> Vec<u8> {
        match self {
            LinkSpecifier::Ipv4(addr, port) => {
                let mut spec = vec![0x00, 6];
                spec.extend_from_slice(&addr.octets());
                spec.extend_from_slice(&port.to_be_bytes());
                spec
            }
            LinkSpecifier::Ipv6(addr, port) => {
                let mut spec = vec![0x01, 18];
                spec.extend_from_slice(&addr.octets());
                spec.extend_from_slice(&port.to_be_bytes());
                spec
            }
            LinkSpecifier::LegacyId(id) => {
                let mut spec = vec![0x02, 20];
                spec.extend_from_slice(id);
                spec
            }
            LinkSpecifier::Ed25519Id(id) => {
                let mut spec = vec![0x03, 32];
                spec.extend_from_slice(id);
                spec
            }
        }
    }

    /// Encode a specifier list: `NSPEC (1)` followed by each specifier
    pub fn encode_list(specs: &[LinkSpecifier]) -> Vec<u8> {
        let mut out = vec![specs.len() as u8];
        for spec in specs {
            out.extend_from_slice(&spec.encode());
        }
        out
    }
}

/// Build an EXTEND2 relay payload.
///
/// Layout: `NSPEC | link specifiers | HTYPE (2) | HLEN (2) | onionskin`.
pub fn extend2_payload(
    specs: &[LinkSpecifier],
    handshake: &NtorHandshake,
    relay_identity: &[u8; 20],
    relay_onion_key: &PublicKey,
) -> Vec<u8> {
    let onionskin = handshake.onionskin(relay_identity, relay_onion_key);
    let mut payload = LinkSpecifier::encode_list(specs);
    payload.extend_from_slice(&HANDSHAKE_TYPE_NTOR.to_be_bytes());
    payload.extend_from_slice(&(onionskin.len() as u16).to_be_bytes());
    payload.extend_from_slice(&onionskin);
    payload
}
