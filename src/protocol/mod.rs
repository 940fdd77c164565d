//! Wire-level protocol implementation
//!
//! The cell codec, per-hop onion cryptography, the ntor handshake, replay
//! protection, SENDME flow control, and the relay-cell pipeline that ties
//! them together. Everything here is independent of the transport; the
//! link and circuit layers drive it.

mod cell;
mod certs;
mod crypto;
mod flow_control;
mod ntor;
mod pipeline;
mod replay;

pub use cell::{
    Cell, CellCodec, CellCommand, LinkVersion, RelayCell, RelayCommand, CELL_LEN, PAYLOAD_LEN,
    RELAY_DATA_MAX, RELAY_HEADER_LEN,
};
pub use certs::{CertEntry, CertsCell, Ed25519Cert, EXT_SIGNED_WITH_ED25519_KEY};
#[cfg(test)]
pub(crate) use certs::test_support as certs_test_support;
pub use crypto::{kdf_tor, CircuitKeys, HopCrypto, HsCircuitKeys};
pub use flow_control::{SendmeWindow, CIRCUIT_SENDME_INCREMENT, STREAM_SENDME_INCREMENT};
pub use ntor::{
    extend2_payload, parse_created2, LinkSpecifier, NtorHandshake, HANDSHAKE_TYPE_NTOR,
    ONIONSKIN_LEN,
};
pub use pipeline::RelayPipeline;
pub use replay::ReplayWindow;
