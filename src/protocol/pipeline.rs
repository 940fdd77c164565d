//! Relay-cell pipeline
//!
//! The onion layers of a circuit, as seen from the originator:
//!
//! - outgoing relay cells get the destination hop's running digest written
//!   into the digest field and are then encrypted once per hop, exit-first
//! - incoming cells are decrypted hop by hop until one hop "recognises"
//!   the cell: recognised field zero and digest field matching the low
//!   4 bytes of that hop's updated backward digest
//!
//! Recognised incoming cells pass replay protection before they are
//! surfaced; a cell no hop recognises is an error the engine drops.

use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, RelayCell, PAYLOAD_LEN};
use crate::protocol::crypto::HopCrypto;
use crate::protocol::replay::ReplayWindow;

/// Byte range of the digest field within a relay payload
const DIGEST_RANGE: std::ops::Range<usize> = 5..9;
/// Byte range of the recognised field within a relay payload
const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;

/// Onion encrypt/decrypt state for one circuit's hops
pub struct RelayPipeline {
    /// Live cipher and digest state, hop 0 = guard
    hops: Vec<HopCrypto>,

    /// Replay window over recognised incoming cells
    inbound_replay: ReplayWindow,

    /// Replay window over cells we originate (bookkeeping symmetry with
    /// the inbound direction)
    outbound_replay: ReplayWindow,

    inbound_seq: u64,
    outbound_seq: u64,
}

impl RelayPipeline {
    pub fn new(replay_window: usize) -> Self {
        Self {
            hops: Vec::with_capacity(3),
            inbound_replay: ReplayWindow::new(replay_window),
            outbound_replay: ReplayWindow::new(replay_window),
            inbound_seq: 0,
            outbound_seq: 0,
        }
    }

    /// Install a newly handshaked hop at the end of the path
    pub fn add_hop(&mut self, hop: HopCrypto) {
        self.hops.push(hop);
    }

    /// Remove the last hop (RELAY_TRUNCATED handling)
    pub fn drop_last_hop(&mut self) {
        self.hops.pop();
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Wrap an outgoing relay cell for the last hop of the path.
    ///
    /// The destination hop's forward digest is updated over the payload
    /// with zeroed digest field, the low 4 bytes are written back, and the
    /// payload is encrypted under every hop's forward key from the
    /// destination inward to the guard. Intermediate hops only encrypt;
    /// only the destination hop's digest is written.
    pub fn wrap_outgoing(
        &mut self,
        relay_cell: &RelayCell,
        circuit_id: u32,
        early: bool,
    ) -> Result<Cell> {
        if self.hops.is_empty() {
            return Err(TorError::Internal("no hops installed".into()));
        }

        let mut payload = relay_cell.to_bytes()?;
        debug_assert_eq!(payload.len(), PAYLOAD_LEN);
        payload[RECOGNIZED_RANGE].fill(0);
        payload[DIGEST_RANGE].fill(0);

        // Destination hop digest, computed over the zero-digest payload
        let last = self.hops.len() - 1;
        let digest = self.hops[last].update_forward_digest(&payload);
        payload[DIGEST_RANGE].copy_from_slice(&digest);

        self.outbound_seq += 1;
        self.outbound_replay
            .validate_and_track(self.outbound_seq, &payload)?;

        // Encrypt exit-first, guard-last
        for hop in self.hops.iter_mut().rev() {
            hop.encrypt_forward(&mut payload);
        }

        Ok(if early {
            Cell::relay_early(circuit_id, payload)
        } else {
            Cell::relay(circuit_id, payload)
        })
    }

    /// Unwrap an incoming RELAY cell payload.
    ///
    /// Decrypts under each hop's backward key in hop order. After each
    /// decryption, if the recognised field is zero the digest field is
    /// checked against that hop's running backward digest (computed over
    /// the payload with the digest field zeroed). The first hop that
    /// recognises the cell wins; its index and the parsed relay cell are
    /// returned. If no hop recognises the cell, `UnrecognisedCell`.
    pub fn process_incoming(&mut self, payload: &mut [u8]) -> Result<(usize, RelayCell)> {
        if payload.len() != PAYLOAD_LEN {
            return Err(TorError::BadLength(payload.len()));
        }

        for hop_idx in 0..self.hops.len() {
            self.hops[hop_idx].decrypt_backward(payload);

            let recognized = u16::from_be_bytes([payload[1], payload[2]]);
            if recognized != 0 {
                continue;
            }

            let received_digest = [payload[5], payload[6], payload[7], payload[8]];
            let mut hashed = payload.to_vec();
            hashed[DIGEST_RANGE].fill(0);

            // Fold into the running digest; roll back if this hop turns
            // out not to be the destination
            let snapshot = self.hops[hop_idx].backward_digest_snapshot();
            let expected = self.hops[hop_idx].update_backward_digest(&hashed);

            if expected == received_digest {
                self.inbound_seq += 1;
                self.inbound_replay
                    .validate_and_track(self.inbound_seq, payload)?;
                let relay_cell = RelayCell::from_bytes(payload)?;
                return Ok((hop_idx, relay_cell));
            }
            self.hops[hop_idx].restore_backward_digest(snapshot);
        }

        Err(TorError::UnrecognisedCell)
    }
}
