//! Replay protection
//!
//! A per-direction sliding window over (sequence number, truncated cell
//! digest). A cell is accepted only if its sequence lies within the window
//! of recently seen positions (or just ahead of it) and neither its
//! sequence nor its digest has been seen before. Stale and far-future
//! sequences are both rejected.

use crate::error::{Result, TorError};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Truncated (128-bit) digest identifying a cell within the window
pub type CellDigest = [u8; 16];

/// Sliding replay window for one direction of a circuit
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Window size in sequence positions
    size: u64,

    /// Highest sequence accepted so far (0 = nothing seen)
    highest_seq: u64,

    /// Recently accepted (seq, digest) pairs, oldest first
    seen: VecDeque<(u64, CellDigest)>,
}

impl ReplayWindow {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1) as u64,
            highest_seq: 0,
            seen: VecDeque::with_capacity(size),
        }
    }

    /// Truncated digest of a cell payload
    pub fn digest(payload: &[u8]) -> CellDigest {
        let hash = Sha256::digest(payload);
        let mut out = [0u8; 16];
        out.copy_from_slice(&hash[..16]);
        out
    }

    /// Validate a (sequence, payload) pair and record it.
    ///
    /// Rejects with `ReplayDetected`:
    /// - a sequence at or below the bottom of the window (too old)
    /// - a sequence more than one window ahead of the highest seen
    /// - a sequence already recorded in the window
    /// - a payload digest already recorded in the window
    pub fn validate_and_track(&mut self, seq: u64, payload: &[u8]) -> Result<()> {
        let digest = Self::digest(payload);

        if self.highest_seq > 0 {
            let window_floor = self.highest_seq.saturating_sub(self.size - 1);
            if seq < window_floor {
                return Err(TorError::ReplayDetected(format!(
                    "sequence {} below window [{}..{}]",
                    seq, window_floor, self.highest_seq
                )));
            }
            if seq > self.highest_seq + self.size {
                return Err(TorError::ReplayDetected(format!(
                    "sequence {} too far ahead of {}",
                    seq, self.highest_seq
                )));
            }
        }

        for (seen_seq, seen_digest) in &self.seen {
            if *seen_seq == seq {
                return Err(TorError::ReplayDetected(format!(
                    "duplicate sequence {}",
                    seq
                )));
            }
            if *seen_digest == digest {
                return Err(TorError::ReplayDetected(format!(
                    "duplicate cell digest at sequence {}",
                    seq
                )));
            }
        }

        self.seen.push_back((seq, digest));
        if seq > self.highest_seq {
            self.highest_seq = seq;
        }

        // Drop entries that fell out of the window
        let floor = self.highest_seq.saturating_sub(self.size - 1);
        while let Some((old_seq, _)) = self.seen.front() {
            if *old_seq < floor {
                self.seen.pop_front();
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Highest sequence accepted so far
    pub fn highest_seq(&self) -> u64 {
        self.highest_seq
    }
}
