//! SENDME flow control
//!
//! Package/deliver windows at circuit and stream level:
//!
//! - the package window decrements on each outgoing DATA cell and blocks
//!   sending at zero; a received SENDME restores `increment` cells, capped
//!   at the initial value
//! - the deliver window decrements on each incoming DATA cell; once it
//!   drops below the threshold we owe the peer a SENDME and credit the
//!   window back
//!
//! Defaults: circuits 1000/900/+100, streams 500/450/+50. A DATA cell
//! arriving on an empty deliver window is a protocol violation.

use crate::error::{Result, TorError};

/// A package/deliver window pair for one circuit or one stream
#[derive(Debug, Clone)]
pub struct SendmeWindow {
    /// Cells we may still send before blocking
    package_window: u16,

    /// Cells the peer may still send before it must wait for our SENDME
    deliver_window: u16,

    /// Initial (and maximum) window value
    initial: u16,

    /// Cells credited per SENDME
    increment: u16,

    /// Deliver level below which we owe a SENDME
    threshold: u16,
}

/// Circuit-level SENDME increment
pub const CIRCUIT_SENDME_INCREMENT: u16 = 100;

/// Stream-level SENDME increment
pub const STREAM_SENDME_INCREMENT: u16 = 50;

impl SendmeWindow {
    /// Circuit-level window (defaults 1000/1000, increment 100,
    /// threshold 900)
    pub fn circuit_level(package: u16, deliver: u16) -> Self {
        Self::new(package, deliver, CIRCUIT_SENDME_INCREMENT)
    }

    /// Stream-level window (defaults 500/500, increment 50, threshold 450)
    pub fn stream_level(package: u16, deliver: u16) -> Self {
        Self::new(package, deliver, STREAM_SENDME_INCREMENT)
    }

    fn new(package: u16, deliver: u16, increment: u16) -> Self {
        Self {
            package_window: package,
            deliver_window: deliver,
            initial: package,
            increment,
            threshold: deliver.saturating_sub(increment),
        }
    }

    /// Whether another DATA cell may be sent right now
    pub fn can_package(&self) -> bool {
        self.package_window > 0
    }

    /// Account for one outgoing DATA cell.
    ///
    /// The caller is expected to check `can_package` and wait for a SENDME
    /// first; packaging on an empty window is an internal error.
    pub fn note_packaged(&mut self) -> Result<()> {
        if self.package_window == 0 {
            return Err(TorError::WindowExhausted(
                "package window empty".into(),
            ));
        }
        self.package_window -= 1;
        Ok(())
    }

    /// Account for a received SENDME; the window never exceeds its initial
    /// value
    pub fn note_sendme_received(&mut self) {
        self.package_window = self
            .package_window
            .saturating_add(self.increment)
            .min(self.initial);
    }

    /// Account for one incoming DATA cell.
    ///
    /// Returns `true` when a SENDME should be sent back. A cell arriving
    /// on an empty deliver window means the peer ignored flow control.
    pub fn note_delivered(&mut self) -> Result<bool> {
        if self.deliver_window == 0 {
            return Err(TorError::WindowExhausted(
                "deliver window empty".into(),
            ));
        }
        self.deliver_window -= 1;

        if self.deliver_window < self.threshold {
            self.deliver_window += self.increment;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn package_window(&self) -> u16 {
        self.package_window
    }

    pub fn deliver_window(&self) -> u16 {
        self.deliver_window
    }
}
