//! Clock and reset block
//!
//! Two single-register controls in front of the ASIC: an output clock
//! divider and a system reset line.

use crate::error::{LinkError, Result};
use crate::mmio::RegisterWindow;
use std::sync::Arc;
use std::time::Duration;
use uart54_chip::regs::board;

/// Board-level clock/reset peripheral
#[derive(Debug, Clone)]
pub struct Board {
    window: Arc<dyn RegisterWindow>,
    base_clock_khz: u32,
    reset_pulse: Duration,
}

impl Board {
    /// Board over `window`, with the divider fed from `base_clock_khz`
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] if the window is too small or the base
    /// clock is zero.
    pub fn new(window: Arc<dyn RegisterWindow>, base_clock_khz: u32, reset_pulse: Duration) -> Result<Self> {
        if window.len() < board::SPAN {
            return Err(LinkError::config(format!(
                "board window is {:#x} bytes, need {:#x}",
                window.len(),
                board::SPAN
            )));
        }
        if base_clock_khz == 0 {
            return Err(LinkError::config("base clock must be non-zero"));
        }
        Ok(Self {
            window,
            base_clock_khz,
            reset_pulse,
        })
    }

    /// Input clock in kHz
    #[must_use]
    pub const fn base_clock_khz(&self) -> u32 {
        self.base_clock_khz
    }

    /// Program the output clock as close to `khz` as the divider allows
    ///
    /// Returns the frequency actually produced, `base / (base / khz)`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidRequest`] for zero or for a frequency
    /// above the base clock.
    pub fn set_clock_khz(&self, khz: u32) -> Result<u32> {
        if khz == 0 {
            return Err(LinkError::invalid_request("clock frequency must be non-zero"));
        }
        let div = self.base_clock_khz / khz;
        if div < 1 {
            return Err(LinkError::invalid_request(format!(
                "{khz} kHz exceeds the {} kHz base clock",
                self.base_clock_khz
            )));
        }
        self.window.write_u32(board::CLOCK_DIVIDER, div - 1)?;
        let actual = self.base_clock_khz / div;
        tracing::info!("Clock set to {actual} kHz (divider {div})");
        Ok(actual)
    }

    /// Pulse the system reset line
    ///
    /// The release write is attempted even when asserting failed, so the
    /// line is never left held.
    ///
    /// # Errors
    ///
    /// Returns the first register write error.
    pub fn system_reset(&self) -> Result<()> {
        let asserted = self.window.write_u32(board::SYSTEM_RESET, 1);
        if asserted.is_ok() {
            std::thread::sleep(self.reset_pulse);
        }
        let release = self.window.write_u32(board::SYSTEM_RESET, 0);
        if let Err(e) = &release {
            tracing::error!("Failed to release system reset: {e}");
        }
        asserted.and(release)?;
        tracing::info!("System reset pulsed for {:?}", self.reset_pulse);
        Ok(())
    }
}
