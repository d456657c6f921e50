//! Local terminal collaborators
//!
//! Raw-mode switching, size queries and resize notifications for the
//! interactive relay. The relay itself only sees [`ResizeSource`].

pub mod resize;

pub use resize::{ChannelResize, PollingResize, ResizeSource, default_resize_source};
#[cfg(unix)]
pub use resize::SignalResize;

use tracing::{debug, warn};

use crate::remote::types::{TerminalError, TerminalSize};

/// Current size of the controlling terminal, if there is one
pub fn current_size() -> Option<TerminalSize> {
    crossterm::terminal::size()
        .ok()
        .filter(|(cols, rows)| *cols > 0 && *rows > 0)
        .map(|(cols, rows)| TerminalSize::new(cols, rows))
}

/// Keeps the local terminal in raw mode while alive
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn acquire() -> Result<Self, TerminalError> {
        crossterm::terminal::enable_raw_mode()
            .map_err(|e| TerminalError::Input(format!("Failed to enable raw mode: {}", e)))?;
        debug!("Local terminal switched to raw mode");
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        match crossterm::terminal::disable_raw_mode() {
            Ok(()) => debug!("Local terminal restored"),
            Err(e) => warn!("Failed to restore terminal mode: {}", e),
        }
    }
}
