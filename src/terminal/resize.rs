//! Resize event sources

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use super::current_size;
use crate::remote::types::TerminalSize;

/// Source of terminal resize notifications.
///
/// `next_resize` resolves with the new dimensions each time the terminal
/// changes size, and with `None` once the source is exhausted.
pub trait ResizeSource: Send {
    fn next_resize(&mut self) -> impl Future<Output = Option<TerminalSize>> + Send;
}

/// SIGWINCH-driven resize source
#[cfg(unix)]
pub struct SignalResize {
    signal: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalResize {
    pub fn new() -> std::io::Result<Self> {
        let signal =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;
        Ok(Self { signal })
    }
}

#[cfg(unix)]
impl ResizeSource for SignalResize {
    async fn next_resize(&mut self) -> Option<TerminalSize> {
        loop {
            self.signal.recv().await?;
            if let Some(size) = current_size() {
                return Some(size);
            }
        }
    }
}

/// Resize source that polls the terminal size on an interval
pub struct PollingResize {
    interval: Interval,
    last: Option<TerminalSize>,
}

impl PollingResize {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval,
            last: current_size(),
        }
    }
}

impl ResizeSource for PollingResize {
    async fn next_resize(&mut self) -> Option<TerminalSize> {
        loop {
            self.interval.tick().await;
            let size = current_size();
            if size.is_some() && size != self.last {
                self.last = size;
                return size;
            }
        }
    }
}

/// Resize source fed by another part of the program
pub struct ChannelResize {
    rx: mpsc::Receiver<TerminalSize>,
}

impl ChannelResize {
    pub fn new(rx: mpsc::Receiver<TerminalSize>) -> Self {
        Self { rx }
    }

    /// Create a source together with the sender that drives it
    pub fn channel(capacity: usize) -> (mpsc::Sender<TerminalSize>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

impl ResizeSource for ChannelResize {
    async fn next_resize(&mut self) -> Option<TerminalSize> {
        self.rx.recv().await
    }
}

/// The host platform's preferred resize source
pub enum PlatformResize {
    #[cfg(unix)]
    Signal(SignalResize),
    Polling(PollingResize),
}

impl ResizeSource for PlatformResize {
    async fn next_resize(&mut self) -> Option<TerminalSize> {
        match self {
            #[cfg(unix)]
            PlatformResize::Signal(source) => source.next_resize().await,
            PlatformResize::Polling(source) => source.next_resize().await,
        }
    }
}

/// Signal-based on Unix, polling elsewhere or when the signal handler
/// cannot be installed.
pub fn default_resize_source(poll_period: Duration) -> PlatformResize {
    #[cfg(unix)]
    {
        match SignalResize::new() {
            Ok(source) => {
                tracing::debug!("Watching SIGWINCH for terminal resizes");
                return PlatformResize::Signal(source);
            }
            Err(e) => tracing::warn!("Cannot watch SIGWINCH ({}), polling terminal size", e),
        }
    }

    PlatformResize::Polling(PollingResize::new(poll_period))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_resize_yields_sizes_then_ends() {
        let (tx, mut source) = ChannelResize::channel(4);
        tx.send(TerminalSize::new(100, 30)).await.unwrap();
        drop(tx);

        assert_eq!(source.next_resize().await, Some(TerminalSize::new(100, 30)));
        assert_eq!(source.next_resize().await, None);
    }

    #[tokio::test]
    async fn test_polling_resize_stays_quiet_without_changes() {
        let mut source = PollingResize::new(Duration::from_millis(10));
        let result =
            tokio::time::timeout(Duration::from_millis(80), source.next_resize()).await;
        assert!(result.is_err(), "an unchanged terminal must not report a resize");
    }
}
