//! Generic `CanBus` trait for vehicle bus transmitters.
//!
//! The translator holds an `Arc<dyn CanBus>` and only ever calls the three
//! trait methods. [`VirtualCanBus`] is the in-process implementation used by
//! the CLI and by tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use aegis_types::{Frame, GatewayError};
use tracing::{debug, info};

/// A frame transmitter.
pub trait CanBus: Send + Sync {
    /// Acquire the underlying channel. Called once before the translator
    /// starts; a failure here aborts startup.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the bus cannot be opened.
    fn open(&self) -> Result<(), GatewayError>;

    /// Transmit one frame.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the frame could not be put
    /// on the bus. Callers treat this as recoverable.
    fn send(&self, frame: &Frame) -> Result<(), GatewayError>;

    /// Release the channel. Idempotent.
    fn shutdown(&self);
}

/// In-process bus that records every transmitted frame.
///
/// Sends fail while the bus is closed. The history keeps the newest
/// `history_limit` frames; [`sent_count`][Self::sent_count] keeps counting
/// past it.
pub struct VirtualCanBus {
    channel: String,
    open: AtomicBool,
    refuse_open: AtomicBool,
    history_limit: usize,
    history: Mutex<VecDeque<Frame>>,
    sent: AtomicU64,
}

impl VirtualCanBus {
    /// Create a closed bus named `channel` (e.g. `"vcan0"`).
    pub fn new(channel: impl Into<String>) -> Self {
        Self::with_history(channel, 1_000)
    }

    pub fn with_history(channel: impl Into<String>, history_limit: usize) -> Self {
        Self {
            channel: channel.into(),
            open: AtomicBool::new(false),
            refuse_open: AtomicBool::new(false),
            history_limit,
            history: Mutex::new(VecDeque::new()),
            sent: AtomicU64::new(0),
        }
    }

    /// Make subsequent [`open`][CanBus::open] calls fail, simulating a
    /// missing interface.
    pub fn refuse_open(&self, refuse: bool) {
        self.refuse_open.store(refuse, Ordering::Release);
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Recorded frames, oldest first.
    pub fn frames(&self) -> Vec<Frame> {
        self.lock().iter().cloned().collect()
    }

    /// Total frames accepted since construction.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Frame>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CanBus for VirtualCanBus {
    fn open(&self) -> Result<(), GatewayError> {
        if self.refuse_open.load(Ordering::Acquire) {
            return Err(GatewayError::Transport(format!(
                "CAN interface '{}' unavailable",
                self.channel
            )));
        }
        if !self.open.swap(true, Ordering::AcqRel) {
            info!(channel = %self.channel, "virtual CAN bus opened");
        }
        Ok(())
    }

    fn send(&self, frame: &Frame) -> Result<(), GatewayError> {
        if !self.is_open() {
            return Err(GatewayError::Transport(format!(
                "CAN interface '{}' is closed",
                self.channel
            )));
        }
        {
            let mut history = self.lock();
            if self.history_limit > 0 {
                while history.len() >= self.history_limit {
                    history.pop_front();
                }
                history.push_back(frame.clone());
            }
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            channel = %self.channel,
            id = format_args!("{:#x}", frame.arbitration_id),
            dlc = frame.payload().len(),
            "frame on bus"
        );
        Ok(())
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            info!(channel = %self.channel, "virtual CAN bus closed");
        }
    }
}
