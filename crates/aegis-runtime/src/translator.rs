//! [`FrameTranslator`] – the vehicle-bus side of the gateway.
//!
//! Drains the priority channel, applies the active [`AttackMode`], and puts
//! one frame per sample on the [`CanBus`]. Each transmission is timed and
//! reported on `frame.sent`.
//!
//! | Mode | Effect on a dequeued sample |
//! |---|---|
//! | `None` | `scale(raw)` |
//! | `Corrupt` | `-scale(raw)` |
//! | `Flood` | `scale(raw)` after an artificial delay |
//! | `SuppressHeartbeat` | discarded: no frame, no event |
//!
//! `latency_us` covers only the transmission call. The flood delay is
//! reported separately as `injected_delay_us`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use aegis_hal::CanBus;
use aegis_kernel::{CancellationToken, TaskHandle, TaskOutcome, TaskSupervisor};
use aegis_middleware::{EventBus, PriorityChannel, UdpIngress};
use aegis_types::{
    AttackMode, AttackModeCell, Event, EventPayload, Frame, FrameTelemetry, GatewayError, Sample,
    topic,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::TranslatorConfig;

pub use aegis_types::scale;

/// Task name of the dequeue → send loop.
pub const PROCESS_TASK: &str = "can.process";
/// Task name of the UDP ingress loop.
pub const INGRESS_TASK: &str = "can.ingress";

const SOURCE: &str = "aegis-runtime::translator";

/// Angle the translator emits for `raw` under `mode`, or `None` when the
/// sample is discarded.
pub fn transform(mode: AttackMode, raw: u8) -> Option<i16> {
    match mode {
        AttackMode::None | AttackMode::Flood => Some(scale(raw)),
        AttackMode::Corrupt => Some(scale(raw).saturating_neg()),
        AttackMode::SuppressHeartbeat => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

struct TranslatorCore {
    config: TranslatorConfig,
    bus: EventBus,
    channel: Arc<PriorityChannel<Sample>>,
    can: Arc<dyn CanBus>,
    mode: Arc<AttackModeCell>,
    frames_sent: AtomicU64,
    suppressed: AtomicU64,
    send_failures: AtomicU64,
}

impl TranslatorCore {
    /// Turn one sample into at most one frame.
    ///
    /// Only cancellation during the flood delay is returned as an error, and
    /// the sample goes back into the channel first. Transmission failures are
    /// logged and absorbed.
    async fn process(&self, sample: Sample, token: &CancellationToken) -> Result<(), GatewayError> {
        // Exactly one read of the mode per item.
        let mode = self.mode.load();
        let Some(angle) = transform(mode, sample.raw_value) else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(ts = sample.timestamp_us, "sample suppressed");
            return Ok(());
        };

        let mut injected = Duration::ZERO;
        if mode == AttackMode::Flood {
            injected = self.config.flood_delay();
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    // Same (priority, timestamp) key, so it is next out on restart.
                    if let Err(e) = self.channel.try_enqueue(sample) {
                        warn!(error = %e, ts = sample.timestamp_us, "delayed sample lost on shutdown");
                    }
                    return Err(GatewayError::Cancelled);
                }
                _ = tokio::time::sleep(injected) => {}
            }
        }

        let mut frame = Frame::new(self.config.arbitration_id, &angle.to_le_bytes())?;
        frame.queue_depth_at_send = u32::try_from(self.channel.len()).unwrap_or(u32::MAX);

        let started = Instant::now();
        let sent = self.can.send(&frame);
        frame.send_latency_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

        if let Err(e) = sent {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, angle, "CAN send failed");
            return Ok(());
        }

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            angle,
            latency_us = frame.send_latency_us,
            queue_depth = frame.queue_depth_at_send,
            ?mode,
            "frame sent"
        );
        let telemetry = FrameTelemetry {
            angle,
            latency_us: frame.send_latency_us,
            queue_depth: frame.queue_depth_at_send,
            source_timestamp_us: sample.timestamp_us,
            injected_delay_us: u64::try_from(injected.as_micros()).unwrap_or(u64::MAX),
        };
        self.bus
            .publish(
                topic::FRAME_SENT,
                Event::new(SOURCE, EventPayload::FrameSent(telemetry)),
            )
            .await;
        Ok(())
    }
}

/// Shuts the bus down when the processing task exits, on every path.
struct CloseOnExit(Arc<dyn CanBus>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FrameTranslator
// ─────────────────────────────────────────────────────────────────────────────

/// State machine: `Stopped → Running → Stopped`. [`start`][Self::start] and
/// [`stop`][Self::stop] are both idempotent.
pub struct FrameTranslator {
    core: Arc<TranslatorCore>,
    tasks: Arc<TaskSupervisor>,
    handles: Mutex<Vec<TaskHandle>>,
    ingress_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl FrameTranslator {
    pub fn new(
        config: TranslatorConfig,
        bus: EventBus,
        channel: Arc<PriorityChannel<Sample>>,
        can: Arc<dyn CanBus>,
        mode: Arc<AttackModeCell>,
        tasks: Arc<TaskSupervisor>,
    ) -> Self {
        Self {
            core: Arc::new(TranslatorCore {
                config,
                bus,
                channel,
                can,
                mode,
                frames_sent: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
                send_failures: AtomicU64::new(0),
            }),
            tasks,
            handles: Mutex::new(Vec::new()),
            ingress_addr: std::sync::Mutex::new(None),
        }
    }

    /// Open the bus (and the ingress socket, if configured) and start the
    /// processing loop.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Transport`] when the bus or the ingress socket cannot
    /// be opened. Nothing is left running or open in that case.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let mut handles = self.handles.lock().await;
        if handles.iter().any(|h| !h.is_finished()) {
            debug!("translator already running");
            return Ok(());
        }
        handles.clear();

        self.core.can.open()?;

        let ingress = match self.core.config.ingress {
            Some(addr) => {
                let bound = match UdpIngress::bind(addr).await {
                    Ok(ingress) => ingress.local_addr().map(|local| (ingress, local)),
                    Err(e) => Err(e),
                };
                match bound {
                    Ok(bound) => Some(bound),
                    Err(e) => {
                        self.core.can.shutdown();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let core = Arc::clone(&self.core);
        let guard = CloseOnExit(Arc::clone(&self.core.can));
        handles.push(self.tasks.start(PROCESS_TASK, move |token| async move {
            let _guard = guard;
            run(core, token).await
        }));

        if let Some((ingress, local)) = ingress {
            *self.lock_ingress_addr() = Some(local);
            let channel = Arc::clone(&self.core.channel);
            handles.push(
                self.tasks
                    .start(INGRESS_TASK, move |token| receive(ingress, channel, token)),
            );
            info!(addr = %local, "translator ingress listening");
        }

        info!(
            arbitration_id = format_args!("{:#x}", self.core.config.arbitration_id),
            "frame translator started"
        );
        Ok(())
    }

    /// Cancel the loops and wait until they have finished. Items still in
    /// the channel are left there.
    ///
    /// # Errors
    ///
    /// Reports loops that ended with a failure other than cancellation.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let handles: Vec<TaskHandle> = self.handles.lock().await.drain(..).collect();
        if handles.is_empty() {
            return Ok(());
        }
        for h in &handles {
            h.cancel();
        }

        let mut failures = Vec::new();
        for h in handles {
            if let TaskOutcome::Failed(e) = h.join().await {
                failures.push(e);
            }
        }
        *self.lock_ingress_addr() = None;
        info!("frame translator stopped");
        GatewayError::aggregate(failures)
    }

    pub async fn is_running(&self) -> bool {
        self.handles.lock().await.iter().any(|h| !h.is_finished())
    }

    /// Address the ingress socket is bound to while running.
    pub fn ingress_addr(&self) -> Option<SocketAddr> {
        *self.lock_ingress_addr()
    }

    pub fn frames_sent(&self) -> u64 {
        self.core.frames_sent.load(Ordering::Relaxed)
    }

    /// Samples discarded under [`AttackMode::SuppressHeartbeat`].
    pub fn suppressed(&self) -> u64 {
        self.core.suppressed.load(Ordering::Relaxed)
    }

    pub fn send_failures(&self) -> u64 {
        self.core.send_failures.load(Ordering::Relaxed)
    }

    fn lock_ingress_addr(&self) -> std::sync::MutexGuard<'_, Option<SocketAddr>> {
        self.ingress_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loops
// ─────────────────────────────────────────────────────────────────────────────

async fn run(core: Arc<TranslatorCore>, token: CancellationToken) -> Result<(), GatewayError> {
    let poll = core.config.poll_timeout();
    loop {
        let sample = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(GatewayError::Cancelled),
            next = core.channel.dequeue(poll) => match next {
                Ok(sample) => sample,
                Err(GatewayError::Empty) => continue,
                Err(e) => return Err(e),
            },
        };
        core.process(sample, &token).await?;
    }
}

async fn receive(
    ingress: UdpIngress,
    channel: Arc<PriorityChannel<Sample>>,
    token: CancellationToken,
) -> Result<(), GatewayError> {
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(GatewayError::Cancelled),
            received = ingress.recv() => received,
        };
        match received {
            Ok((packet, peer)) => {
                let sample = packet.to_sample();
                if let Err(e) = channel.try_enqueue(sample) {
                    warn!(error = %e, peer = %peer, "ingress sample dropped");
                }
            }
            Err(e) => warn!(error = %e, "ingress datagram rejected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_hal::VirtualCanBus;

    struct Rig {
        channel: Arc<PriorityChannel<Sample>>,
        can: Arc<VirtualCanBus>,
        mode: Arc<AttackModeCell>,
        bus: EventBus,
        translator: FrameTranslator,
    }

    fn rig(config: TranslatorConfig) -> Rig {
        let channel = Arc::new(PriorityChannel::new(64));
        let can = Arc::new(VirtualCanBus::new("vcan0"));
        let mode = Arc::new(AttackModeCell::new(AttackMode::None));
        let bus = EventBus::new();
        let translator = FrameTranslator::new(
            config,
            bus.clone(),
            Arc::clone(&channel),
            Arc::clone(&can) as Arc<dyn CanBus>,
            Arc::clone(&mode),
            Arc::new(TaskSupervisor::new()),
        );
        Rig {
            channel,
            can,
            mode,
            bus,
            translator,
        }
    }

    fn fast() -> TranslatorConfig {
        TranslatorConfig {
            poll_timeout_ms: 10,
            flood_delay_ms: 5,
            ..TranslatorConfig::default()
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn transform_follows_mode_table() {
        assert_eq!(transform(AttackMode::None, 255), Some(900));
        assert_eq!(transform(AttackMode::Flood, 0), Some(-900));
        assert_eq!(transform(AttackMode::Corrupt, 255), Some(-900));
        assert_eq!(transform(AttackMode::Corrupt, 127), Some(0));
        assert_eq!(transform(AttackMode::SuppressHeartbeat, 200), None);
    }

    #[tokio::test]
    async fn frames_carry_le_angle_and_measurements() -> Result<(), Box<dyn std::error::Error>> {
        let r = rig(fast());
        let mut sent = r.bus.tap(topic::FRAME_SENT, 16);
        r.channel.try_enqueue(Sample::new(255, 0, 77))?;

        r.translator.start().await?;
        let event = tokio::time::timeout(Duration::from_secs(2), sent.recv())
            .await?
            .ok_or("tap closed")?;
        r.translator.stop().await?;

        let EventPayload::FrameSent(t) = event.payload else {
            return Err("unexpected payload".into());
        };
        assert_eq!(t.angle, 900);
        assert_eq!(t.source_timestamp_us, 77);
        assert_eq!(t.injected_delay_us, 0);

        let frames = r.can.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].arbitration_id, 0x100);
        assert_eq!(frames[0].payload(), &900i16.to_le_bytes());
        Ok(())
    }

    #[tokio::test]
    async fn flood_mode_delays_but_still_sends() -> Result<(), Box<dyn std::error::Error>> {
        let r = rig(fast());
        let mut sent = r.bus.tap(topic::FRAME_SENT, 16);
        r.mode.store(AttackMode::Flood);
        r.channel.try_enqueue(Sample::new(127, 0, 1))?;

        r.translator.start().await?;
        let event = tokio::time::timeout(Duration::from_secs(2), sent.recv())
            .await?
            .ok_or("tap closed")?;
        r.translator.stop().await?;

        let EventPayload::FrameSent(t) = event.payload else {
            return Err("unexpected payload".into());
        };
        assert_eq!(t.injected_delay_us, 5_000);
        assert!(t.latency_us < t.injected_delay_us);
        Ok(())
    }

    #[tokio::test]
    async fn stop_during_flood_delay_requeues_the_sample() -> Result<(), Box<dyn std::error::Error>> {
        let r = rig(TranslatorConfig {
            flood_delay_ms: 5_000,
            ..fast()
        });
        r.mode.store(AttackMode::Flood);
        r.channel.try_enqueue(Sample::new(200, 1, 42))?;

        r.translator.start().await?;
        wait_for(|| r.channel.is_empty()).await;
        r.translator.stop().await?;

        assert_eq!(r.translator.frames_sent(), 0);
        assert_eq!(r.channel.len(), 1);

        // The next run picks it up.
        r.mode.store(AttackMode::None);
        let mut sent = r.bus.tap(topic::FRAME_SENT, 4);
        r.translator.start().await?;
        let event = tokio::time::timeout(Duration::from_secs(2), sent.recv())
            .await?
            .ok_or("tap closed")?;
        r.translator.stop().await?;

        let EventPayload::FrameSent(t) = event.payload else {
            return Err("unexpected payload".into());
        };
        assert_eq!(t.source_timestamp_us, 42);
        assert_eq!(t.angle, scale(200));
        Ok(())
    }

    #[tokio::test]
    async fn send_failure_does_not_stop_the_loop() -> Result<(), Box<dyn std::error::Error>> {
        let r = rig(fast());
        r.translator.start().await?;

        // Close the bus underneath the running translator.
        r.can.shutdown();
        r.channel.try_enqueue(Sample::new(10, 0, 1))?;
        wait_for(|| r.translator.send_failures() == 1).await;

        r.can.open()?;
        r.channel.try_enqueue(Sample::new(20, 0, 2))?;
        wait_for(|| r.translator.frames_sent() == 1).await;

        assert!(r.translator.is_running().await);
        r.translator.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_bus_aborts_start() {
        let r = rig(fast());
        r.can.refuse_open(true);
        let err = r.translator.start().await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        assert!(!r.translator.is_running().await);
    }

    #[tokio::test]
    async fn stop_closes_the_bus() -> Result<(), Box<dyn std::error::Error>> {
        let r = rig(fast());
        r.translator.start().await?;
        assert!(r.can.is_open());
        r.translator.stop().await?;
        assert!(!r.can.is_open());
        Ok(())
    }
}
