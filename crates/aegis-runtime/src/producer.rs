//! [`SignalProducer`] – the sensor-link side of the gateway.
//!
//! Runs as two supervised tasks so that generation cadence never waits on
//! transmission:
//!
//! | Task | Loop |
//! |---|---|
//! | `ble.generator` | Every tick: read the steering walk, publish `ble.rx`, stage the sample in the local outbox. |
//! | `ble.forwarder` | Drain the outbox towards the translator (in-process channel or UDP) and publish `ble.tx` per forwarded sample. |
//!
//! A full outbox or a full downstream channel drops the sample and publishes
//! `ble.drop`; nothing here ever waits for space.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use aegis_hal::SteeringWalk;
use aegis_kernel::{CancellationToken, TaskHandle, TaskOutcome, TaskSupervisor};
use aegis_middleware::{EventBus, PriorityChannel, UdpUplink, WirePacket};
use aegis_types::{DropReason, Event, EventPayload, GatewayError, MonotonicClock, Sample, topic};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ProducerConfig, Uplink};

/// Task name of the generator loop.
pub const GENERATOR_TASK: &str = "ble.generator";
/// Task name of the forwarding loop.
pub const FORWARDER_TASK: &str = "ble.forwarder";

const SOURCE: &str = "aegis-runtime::producer";

/// Samples are staged with the highest priority.
const SAMPLE_PRIORITY: u8 = 0;

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

struct ProducerCore {
    config: ProducerConfig,
    bus: EventBus,
    outbox: PriorityChannel<Sample>,
    channel: Arc<PriorityChannel<Sample>>,
    clock: MonotonicClock,
    generated: AtomicU64,
    forwarded: AtomicU64,
    downstream_drops: AtomicU64,
}

impl ProducerCore {
    async fn publish_drop(&self, sample: Sample, reason: DropReason) {
        self.bus
            .publish(
                topic::BLE_DROP,
                Event::new(
                    SOURCE,
                    EventPayload::SampleDropped {
                        raw: sample.raw_value,
                        timestamp_us: sample.timestamp_us,
                        reason,
                    },
                ),
            )
            .await;
    }
}

/// Where the forwarding loop delivers staged samples.
///
/// The UDP socket is owned here, so it closes whichever way the forwarding
/// task exits.
enum Forwarder {
    Channel(Arc<PriorityChannel<Sample>>),
    Datagram(UdpUplink),
}

impl Forwarder {
    /// Deliver one sample and return the number of payload bytes sent.
    async fn forward(&self, sample: Sample) -> Result<usize, GatewayError> {
        match self {
            Forwarder::Channel(channel) => {
                channel.try_enqueue(sample)?;
                Ok(1)
            }
            Forwarder::Datagram(uplink) => {
                let packet = WirePacket::from(sample);
                uplink.send(&packet).await?;
                Ok(packet.payload.len())
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SignalProducer
// ─────────────────────────────────────────────────────────────────────────────

/// Generates steering samples and hands them to the translator stage.
///
/// State machine: `Stopped → Running → Stopped`. [`start`][Self::start] and
/// [`stop`][Self::stop] are both idempotent.
pub struct SignalProducer {
    core: Arc<ProducerCore>,
    tasks: Arc<TaskSupervisor>,
    handles: Mutex<Vec<TaskHandle>>,
}

impl SignalProducer {
    pub fn new(
        config: ProducerConfig,
        bus: EventBus,
        channel: Arc<PriorityChannel<Sample>>,
        tasks: Arc<TaskSupervisor>,
    ) -> Self {
        let outbox = PriorityChannel::new(config.outbox_capacity);
        Self {
            core: Arc::new(ProducerCore {
                config,
                bus,
                outbox,
                channel,
                clock: MonotonicClock::new(),
                generated: AtomicU64::new(0),
                forwarded: AtomicU64::new(0),
                downstream_drops: AtomicU64::new(0),
            }),
            tasks,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the generator and forwarding loops.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Transport`] when the datagram uplink cannot be opened.
    /// Nothing is started in that case.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let mut handles = self.handles.lock().await;
        if handles.iter().any(|h| !h.is_finished()) {
            debug!("producer already running");
            return Ok(());
        }
        handles.clear();

        let forwarder = match self.core.config.uplink {
            Uplink::InProcess => Forwarder::Channel(Arc::clone(&self.core.channel)),
            Uplink::Datagram { target } => Forwarder::Datagram(UdpUplink::connect(target).await?),
        };

        let core = Arc::clone(&self.core);
        handles.push(
            self.tasks
                .start(GENERATOR_TASK, move |token| generate(core, token)),
        );
        let core = Arc::clone(&self.core);
        handles.push(
            self.tasks
                .start(FORWARDER_TASK, move |token| forward(core, forwarder, token)),
        );

        info!(
            tick_ms = self.core.config.tick_ms,
            uplink = ?self.core.config.uplink,
            "signal producer started"
        );
        Ok(())
    }

    /// Cancel both loops and wait until they have finished.
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
        info!("signal producer stopped");
        GatewayError::aggregate(failures)
    }

    pub async fn is_running(&self) -> bool {
        self.handles.lock().await.iter().any(|h| !h.is_finished())
    }

    /// Samples generated since construction.
    pub fn generated(&self) -> u64 {
        self.core.generated.load(Ordering::Relaxed)
    }

    /// Samples delivered downstream since construction.
    pub fn forwarded(&self) -> u64 {
        self.core.forwarded.load(Ordering::Relaxed)
    }

    /// Samples lost to a full outbox or a full downstream channel.
    pub fn drops(&self) -> u64 {
        self.core.outbox.drops() + self.core.downstream_drops.load(Ordering::Relaxed)
    }

    /// Samples staged but not yet forwarded.
    pub fn outbox_len(&self) -> usize {
        self.core.outbox.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loops
// ─────────────────────────────────────────────────────────────────────────────

async fn generate(core: Arc<ProducerCore>, token: CancellationToken) -> Result<(), GatewayError> {
    let mut walk = match core.config.seed {
        Some(seed) => SteeringWalk::seeded(seed, core.config.max_step),
        None => SteeringWalk::new(core.config.max_step),
    };
    let mut ticker = tokio::time::interval(core.config.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(GatewayError::Cancelled),
            _ = ticker.tick() => {}
        }

        let sample = Sample::new(walk.next_reading(), SAMPLE_PRIORITY, core.clock.now_us());
        core.generated.fetch_add(1, Ordering::Relaxed);
        core.bus
            .publish(
                topic::BLE_RX,
                Event::new(
                    SOURCE,
                    EventPayload::SampleIngested {
                        raw: sample.raw_value,
                        timestamp_us: sample.timestamp_us,
                    },
                ),
            )
            .await;

        if let Err(e) = core.outbox.try_enqueue(sample) {
            warn!(error = %e, ts = sample.timestamp_us, "outbox full, sample dropped");
            core.publish_drop(sample, DropReason::OutboxFull).await;
        }
    }
}

async fn forward(
    core: Arc<ProducerCore>,
    forwarder: Forwarder,
    token: CancellationToken,
) -> Result<(), GatewayError> {
    let poll = core.config.tick();
    loop {
        let sample = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(GatewayError::Cancelled),
            next = core.outbox.dequeue(poll) => match next {
                Ok(sample) => sample,
                Err(GatewayError::Empty) => continue,
                Err(e) => return Err(e),
            },
        };

        match forwarder.forward(sample).await {
            Ok(data_len) => {
                core.forwarded.fetch_add(1, Ordering::Relaxed);
                core.bus
                    .publish(
                        topic::BLE_TX,
                        Event::new(
                            SOURCE,
                            EventPayload::SampleForwarded {
                                priority: sample.priority,
                                timestamp_us: sample.timestamp_us,
                                data_len,
                            },
                        ),
                    )
                    .await;
            }
            Err(e @ GatewayError::ChannelFull { .. }) => {
                core.downstream_drops.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, ts = sample.timestamp_us, "translator channel full, sample dropped");
                core.publish_drop(sample, DropReason::ChannelFull).await;
            }
            Err(e) => {
                error!(error = %e, ts = sample.timestamp_us, "forwarding failed");
            }
        }
    }
}
