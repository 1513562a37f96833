//! [`PipelineSupervisor`] – owns and wires every gateway stage.
//!
//! ```text
//! SignalProducer ─▶ PriorityChannel ─▶ FrameTranslator ─▶ CanBus
//!                                          │
//!                                          └─ frame.sent ──┐
//! FaultInjector ───────────────────────── attack.event ────┴─▶ TelemetrySink
//! MetricsReporter ─────────────────────── system.metrics (bus only)
//! ```
//!
//! The supervisor is the only writer of the [`AttackMode`]. Switching to
//! `dos`, `flip` or `heart` also fires the matching fault injector behaviour
//! as a supervised one-shot task; switching away from `dos` cancels a burst
//! that is still running.

use std::collections::HashMap;
use std::sync::Arc;

use aegis_hal::CanBus;
use aegis_kernel::TaskSupervisor;
use aegis_middleware::{EventBus, EventHandler, PriorityChannel, TelemetrySink};
use aegis_types::{
    AttackMode, AttackModeCell, Event, GatewayError, Sample, SystemMetrics, TelemetryRecord, topic,
};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::fault_injector::FaultInjector;
use crate::metrics::MetricsReporter;
use crate::producer::SignalProducer;
use crate::translator::FrameTranslator;

/// Task name of a running DoS burst.
pub const DOS_TASK: &str = "attack.dos";
/// Task name of the bit-flip one-shot.
pub const FLIP_TASK: &str = "attack.flip";
/// Task name of the heartbeat-loss one-shot.
pub const HEART_TASK: &str = "attack.heart";

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry forwarding
// ─────────────────────────────────────────────────────────────────────────────

/// Bus handler that tags events with a stage label and hands them to the sink.
struct SinkForwarder {
    sink: Arc<dyn TelemetrySink>,
    stage: &'static str,
    kind: &'static str,
}

#[async_trait]
impl EventHandler for SinkForwarder {
    async fn handle(&self, event: &Event) -> Result<(), GatewayError> {
        self.sink
            .record(TelemetryRecord {
                stage: self.stage.to_string(),
                kind: self.kind.to_string(),
                event: event.clone(),
            })
            .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub attack_mode: AttackMode,
    pub queue_depth: usize,
    pub producer_drops: u64,
    pub frames_sent: u64,
    /// Task name → still alive.
    pub tasks: HashMap<String, bool>,
    /// Latest host snapshot from the metrics reporter.
    pub metrics: Option<SystemMetrics>,
}

// ─────────────────────────────────────────────────────────────────────────────
// PipelineSupervisor
// ─────────────────────────────────────────────────────────────────────────────

pub struct PipelineSupervisor {
    config: PipelineConfig,
    bus: EventBus,
    channel: Arc<PriorityChannel<Sample>>,
    tasks: Arc<TaskSupervisor>,
    mode: Arc<AttackModeCell>,
    producer: SignalProducer,
    translator: FrameTranslator,
    injector: FaultInjector,
    metrics: MetricsReporter,
    running: Mutex<bool>,
}

impl PipelineSupervisor {
    /// Build a stopped pipeline transmitting on `can` and reporting to `sink`.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] if `config` fails validation.
    pub fn new(
        config: PipelineConfig,
        can: Arc<dyn CanBus>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let bus = EventBus::new();
        let channel = Arc::new(PriorityChannel::new(config.channel_capacity));
        let tasks = Arc::new(TaskSupervisor::new());
        let mode = Arc::new(AttackModeCell::new(AttackMode::None));

        bus.subscribe(
            topic::FRAME_SENT,
            Arc::new(SinkForwarder {
                sink: Arc::clone(&sink),
                stage: "can",
                kind: "CAN_TX",
            }),
        );
        bus.subscribe(
            topic::ATTACK_EVENT,
            Arc::new(SinkForwarder {
                sink,
                stage: "attack",
                kind: "ATTACK",
            }),
        );

        let producer = SignalProducer::new(
            config.producer.clone(),
            bus.clone(),
            Arc::clone(&channel),
            Arc::clone(&tasks),
        );
        let translator = FrameTranslator::new(
            config.translator.clone(),
            bus.clone(),
            Arc::clone(&channel),
            can,
            Arc::clone(&mode),
            Arc::clone(&tasks),
        );
        let injector = FaultInjector::new(bus.clone());
        let metrics =
            MetricsReporter::new(config.metrics.clone(), bus.clone(), Arc::clone(&tasks));

        Ok(Self {
            config,
            bus,
            channel,
            tasks,
            mode,
            producer,
            translator,
            injector,
            metrics,
            running: Mutex::new(false),
        })
    }

    /// Start the translator, then the producer, then the metrics reporter
    /// when enabled. A no-op when already running.
    ///
    /// # Errors
    ///
    /// Startup resource failures (bus, sockets). Whatever had already
    /// started is stopped again before the error is returned.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let mut running = self.running.lock().await;
        if *running {
            info!("gateway already running");
            return Ok(());
        }
        info!("gateway starting");

        self.translator.start().await?;
        if let Err(e) = self.producer.start().await {
            if let Err(stop_err) = self.translator.stop().await {
                warn!(error = %stop_err, "translator stop after failed start");
            }
            return Err(e);
        }
        if self.config.metrics.enabled {
            self.metrics.start().await;
        }

        *running = true;
        info!("gateway fully started");
        Ok(())
    }

    /// Stop every stage and any fault task still running. A no-op when
    /// already stopped.
    ///
    /// # Errors
    ///
    /// All stage failures, aggregated.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let mut running = self.running.lock().await;
        if !*running {
            return Ok(());
        }
        info!("gateway stopping");

        let mut failures = Vec::new();
        for result in [
            self.producer.stop().await,
            self.translator.stop().await,
            self.metrics.stop().await,
            self.tasks.shutdown_all().await,
        ] {
            if let Err(e) = result {
                failures.push(e);
            }
        }

        *running = false;
        info!("gateway stopped");
        GatewayError::aggregate(failures)
    }

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Switch the translator's attack mode and fire the matching fault.
    pub fn set_attack_mode(&self, mode: AttackMode) {
        let previous = self.mode.store(mode);
        if previous == AttackMode::Flood && mode != AttackMode::Flood {
            self.tasks.cancel(DOS_TASK);
        }

        match mode {
            AttackMode::None => info!(%previous, "attack mode cleared"),
            AttackMode::Flood => {
                warn!(%mode, "attack mode activated");
                let injector = self.injector.clone();
                let flood = self.config.flood.clone();
                self.tasks.start(DOS_TASK, move |token| async move {
                    injector.flood(flood.duration(), flood.rate_hz, token).await;
                    Ok(())
                });
            }
            AttackMode::Corrupt => {
                warn!(%mode, "attack mode activated");
                let injector = self.injector.clone();
                self.tasks.start(FLIP_TASK, move |_| async move {
                    injector.bitflip().await;
                    Ok(())
                });
            }
            AttackMode::SuppressHeartbeat => {
                warn!(%mode, "attack mode activated");
                let injector = self.injector.clone();
                self.tasks.start(HEART_TASK, move |_| async move {
                    injector.heartbeat_drop().await;
                    Ok(())
                });
            }
        }
    }

    /// Parse `mode` (`none|dos|flip|heart`) and apply it.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidAttackMode`] before anything is changed.
    pub fn set_attack_mode_str(&self, mode: &str) -> Result<AttackMode, GatewayError> {
        let mode: AttackMode = mode.parse()?;
        self.set_attack_mode(mode);
        Ok(mode)
    }

    pub fn attack_mode(&self) -> AttackMode {
        self.mode.load()
    }

    pub async fn status(&self) -> PipelineStatus {
        PipelineStatus {
            running: self.is_running().await,
            attack_mode: self.attack_mode(),
            queue_depth: self.channel.len(),
            producer_drops: self.producer.drops(),
            frames_sent: self.translator.frames_sent(),
            tasks: self.tasks.health(),
            metrics: self.metrics.latest(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn channel(&self) -> &Arc<PriorityChannel<Sample>> {
        &self.channel
    }

    pub fn tasks(&self) -> &Arc<TaskSupervisor> {
        &self.tasks
    }

    pub fn producer(&self) -> &SignalProducer {
        &self.producer
    }

    pub fn translator(&self) -> &FrameTranslator {
        &self.translator
    }

    pub fn metrics(&self) -> &MetricsReporter {
        &self.metrics
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}
