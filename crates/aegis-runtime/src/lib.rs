//! `aegis-runtime` – The Gateway Pipeline
//!
//! The stages that move steering samples from the sensor link to the vehicle
//! bus, plus the supervisor that owns them.
//!
//! # Modules
//!
//! - [`producer`] – [`SignalProducer`][producer::SignalProducer]: generates
//!   steering samples at a fixed tick and forwards them to the translator,
//!   in-process or over UDP.
//! - [`translator`] – [`FrameTranslator`][translator::FrameTranslator]:
//!   drains the priority channel, applies the active attack mode, and times
//!   each CAN transmission.
//! - [`fault_injector`] – [`FaultInjector`][fault_injector::FaultInjector]:
//!   publishes synthetic DoS, bit-flip and heartbeat-loss events.
//! - [`pipeline`] – [`PipelineSupervisor`][pipeline::PipelineSupervisor]:
//!   wires everything together and exposes start/stop/attack-mode control.
//! - [`metrics`] – [`MetricsReporter`][metrics::MetricsReporter]: periodic
//!   host load and live task count on `system.metrics`.
//! - [`config`] – [`PipelineConfig`][config::PipelineConfig] and its parts.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console, rotated
//!   file and OTLP outputs for `tracing`.

pub mod config;
pub mod fault_injector;
pub mod metrics;
pub mod pipeline;
pub mod producer;
pub mod telemetry;
pub mod translator;

pub use config::{
    FloodConfig, MetricsConfig, PipelineConfig, ProducerConfig, TranslatorConfig, Uplink,
};
pub use fault_injector::FaultInjector;
pub use metrics::MetricsReporter;
pub use pipeline::{PipelineStatus, PipelineSupervisor};
pub use producer::SignalProducer;
pub use telemetry::{LogSettings, TelemetryGuard, init_tracing, init_with};
pub use translator::{FrameTranslator, transform};
