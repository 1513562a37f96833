//! Runtime configuration for the gateway pipeline.
//!
//! Every field has a default, so an empty TOML table or `{}` JSON object is a
//! valid configuration.

use std::net::SocketAddr;
use std::time::Duration;

use aegis_types::GatewayError;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Upper bound for [`FloodConfig::rate_hz`].
pub const MAX_FLOOD_RATE_HZ: f64 = 10_000.0;
/// Upper bound for [`FloodConfig::duration_ms`] (one hour).
pub const MAX_FLOOD_DURATION_MS: u64 = 3_600_000;
pub const MAX_POLL_TIMEOUT_MS: u64 = 60_000;

/// Configuration bundle for [`PipelineSupervisor`][crate::PipelineSupervisor].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the producer → translator priority channel.
    pub channel_capacity: usize,
    /// Records kept by the in-memory telemetry sink.
    pub telemetry_capacity: usize,
    pub producer: ProducerConfig,
    pub translator: TranslatorConfig,
    pub flood: FloodConfig,
    pub metrics: MetricsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 500,
            telemetry_capacity: 500,
            producer: ProducerConfig::default(),
            translator: TranslatorConfig::default(),
            flood: FloodConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reject values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.channel_capacity == 0 {
            return Err(GatewayError::Config("channel_capacity must be > 0".into()));
        }
        if self.producer.tick_ms == 0 {
            return Err(GatewayError::Config("producer.tick_ms must be > 0".into()));
        }
        if self.producer.outbox_capacity == 0 {
            return Err(GatewayError::Config(
                "producer.outbox_capacity must be > 0".into(),
            ));
        }
        if self.translator.poll_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "translator.poll_timeout_ms must be > 0".into(),
            ));
        }
        if self.translator.poll_timeout_ms > MAX_POLL_TIMEOUT_MS {
            return Err(GatewayError::Config(format!(
                "translator.poll_timeout_ms must be <= {MAX_POLL_TIMEOUT_MS}"
            )));
        }
        let rate = self.flood.rate_hz;
        if !(rate.is_finite() && rate > 0.0 && rate <= MAX_FLOOD_RATE_HZ) {
            return Err(GatewayError::Config(format!(
                "flood.rate_hz must be in (0, {MAX_FLOOD_RATE_HZ}], got {rate}"
            )));
        }
        if self.flood.duration_ms > MAX_FLOOD_DURATION_MS {
            return Err(GatewayError::Config(format!(
                "flood.duration_ms must be <= {MAX_FLOOD_DURATION_MS}"
            )));
        }
        if self.metrics.enabled && self.metrics.interval_ms == 0 {
            return Err(GatewayError::Config("metrics.interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Producer
// ─────────────────────────────────────────────────────────────────────────────

/// Where the producer's forwarding loop sends staged samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Uplink {
    /// Straight into the translator's channel in this process.
    #[default]
    InProcess,
    /// Over UDP to a translator ingress socket.
    Datagram { target: SocketAddr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Generator tick period in milliseconds. 20 ms ≈ 50 Hz.
    pub tick_ms: u64,
    /// Capacity of the producer's local staging queue.
    pub outbox_capacity: usize,
    /// Largest change of the raw reading between two ticks.
    pub max_step: u8,
    /// Fixed seed for a reproducible steering walk.
    pub seed: Option<u64>,
    pub uplink: Uplink,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 20,
            outbox_capacity: 500,
            max_step: 8,
            seed: None,
            uplink: Uplink::InProcess,
        }
    }
}

impl ProducerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Translator
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    /// Longest single wait on the channel before re-checking for shutdown.
    pub poll_timeout_ms: u64,
    /// Artificial per-item delay while the flood attack is active.
    pub flood_delay_ms: u64,
    pub arbitration_id: u32,
    /// Bind a UDP ingress socket here to accept samples from a separate
    /// producer process.
    pub ingress: Option<SocketAddr>,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            flood_delay_ms: 50,
            arbitration_id: 0x100,
            ingress: None,
        }
    }
}

impl TranslatorConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn flood_delay(&self) -> Duration {
        Duration::from_millis(self.flood_delay_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Flood burst
// ─────────────────────────────────────────────────────────────────────────────

/// Shape of the DoS event burst fired when the flood attack is switched on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodConfig {
    pub duration_ms: u64,
    pub rate_hz: f64,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            duration_ms: 3_000,
            rate_hz: 80.0,
        }
    }
}

impl FloodConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Run the `system.metrics` reporter while the pipeline is up.
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
        }
    }
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_cadence() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.channel_capacity, 500);
        assert_eq!(cfg.producer.tick(), Duration::from_millis(20));
        assert_eq!(cfg.translator.arbitration_id, 0x100);
        assert_eq!(cfg.producer.uplink, Uplink::InProcess);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_in_defaults() -> Result<(), serde_json::Error> {
        let cfg: PipelineConfig = serde_json::from_str(
            r#"{"channel_capacity": 8, "producer": {"uplink": {"kind": "datagram", "target": "127.0.0.1:9000"}}}"#,
        )?;
        assert_eq!(cfg.channel_capacity, 8);
        assert_eq!(cfg.producer.tick_ms, 20);
        assert_eq!(
            cfg.producer.uplink,
            Uplink::Datagram {
                target: "127.0.0.1:9000".parse().unwrap()
            }
        );
        assert_eq!(cfg.flood, FloodConfig::default());
        Ok(())
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let mut cfg = PipelineConfig::default();
        cfg.channel_capacity = 0;
        assert!(matches!(cfg.validate(), Err(GatewayError::Config(_))));

        let mut cfg = PipelineConfig::default();
        cfg.flood.rate_hz = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.producer.tick_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_bounds_the_flood_burst() {
        for rate in [1e10, f64::INFINITY, f64::NAN, -1.0, MAX_FLOOD_RATE_HZ + 1.0] {
            let mut cfg = PipelineConfig::default();
            cfg.flood.rate_hz = rate;
            assert!(
                matches!(cfg.validate(), Err(GatewayError::Config(_))),
                "rate {rate} accepted"
            );
        }

        let mut cfg = PipelineConfig::default();
        cfg.flood.rate_hz = MAX_FLOOD_RATE_HZ;
        assert!(cfg.validate().is_ok());

        // Tiny rates are accepted; the injector skips a burst it cannot time.
        cfg.flood.rate_hz = 1e-300;
        assert!(cfg.validate().is_ok());

        cfg.flood.duration_ms = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.translator.poll_timeout_ms = u64::MAX;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_metrics_interval_only_matters_when_enabled() {
        let mut cfg = PipelineConfig::default();
        cfg.metrics.interval_ms = 0;
        assert!(cfg.validate().is_err());
        cfg.metrics.enabled = false;
        assert!(cfg.validate().is_ok());
    }
}
