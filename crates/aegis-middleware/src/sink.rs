//! Telemetry sink adapters.
//!
//! The gateway never talks to dashboards or databases directly. It hands
//! [`TelemetryRecord`]s to a [`TelemetrySink`]; an adapter translates them for
//! whatever lives outside the pipeline.
//!
//! - [`MemorySink`] – bounded in-process buffer of the most recent records.
//! - [`TracingSink`] – writes each record as a structured `tracing` event.

use std::collections::VecDeque;
use std::sync::Mutex;

use aegis_types::{GatewayError, TelemetryRecord};
use async_trait::async_trait;
use tracing::info;

/// Every telemetry adapter must implement this trait.
///
/// Records arrive in emission order per stage. A sink error is logged by the
/// caller and never interrupts the pipeline.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, record: TelemetryRecord) -> Result<(), GatewayError>;
}

/// Ring buffer keeping the newest `capacity` records.
pub struct MemorySink {
    capacity: usize,
    records: Mutex<VecDeque<TelemetryRecord>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Copy of the buffered records, oldest first.
    pub fn snapshot(&self) -> Vec<TelemetryRecord> {
        self.lock().iter().cloned().collect()
    }

    /// The newest `n` records, oldest first.
    pub fn latest(&self, n: usize) -> Vec<TelemetryRecord> {
        let records = self.lock();
        let skip = records.len().saturating_sub(n);
        records.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TelemetryRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(500)
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn record(&self, record: TelemetryRecord) -> Result<(), GatewayError> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut records = self.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }
}

/// Emits every record as an `info` event with the payload as JSON.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn record(&self, record: TelemetryRecord) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(&record.event.payload)
            .map_err(|e| GatewayError::Handler(format!("telemetry serialization: {e}")))?;
        info!(stage = %record.stage, kind = %record.kind, payload = %payload, "telemetry");
        Ok(())
    }
}
