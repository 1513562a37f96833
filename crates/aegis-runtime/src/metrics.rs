//! [`MetricsReporter`] – periodic host load on `system.metrics`.
//!
//! An observer only: each tick it reads the supervisor's task health and the
//! host's CPU, memory and disk usage, publishes a [`SystemMetrics`] event and
//! keeps the latest snapshot for status queries. It never touches the data
//! path.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use aegis_kernel::{CancellationToken, TaskHandle, TaskOutcome, TaskSupervisor};
use aegis_middleware::EventBus;
use aegis_types::{Event, EventPayload, GatewayError, SystemMetrics, topic};
use sysinfo::{Disks, System};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::MetricsConfig;

/// Task name of the reporting loop.
pub const METRICS_TASK: &str = "system.metrics";

const SOURCE: &str = "aegis-runtime::metrics";

type Latest = Arc<std::sync::Mutex<Option<SystemMetrics>>>;

/// Share of `total` taken by `used`, in percent. Zero when `total` is zero.
fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (used.min(total) as f64 / total as f64 * 100.0) as f32
}

/// Keeps the previous CPU reading between samples, so use one per loop.
struct HostSampler {
    system: System,
}

impl HostSampler {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }

    fn sample(&mut self, live_tasks: usize) -> SystemMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        SystemMetrics {
            cpu_percent: self.system.global_cpu_usage(),
            ram_percent: percent(self.system.used_memory(), self.system.total_memory()),
            disk_percent: root_disk_percent(),
            live_tasks,
        }
    }
}

fn root_disk_percent() -> f32 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().iter().max_by_key(|d| d.total_space()))
        .map_or(0.0, |d| {
            percent(
                d.total_space().saturating_sub(d.available_space()),
                d.total_space(),
            )
        })
}

pub struct MetricsReporter {
    config: MetricsConfig,
    bus: EventBus,
    tasks: Arc<TaskSupervisor>,
    handle: Mutex<Option<TaskHandle>>,
    latest: Latest,
}

impl MetricsReporter {
    pub fn new(config: MetricsConfig, bus: EventBus, tasks: Arc<TaskSupervisor>) -> Self {
        Self {
            config,
            bus,
            tasks,
            handle: Mutex::new(None),
            latest: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Start the reporting loop. A no-op while it is running.
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("metrics reporter already running");
            return;
        }

        let bus = self.bus.clone();
        // Weak: the loop must not keep its own supervisor alive.
        let tasks = Arc::downgrade(&self.tasks);
        let latest = Arc::clone(&self.latest);
        let period = self.config.interval();
        *handle = Some(self.tasks.start(METRICS_TASK, move |token| {
            report(bus, tasks, latest, period, token)
        }));
        info!(interval_ms = self.config.interval_ms, "metrics reporter started");
    }

    /// Cancel the loop and wait for it. A no-op when stopped.
    ///
    /// # Errors
    ///
    /// The loop's failure, if it ended with one other than cancellation.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(());
        };
        handle.cancel();
        let outcome = handle.join().await;
        info!("metrics reporter stopped");
        match outcome {
            TaskOutcome::Failed(e) => Err(e),
            TaskOutcome::Completed | TaskOutcome::Cancelled => Ok(()),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Most recent snapshot, if one has been taken.
    pub fn latest(&self) -> Option<SystemMetrics> {
        *lock_latest(&self.latest)
    }
}

fn lock_latest(latest: &Latest) -> std::sync::MutexGuard<'_, Option<SystemMetrics>> {
    latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn report(
    bus: EventBus,
    tasks: Weak<TaskSupervisor>,
    latest: Latest,
    period: Duration,
    token: CancellationToken,
) -> Result<(), GatewayError> {
    let mut sampler = HostSampler::new();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(GatewayError::Cancelled),
            _ = ticker.tick() => {}
        }

        let Some(live_tasks) = tasks
            .upgrade()
            .map(|t| t.health().values().filter(|alive| **alive).count())
        else {
            return Ok(());
        };
        let metrics = sampler.sample(live_tasks);
        debug!(
            cpu = metrics.cpu_percent,
            ram = metrics.ram_percent,
            disk = metrics.disk_percent,
            live_tasks,
            "system metrics"
        );
        *lock_latest(&latest) = Some(metrics);
        bus.publish(
            topic::SYSTEM_METRICS,
            Event::new(SOURCE, EventPayload::Metrics(metrics)),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> MetricsConfig {
        MetricsConfig {
            enabled: true,
            interval_ms: 20,
        }
    }

    #[test]
    fn percent_handles_edges() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
        assert_eq!(percent(300, 200), 100.0);
    }

    #[tokio::test]
    async fn reports_host_load_and_live_tasks() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::new();
        let mut rx = bus.tap(topic::SYSTEM_METRICS, 16);
        let tasks = Arc::new(TaskSupervisor::new());
        tasks.start("idle", |token: CancellationToken| async move {
            token.cancelled().await;
            Err(GatewayError::Cancelled)
        });

        let reporter = MetricsReporter::new(fast(), bus.clone(), Arc::clone(&tasks));
        reporter.start().await;
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await?
            .ok_or("tap closed")?;
        reporter.stop().await?;

        let EventPayload::Metrics(m) = event.payload else {
            return Err("unexpected payload".into());
        };
        // The idle task and the reporter itself.
        assert_eq!(m.live_tasks, 2);
        assert!((0.0..=100.0).contains(&m.ram_percent));
        assert!((0.0..=100.0).contains(&m.disk_percent));
        assert!(reporter.latest().is_some());

        tasks.shutdown_all().await?;
        Ok(())
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() -> Result<(), GatewayError> {
        let tasks = Arc::new(TaskSupervisor::new());
        let reporter = MetricsReporter::new(fast(), EventBus::new(), Arc::clone(&tasks));
        assert!(reporter.latest().is_none());

        reporter.start().await;
        reporter.start().await;
        assert_eq!(tasks.len(), 1);
        assert!(reporter.is_running().await);

        reporter.stop().await?;
        reporter.stop().await?;
        assert!(!reporter.is_running().await);
        assert!(!tasks.is_running(METRICS_TASK));
        Ok(())
    }
}
