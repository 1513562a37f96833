//! [`FaultInjector`] – synthetic fault events.
//!
//! The injector only publishes on [`topic::ATTACK_EVENT`]. It never touches
//! the priority channel; the data-path effect of an attack comes from the
//! pipeline switching the translator's [`AttackMode`][aegis_types::AttackMode].

use std::time::Duration;

use aegis_middleware::EventBus;
use aegis_types::{AttackEvent, AttackKind, Event, EventPayload, topic};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SOURCE: &str = "aegis-runtime::fault_injector";

/// Fastest tick a burst runs at, whatever rate is asked for.
pub const MIN_BURST_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct FaultInjector {
    bus: EventBus,
}

impl FaultInjector {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Publish `DOS` events at `rate_hz` for `duration`.
    ///
    /// Cancelling `token` ends the burst early; that is a normal exit. Returns
    /// the number of events published.
    pub async fn flood(&self, duration: Duration, rate_hz: f64, token: CancellationToken) -> u64 {
        let Some(period) = burst_period(rate_hz) else {
            warn!(rate_hz, "DoS burst skipped: rate has no usable period");
            return 0;
        };
        let Some(deadline) = Instant::now().checked_add(duration) else {
            warn!(?duration, "DoS burst skipped: duration out of range");
            return 0;
        };
        warn!(?duration, rate_hz, ?period, "starting DoS burst");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut count = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("DoS burst cancelled");
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    count += 1;
                    let mut attack = AttackEvent::new(AttackKind::Dos, "simulated bus flood");
                    attack.event_count = count;
                    attack.rate_hz = Some(rate_hz);
                    self.publish(attack).await;
                }
            }
        }

        info!(events = count, "DoS burst ended");
        count
    }

    pub async fn bitflip(&self) {
        self.publish(AttackEvent::new(
            AttackKind::BitFlip,
            "Random bit flip injected in steering data",
        ))
        .await;
        warn!("bit-flip attack event published");
    }

    pub async fn heartbeat_drop(&self) {
        self.publish(AttackEvent::new(
            AttackKind::HeartbeatLoss,
            "Heartbeat messages dropped - potential node isolation",
        ))
        .await;
        warn!("heartbeat drop attack event published");
    }

    async fn publish(&self, attack: AttackEvent) {
        self.bus
            .publish(topic::ATTACK_EVENT, Event::new(SOURCE, EventPayload::Attack(attack)))
            .await;
    }
}

/// Tick period for `rate_hz`, never shorter than [`MIN_BURST_PERIOD`].
/// `None` for rates that are not positive or whose period overflows.
fn burst_period(rate_hz: f64) -> Option<Duration> {
    if !(rate_hz.is_finite() && rate_hz > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(rate_hz.recip())
        .ok()
        .map(|period| period.max(MIN_BURST_PERIOD))
}
