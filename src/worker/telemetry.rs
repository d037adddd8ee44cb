use std::time::Duration;

use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::capacity::CapacitySampler;
use crate::protocol::Envelope;
use crate::session::Outbound;

/// Shortest accepted reporting period; a zero interval is raised to this.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically advertises this worker's spare capacity.
pub struct TelemetryLoop {
    identity: Uuid,
    interval: Duration,
    capacity: CapacitySampler,
}

impl TelemetryLoop {
    pub fn new(identity: Uuid, interval: Duration, capacity: CapacitySampler) -> Self {
        Self {
            identity,
            interval: interval.max(MIN_INTERVAL),
            capacity,
        }
    }

    /// Run until the owning session drops this future. The first report goes
    /// out immediately.
    pub async fn run(&self, outbound: &Outbound) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let Some(memory) = self.capacity.read().await else {
                tracing::debug!("No eligible GPU capacity, skipping report");
                continue;
            };

            match outbound.send(Envelope::telemetry(self.identity, memory)).await {
                Ok(()) => tracing::info!(memory, "Sent capacity report"),
                Err(e) => tracing::error!(error = %e, "Failed to send capacity report"),
            }
        }
    }
}
