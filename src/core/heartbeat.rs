//! Periodic maintenance: heartbeat-timeout detection and the requeue pump.
//!
//! A single task ticks two timers. The staleness sweep drives state-machine
//! transitions to unavailable (and reclaims entities past the retention
//! window); the pump re-evaluates requeued placement requests. Both run
//! off the event path so message delivery never waits on them.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::now_ms;
use crate::service::RegistryService;

pub struct HeartbeatMonitor {
    service: Arc<RegistryService>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    pub fn new(service: Arc<RegistryService>, cancel: CancellationToken) -> Self {
        Self { service, cancel }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep_interval =
                tokio::time::interval(self.service.config().heartbeat.scan_interval());
            let mut pump_interval =
                tokio::time::interval(self.service.config().route.requeue_delay());

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("Heartbeat monitor shutting down");
                        break;
                    }

                    _ = sweep_interval.tick() => {
                        if let Err(e) = self.service.sweep(now_ms()).await {
                            // Fail closed: entities keep their prior state
                            // and the next tick retries the scan.
                            warn!(error = %e, "Staleness sweep failed");
                        }
                    }

                    _ = pump_interval.tick() => {
                        if let Err(e) = self.service.pump_pending().await {
                            warn!(error = %e, "Requeue pump failed");
                        }
                    }
                }
            }
        })
    }
}
