//! Scheduler: periodic preheat (and, transitively, push) per site.
//!
//! Runs on its own timer, independent of request traffic. Each tick
//! checks every registered site with preheat enabled and triggers a run
//! when its configured interval has elapsed. An already-running preheat
//! is skipped quietly; the next due tick retries.

use crate::error::PreheatError;
use crate::preheat::PreheatRunner;
use crate::push::PushRunner;
use crate::registry::EngineManager;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How often the scheduler wakes to check site cadences
const TICK_INTERVAL_SECS: u64 = 60;

pub struct Scheduler {
    registry: Arc<EngineManager>,
    preheat: Arc<PreheatRunner>,
    push: Arc<PushRunner>,
    last_runs: Mutex<HashMap<String, Instant>>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        registry: Arc<EngineManager>,
        preheat: Arc<PreheatRunner>,
        push: Arc<PushRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            preheat,
            push,
            last_runs: Mutex::new(HashMap::new()),
            tick_interval: Duration::from_secs(TICK_INTERVAL_SECS),
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        // The first tick fires immediately; skip it so startup is quiet
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One cadence check over all registered sites
    pub async fn tick(&self) {
        let sites = self.registry.list_sites();

        // Decide what is due without holding the lock across awaits
        let due: Vec<_> = {
            let mut last_runs = self.last_runs.lock();
            let now = Instant::now();
            sites
                .into_iter()
                .filter(|site| site.render.preheat.enabled)
                .filter(|site| {
                    let interval = Duration::from_secs(site.render.preheat.interval_secs);
                    let due = is_due(last_runs.get(&site.id).copied(), interval, now);
                    if due {
                        last_runs.insert(site.id.clone(), now);
                    }
                    due
                })
                .collect()
        };

        for site in due {
            match self.preheat.trigger(Arc::clone(&site)).await {
                Ok(task_id) => {
                    debug!(site = %site.id, task = %task_id, "Scheduled preheat triggered");
                    if site.render.push.enabled {
                        if let Err(e) = self.push.trigger(Arc::clone(&site)).await {
                            warn!(site = %site.id, error = %e, "Scheduled push failed to start");
                        }
                    }
                }
                Err(PreheatError::AlreadyRunning(_)) => {
                    debug!(site = %site.id, "Preheat already running, skipping scheduled run");
                }
                Err(e) => {
                    warn!(site = %site.id, error = %e, "Scheduled preheat failed to start");
                }
            }
        }

        // Drop cadence state for removed sites
        let live: std::collections::HashSet<String> =
            self.registry.site_ids().into_iter().collect();
        self.last_runs.lock().retain(|id, _| live.contains(id));
    }
}

/// Whether a site's preheat is due: never run, or its interval elapsed
fn is_due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last {
        None => true,
        Some(last) => now.duration_since(last) >= interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_due() {
        let now = Instant::now();
        assert!(is_due(None, Duration::from_secs(60), now));
        assert!(!is_due(Some(now), Duration::from_secs(60), now));

        let old = now - Duration::from_secs(120);
        assert!(is_due(Some(old), Duration::from_secs(60), now));
        assert!(!is_due(Some(old), Duration::from_secs(600), now));
    }
}
