//! Periodic background work: the trending decay tick and the retry drain.
//!
//! Both loops finish the iteration in progress before honouring shutdown.

use crate::clock::Clock;
use crate::index::InvertedIndex;
use crate::retry::RetryQueue;
use crate::service::SearchService;
use crate::trending::TrendingEngine;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const MINUTE: Duration = Duration::from_secs(60);

/// Time left until the next wall-clock minute boundary.
pub fn until_next_minute(clock: &dyn Clock) -> Duration {
    let into_minute = clock.unix_seconds().rem_euclid(60.0);
    Duration::from_secs_f64((60.0 - into_minute).clamp(0.0, 60.0))
}

/// Handle on the spawned loops.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Starts the decay and retry loops for `service` on the current runtime.
    pub fn spawn(service: &SearchService) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let pipeline = service.pipeline();
        let handles = vec![
            tokio::spawn(decay_loop(service.trending_engine().clone(), rx.clone())),
            tokio::spawn(retry_loop(
                pipeline.retry_queue().clone(),
                pipeline.index().clone(),
                rx,
            )),
        ];
        tracing::info!("background tasks started");
        Self { shutdown, handles }
    }

    /// Signals both loops and waits for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "background task panicked");
            }
        }
        tracing::info!("background tasks stopped");
    }
}

async fn decay_loop(engine: TrendingEngine, mut shutdown: watch::Receiver<bool>) {
    let first = Instant::now() + until_next_minute(engine.clock().as_ref());
    let mut ticker = interval_at(first, MINUTE);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        match engine.decay_tick().await {
            Ok(report) => tracing::trace!(buckets = report.buckets, "decay tick"),
            Err(e) => tracing::error!(error = %e, "trending decay tick failed"),
        }
    }
    tracing::debug!("decay loop exited");
}

async fn retry_loop(queue: RetryQueue, index: InvertedIndex, mut shutdown: watch::Receiver<bool>) {
    let period = queue.config().interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        match queue.drain(&index).await {
            Ok(report) if !report.is_empty() => tracing::info!(
                indexed = report.indexed,
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                malformed = report.malformed,
                "retry drain finished"
            ),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "retry drain failed"),
        }
    }
    tracing::debug!("retry loop exited");
}
