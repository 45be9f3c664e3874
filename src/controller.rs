use crate::cache::{Fingerprint, ResultCache};
use crate::config::EngineConfig;
use crate::errors::{EngineResult, SimError};
use crate::models::calibration;
use crate::sim::driver::{self, RunConfig};
use crate::types::{CancelFlag, JobEvent, SimRequest};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Accepts simulation requests, owns the result cache, and drives at
/// most one blocking worker at a time. Controller and worker share only
/// the cancellation flag and the cache; everything else flows over the
/// event channel.
///
/// Job lifecycle: idle -> running -> (complete | cancelled | error),
/// terminal states absorbing until the next submit. The terminal state
/// is conveyed on the event stream.
pub struct JobController {
    config: EngineConfig,
    cache: Arc<Mutex<ResultCache>>,
    events_tx: mpsc::Sender<JobEvent>,
    active: Option<ActiveJob>,
}

struct ActiveJob {
    id: Uuid,
    cancel: CancelFlag,
    handle: tokio::task::JoinHandle<()>,
}

impl JobController {
    /// Build a controller and the receive end of its event stream.
    pub fn new(config: EngineConfig) -> (Self, mpsc::Receiver<JobEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cache =
            Arc::new(Mutex::new(ResultCache::new(config.cache_capacity, config.cache_ttl)));
        (Self { config, cache, events_tx, active: None }, events_rx)
    }

    /// Validate the request and start its job. A still-running job is
    /// cancelled and fully wound down first, so exactly one worker ever
    /// executes. A fingerprint hit short-circuits straight to
    /// `Complete` without drawing a path.
    pub async fn submit(&mut self, request: SimRequest) -> EngineResult<Uuid> {
        if let Some(job) = self.active.take() {
            job.cancel.cancel();
            let _ = job.handle.await;
        }

        let now = chrono::Utc::now();
        let target = request.market.target()?;
        if !request.spot.is_finite() || request.spot <= 0.0 {
            return Err(SimError::InvalidInput(format!("spot must be > 0, got {}", request.spot)));
        }
        let hours_to_close = request.market.hours_to_close(now);
        if hours_to_close <= 0.0 {
            return Err(SimError::InvalidInput(format!(
                "market {} already closed",
                request.market.ticker
            )));
        }

        let inputs = calibration::build_sim_inputs(
            &request.calibration,
            request.spot,
            hours_to_close,
            &request.sensitivity,
        )?;

        let job_id = Uuid::new_v4();
        let fingerprint = Fingerprint::new(
            &request.market.ticker,
            request.spot,
            hours_to_close,
            &request.sensitivity,
        );

        let cached = lock(&self.cache).get(&fingerprint);
        if let Some(result) = cached {
            tracing::info!(job_id = %job_id, fingerprint = %fingerprint, "cache hit");
            self.events_tx
                .send(JobEvent::Complete { job_id, result })
                .await
                .map_err(|e| SimError::ChannelClosed(e.to_string()))?;
            return Ok(job_id);
        }

        let n_paths = request.n_paths.unwrap_or(self.config.default_paths);
        let base_seed = request.base_seed.unwrap_or_else(wall_clock_seed);
        let run_cfg = RunConfig::from_engine(
            &self.config,
            n_paths,
            base_seed,
            request.capture_distribution,
        );

        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();
        let tx = self.events_tx.clone();
        let cache = Arc::clone(&self.cache);

        tracing::info!(
            job_id = %job_id,
            ticker = %request.market.ticker,
            n_paths,
            base_seed,
            hours_to_close,
            degraded = request.calibration.degraded,
            "job started"
        );

        let handle = tokio::task::spawn_blocking(move || {
            let progress_tx = tx.clone();
            let outcome = driver::run(&inputs, &target, &run_cfg, &worker_cancel, |update| {
                let _ = progress_tx.blocking_send(JobEvent::Progress { job_id, update });
            });

            let event = match outcome {
                Ok(result) => {
                    // Cache write strictly precedes the completion event.
                    lock(&cache).insert(&fingerprint, result.clone());
                    tracing::info!(job_id = %job_id, p = result.p, fair = result.fair, "job complete");
                    JobEvent::Complete { job_id, result }
                }
                Err(SimError::Cancelled) => {
                    tracing::info!(job_id = %job_id, "job cancelled");
                    JobEvent::Cancelled { job_id }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "job failed");
                    JobEvent::Error { job_id, message: e.to_string() }
                }
            };
            let _ = tx.blocking_send(event);
        });

        self.active = Some(ActiveJob { id: job_id, cancel, handle });
        Ok(job_id)
    }

    /// Request cooperative cancellation. The worker acknowledges at the
    /// next batch boundary; nothing is cached or completed after that.
    pub fn cancel(&self, job_id: Uuid) {
        if let Some(job) = &self.active {
            if job.id == job_id {
                tracing::info!(job_id = %job_id, "cancellation requested");
                job.cancel.cancel();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|job| !job.handle.is_finished())
    }

    pub fn cached_results(&self) -> usize {
        lock(&self.cache).len()
    }
}

/// Cache lock with poison recovery: a worker that panicked mid-insert
/// leaves the map structurally intact.
fn lock(cache: &Arc<Mutex<ResultCache>>) -> MutexGuard<'_, ResultCache> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wall_clock_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5EED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::calibration::degraded_default;
    use crate::types::{MarketDescriptor, SensitivityOverrides};

    fn market(hours_out: i64) -> MarketDescriptor {
        let close = chrono::Utc::now() + chrono::Duration::hours(hours_out);
        MarketDescriptor {
            ticker: "KXBTCD-TEST".into(),
            close_time: close.to_rfc3339(),
            strike_price: Some(60_000.0),
            range_low: None,
            range_high: None,
        }
    }

    fn request(n_paths: u32, spot: f64) -> SimRequest {
        SimRequest {
            market: market(1),
            spot,
            calibration: degraded_default(chrono::Utc::now()),
            sensitivity: SensitivityOverrides::default(),
            n_paths: Some(n_paths),
            base_seed: Some(42),
            capture_distribution: false,
        }
    }

    #[tokio::test]
    async fn full_job_emits_progress_then_complete() {
        crate::init_test_tracing();
        let (mut controller, mut events) = JobController::new(EngineConfig::default());
        let job_id = controller.submit(request(2_000, 60_000.0)).await.unwrap();

        let mut progress_seen = 0u32;
        loop {
            match events.recv().await.unwrap() {
                JobEvent::Progress { job_id: id, update } => {
                    assert_eq!(id, job_id);
                    progress_seen += 1;
                    assert_eq!(update.batch, progress_seen);
                    assert!(update.cumulative_n > 0);
                }
                JobEvent::Complete { job_id: id, result } => {
                    assert_eq!(id, job_id);
                    assert_eq!(progress_seen, 10, "complete strictly follows final progress");
                    assert!(result.p >= 0.0 && result.p <= 1.0);
                    assert!(result.ci[0] <= result.p && result.p <= result.ci[1]);
                    // Write-through happened before this event arrived.
                    assert_eq!(controller.cached_results(), 1);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn repeat_submit_hits_the_cache() {
        crate::init_test_tracing();
        let (mut controller, mut events) = JobController::new(EngineConfig::default());
        controller.submit(request(2_000, 60_000.0)).await.unwrap();

        // Drain to the first completion.
        loop {
            if matches!(events.recv().await.unwrap(), JobEvent::Complete { .. }) {
                break;
            }
        }

        // Slightly perturbed spot lands in the same fingerprint bucket:
        // immediate completion, no progress events, no second entry.
        let second = controller.submit(request(2_000, 60_000.3)).await.unwrap();
        match events.recv().await.unwrap() {
            JobEvent::Complete { job_id, .. } => assert_eq!(job_id, second),
            other => panic!("expected cached completion, got {other:?}"),
        }
        assert_eq!(controller.cached_results(), 1);
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn cancel_suppresses_completion_and_cache_write() {
        crate::init_test_tracing();
        let (mut controller, mut events) = JobController::new(EngineConfig::default());
        let job_id = controller.submit(request(500_000, 60_000.0)).await.unwrap();
        controller.cancel(job_id);

        loop {
            match events.recv().await.unwrap() {
                JobEvent::Progress { .. } => continue,
                JobEvent::Cancelled { job_id: id } => {
                    assert_eq!(id, job_id);
                    break;
                }
                other => panic!("expected cancellation, got {other:?}"),
            }
        }
        assert_eq!(controller.cached_results(), 0, "no partial result cached");

        // The controller accepts fresh work afterwards.
        let next = controller.submit(request(1_000, 61_000.0)).await.unwrap();
        loop {
            match events.recv().await.unwrap() {
                JobEvent::Progress { job_id: id, .. } => assert_eq!(id, next),
                JobEvent::Complete { job_id: id, .. } => {
                    assert_eq!(id, next);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn submit_while_running_cancels_and_replaces() {
        crate::init_test_tracing();
        let (mut controller, mut events) = JobController::new(EngineConfig::default());
        let first = controller.submit(request(500_000, 60_000.0)).await.unwrap();
        let second = controller.submit(request(1_000, 62_000.0)).await.unwrap();
        assert_ne!(first, second);

        let mut first_terminal = None;
        let mut second_done = false;
        while !second_done {
            match events.recv().await.unwrap() {
                JobEvent::Cancelled { job_id } if job_id == first => {
                    assert!(first_terminal.is_none());
                    first_terminal = Some("cancelled");
                }
                JobEvent::Complete { job_id, .. } if job_id == first => {
                    // The first job may have finished before the flag
                    // was observed; either terminal is legal, but only
                    // one of them.
                    assert!(first_terminal.is_none());
                    first_terminal = Some("complete");
                }
                JobEvent::Complete { job_id, .. } if job_id == second => {
                    assert!(first_terminal.is_some(), "old job wound down first");
                    second_done = true;
                }
                JobEvent::Progress { .. } => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_running() {
        crate::init_test_tracing();
        let (mut controller, _events) = JobController::new(EngineConfig::default());

        let mut bad = request(1_000, 60_000.0);
        bad.spot = -5.0;
        assert!(matches!(
            controller.submit(bad).await,
            Err(SimError::InvalidInput(_))
        ));

        let mut closed = request(1_000, 60_000.0);
        closed.market = market(-1);
        assert!(controller.submit(closed).await.is_err());

        let mut ambiguous = request(1_000, 60_000.0);
        ambiguous.market.range_low = Some(55_000.0);
        ambiguous.market.range_high = Some(65_000.0);
        assert!(controller.submit(ambiguous).await.is_err());

        assert!(!controller.is_running());
    }
}
