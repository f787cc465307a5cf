//! Fixed-interval background refresh.
//!
//! Each registered [`RefreshJob`] fires on every tick unless its previous
//! refresh is still outstanding. Results travel to the hub tagged with the
//! polling generation they were started under; teardown starts a new
//! generation, so the hub drops anything still queued or in flight.

use crate::hub::{EngineUpdate, UpdateSender};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// A periodic refresh. `key` identifies it for single-flight purposes.
#[async_trait]
pub trait RefreshJob: Send + Sync {
    fn key(&self) -> String;

    /// Fetch and turn the result into view updates. Failures become notice
    /// updates; nothing here may touch view state directly.
    async fn run(&self) -> Vec<EngineUpdate>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SchedulerState {
    interval: Duration,
    updates: UpdateSender,
    jobs: Mutex<Vec<Arc<dyn RefreshJob>>>,
    inflight: Mutex<HashSet<String>>,
    running: AtomicBool,
}

impl SchedulerState {
    fn add_job(&self, job: Arc<dyn RefreshJob>) {
        let key = job.key();
        let mut jobs = lock(&self.jobs);
        jobs.retain(|j| j.key() != key);
        jobs.push(job);
    }

    fn remove_job(&self, key: &str) -> bool {
        let mut jobs = lock(&self.jobs);
        let before = jobs.len();
        jobs.retain(|j| j.key() != key);
        jobs.len() != before
    }

    fn trigger_all(self: &Arc<Self>) -> usize {
        let jobs: Vec<_> = lock(&self.jobs).clone();
        jobs.into_iter().filter(|job| self.trigger(Arc::clone(job))).count()
    }

    fn trigger(self: &Arc<Self>, job: Arc<dyn RefreshJob>) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let key = job.key();
        if !lock(&self.inflight).insert(key.clone()) {
            debug!(job = %key, "previous refresh still in flight; skipping");
            return false;
        }
        let generation = self.updates.current_generation();
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let _slot = InflightSlot {
                state: Arc::clone(&state),
                key: key.clone(),
            };
            let updates = job.run().await;
            for update in updates {
                if state.updates.current_generation() != generation {
                    debug!(job = %key, "discarding refresh from a torn-down generation");
                    return;
                }
                let tagged = EngineUpdate::Refresh {
                    generation,
                    update: Box::new(update),
                };
                if !state.updates.send(tagged).await {
                    return;
                }
            }
        });
        true
    }
}

/// Frees a job's single-flight slot even if the refresh panics.
struct InflightSlot {
    state: Arc<SchedulerState>,
    key: String,
}

impl Drop for InflightSlot {
    fn drop(&mut self) {
        lock(&self.state.inflight).remove(&self.key);
    }
}

pub struct PollingScheduler {
    state: Arc<SchedulerState>,
    timer: Option<JoinHandle<()>>,
}

impl PollingScheduler {
    pub fn new(interval: Duration, updates: UpdateSender) -> Self {
        Self {
            state: Arc::new(SchedulerState {
                interval,
                updates,
                jobs: Mutex::new(Vec::new()),
                inflight: Mutex::new(HashSet::new()),
                running: AtomicBool::new(false),
            }),
            timer: None,
        }
    }

    /// Register a job, replacing any job with the same key.
    pub fn add_job(&self, job: Arc<dyn RefreshJob>) {
        self.state.add_job(job);
    }

    pub fn remove_job(&self, key: &str) -> bool {
        self.state.remove_job(key)
    }

    /// Begin ticking. The first tick fires immediately.
    pub fn start(&mut self) {
        if self.timer.is_some() {
            return;
        }
        self.state.running.store(true, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        self.timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                state.trigger_all();
            }
        }));
        info!(interval = ?self.state.interval, "polling scheduler started");
    }

    /// Refresh every job now, outside the tick. Returns how many launched.
    pub fn trigger_now(&self) -> usize {
        self.state.trigger_all()
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.updates.current_generation()
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Stop ticking and invalidate every refresh still in flight.
    pub fn teardown(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        self.state.updates.begin_generation();
        if let Some(timer) = self.timer.take() {
            timer.abort();
            info!("polling scheduler torn down");
        }
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Cloneable trigger for code that does not own the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    state: Arc<SchedulerState>,
}

impl SchedulerHandle {
    pub fn trigger_now(&self) -> usize {
        self.state.trigger_all()
    }

    pub fn add_job(&self, job: Arc<dyn RefreshJob>) {
        self.state.add_job(job);
    }

    pub fn remove_job(&self, key: &str) -> bool {
        self.state.remove_job(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::StateHub;
    use std::sync::atomic::AtomicUsize;
    use telemetry_core::FailureKind;
    use tokio::time::sleep;

    const TICK: Duration = Duration::from_secs(30);

    struct CountingJob {
        key: &'static str,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingJob {
        fn new(key: &'static str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                key,
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshJob for CountingJob {
        fn key(&self) -> String {
            self.key.to_string()
        }

        async fn run(&self) -> Vec<EngineUpdate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(self.delay).await;
            vec![EngineUpdate::Notice {
                kind: FailureKind::TransientNetwork,
                detail: None,
            }]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_immediately_then_every_interval() {
        let hub = StateHub::spawn(16);
        let mut scheduler = PollingScheduler::new(TICK, hub.sender());
        let job = CountingJob::new("runs", Duration::from_millis(10));
        scheduler.add_job(job.clone());
        scheduler.start();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(job.calls(), 1);
        sleep(TICK).await;
        assert_eq!(job.calls(), 2);
        sleep(TICK).await;
        assert_eq!(job.calls(), 3);
        assert_eq!(hub.views().notices.borrow().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_suppresses_overlapping_ticks() {
        let hub = StateHub::spawn(16);
        let mut scheduler = PollingScheduler::new(TICK, hub.sender());
        let slow = CountingJob::new("runs", Duration::from_secs(100));
        let fast = CountingJob::new("artifact:camden/latest", Duration::from_millis(10));
        scheduler.add_job(slow.clone());
        scheduler.add_job(fast.clone());
        scheduler.start();

        sleep(Duration::from_secs(95)).await;
        assert_eq!(slow.calls(), 1);
        assert_eq!(fast.calls(), 4);
        assert_eq!(scheduler.trigger_now(), 1);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(slow.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_discards_in_flight_results_and_stops_ticking() {
        let hub = StateHub::spawn(16);
        let views = hub.views();
        let mut scheduler = PollingScheduler::new(TICK, hub.sender());
        let job = CountingJob::new("runs", Duration::from_secs(10));
        scheduler.add_job(job.clone());
        scheduler.start();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(job.calls(), 1);
        let before = scheduler.generation();
        scheduler.teardown();
        assert!(scheduler.generation() > before);
        assert!(!scheduler.is_running());

        sleep(Duration::from_secs(120)).await;
        assert_eq!(job.calls(), 1);
        assert!(views.notices.borrow().is_empty());
        assert_eq!(scheduler.trigger_now(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn results_blocked_on_a_full_queue_are_dropped_after_teardown() {
        let hub = StateHub::spawn(1);
        let views = hub.views();
        let mut scheduler = PollingScheduler::new(TICK, hub.sender());
        let job = CountingJob::new("runs", Duration::from_secs(1));
        scheduler.add_job(job.clone());

        // The only queue slot is taken, so the finished refresh waits in `send`.
        let slot = hub.sender().hold_slot().await;
        scheduler.start();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(job.calls(), 1);

        scheduler.teardown();
        drop(slot);
        sleep(Duration::from_secs(5)).await;
        assert!(views.notices.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_are_replaced_and_removed_by_key() {
        let hub = StateHub::spawn(16);
        let mut scheduler = PollingScheduler::new(TICK, hub.sender());
        let first = CountingJob::new("runs", Duration::ZERO);
        let second = CountingJob::new("runs", Duration::ZERO);
        scheduler.add_job(first.clone());
        scheduler.handle().add_job(second.clone());
        scheduler.start();
        sleep(Duration::from_secs(1)).await;
        assert_eq!((first.calls(), second.calls()), (0, 1));

        assert!(scheduler.handle().remove_job("runs"));
        assert!(!scheduler.remove_job("runs"));
        sleep(TICK).await;
        assert_eq!(second.calls(), 1);
    }
}
