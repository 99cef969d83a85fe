//! Periodic background duties.
//!
//! A [`Chore`] runs a [`Duty`] on its own tokio task:
//! - the period is measured between duty starts, not as an idle gap
//! - `stop()` interrupts a sleep and prevents the next duty
//! - `trigger_now()` cuts the current sleep short without cancelling a
//!   duty that is already executing
//! - a fatal duty error stops that chore only

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_observe::{ChoreEvt, ChoreKind, Meter, NoopMeter, VizEvent};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{CoordError, ErrorKind};

/// Work performed by a [`Chore`] each period.
#[async_trait]
pub trait Duty: Send + 'static {
    /// Runs instead of [`chore`](Duty::chore) until it returns `true`.
    async fn initial_chore(&mut self) -> Result<bool, ChoreError> {
        Ok(true)
    }

    async fn chore(&mut self) -> Result<(), ChoreError>;

    /// Called once when the loop exits.
    fn cleanup(&mut self) {}
}

/// Duty failure, classified by whether the loop may continue.
#[derive(Debug, thiserror::Error)]
pub enum ChoreError {
    #[error("Recoverable duty error: {0}")]
    Recoverable(String),

    #[error("Fatal duty error: {0}")]
    Fatal(String),
}

impl From<CoordError> for ChoreError {
    fn from(e: CoordError) -> Self {
        match e.kind() {
            ErrorKind::CorruptMessage | ErrorKind::InvalidInput => ChoreError::Fatal(e.to_string()),
            _ => ChoreError::Recoverable(e.to_string()),
        }
    }
}

/// Lifecycle of a chore. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoreState {
    Created,
    Running,
    Stopped,
}

impl ChoreState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChoreState::Created,
            1 => ChoreState::Running,
            _ => ChoreState::Stopped,
        }
    }
}

struct ChoreControl {
    stop: AtomicBool,
    stop_notify: Notify,
    trigger: Notify,
    state: AtomicU8,
}

/// Control handle of a chore. Cloning shares the same chore.
///
/// Dropping a handle does not stop the chore.
#[derive(Clone)]
pub struct ChoreHandle {
    name: Arc<str>,
    control: Arc<ChoreControl>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ChoreHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChoreState {
        ChoreState::from_u8(self.control.state.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.control.stop.load(Ordering::Acquire)
    }

    /// Request the loop to exit before its next duty.
    pub fn stop(&self) {
        if !self.control.stop.swap(true, Ordering::AcqRel) {
            debug!(chore = %self.name, "Stop requested");
        }
        self.control.stop_notify.notify_one();
    }

    /// Run the next duty without waiting out the period.
    pub fn trigger_now(&self) {
        self.control.trigger.notify_one();
    }

    /// Wait for the loop to exit.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(chore = %self.name, error = %e, "Chore task panicked");
            }
        }
    }
}

/// A named periodic duty.
pub struct Chore<D: Duty> {
    name: Arc<str>,
    period: Duration,
    duty: D,
    control: Arc<ChoreControl>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    meter: Arc<dyn Meter>,
}

impl<D: Duty> Chore<D> {
    pub fn new(name: impl Into<String>, period: Duration, duty: D) -> Self {
        Self {
            name: Arc::from(name.into()),
            period,
            duty,
            control: Arc::new(ChoreControl {
                stop: AtomicBool::new(false),
                stop_notify: Notify::new(),
                trigger: Notify::new(),
                state: AtomicU8::new(ChoreState::Created as u8),
            }),
            task: Arc::new(Mutex::new(None)),
            meter: Arc::new(NoopMeter),
        }
    }

    pub fn with_meter(mut self, meter: Arc<dyn Meter>) -> Self {
        self.meter = meter;
        self
    }

    /// Handle usable before the chore is started.
    pub fn handle(&self) -> ChoreHandle {
        ChoreHandle {
            name: self.name.clone(),
            control: self.control.clone(),
            task: self.task.clone(),
        }
    }

    /// Spawn the loop and return its handle.
    pub fn start(self) -> ChoreHandle {
        let handle = self.handle();
        let task = self.task.clone();
        self.control
            .state
            .store(ChoreState::Running as u8, Ordering::Release);
        *task.lock() = Some(tokio::spawn(self.run()));
        handle
    }

    async fn run(mut self) {
        info!(chore = %self.name, period = ?self.period, "Chore started");
        self.emit(ChoreKind::Started);

        let mut initialized = false;
        loop {
            if self.control.stop.load(Ordering::Acquire) {
                break;
            }

            let started = Instant::now();
            let outcome = if initialized {
                self.duty.chore().await
            } else {
                self.duty.initial_chore().await.map(|done| {
                    initialized = done;
                })
            };

            match outcome {
                Ok(()) => {}
                Err(ChoreError::Recoverable(reason)) => {
                    warn!(chore = %self.name, reason = %reason, "Duty failed, continuing");
                    self.emit(ChoreKind::DutyFailed { fatal: false });
                }
                Err(ChoreError::Fatal(reason)) => {
                    error!(chore = %self.name, reason = %reason, "Duty failed fatally, stopping");
                    self.emit(ChoreKind::DutyFailed { fatal: true });
                    self.control.stop.store(true, Ordering::Release);
                    break;
                }
            }

            if self.control.stop.load(Ordering::Acquire) {
                break;
            }

            tokio::select! {
                _ = sleep_until(started + self.period) => {}
                _ = self.control.trigger.notified() => {
                    debug!(chore = %self.name, "Triggered");
                }
                _ = self.control.stop_notify.notified() => break,
            }
        }

        self.duty.cleanup();
        self.control
            .state
            .store(ChoreState::Stopped as u8, Ordering::Release);
        self.emit(ChoreKind::Stopped);
        info!(chore = %self.name, "Chore stopped");
    }

    fn emit(&self, kind: ChoreKind) {
        self.meter.emit(VizEvent::Chore(ChoreEvt {
            name: self.name.to_string(),
            kind,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::{sleep, timeout};

    /// Records the start instant of every duty.
    struct Recorder {
        starts: Arc<Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl Duty for Recorder {
        async fn chore(&mut self) -> Result<(), ChoreError> {
            self.starts.lock().push(Instant::now());
            Ok(())
        }
    }

    async fn wait_for_starts(starts: &Arc<Mutex<Vec<Instant>>>, n: usize) {
        while starts.lock().len() < n {
            sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_between_starts() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let handle = Chore::new(
            "recorder",
            Duration::from_secs(10),
            Recorder {
                starts: starts.clone(),
            },
        )
        .start();
        assert_eq!(handle.state(), ChoreState::Running);

        wait_for_starts(&starts, 3).await;
        handle.stop();
        handle.join().await;

        let s = starts.lock().clone();
        assert!(s[1] - s[0] >= Duration::from_secs(10));
        assert!(s[1] - s[0] < Duration::from_millis(10_500));
        assert!(s[2] - s[1] >= Duration::from_secs(10));
        assert_eq!(handle.state(), ChoreState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_now_runs_duty_early() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let handle = Chore::new(
            "triggered",
            Duration::from_secs(10),
            Recorder {
                starts: starts.clone(),
            },
        )
        .start();

        wait_for_starts(&starts, 1).await;
        sleep(Duration::from_secs(1)).await;
        handle.trigger_now();

        wait_for_starts(&starts, 3).await;
        handle.stop();
        handle.join().await;

        let s = starts.lock().clone();
        // Triggered duty starts well before the period elapses...
        assert!(s[1] - s[0] < Duration::from_secs(10));
        // ...and the schedule resumes from the triggered start.
        assert!(s[2] - s[1] >= Duration::from_secs(10));
        assert!(s[2] - s[1] < Duration::from_millis(10_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_sleep() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let handle = Chore::new(
            "sleepy",
            Duration::from_secs(3600),
            Recorder {
                starts: starts.clone(),
            },
        )
        .start();

        wait_for_starts(&starts, 1).await;
        handle.stop();
        let joined = timeout(Duration::from_secs(1), handle.join()).await;
        assert!(joined.is_ok(), "stop should not wait out the period");
        assert_eq!(starts.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_runs_nothing() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let chore = Chore::new(
            "never",
            Duration::from_secs(1),
            Recorder {
                starts: starts.clone(),
            },
        );
        chore.handle().stop();
        let handle = chore.start();
        handle.join().await;
        assert!(starts.lock().is_empty());
        assert_eq!(handle.state(), ChoreState::Stopped);
    }

    struct Failing {
        calls: Arc<AtomicU32>,
        fatal_on: u32,
    }

    #[async_trait]
    impl Duty for Failing {
        async fn chore(&mut self) -> Result<(), ChoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fatal_on {
                Err(ChoreError::Fatal(format!("call {}", n)))
            } else {
                Err(ChoreError::Recoverable(format!("call {}", n)))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recoverable_errors_continue_fatal_stops() {
        let calls = Arc::new(AtomicU32::new(0));
        let handle = Chore::new(
            "failing",
            Duration::from_millis(10),
            Failing {
                calls: calls.clone(),
                fatal_on: 3,
            },
        )
        .start();

        timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("fatal error should end the loop");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(handle.is_stopped());
        assert_eq!(handle.state(), ChoreState::Stopped);
    }

    struct SlowStart {
        initial_attempts: u32,
        log: Arc<Mutex<Vec<&'static str>>>,
        cleaned: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Duty for SlowStart {
        async fn initial_chore(&mut self) -> Result<bool, ChoreError> {
            self.log.lock().push("initial");
            self.initial_attempts -= 1;
            Ok(self.initial_attempts == 0)
        }

        async fn chore(&mut self) -> Result<(), ChoreError> {
            self.log.lock().push("chore");
            Ok(())
        }

        fn cleanup(&mut self) {
            self.cleaned.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_chore_until_true() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cleaned = Arc::new(AtomicBool::new(false));
        let handle = Chore::new(
            "slow-start",
            Duration::from_millis(10),
            SlowStart {
                initial_attempts: 2,
                log: log.clone(),
                cleaned: cleaned.clone(),
            },
        )
        .start();

        while log.lock().len() < 4 {
            sleep(Duration::from_millis(5)).await;
        }
        handle.stop();
        handle.join().await;

        let log = log.lock().clone();
        assert_eq!(&log[..4], &["initial", "initial", "chore", "chore"]);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_coord_error_classification() {
        let e: ChoreError = CoordError::unavailable("down").into();
        assert!(matches!(e, ChoreError::Recoverable(_)));
        let e: ChoreError = CoordError::corrupt("bad").into();
        assert!(matches!(e, ChoreError::Fatal(_)));
    }
}
