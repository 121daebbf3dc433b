//! Background resource monitor.
//!
//! A cancellable task that samples CPU and memory on a fixed interval and
//! sends a warning to a [`Notifier`] for every threshold a sample exceeds.
//! Sampling errors never end the loop; they stretch the delay before the
//! next attempt (doubling per consecutive error, capped at `max_backoff`).

pub mod notifier;
pub mod sampler;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::MonitorSettings;

pub use notifier::{Notifier, TracingNotifier};
pub use sampler::{ResourceSample, ResourceSampler, SampleError, SysinfoSampler};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub cpu_threshold_percent: f32,
    pub memory_threshold_mb: u64,
    pub max_backoff: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&MonitorSettings::default())
    }
}

impl From<&MonitorSettings> for MonitorConfig {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            interval: settings.interval(),
            cpu_threshold_percent: settings.cpu_threshold_percent,
            memory_threshold_mb: settings.memory_threshold_mb,
            max_backoff: settings.max_backoff(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Sampling,
    Alerting,
}

/// A threshold a sample went over
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    Cpu { percent: f32, threshold: f32 },
    Memory { mb: f64, threshold_mb: u64 },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu { percent, threshold } => {
                write!(f, "High CPU usage: {:.1}% (threshold {}%)", percent, threshold)
            }
            Self::Memory { mb, threshold_mb } => {
                write!(f, "High memory usage: {:.1} MB (threshold {} MB)", mb, threshold_mb)
            }
        }
    }
}

/// Alerts for every threshold `sample` strictly exceeds
pub fn check_thresholds(sample: &ResourceSample, config: &MonitorConfig) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if sample.cpu_percent > config.cpu_threshold_percent {
        alerts.push(Alert::Cpu {
            percent: sample.cpu_percent,
            threshold: config.cpu_threshold_percent,
        });
    }

    if sample.memory_bytes > config.memory_threshold_mb.saturating_mul(1024 * 1024) {
        alerts.push(Alert::Memory {
            mb: sample.memory_mb(),
            threshold_mb: config.memory_threshold_mb,
        });
    }

    alerts
}

/// Delay before the next sample after `consecutive_errors` failures in a row
pub fn next_delay(config: &MonitorConfig, consecutive_errors: u32) -> Duration {
    if consecutive_errors == 0 {
        return config.interval;
    }
    let factor = 1u32 << consecutive_errors.min(16);
    config
        .interval
        .saturating_mul(factor)
        .min(config.max_backoff.max(config.interval))
}

/// Running monitor task
pub struct MonitorHandle {
    cancel: CancellationToken,
    state: watch::Receiver<MonitorState>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Start the loop. `make_sampler` runs on the monitor task, so the
    /// sampler lives and dies with it.
    pub fn spawn<S, F>(
        config: MonitorConfig,
        make_sampler: F,
        notifier: Arc<dyn Notifier>,
        cancel: CancellationToken,
    ) -> Self
    where
        S: ResourceSampler + 'static,
        F: FnOnce() -> S + Send + 'static,
    {
        let (state_tx, state) = watch::channel(MonitorState::Idle);
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let sampler = make_sampler();
            run_loop(sampler, config, notifier, state_tx, task_cancel).await;
        });

        Self {
            cancel,
            state,
            task,
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop and wait for the task to exit
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        self.cancel.cancel();
        self.task.await
    }
}

async fn run_loop<S: ResourceSampler>(
    mut sampler: S,
    config: MonitorConfig,
    notifier: Arc<dyn Notifier>,
    state: watch::Sender<MonitorState>,
    cancel: CancellationToken,
) {
    info!(
        interval_secs = config.interval.as_secs_f64(),
        cpu_threshold = config.cpu_threshold_percent,
        memory_threshold_mb = config.memory_threshold_mb,
        "Resource monitor started"
    );

    let mut consecutive_errors: u32 = 0;

    loop {
        let delay = next_delay(&config, consecutive_errors);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        state.send_replace(MonitorState::Sampling);

        match sampler.sample() {
            Ok(sample) => {
                consecutive_errors = 0;
                debug!(cpu = sample.cpu_percent, memory_mb = sample.memory_mb(), "Resource sample");

                let alerts = check_thresholds(&sample, &config);
                if !alerts.is_empty() {
                    state.send_replace(MonitorState::Alerting);
                    for alert in alerts {
                        notifier.warn(&alert.to_string());
                    }
                }
            }
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                error!(
                    consecutive_errors,
                    retry_in_secs = next_delay(&config, consecutive_errors).as_secs_f64(),
                    "{}",
                    e
                );
            }
        }

        state.send_replace(MonitorState::Idle);
    }

    drop(sampler);
    info!("Resource monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    const MB: u64 = 1024 * 1024;

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(5),
            cpu_threshold_percent: 80.0,
            memory_threshold_mb: 1024,
            max_backoff: Duration::from_millis(40),
        }
    }

    fn sample(cpu: f32, memory_mb: u64) -> ResourceSample {
        ResourceSample {
            cpu_percent: cpu,
            memory_bytes: memory_mb * MB,
        }
    }

    /// Plays back a script, then repeats a calm sample
    struct ScriptedSampler {
        script: VecDeque<Result<ResourceSample, SampleError>>,
        calls: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
    }

    impl ScriptedSampler {
        fn new(script: Vec<Result<ResourceSample, SampleError>>) -> Self {
            Self {
                script: script.into(),
                calls: Arc::new(AtomicUsize::new(0)),
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl ResourceSampler for ScriptedSampler {
        fn sample(&mut self) -> Result<ResourceSample, SampleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.pop_front().unwrap_or(Ok(sample(1.0, 10)))
        }
    }

    impl Drop for ScriptedSampler {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    struct ChannelNotifier(mpsc::UnboundedSender<String>);

    impl Notifier for ChannelNotifier {
        fn warn(&self, message: &str) {
            let _ = self.0.send(message.to_string());
        }
    }

    async fn next_warning(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no warning within timeout")
            .expect("notifier channel closed")
    }

    #[test]
    fn test_thresholds_are_strict() {
        let config = fast_config();
        assert!(check_thresholds(&sample(80.0, 1024), &config).is_empty());
        assert_eq!(check_thresholds(&sample(80.5, 0), &config).len(), 1);

        let both = check_thresholds(&sample(95.0, 2048), &config);
        assert_eq!(both.len(), 2);
        assert!(matches!(both[0], Alert::Cpu { .. }));
        assert!(matches!(both[1], Alert::Memory { threshold_mb: 1024, .. }));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = MonitorConfig {
            interval: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
            ..fast_config()
        };
        assert_eq!(next_delay(&config, 0), Duration::from_secs(30));
        assert_eq!(next_delay(&config, 1), Duration::from_secs(60));
        assert_eq!(next_delay(&config, 3), Duration::from_secs(240));
        assert_eq!(next_delay(&config, 4), Duration::from_secs(300));
        assert_eq!(next_delay(&config, u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.cpu_threshold_percent, 80.0);
        assert_eq!(config.memory_threshold_mb, 1024);
        assert_eq!(config.max_backoff, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_warns_for_each_exceeded_threshold() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sampler = ScriptedSampler::new(vec![Ok(sample(10.0, 10)), Ok(sample(99.0, 4096))]);

        let handle = MonitorHandle::spawn(
            fast_config(),
            move || sampler,
            Arc::new(ChannelNotifier(tx)),
            CancellationToken::new(),
        );

        let first = next_warning(&mut rx).await;
        let second = next_warning(&mut rx).await;
        assert!(first.contains("CPU"));
        assert!(second.contains("memory"));

        handle.shutdown().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sampling_errors_do_not_stop_loop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sampler = ScriptedSampler::new(vec![
            Err(SampleError::new("counter unavailable")),
            Err(SampleError::new("counter unavailable")),
            Ok(sample(90.0, 10)),
        ]);
        let calls = sampler.calls.clone();

        let handle = MonitorHandle::spawn(
            fast_config(),
            move || sampler,
            Arc::new(ChannelNotifier(tx)),
            CancellationToken::new(),
        );

        let warning = next_warning(&mut rx).await;
        assert!(warning.contains("CPU"));
        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert!(!handle.is_finished());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_sampler() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sampler = ScriptedSampler::new(Vec::new());
        let dropped = sampler.dropped.clone();

        let config = MonitorConfig {
            interval: Duration::from_secs(3600),
            ..fast_config()
        };
        let handle = MonitorHandle::spawn(
            config,
            move || sampler,
            Arc::new(ChannelNotifier(tx)),
            CancellationToken::new(),
        );
        assert_eq!(handle.state(), MonitorState::Idle);

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("monitor did not stop")
            .unwrap();
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_parent_token_cancels() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let parent = CancellationToken::new();
        let handle = MonitorHandle::spawn(
            fast_config(),
            || ScriptedSampler::new(Vec::new()),
            Arc::new(ChannelNotifier(tx)),
            parent.child_token(),
        );

        parent.cancel();
        let mut state = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                let _ = tokio::time::timeout(Duration::from_millis(10), state.changed()).await;
            }
        })
        .await
        .expect("monitor ignored cancellation");
    }
}
