/// Receives threshold warnings from the monitoring loop.
pub trait Notifier: Send + Sync {
    fn warn(&self, message: &str);
}

/// Default notifier: logs at WARN
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn warn(&self, message: &str) {
        tracing::warn!(target: "monitor", "{}", message);
    }
}
