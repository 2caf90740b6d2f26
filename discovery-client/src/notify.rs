use std::sync::Arc;
use std::time::Duration;
use shared::types::RobotRecord;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Called with the merged robot list after it changes
pub type ListChangeHandler = Arc<dyn Fn(&[RobotRecord]) + Send + Sync>;

/// Throttled delivery of robot-list changes.
///
/// The first change after a quiet period is delivered immediately; further
/// changes within `window` collapse into one trailing delivery of the latest
/// list. Every real change is followed by at least one delivery.
pub struct Notifier {
    tx: watch::Sender<Arc<Vec<RobotRecord>>>,
    cancel: CancellationToken,
}

impl Notifier {
    /// Must be called from within a Tokio runtime.
    pub fn spawn(window: Duration, handler: ListChangeHandler) -> Self {
        let (tx, mut rx) = watch::channel(Arc::new(Vec::new()));
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = task_cancel.cancelled() => break,
                }

                let robots = rx.borrow_and_update().clone();
                tracing::debug!("Robot list changed: {} robots", robots.len());
                handler(&robots);

                tokio::select! {
                    _ = tokio::time::sleep(window) => {}
                    _ = task_cancel.cancelled() => break,
                }
            }
        });

        Self { tx, cancel }
    }

    pub fn notify(&self, robots: Arc<Vec<RobotRecord>>) {
        self.tx.send_replace(robots);
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
