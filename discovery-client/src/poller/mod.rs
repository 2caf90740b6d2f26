//! Interval-driven health polling of candidate addresses.
//!
//! A single driver task owns the target list, the recurring timer and the set
//! of in-flight probes. `start` and `stop` only send it messages, so neither
//! blocks the caller.

mod probe;

pub use probe::{PollResult, ProbeError, Prober};

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::stream::{FuturesUnordered, StreamExt};
use shared::types::Address;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Receives every poll result that survives the epoch check
pub type ResultSink = Arc<dyn Fn(PollResult) + Send + Sync>;

type ProbeFuture = Pin<Box<dyn Future<Output = PollResult> + Send>>;

/// Shorter intervals, zero included, are raised to this
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Delta applied by `HealthPoller::start`. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct PollerOptions {
    pub list: Option<Vec<Address>>,
    pub interval: Option<Duration>,
}

struct Running {
    tx: mpsc::UnboundedSender<PollerOptions>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct HealthPoller {
    prober: Prober,
    sink: ResultSink,
    epoch: Arc<AtomicU64>,
    list: Vec<Address>,
    interval: Duration,
    running: Option<Running>,
}

impl HealthPoller {
    pub fn new(prober: Prober, default_interval: Duration, sink: ResultSink) -> Self {
        Self {
            prober,
            sink,
            epoch: Arc::new(AtomicU64::new(0)),
            list: Vec::new(),
            interval: clamp_interval(default_interval),
            running: None,
        }
    }

    /// Replace the target list and/or interval and make sure a poll cycle is
    /// running. Must be called from within a Tokio runtime.
    pub fn start(&mut self, options: PollerOptions) {
        let options = PollerOptions {
            interval: options.interval.map(clamp_interval),
            ..options
        };
        if let Some(list) = &options.list {
            self.list = dedup(list);
        }
        if let Some(interval) = options.interval {
            self.interval = interval;
        }

        if let Some(running) = &self.running {
            if !running.task.is_finished() {
                let delta = PollerOptions {
                    list: options.list.map(|_| self.list.clone()),
                    interval: options.interval,
                };
                if running.tx.send(delta).is_ok() {
                    return;
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let driver = Driver {
            list: self.list.clone(),
            interval: self.interval,
            prober: self.prober.clone(),
            sink: self.sink.clone(),
            epoch: self.epoch.clone(),
            my_epoch: self.epoch.load(Ordering::SeqCst),
        };

        tracing::info!(
            "Starting health poller: {} addresses every {:?}",
            self.list.len(),
            self.interval
        );
        let task = tokio::spawn(driver.run(rx, cancel.clone()));
        self.running = Some(Running { tx, cancel, task });
    }

    /// Halt polling. In-flight probes are dropped and any result they would
    /// have produced is discarded.
    pub fn stop(&mut self) {
        // Invalidate before cancelling so a result racing the cancellation
        // fails the epoch check
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            running.task.abort();
            tracing::info!("Stopped health poller");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.task.is_finished())
            .unwrap_or(false)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn list(&self) -> &[Address] {
        &self.list
    }
}

impl Drop for HealthPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Driver {
    list: Vec<Address>,
    interval: Duration,
    prober: Prober,
    sink: ResultSink,
    epoch: Arc<AtomicU64>,
    my_epoch: u64,
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PollerOptions>, cancel: CancellationToken) {
        let mut ticker = make_ticker(self.interval);
        let mut in_flight: HashSet<Address> = HashSet::new();
        let mut probes: FuturesUnordered<ProbeFuture> = FuturesUnordered::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    for address in &self.list {
                        // Still waiting on last cycle's request for this one
                        if in_flight.insert(address.clone()) {
                            probes.push(self.probe(address.clone()));
                        }
                    }
                }

                update = rx.recv() => {
                    let Some(update) = update else { break };
                    if let Some(list) = update.list {
                        // New candidates are polled right away, existing ones
                        // keep their schedule
                        for address in &list {
                            if !self.list.contains(address) && in_flight.insert(address.clone()) {
                                probes.push(self.probe(address.clone()));
                            }
                        }
                        self.list = list;
                    }
                    if let Some(interval) = update.interval {
                        if interval != self.interval {
                            tracing::debug!("Health poll interval {:?} -> {:?}", self.interval, interval);
                            self.interval = interval;
                            ticker = make_ticker(interval);
                        }
                    }
                }

                Some(result) = probes.next() => {
                    let address = result.address();
                    in_flight.remove(&address);

                    if self.epoch.load(Ordering::SeqCst) != self.my_epoch {
                        tracing::debug!("Discarding stale poll result for {}", address);
                        continue;
                    }
                    if !self.list.contains(&address) {
                        tracing::debug!("Discarding poll result for dropped address {}", address);
                        continue;
                    }
                    match &result.health {
                        Ok(_) => tracing::debug!("Poll {} ok", address),
                        Err(e) => tracing::debug!("Poll {} failed: {}", address, e),
                    }
                    (self.sink)(result);
                }
            }
        }
    }

    fn probe(&self, address: Address) -> ProbeFuture {
        let prober = self.prober.clone();
        Box::pin(async move { prober.probe(address).await })
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    if interval < MIN_POLL_INTERVAL {
        tracing::warn!(
            "Health poll interval {:?} too short, using {:?}",
            interval,
            MIN_POLL_INTERVAL
        );
        return MIN_POLL_INTERVAL;
    }
    interval
}

fn make_ticker(interval: Duration) -> Interval {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn dedup(list: &[Address]) -> Vec<Address> {
    let mut seen = HashSet::new();
    list.iter()
        .filter(|a| seen.insert((*a).clone()))
        .cloned()
        .collect()
}
