//! Discovery client façade.
//!
//! Owns the store, the health poller and the mDNS browser, keeps the poller's
//! target list in step with the store, and reports robot-list changes to the
//! embedding application.
//!
//! Polling cadence is a small state machine:
//!
//! ```text
//! Stopped --start--> SlowPoll --discovery_start--> FastPoll
//!    ^                  ^ <------discovery_finish------ |
//!    +------stop--------+-------------------------------+
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use anyhow::Result;
use shared::types::{Address, RobotRecord};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache_manager::CacheHandle;
use crate::config::{ClientConfig, StartOptions};
use crate::mdns::{AnnouncementSink, ServiceBrowser};
use crate::notify::{ListChangeHandler, Notifier};
use crate::poller::{HealthPoller, PollerOptions, Prober, ResultSink};
use crate::store::{hash, Command, Snapshot, State, StoreHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollingMode {
    Stopped,
    SlowPoll,
    FastPoll,
}

/// Named triggers from the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAction {
    UiInitialized,
    DiscoveryStart { timeout: Option<Duration> },
    DiscoveryFinish,
    RemoveRobot(String),
    ClearCache,
}

struct Inner {
    mode: PollingMode,
    slow_interval: Duration,
    candidates: Vec<String>,
    cache_disabled: bool,
    /// Manual addresses the store was last initialized with
    initialized_with: Option<Vec<Address>>,
    poller: HealthPoller,
    browser: Option<ServiceBrowser>,
    watcher: Option<CancellationToken>,
    /// Snapshot the last watcher handed to the subscriber and the cache
    delivered: Option<Snapshot>,
    discovery_timer: Option<CancellationToken>,
}

pub struct DiscoveryClient {
    config: ClientConfig,
    runtime: Handle,
    store: StoreHandle,
    cache: Option<CacheHandle>,
    notifier: Arc<Notifier>,
    inner: Arc<Mutex<Inner>>,
}

impl DiscoveryClient {
    /// Build a stopped client. Must be called from within a Tokio runtime;
    /// the other methods may be called from anywhere.
    pub fn new(
        config: ClientConfig,
        cache: Option<CacheHandle>,
        on_list_change: ListChangeHandler,
    ) -> Result<Self> {
        let runtime = Handle::current();
        let store = StoreHandle::spawn(State::default());
        let prober = Prober::new(config.probe_timeout())?;

        let poll_store = store.clone();
        let on_poll: ResultSink = Arc::new(move |result| {
            poll_store.dispatch(Command::HealthPolled(result));
        });
        let poller = HealthPoller::new(prober, config.slow_interval(), on_poll);

        let browser = config.enable_mdns.then(|| {
            let browse_store = store.clone();
            let on_found: AnnouncementSink = Arc::new(move |found| {
                browse_store.dispatch(Command::ServiceFound(found));
            });
            ServiceBrowser::new(config.service_type.clone(), config.ports.clone(), on_found)
        });

        let inner = Inner {
            mode: PollingMode::Stopped,
            slow_interval: config.slow_interval(),
            candidates: config.candidates.clone(),
            cache_disabled: config.disable_cache,
            initialized_with: None,
            poller,
            browser,
            watcher: None,
            delivered: None,
            discovery_timer: None,
        };

        Ok(Self {
            notifier: Arc::new(Notifier::spawn(config.notify_throttle(), on_list_change)),
            config,
            runtime,
            store,
            cache,
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Start or reconfigure. Safe to call repeatedly: running components are
    /// kept and only the interval/candidate/cache delta is applied.
    pub async fn start(&self, options: StartOptions) {
        let load_seed = {
            let mut inner = lock(&self.inner);
            if let Some(disabled) = options.disable_cache {
                inner.cache_disabled = disabled;
            }
            if let Some(candidates) = options.candidates {
                inner.candidates = candidates;
            }
            if let Some(interval) = options.health_poll_interval {
                inner.slow_interval = interval;
            }
            inner.initialized_with.is_none() && !inner.cache_disabled
        };

        let seed = match (&self.cache, load_seed) {
            (Some(cache), true) => match cache.load().await {
                Ok(robots) => {
                    tracing::info!("Loaded {} robots from cache", robots.len());
                    Some(robots)
                }
                Err(e) => {
                    tracing::warn!("Failed to load robot cache: {:#}", e);
                    None
                }
            },
            _ => None,
        };

        let _guard = self.runtime.enter();
        let mut inner = lock(&self.inner);

        // Subscribe before initializing so the watcher sees the result.
        // Changes made while stopped are diffed against what was delivered.
        if inner.watcher.is_none() {
            let rx = self.store.subscribe();
            let last = inner
                .delivered
                .clone()
                .unwrap_or_else(|| rx.borrow().clone());
            let cancel = CancellationToken::new();
            self.runtime.spawn(watch_store(
                rx,
                last,
                self.inner.clone(),
                self.notifier.clone(),
                self.cache.clone(),
                cancel.clone(),
            ));
            inner.watcher = Some(cancel);
        }

        let manual = self.config.manual_addresses(&inner.candidates);
        if inner.initialized_with.as_ref() != Some(&manual) {
            let robots = seed.unwrap_or_else(|| self.store.robots().to_vec());
            tracing::debug!(
                "Initializing store with {} robots and {} manual addresses",
                robots.len(),
                manual.len()
            );
            self.store.dispatch(Command::Initialize {
                robots,
                manual_addresses: manual.clone(),
            });
            inner.initialized_with = Some(manual);
        }

        let interval = match inner.mode {
            PollingMode::Stopped => {
                tracing::info!("Starting discovery client");
                inner.mode = PollingMode::SlowPoll;
                inner.slow_interval
            }
            PollingMode::SlowPoll => inner.slow_interval,
            PollingMode::FastPoll => self.config.fast_interval(),
        };
        let list = self.store.addresses().to_vec();
        inner.poller.start(PollerOptions {
            list: Some(list),
            interval: Some(interval),
        });

        if let Some(browser) = inner.browser.as_mut() {
            if !browser.is_listening() {
                browser.start();
            }
        }
    }

    /// Stop polling and browsing. The robot list is kept for a later start.
    pub fn stop(&self) {
        let mut inner = lock(&self.inner);
        if let Some(watcher) = inner.watcher.take() {
            watcher.cancel();
        }
        if let Some(timer) = inner.discovery_timer.take() {
            timer.cancel();
        }
        inner.poller.stop();
        if let Some(browser) = inner.browser.as_mut() {
            browser.stop();
        }
        if inner.mode != PollingMode::Stopped {
            tracing::info!("Stopped discovery client");
        }
        inner.mode = PollingMode::Stopped;
    }

    /// Switch to fast polling and re-query the network. With a timeout (or a
    /// configured default) discovery finishes on its own.
    pub fn discovery_start(&self, timeout: Option<Duration>) {
        let _guard = self.runtime.enter();
        let mut inner = lock(&self.inner);
        if inner.mode == PollingMode::Stopped {
            tracing::debug!("Ignoring discovery start while stopped");
            return;
        }

        tracing::info!("Discovery started");
        inner.mode = PollingMode::FastPoll;
        inner.poller.start(PollerOptions {
            list: None,
            interval: Some(self.config.fast_interval()),
        });
        if let Some(browser) = inner.browser.as_mut() {
            browser.start();
        }

        if let Some(timer) = inner.discovery_timer.take() {
            timer.cancel();
        }
        if let Some(timeout) = timeout.or_else(|| self.config.discovery_timeout()) {
            let cancel = CancellationToken::new();
            let timer_cancel = cancel.clone();
            let timer_inner = self.inner.clone();
            self.runtime.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        let mut inner = lock(&timer_inner);
                        // Replaced timers are cancelled under this lock
                        if timer_cancel.is_cancelled() {
                            return;
                        }
                        tracing::debug!("Discovery timed out after {:?}", timeout);
                        inner.discovery_timer = None;
                        finish_discovery(&mut inner);
                    }
                    _ = timer_cancel.cancelled() => {}
                }
            });
            inner.discovery_timer = Some(cancel);
        }
    }

    /// Return to slow polling.
    pub fn discovery_finish(&self) {
        let _guard = self.runtime.enter();
        let mut inner = lock(&self.inner);
        if let Some(timer) = inner.discovery_timer.take() {
            timer.cancel();
        }
        finish_discovery(&mut inner);
    }

    /// Forget a robot and all of its addresses.
    pub fn remove_robot(&self, name: &str) {
        tracing::info!("Removing robot {}", name);
        self.store.dispatch(Command::RemoveRobot(name.to_string()));
    }

    /// Empty the in-memory robot list and the persisted cache.
    pub async fn clear_cache(&self) {
        let manual = {
            let inner = lock(&self.inner);
            inner
                .initialized_with
                .clone()
                .unwrap_or_else(|| self.config.manual_addresses(&inner.candidates))
        };

        tracing::info!("Clearing robot cache");
        self.store.dispatch(Command::Initialize {
            robots: Vec::new(),
            manual_addresses: manual,
        });

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.clear().await {
                tracing::error!("Failed to clear persisted cache: {:#}", e);
            }
        }
    }

    /// Apply one application-level trigger.
    pub async fn handle(&self, action: UpstreamAction) {
        match action {
            UpstreamAction::UiInitialized => self.start(StartOptions::default()).await,
            UpstreamAction::DiscoveryStart { timeout } => self.discovery_start(timeout),
            UpstreamAction::DiscoveryFinish => self.discovery_finish(),
            UpstreamAction::RemoveRobot(name) => self.remove_robot(&name),
            UpstreamAction::ClearCache => self.clear_cache().await,
        }
    }

    /// Current robot list. Unchanged lists are the same `Arc`.
    pub fn robots(&self) -> Arc<Vec<RobotRecord>> {
        self.store.robots()
    }

    /// Current candidate addresses
    pub fn addresses(&self) -> Arc<Vec<Address>> {
        self.store.addresses()
    }

    /// Digest of the current robot list
    pub fn robots_hash(&self) -> String {
        hash::compute_hash(&self.store.robots())
    }

    /// Store snapshots as they change
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.store.subscribe()
    }

    pub fn mode(&self) -> PollingMode {
        lock(&self.inner).mode
    }

    /// Interval and target list the poller is currently running with
    pub fn polling(&self) -> Option<(Duration, Vec<Address>)> {
        let inner = lock(&self.inner);
        inner
            .poller
            .is_running()
            .then(|| (inner.poller.interval(), inner.poller.list().to_vec()))
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn finish_discovery(inner: &mut Inner) {
    if inner.mode != PollingMode::FastPoll {
        return;
    }
    tracing::info!("Discovery finished");
    inner.mode = PollingMode::SlowPoll;
    let slow = inner.slow_interval;
    inner.poller.start(PollerOptions {
        list: None,
        interval: Some(slow),
    });
}

/// Follows store snapshots: address changes retarget the poller, robot
/// changes go to the subscriber and the cache.
async fn watch_store(
    mut rx: watch::Receiver<Snapshot>,
    mut last: Snapshot,
    inner: Arc<Mutex<Inner>>,
    notifier: Arc<Notifier>,
    cache: Option<CacheHandle>,
    cancel: CancellationToken,
) {
    loop {
        let (snapshot, persist) = {
            let mut inner = lock(&inner);
            if cancel.is_cancelled() || inner.mode == PollingMode::Stopped {
                break;
            }
            let snapshot = rx.borrow_and_update().clone();
            if !Arc::ptr_eq(&snapshot.addresses, &last.addresses)
                && snapshot.addresses != last.addresses
            {
                tracing::debug!("Candidate addresses changed: {}", snapshot.addresses.len());
                inner.poller.start(PollerOptions {
                    list: Some(snapshot.addresses.to_vec()),
                    interval: None,
                });
            }
            inner.delivered = Some(snapshot.clone());
            (snapshot, !inner.cache_disabled)
        };

        if !Arc::ptr_eq(&snapshot.robots, &last.robots) && snapshot.robots != last.robots {
            notifier.notify(snapshot.robots.clone());
            if let (true, Some(cache)) = (persist, &cache) {
                if let Err(e) = cache.save(snapshot.robots.to_vec()).await {
                    tracing::warn!("Failed to save robot cache: {:#}", e);
                }
            }
        }
        last = snapshot;

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    tracing::debug!("Store watcher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::db::CacheDb;
    use crate::poller::MIN_POLL_INTERVAL;
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use shared::types::{AddressHealthState, HealthStatus};

    fn test_config() -> ClientConfig {
        ClientConfig {
            health_poll_interval_ms: 200,
            fast_poll_interval_ms: 50,
            probe_timeout_ms: 500,
            notify_throttle_ms: 20,
            enable_mdns: false,
            include_fallback: false,
            ..ClientConfig::default()
        }
    }

    fn recording() -> (ListChangeHandler, Arc<Mutex<Vec<Vec<RobotRecord>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let handler: ListChangeHandler = Arc::new(move |robots: &[RobotRecord]| {
            sink.lock().unwrap().push(robots.to_vec());
        });
        (handler, calls)
    }

    async fn fake_robot(name: &'static str) -> String {
        let app = Router::new()
            .route("/health", get(move || async move {
                Json(json!({ "name": name, "api_version": "7.0.0", "robot_model": "OT-2 Standard" }))
            }))
            .route("/server/update/health", get(move || async move {
                Json(json!({ "name": name }))
            }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("127.0.0.1:{}", port)
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_manual_candidate_becomes_robot() {
        let candidate = fake_robot("robotA").await;
        let (handler, calls) = recording();
        let client = DiscoveryClient::new(test_config(), None, handler).unwrap();

        client
            .start(StartOptions {
                candidates: Some(vec![candidate.clone()]),
                ..StartOptions::default()
            })
            .await;
        assert_eq!(client.mode(), PollingMode::SlowPoll);

        eventually("robot to appear", || client.robots().len() == 1).await;
        let robots = client.robots();
        assert_eq!(robots[0].name, "robotA");
        assert!(robots[0].addresses[0].seen);
        assert_eq!(robots[0].addresses[0].health_status, Some(HealthStatus::Ok));

        eventually("subscriber notification", || {
            calls.lock().unwrap().last().map(|l| l.len()) == Some(1)
        })
        .await;
        client.stop();
    }

    #[tokio::test]
    async fn test_mode_transitions_keep_address_list() {
        let candidate = fake_robot("robotA").await;
        let (handler, _calls) = recording();
        let client = DiscoveryClient::new(test_config(), None, handler).unwrap();
        assert_eq!(client.mode(), PollingMode::Stopped);
        assert!(client.polling().is_none());

        client
            .start(StartOptions {
                candidates: Some(vec![candidate]),
                ..StartOptions::default()
            })
            .await;
        eventually("address list", || client.addresses().len() == 1).await;
        eventually("poller list", || {
            client.polling().map(|(_, list)| list.len()) == Some(1)
        })
        .await;
        let (interval, list) = client.polling().unwrap();
        assert_eq!(interval, Duration::from_millis(200));

        client.discovery_start(None);
        assert_eq!(client.mode(), PollingMode::FastPoll);
        let (fast, fast_list) = client.polling().unwrap();
        assert_eq!(fast, Duration::from_millis(50));
        assert_eq!(fast_list, list);

        client.discovery_finish();
        assert_eq!(client.mode(), PollingMode::SlowPoll);
        let (slow, slow_list) = client.polling().unwrap();
        assert_eq!(slow, Duration::from_millis(200));
        assert_eq!(slow_list, list);

        client.stop();
        assert_eq!(client.mode(), PollingMode::Stopped);
        assert!(client.polling().is_none());

        // Discovery triggers do nothing while stopped
        client.discovery_start(None);
        assert_eq!(client.mode(), PollingMode::Stopped);
    }

    #[tokio::test]
    async fn test_discovery_times_out_to_slow_poll() {
        let (handler, _calls) = recording();
        let client = DiscoveryClient::new(test_config(), None, handler).unwrap();
        client.start(StartOptions::default()).await;

        client.discovery_start(Some(Duration::from_millis(100)));
        assert_eq!(client.mode(), PollingMode::FastPoll);

        eventually("auto finish", || client.mode() == PollingMode::SlowPoll).await;
        assert_eq!(client.polling().unwrap().0, Duration::from_millis(200));
        client.stop();
    }

    #[tokio::test]
    async fn test_repeated_start_is_idempotent() {
        let candidate = fake_robot("robotA").await;
        let (handler, calls) = recording();
        let client = DiscoveryClient::new(test_config(), None, handler).unwrap();

        for _ in 0..3 {
            client
                .start(StartOptions {
                    candidates: Some(vec![candidate.clone()]),
                    ..StartOptions::default()
                })
                .await;
        }
        eventually("robot to appear", || client.robots().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // One watcher means one notification per change, not three
        let calls = calls.lock().unwrap();
        let with_robot = calls.iter().filter(|l| l.len() == 1).count();
        assert!(with_robot >= 1);
        assert!(calls.len() <= 3, "too many notifications: {}", calls.len());
        drop(calls);
        client.stop();
    }

    #[tokio::test]
    async fn test_cache_seeds_and_clears() {
        let db = CacheDb::open(":memory:").unwrap();
        let mut cached = RobotRecord::new("cachedBot");
        cached.addresses.push(AddressHealthState::unpolled("127.0.0.1", 9));
        db.put_robots(&[cached]).unwrap();
        let cache = CacheHandle::spawn(db);

        let (handler, calls) = recording();
        let client = DiscoveryClient::new(test_config(), Some(cache.clone()), handler).unwrap();
        client.start(StartOptions::default()).await;

        eventually("cached robot", || {
            client.robots().iter().any(|r| r.name == "cachedBot")
        })
        .await;
        assert!(client.addresses().contains(&Address::new("127.0.0.1", 9)));

        client.handle(UpstreamAction::ClearCache).await;
        eventually("empty list", || client.robots().is_empty()).await;
        eventually("empty notification", || {
            calls.lock().unwrap().last().map(|l| l.is_empty()) == Some(true)
        })
        .await;

        // The watcher's write-through may land just after the clear
        let mut persisted = cache.load().await.unwrap();
        for _ in 0..50 {
            if persisted.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            persisted = cache.load().await.unwrap();
        }
        assert!(persisted.is_empty());
        client.stop();
    }

    #[tokio::test]
    async fn test_changes_while_stopped_reach_subscriber_on_restart() {
        let db = CacheDb::open(":memory:").unwrap();
        let mut cached = RobotRecord::new("cachedBot");
        cached.addresses.push(AddressHealthState::unpolled("127.0.0.1", 9));
        db.put_robots(&[cached]).unwrap();
        let cache = CacheHandle::spawn(db);

        let (handler, calls) = recording();
        let client = DiscoveryClient::new(test_config(), Some(cache.clone()), handler).unwrap();
        client.start(StartOptions::default()).await;
        eventually("cached robot delivered", || {
            calls.lock().unwrap().last().map(|l| l.len()) == Some(1)
        })
        .await;

        client.stop();
        client.remove_robot("cachedBot");
        eventually("robot removed", || client.robots().is_empty()).await;

        client.start(StartOptions::default()).await;
        eventually("removal delivered", || {
            calls.lock().unwrap().last().map(|l| l.is_empty()) == Some(true)
        })
        .await;

        let mut persisted = cache.load().await.unwrap();
        for _ in 0..50 {
            if persisted.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            persisted = cache.load().await.unwrap();
        }
        assert!(persisted.is_empty());
        client.stop();
    }

    #[tokio::test]
    async fn test_zero_poll_interval_keeps_polling() {
        let (handler, _calls) = recording();
        let client = DiscoveryClient::new(test_config(), None, handler).unwrap();
        client
            .start(StartOptions {
                health_poll_interval: Some(Duration::ZERO),
                ..StartOptions::default()
            })
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let (interval, _) = client.polling().unwrap();
        assert_eq!(interval, MIN_POLL_INTERVAL);
        client.stop();
    }

    #[tokio::test]
    async fn test_disabled_cache_is_not_read() {
        let db = CacheDb::open(":memory:").unwrap();
        db.put_robots(&[RobotRecord::new("cachedBot")]).unwrap();
        let cache = CacheHandle::spawn(db);

        let (handler, _calls) = recording();
        let client = DiscoveryClient::new(test_config(), Some(cache), handler).unwrap();
        client
            .start(StartOptions {
                disable_cache: Some(true),
                ..StartOptions::default()
            })
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.robots().is_empty());
        client.stop();
    }

    #[tokio::test]
    async fn test_remove_robot_and_stop_discards_results() {
        let candidate = fake_robot("robotA").await;
        let (handler, _calls) = recording();
        let client = DiscoveryClient::new(test_config(), None, handler).unwrap();
        client
            .start(StartOptions {
                candidates: Some(vec![candidate]),
                ..StartOptions::default()
            })
            .await;
        eventually("robot to appear", || client.robots().len() == 1).await;

        client.stop();
        client.handle(UpstreamAction::RemoveRobot("robotA".to_string())).await;
        eventually("robot removed", || client.robots().is_empty()).await;

        // Stopped: nothing polls the manual candidate back into a robot
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(client.robots().is_empty());
    }
}
