//! Reconciling store.
//!
//! `State` is a plain value driven by `Command`s. `StoreHandle` runs it on its
//! own task so every write is serialized, and publishes a `Snapshot` on a
//! watch channel whenever a command changes something.

pub mod hash;
mod state;

pub use state::{Command, ServiceFound, State};

use std::sync::Arc;
use shared::types::{Address, RobotRecord};
use tokio::sync::{mpsc, watch};

/// Derived projections of the store. A part that did not change keeps its
/// `Arc`, so `Arc::ptr_eq` is a valid "unchanged" test.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub robots: Arc<Vec<RobotRecord>>,
    pub addresses: Arc<Vec<Address>>,
}

impl Snapshot {
    fn of(state: &State) -> Self {
        Self {
            robots: Arc::new(state.robots()),
            addresses: Arc::new(state.addresses()),
        }
    }
}

/// Handle to the store task. Cloning shares the same store.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

impl StoreHandle {
    /// Spawn the store task. Must be called from within a Tokio runtime.
    pub fn spawn(initial: State) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let (snapshot_tx, snapshot) = watch::channel(Snapshot::of(&initial));

        tokio::spawn(async move {
            let mut state = initial;
            while let Some(command) = rx.recv().await {
                if !state.apply(command) {
                    continue;
                }
                snapshot_tx.send_if_modified(|current| {
                    let mut modified = false;
                    let robots = state.robots();
                    if *current.robots != robots {
                        current.robots = Arc::new(robots);
                        modified = true;
                    }
                    let addresses = state.addresses();
                    if *current.addresses != addresses {
                        current.addresses = Arc::new(addresses);
                        modified = true;
                    }
                    modified
                });
            }
            tracing::debug!("Store task exiting");
        });

        Self { tx, snapshot }
    }

    /// Queue a command. Never blocks; commands apply in the order sent.
    pub fn dispatch(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::warn!("Store task is gone, dropping command");
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn robots(&self) -> Arc<Vec<RobotRecord>> {
        self.snapshot.borrow().robots.clone()
    }

    pub fn addresses(&self) -> Arc<Vec<Address>> {
        self.snapshot.borrow().addresses.clone()
    }

    /// A receiver that has already seen the current snapshot
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        let mut rx = self.snapshot.clone();
        rx.mark_unchanged();
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn found(name: &str, ip: &str) -> Command {
        Command::ServiceFound(ServiceFound {
            name: name.to_string(),
            ip: ip.to_string(),
            port: 31950,
            advertised_model: None,
        })
    }

    #[tokio::test]
    async fn test_dispatch_publishes_snapshot() {
        let store = StoreHandle::spawn(State::default());
        let mut rx = store.subscribe();

        store.dispatch(found("robotA", "10.0.0.5"));
        tokio::time::timeout(Duration::from_secs(1), rx.changed()).await.unwrap().unwrap();

        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.robots.len(), 1);
        assert_eq!(*snapshot.addresses, vec![Address::new("10.0.0.5", 31950)]);
    }

    #[tokio::test]
    async fn test_unchanged_parts_keep_identity() {
        let store = StoreHandle::spawn(State::default());
        let mut rx = store.subscribe();

        store.dispatch(found("robotA", "10.0.0.5"));
        rx.changed().await.unwrap();
        let first = rx.borrow_and_update().clone();

        // Same address, now under a different robot: robots change, the
        // address list does not
        store.dispatch(found("robotB", "10.0.0.5"));
        rx.changed().await.unwrap();
        let second = rx.borrow_and_update().clone();

        assert!(Arc::ptr_eq(&first.addresses, &second.addresses));
        assert!(!Arc::ptr_eq(&first.robots, &second.robots));
    }

    #[tokio::test]
    async fn test_no_op_commands_do_not_notify() {
        let store = StoreHandle::spawn(State::default());
        store.dispatch(found("robotA", "10.0.0.5"));

        let mut rx = store.subscribe();
        // Flush the first command, then replay it
        tokio::time::sleep(Duration::from_millis(50)).await;
        rx.mark_unchanged();
        store.dispatch(found("robotA", "10.0.0.5"));
        store.dispatch(Command::RemoveRobot("nobody".to_string()));

        let changed = tokio::time::timeout(Duration::from_millis(200), rx.changed()).await;
        assert!(changed.is_err(), "no-op commands must not publish");
    }
}
