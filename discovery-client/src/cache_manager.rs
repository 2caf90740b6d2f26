use std::thread;
use tokio::sync::{mpsc, oneshot};
use anyhow::Result;
use shared::types::RobotRecord;
use crate::cache::{self, db::CacheDb};

/// Commands sent to the cache thread
pub enum CacheCommand {
    Load(oneshot::Sender<Result<Vec<RobotRecord>>>),
    Save(Vec<RobotRecord>, oneshot::Sender<Result<bool>>),
    Clear(oneshot::Sender<Result<()>>),
    Shutdown,
}

/// Handle to the persisted robot cache. SQLite runs on its own thread so
/// callers never block the runtime.
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::Sender<CacheCommand>,
}

impl CacheHandle {
    /// Spawn a new cache thread with the given database
    pub fn spawn(db: CacheDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<CacheCommand>(64);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    CacheCommand::Load(reply) => {
                        let _ = reply.send(cache::load_robots(&db));
                    }
                    CacheCommand::Save(robots, reply) => {
                        let result = db.put_robots(&robots);
                        if let Ok(true) = result {
                            tracing::debug!("Saved {} robots to cache", robots.len());
                        }
                        let _ = reply.send(result);
                    }
                    CacheCommand::Clear(reply) => {
                        // Leave an explicit empty list behind so a restart
                        // does not fall back to legacy data
                        let result = db.clear().and_then(|_| db.put_robots(&[]).map(|_| ()));
                        let _ = reply.send(result);
                    }
                    CacheCommand::Shutdown => {
                        tracing::info!("Cache thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Cached robots, migrating legacy data if that is all there is
    pub async fn load(&self) -> Result<Vec<RobotRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::Load(reply)).await?;
        rx.await?
    }

    /// Write the robot list. Returns true if the stored value changed.
    pub async fn save(&self, robots: Vec<RobotRecord>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::Save(robots, reply)).await?;
        rx.await?
    }

    /// Empty the cache
    pub async fn clear(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::Clear(reply)).await?;
        rx.await?
    }

    /// Shutdown the cache thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(CacheCommand::Shutdown).await?;
        Ok(())
    }
}
