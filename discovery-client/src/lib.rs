//! Robot discovery and health tracking.
//!
//! Robots are found two ways: mDNS service announcements (`mdns`) and
//! periodic health probes of candidate addresses (`poller`). Both feed the
//! reconciling `store`, which keeps one record per robot name. The
//! `DiscoveryClient` façade runs all of it and reports list changes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use discovery_client::{ClientConfig, DiscoveryClient, StartOptions};
//! use shared::types::RobotRecord;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let client = DiscoveryClient::new(
//!     ClientConfig::default(),
//!     None,
//!     Arc::new(|robots: &[RobotRecord]| println!("{} robots", robots.len())),
//! )?;
//! client.start(StartOptions::default()).await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cache_manager;
pub mod client;
pub mod config;
pub mod mdns;
pub mod notify;
pub mod poller;
pub mod store;

pub use cache_manager::CacheHandle;
pub use client::{DiscoveryClient, PollingMode, UpstreamAction};
pub use config::{ClientConfig, StartOptions};
pub use notify::ListChangeHandler;
