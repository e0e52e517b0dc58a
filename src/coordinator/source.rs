use super::hot_reload::{Coordinator, ReloadOutcome};
use crate::core::{ProxyError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Level, event};

/// Where candidate route descriptions come from.
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// Returns the current route description text.
    async fn fetch(&self) -> Result<String>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

/// Reads the route description from a file on every fetch.
#[derive(Debug, Clone)]
pub struct FileRouteSource {
    path: PathBuf,
}

impl FileRouteSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl RouteSource for FileRouteSource {
    async fn fetch(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| ProxyError::Io(format!("{}: {}", self.path.display(), err)))
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Route text held in memory and replaced with [`StaticRouteSource::set`].
#[derive(Debug, Default)]
pub struct StaticRouteSource {
    text: Mutex<String>,
}

impl StaticRouteSource {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(text.into()),
        }
    }

    pub fn set(&self, text: impl Into<String>) {
        *self.text.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = text.into();
    }
}

#[async_trait]
impl RouteSource for StaticRouteSource {
    async fn fetch(&self) -> Result<String> {
        Ok(self
            .text
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Triggers a reload from `source` every `interval` until the coordinator shuts down.
///
/// Busy and rejected reloads are logged and retried on the next tick.
pub fn spawn_route_poller(
    coordinator: Arc<Coordinator>,
    source: Arc<dyn RouteSource>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if coordinator.is_shut_down() {
                break;
            }
            match coordinator.reload_from(source.as_ref()).await {
                Ok(ReloadOutcome::Applied { .. }) => {}
                Ok(ReloadOutcome::AlreadyCurrent { version }) => {
                    event!(Level::DEBUG, version, "route poll: already current");
                }
                Err(ProxyError::ReloadInProgress) => {
                    event!(Level::DEBUG, "route poll skipped, reload in progress");
                }
                Err(err) => {
                    event!(
                        Level::WARN,
                        source = %source.describe(),
                        error = %err,
                        "route poll failed"
                    );
                }
            }
        }
        event!(Level::DEBUG, "route poller stopped");
    })
}
