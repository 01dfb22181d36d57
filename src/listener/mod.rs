//! Change-feed dispatcher
//!
//! One task per job drains the job's [`Watch`] and hands every event to each
//! registered [`ChangeHandler`] in turn. A handler that fails or panics is
//! logged and skipped; the others still see the event, and so does it on the
//! next one. A retryable failure (lost transaction race, coordination
//! hiccup) is retried once before being logged.

pub mod handlers;

pub use handlers::{
    FailoverSettingsChangedHandler, JobCrashedHandler, LeaderElectionHandler,
    ServersChangedHandler, ShardingTotalCountChangedHandler,
};

use crate::common::Result;
use crate::storage::{ChangeEvent, JobNodePath, Watch};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tries per handler per event; only retryable errors get another go.
const HANDLER_ATTEMPTS: usize = 2;

/// Reacts to changes under a job root. Must be idempotent: events can be
/// redelivered relative to the state they describe.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// `relative` is the event path below the job root.
    async fn handle(&self, relative: &str, event: &ChangeEvent) -> Result<()>;

    /// The dispatcher fell behind and `missed` events were dropped.
    async fn on_lagged(&self, _missed: u64) -> Result<()> {
        Ok(())
    }
}

pub struct ListenerDispatcher {
    path: JobNodePath,
    handlers: Vec<Arc<dyn ChangeHandler>>,
}

impl ListenerDispatcher {
    pub fn new(path: JobNodePath) -> Self {
        Self {
            path,
            handlers: Vec::new(),
        }
    }

    pub fn add_handler(&mut self, handler: Arc<dyn ChangeHandler>) {
        self.handlers.push(handler);
    }

    /// Spawn the dispatch loop; it ends when `cancel` fires or the feed closes.
    pub fn start(self, mut watch: Watch, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::debug!(root = %self.path.root(), handlers = self.handlers.len(), "Dispatcher started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = watch.recv() => match received {
                        Ok(event) => self.dispatch(&event).await,
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(root = %self.path.root(), missed, "Change feed lagged");
                            self.lagged(missed).await;
                        }
                        Err(RecvError::Closed) => {
                            tracing::warn!(root = %self.path.root(), "Change feed closed");
                            break;
                        }
                    }
                }
            }
            tracing::debug!(root = %self.path.root(), "Dispatcher stopped");
        })
    }

    async fn dispatch(&self, event: &ChangeEvent) {
        let Some(relative) = self.path.relative(&event.path) else {
            return;
        };
        for handler in &self.handlers {
            for attempt in 1..=HANDLER_ATTEMPTS {
                let outcome = AssertUnwindSafe(handler.handle(relative, event))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.is_shutdown() => {
                        tracing::debug!(handler = handler.name(), "Handler stopped by shutdown");
                    }
                    Ok(Err(e)) if e.is_retryable() && attempt < HANDLER_ATTEMPTS => {
                        tracing::debug!(handler = handler.name(), attempt, error = %e, "Retrying change handler");
                        continue;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(
                            handler = handler.name(),
                            path = %event.path,
                            kind = %event.kind,
                            error = %e,
                            "Change handler failed"
                        );
                    }
                    Err(_) => {
                        tracing::error!(handler = handler.name(), path = %event.path, "Change handler panicked");
                    }
                }
                break;
            }
        }
    }

    async fn lagged(&self, missed: u64) {
        for handler in &self.handlers {
            match AssertUnwindSafe(handler.on_lagged(missed)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(handler = handler.name(), error = %e, "Lag recovery failed");
                }
                Err(_) => {
                    tracing::error!(handler = handler.name(), "Lag recovery panicked");
                }
            }
        }
    }
}
