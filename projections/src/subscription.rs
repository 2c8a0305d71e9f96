//! Subscription loop driving a read model.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  positions   ┌──────────────────┐  catch_up   ┌───────────┐
//! │ EventStore │ ───────────► │ subscription task│ ──────────► │ read model│
//! └────────────┘  (or poll)   └──────────────────┘             └───────────┘
//!                                   ▲      ▲
//!                    catch_up_now() │      │ shutdown()
//!                          ┌────────┴──────┴───┐
//!                          │ SubscriptionHandle│
//!                          └───────────────────┘
//! ```
//!
//! The task blocks until a position notification arrives, the poll interval
//! elapses or a caller requests a catch-up, then runs one catch-up of the read
//! model. Notifications only wake the task; the read model queries from its
//! own cursor, so a missed notification is caught by the next wake-up.
//!
//! A catch-up runs outside the `select!`, so a shutdown signal never cancels
//! a batch halfway; it is observed once the batch is done.
//!
//! # Example
//!
//! ```ignore
//! let orgs = Arc::new(ListReadModel::new(OrgList::new(), store.clone(), InMemoryCache::new()));
//! let handle = subscription::spawn(orgs.clone(), store, SubscriptionConfig::default());
//!
//! // In signal handler:
//! handle.shutdown().await?;
//! ```

use crate::config::SubscriptionConfig;
use crate::error::{ProjectionError, Result};
use crate::read_model::CatchUp;
use eventstore_core::position::GlobalPosition;
use eventstore_core::store::{EventStore, PositionStream};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Control of a running subscription task.
pub struct SubscriptionHandle {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    trigger: Arc<Notify>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl SubscriptionHandle {
    /// Name of the driven read model.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the task to catch up now, without waiting for a notification.
    pub fn catch_up_now(&self) {
        self.trigger.notify_one();
    }

    /// Returns `true` while the task is running.
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Signal the task to stop and wait for it.
    ///
    /// A catch-up in flight finishes first. Calling `shutdown` more than once
    /// is safe; later calls return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Subscription`] if the task panicked, or the
    /// error that ended the task.
    pub async fn shutdown(&self) -> Result<()> {
        // receiver is gone if the task already exited
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        match task {
            Some(task) => task.await.map_err(|e| {
                ProjectionError::Subscription(format!("subscription task of {} failed: {e}", self.name))
            })?,
            None => Ok(()),
        }
    }
}

/// Spawn the subscription task of `target`.
///
/// The first catch-up runs immediately.
#[must_use]
pub fn spawn(target: Arc<dyn CatchUp>, store: Arc<dyn EventStore>, config: SubscriptionConfig) -> SubscriptionHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trigger = Arc::new(Notify::new());
    let name = target.name().to_string();

    let task = tokio::spawn(run(target, store, config, shutdown_rx, Arc::clone(&trigger)));

    SubscriptionHandle {
        name,
        shutdown_tx,
        trigger,
        task: Mutex::new(Some(task)),
    }
}

enum Wake {
    Poll,
    Requested,
    Notified(Option<GlobalPosition>),
    Shutdown,
}

async fn next_position(notifications: &mut Option<PositionStream>) -> Option<GlobalPosition> {
    match notifications {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn open_notifications(store: &dyn EventStore, name: &str) -> Option<PositionStream> {
    match store.subscribe().await {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::warn!(read_model = name, error = %e, "Position notifications unavailable, polling only");
            None
        }
    }
}

#[allow(clippy::cognitive_complexity)]
async fn run(
    target: Arc<dyn CatchUp>,
    store: Arc<dyn EventStore>,
    config: SubscriptionConfig,
    mut shutdown: watch::Receiver<bool>,
    trigger: Arc<Notify>,
) -> Result<()> {
    let name = target.name().to_string();
    tracing::info!(
        read_model = %name,
        poll_interval = ?config.poll_interval,
        batch_size = config.batch_size,
        "Starting subscription"
    );

    let mut notifications = open_notifications(store.as_ref(), &name).await;
    let mut poll = tokio::time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let wake = tokio::select! {
            _ = poll.tick() => Wake::Poll,
            () = trigger.notified() => Wake::Requested,
            position = next_position(&mut notifications) => Wake::Notified(position),
            changed = shutdown.changed() => {
                if changed.is_err() { Wake::Shutdown } else { continue }
            }
        };

        match wake {
            Wake::Shutdown => break,
            Wake::Notified(None) => {
                tracing::warn!(read_model = %name, "Position notifications closed, polling only");
                notifications = None;
                continue;
            }
            Wake::Notified(Some(position)) => {
                tracing::trace!(read_model = %name, %position, "Position notification");
            }
            Wake::Poll if notifications.is_none() => {
                notifications = open_notifications(store.as_ref(), &name).await;
            }
            Wake::Poll | Wake::Requested => {}
        }

        let started = Instant::now();
        match target.catch_up(&config).await {
            Ok(applied) => {
                failures = 0;
                metrics::counter!("eventstore_catch_up_events_total", "read_model" => name.clone())
                    .increment(u64::try_from(applied).unwrap_or(u64::MAX));
                metrics::histogram!("eventstore_catch_up_duration_seconds", "read_model" => name.clone())
                    .record(started.elapsed().as_secs_f64());
                if applied > 0 {
                    tracing::debug!(read_model = %name, applied, "Caught up");
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = config.retry_delay(failures);
                tracing::error!(
                    read_model = %name,
                    error = %e,
                    failures,
                    retry_in = ?delay,
                    "Catch-up failed"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
                // retry without waiting for the next wake-up
                trigger.notify_one();
            }
        }
    }

    tracing::info!(read_model = %name, "Subscription stopped");
    Ok(())
}
