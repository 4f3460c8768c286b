//! The retry scheduler: a cooperative loop inside the worker.
//!
//! Every tick it claims due `retrying` records through a compare-and-set
//! status guard and republishes their jobs, then revives orphaned `pending`
//! records whose enqueue was lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::model::{Event, RequestStatus};
use crate::queue::{EmitJob, JobPublisher};
use crate::store::{RequestStore, RequestUpdate, StoreError};

/// The due-retry poller.
pub struct RetryScheduler {
    requests: Arc<dyn RequestStore>,
    publisher: Arc<dyn JobPublisher>,
    interval: Duration,
    batch: i64,
    pending_grace: chrono::Duration,
}

impl RetryScheduler {
    /// Builds a scheduler with the given tick interval.
    #[must_use]
    pub fn new(
        requests: Arc<dyn RequestStore>,
        publisher: Arc<dyn JobPublisher>,
        interval: Duration,
    ) -> Self {
        Self {
            requests,
            publisher,
            interval,
            batch: 10,
            pending_grace: chrono::Duration::seconds(60),
        }
    }

    /// Runs until shutdown, polling on a fixed interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once(Utc::now()).await {
                        Ok(0) => {},
                        Ok(count) => debug!(count, "republished due work"),
                        Err(err) => warn!(error = %err, "retry poll failed"),
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("retry scheduler stopping");
                        return;
                    }
                },
            }
        }
    }

    /// One poll: claims due retries, revives stale pending records.
    /// Returns how many jobs were republished.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the due-work queries fail; per-record failures
    /// only log.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut published = 0;

        for request in self.requests.due_retries(now, self.batch).await? {
            // Exclusive claim: only one worker wins this transition.
            let claimed = self
                .requests
                .transition(
                    request.id,
                    RequestStatus::Retrying,
                    RequestStatus::Processing,
                    RequestUpdate {
                        next_retry_at: Some(None),
                        ..RequestUpdate::default()
                    },
                )
                .await?;
            if !claimed {
                continue;
            }
            if let Err(err) = self
                .requests
                .append_event(&Event::transition(
                    request.id,
                    RequestStatus::Retrying,
                    RequestStatus::Processing,
                ))
                .await
            {
                warn!(request_id = %request.id, error = %err, "event append failed");
            }

            let job = EmitJob {
                request_id: request.id,
                idempotency_key: request.idempotency_key.clone(),
                retry_count: request.retry_count,
                enqueued_at: now,
            };
            if let Err(err) = self.publisher.publish_emit(&job).await {
                // Undo the claim so a later tick can retry the publish.
                warn!(request_id = %request.id, error = %err,
                    "republish failed, restoring retrying state");
                let restored = self
                    .requests
                    .transition(
                        request.id,
                        RequestStatus::Processing,
                        RequestStatus::Retrying,
                        RequestUpdate {
                            next_retry_at: Some(request.next_retry_at),
                            ..RequestUpdate::default()
                        },
                    )
                    .await;
                if let Err(err) = restored {
                    warn!(request_id = %request.id, error = %err, "claim rollback failed");
                }
                continue;
            }
            published += 1;
        }

        // Orphans: intake persisted them but the enqueue never landed.
        let cutoff = now - self.pending_grace;
        for request in self.requests.stale_pending(cutoff, self.batch).await? {
            let job = EmitJob {
                request_id: request.id,
                idempotency_key: request.idempotency_key.clone(),
                retry_count: request.retry_count,
                enqueued_at: now,
            };
            match self.publisher.publish_emit(&job).await {
                Ok(()) => {
                    info!(request_id = %request.id, "revived orphaned pending request");
                    published += 1;
                },
                Err(err) => {
                    warn!(request_id = %request.id, error = %err, "orphan revival failed");
                },
            }
        }

        Ok(published)
    }
}
