//! Periodic housekeeping and the RabbitMQ side channels. Every loop exits
//! when the shutdown token fires.

use std::future::Future;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::BasicAckOptions;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::infrastructure::queue::rabbitmq::{RabbitMqService, OPERATOR_ALERT_QUEUE, TRANSCODE_QUEUE};
use crate::modules::jobs::queue::JobQueue;
use crate::modules::playback::service::PlaybackService;
use crate::modules::upload::service::UploadCoordinator;

/// Runs `tick` every `period` until shutdown. A slow tick delays the next one
/// rather than causing a burst.
async fn every<F, Fut>(name: &str, period: Duration, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("⏱️ {} running every {:?}", name, period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => tick().await,
        }
    }

    info!("🛑 {} stopped", name);
}

pub async fn run_lease_reaper(queue: JobQueue, interval: Duration, shutdown: CancellationToken) {
    let queue = &queue;
    every("Lease reaper", interval, shutdown, move || async move {
        match queue.reap().await {
            Ok(report) if report.requeued.is_empty() && report.failed.is_empty() => {}
            Ok(report) => info!(
                "♻️ Reaper requeued {} and failed {} stalled job(s)",
                report.requeued.len(),
                report.failed.len()
            ),
            Err(e) => error!("Lease reaper sweep failed: {}", e),
        }
    })
    .await
}

pub async fn run_session_sweep(
    playback: PlaybackService,
    threshold: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let playback = &playback;
    every("Device session sweep", interval, shutdown, move || async move {
        match playback.sweep_inactive(threshold).await {
            Ok(0) => {}
            Ok(n) => info!("Deactivated {} idle device session(s)", n),
            Err(e) => error!("Device session sweep failed: {}", e),
        }
    })
    .await
}

pub async fn run_upload_expiry(uploads: UploadCoordinator, interval: Duration, shutdown: CancellationToken) {
    let uploads = &uploads;
    every("Upload expiry sweep", interval, shutdown, move || async move {
        match uploads.sweep_expired().await {
            Ok(0) => {}
            Ok(n) => info!("Expired {} upload session(s)", n),
            Err(e) => error!("Upload expiry sweep failed: {}", e),
        }
    })
    .await
}

/// Turns wake-up nudges published by other processes into local wake-ups.
/// Losing this consumer only costs latency; workers still poll.
pub async fn run_nudge_consumer(rabbit: RabbitMqService, queue: JobQueue, shutdown: CancellationToken) {
    let tag = format!("transcoder-nudges-{}", std::process::id());
    let mut consumer = match rabbit.consume(TRANSCODE_QUEUE, &tag).await {
        Ok(consumer) => consumer,
        Err(e) => {
            warn!("Job nudges disabled, falling back to polling: {}", e);
            return;
        }
    };

    info!("🐇 Listening for job nudges on '{}'", TRANSCODE_QUEUE);

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = consumer.next() => next,
        };

        match delivery {
            Some(Ok(delivery)) => {
                debug!("Job nudge received ({} bytes)", delivery.data.len());
                queue.wake();
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!("Failed to ack job nudge: {}", e);
                }
            }
            Some(Err(e)) => warn!("Job nudge consumer error: {}", e),
            None => {
                warn!("Job nudge consumer closed, falling back to polling");
                break;
            }
        }
    }
}

/// Forwards permanent job failures from the in-process channel to the
/// operator queue.
pub async fn run_alert_forwarder(rabbit: RabbitMqService, queue: JobQueue, shutdown: CancellationToken) {
    let mut alerts = queue.subscribe_alerts();

    loop {
        let alert = tokio::select! {
            _ = shutdown.cancelled() => break,
            alert = alerts.recv() => alert,
        };

        match alert {
            Ok(alert) => {
                if let Err(e) = rabbit.publish_json(OPERATOR_ALERT_QUEUE, &alert).await {
                    error!("Failed to forward alert for job {}: {}", alert.job_id, e);
                }
            }
            Err(RecvError::Lagged(missed)) => warn!("Operator alert forwarder missed {} alert(s)", missed),
            Err(RecvError::Closed) => break,
        }
    }
}
