//! Worker pools, job dispatch, and graceful shutdown.
//!
//! One pool per label, sized from config. Workers lease, run with a
//! per-label timeout, then ack or fail. A job that dead-letters on the
//! bundle spine takes its bundle to `failed` and queues the refunds, so
//! reservations never leak on permanent delivery failure.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use weft::WeftError;

use crate::error::UploadError;
use crate::metrics;
use crate::pipeline::{self, FinalizeJob, PipelineCtx, SettleAction};
use crate::store::queue::{Job, JobFate, JobLabel};

const POLL_INTERVAL_MS: u64 = 500;
const MAINTENANCE_INTERVAL_SECS: u64 = 60;

fn lease_secs(label: JobLabel) -> u64 {
    match label {
        JobLabel::Post | JobLabel::Verify => 600,
        JobLabel::Prepare | JobLabel::Unbundle => 300,
        _ => 120,
    }
}

/// Hard cancel bound per label; comfortably inside the lease.
fn job_timeout(label: JobLabel) -> Duration {
    match label {
        JobLabel::Post | JobLabel::Verify => Duration::from_secs(540),
        JobLabel::Prepare | JobLabel::Unbundle => Duration::from_secs(240),
        JobLabel::NewDataItem => Duration::from_secs(60),
        _ => Duration::from_secs(90),
    }
}

async fn dispatch(ctx: &PipelineCtx, job: &Job) -> Result<(), UploadError> {
    match job.label {
        JobLabel::NewDataItem => pipeline::new_item::handle(ctx, &job.payload).await,
        JobLabel::Plan => pipeline::plan::handle(ctx).await,
        JobLabel::Prepare => pipeline::prepare::handle(ctx, &job.payload).await,
        JobLabel::Post => pipeline::post::handle(ctx, &job.payload).await,
        JobLabel::Verify => pipeline::verify::handle(ctx, &job.payload).await,
        JobLabel::OversizedItem => pipeline::oversized::handle(ctx, &job.payload).await,
        JobLabel::Unbundle => pipeline::unbundle::handle(ctx, &job.payload).await,
        JobLabel::OpticalPost => pipeline::optical::handle(ctx, &job.payload).await,
        JobLabel::PutOffsets => pipeline::offsets::handle(ctx, &job.payload).await,
        JobLabel::CleanupFs => pipeline::cleanup::handle(ctx, &job.payload).await,
        JobLabel::FinalizePayment => pipeline::finalize_payment::handle(ctx, &job.payload).await,
    }
}

/// A job on the bundle spine has exhausted its retries: fail the bundle
/// and queue refunds for every member reservation.
async fn on_dead(ctx: &PipelineCtx, job: &Job) {
    let bundle_id = match job.label {
        JobLabel::Prepare | JobLabel::Post | JobLabel::Verify => {
            match job.payload.get("bundleId").and_then(|v| v.as_str()) {
                Some(id) => id.to_string(),
                None => return,
            }
        }
        _ => return,
    };

    match ctx.db.fail_bundle(&bundle_id, "delivery_failed") {
        Ok(items) => {
            for item in items {
                let payload = serde_json::to_value(FinalizeJob {
                    item_id: item.item_id.clone(),
                    reservation_id: item.reservation_id.clone(),
                    payment_id: item.payment_id.clone(),
                    byte_count: item.byte_count,
                    action: SettleAction::Refund,
                })
                .unwrap_or_default();
                if let Err(e) = ctx.queue.enqueue(JobLabel::FinalizePayment, &payload) {
                    tracing::error!(
                        item = %item.item_id,
                        error = %e,
                        "failed to queue refund for failed bundle"
                    );
                }
            }
            tracing::error!(bundle = %bundle_id, label = job.label.as_str(), "bundle failed permanently");
        }
        Err(e) => {
            tracing::error!(bundle = %bundle_id, error = %e, "could not fail bundle after dead-letter");
        }
    }
}

async fn run_job(ctx: &PipelineCtx, job: &Job) {
    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(job_timeout(job.label), dispatch(ctx, job)).await;
    let elapsed = started.elapsed().as_secs_f64();

    match outcome {
        Ok(Ok(())) => {
            metrics::JOB_RUNS
                .with_label_values(&[job.label.as_str(), "ok"])
                .inc();
            metrics::JOB_LATENCY
                .with_label_values(&[job.label.as_str()])
                .observe(elapsed);
            if let Err(e) = ctx.queue.ack(job.id) {
                tracing::error!(job = job.id, error = %e, "failed to ack completed job");
            }
        }
        Ok(Err(e)) => {
            metrics::JOB_RUNS
                .with_label_values(&[job.label.as_str(), "error"])
                .inc();
            tracing::warn!(
                job = job.id,
                label = job.label.as_str(),
                attempt = job.attempt,
                error = %e,
                "job failed"
            );
            let err = match e {
                UploadError::Core(core) => core,
                UploadError::Db(db) => WeftError::Internal(db.to_string()),
            };
            match ctx.queue.fail(job, &err) {
                Ok(JobFate::Dead) => on_dead(ctx, job).await,
                Ok(JobFate::Retrying { .. }) => {}
                Err(e) => tracing::error!(job = job.id, error = %e, "failed to record job failure"),
            }
        }
        Err(_) => {
            metrics::JOB_RUNS
                .with_label_values(&[job.label.as_str(), "timeout"])
                .inc();
            tracing::warn!(
                job = job.id,
                label = job.label.as_str(),
                "job timed out"
            );
            let err = WeftError::Timeout(format!("{} job timed out", job.label.as_str()));
            match ctx.queue.fail(job, &err) {
                Ok(JobFate::Dead) => on_dead(ctx, job).await,
                _ => {}
            }
        }
    }
}

async fn worker_loop(
    ctx: Arc<PipelineCtx>,
    label: JobLabel,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match ctx.queue.lease(label, lease_secs(label)) {
            Ok(Some(job)) => run_job(&ctx, &job).await,
            Ok(None) => {
                let idle = weft::backoff::with_jitter(Duration::from_millis(POLL_INTERVAL_MS));
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                tracing::error!(label = label.as_str(), error = %e, "queue lease failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    tracing::debug!(label = label.as_str(), "worker stopped");
}

/// Background maintenance: lease reaping, cache purge, multipart expiry,
/// the periodic plan tick, and queue-depth gauges.
async fn maintenance_loop(ctx: Arc<PipelineCtx>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
    let plan_every = (ctx.cfg.plan_interval_secs / MAINTENANCE_INTERVAL_SECS).max(1);
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        ticks += 1;

        match ctx.queue.reap_expired() {
            Ok(0) => {}
            Ok(reaped) => tracing::info!(reaped, "returned expired job leases"),
            Err(e) => tracing::error!(error = %e, "lease reap failed"),
        }

        let purged = ctx.cache.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "purged expired cache entries");
        }

        match ctx.db.sweep_expired_multiparts() {
            Ok(expired) => {
                for upload_id in expired {
                    tracing::info!(upload = %upload_id, "expired multipart upload");
                    // Part numbering is client-chosen; probe until a
                    // long run of misses says we are past the end.
                    let mut consecutive_misses = 0u32;
                    for part in 0..10_000u32 {
                        let key = crate::multipart::part_key(&upload_id, part);
                        match ctx.objects.exists(crate::store::Bucket::Raw, &key).await {
                            Ok(true) => {
                                consecutive_misses = 0;
                                let _ = ctx.objects.delete(crate::store::Bucket::Raw, &key).await;
                            }
                            _ => {
                                consecutive_misses += 1;
                                if consecutive_misses > 64 {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "multipart sweep failed"),
        }

        if ticks % plan_every == 0 {
            if let Err(e) = ctx.queue.enqueue(JobLabel::Plan, &serde_json::json!({})) {
                tracing::error!(error = %e, "failed to enqueue periodic plan tick");
            }
        }

        for label in JobLabel::ALL {
            if let Ok(depth) = ctx.queue.pending_count(label) {
                metrics::QUEUE_DEPTH
                    .with_label_values(&[label.as_str()])
                    .set(depth as i64);
            }
        }
    }
}

/// Spawn every worker pool plus the maintenance task.
pub fn spawn_workers(
    ctx: Arc<PipelineCtx>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for label in JobLabel::ALL {
        let concurrency = ctx.cfg.worker_concurrency(label);
        for _ in 0..concurrency {
            handles.push(tokio::spawn(worker_loop(
                Arc::clone(&ctx),
                label,
                shutdown.clone(),
            )));
        }
        tracing::info!(label = label.as_str(), concurrency, "worker pool started");
    }
    handles.push(tokio::spawn(maintenance_loop(ctx, shutdown)));
    handles
}

/// Wait for workers to drain, up to the grace timeout.
pub async fn await_shutdown(handles: Vec<JoinHandle<()>>, grace: Duration) {
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!(
            grace_secs = grace.as_secs(),
            "workers did not drain within grace period; abandoning leases"
        );
    }
}
