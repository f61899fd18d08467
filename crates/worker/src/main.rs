//! Finflow Background Worker
//!
//! Handles scheduled jobs including:
//! - Webhook queue drain (every minute)
//! - Stale intent reconciliation (every 5 minutes)
//! - Auto-renewal checkout creation (daily at 2:00 AM UTC)
//! - Billing invariant checks (daily at 5:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use finflow_billing::{BillingService, InvariantChecker};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Events drained per pass; a backlog clears over successive minutes.
const DRAIN_BATCH_SIZE: i64 = 50;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Finflow Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without provider credentials there is nothing to drive.
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Drain the webhook event queue (every minute)
    // Picks up queued events, retryable failures, and stuck claims.
    let drain_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = drain_billing.clone();
            Box::pin(async move {
                match billing.processor.drain_queue(DRAIN_BATCH_SIZE).await {
                    Ok(summary) => {
                        if summary.scanned > 0 {
                            info!(
                                scanned = summary.scanned,
                                applied = summary.applied,
                                acknowledged = summary.acknowledged,
                                ignored = summary.ignored,
                                failed = summary.failed,
                                "Webhook queue drain complete"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Webhook queue drain failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook queue drain (every minute)");

    // Job 2: Expire stale payment intents (every 5 minutes)
    let reconcile_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = reconcile_billing.clone();
            Box::pin(async move {
                if let Err(e) = billing.reconciliation.expire_stale_intents().await {
                    error!(error = %e, "Reconciliation sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale intent reconciliation (every 5 minutes)");

    // Job 3: Auto-renewal checkout creation (daily at 2:00 AM UTC)
    let renewal_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let billing = renewal_billing.clone();
            Box::pin(async move {
                info!("Running auto-renewal job");
                match billing.renewal.run().await {
                    Ok(summary) => info!(
                        candidates = summary.candidates,
                        initiated = summary.initiated,
                        failed = summary.failed,
                        "Auto-renewal job complete"
                    ),
                    Err(e) => error!(error = %e, "Auto-renewal job failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Auto-renewal (daily at 2:00 AM UTC)");

    // Job 4: Billing invariant checks (daily at 5:00 AM UTC)
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 5 * * *", move |_uuid, _l| {
            let pool = invariant_pool.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                let checker = InvariantChecker::new(pool);
                match checker.run_all_checks().await {
                    Ok(summary) => {
                        if summary.healthy {
                            info!(
                                checks_run = summary.checks_run,
                                "All billing invariants hold"
                            );
                        } else {
                            for violation in &summary.violations {
                                warn!(
                                    invariant = %violation.invariant,
                                    severity = %violation.severity,
                                    description = %violation.description,
                                    "Billing invariant violated"
                                );
                            }
                            error!(
                                checks_failed = summary.checks_failed,
                                violations = summary.violations.len(),
                                "Billing invariant check found violations"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 5:00 AM UTC)");

    // Job 5: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Finflow Worker started successfully with {} scheduled jobs", 6);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
