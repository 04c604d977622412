use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info};

pub mod tasks;

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<crate::context::AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<crate::context::AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        tokio::spawn(Self::credential_sweep_job(Arc::clone(&self)));
        tokio::spawn(Self::health_check_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Delete long-expired credentials
    ///
    /// Housekeeping only: lookups check expiry themselves.
    async fn credential_sweep_job(scheduler: Arc<Self>) {
        let period = scheduler.context.config.jobs.credential_sweep_interval.max(1);
        let mut interval = interval(Duration::from_secs(period));

        loop {
            interval.tick().await;

            match tasks::sweep_expired_credentials(&scheduler.context).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Purged {} expired credentials", count);
                    }
                }
                Err(e) => error!("Failed to purge expired credentials: {}", e),
            }
        }
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300));

        loop {
            interval.tick().await;

            if let Err(e) = tasks::health_check(&scheduler.context).await {
                error!("Health check failed: {}", e);
            }
        }
    }
}
