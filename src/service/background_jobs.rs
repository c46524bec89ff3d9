// service/background_jobs.rs
use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::AppState;

/// Retries escrow movements whose gateway call failed or never ran.
pub async fn start_settlement_job(app_state: Arc<AppState>) {
    let period = Duration::from_secs(app_state.env.settlement_interval_secs.max(1));
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        match app_state.escrow_service.settle_pending().await {
            Ok(0) => tracing::debug!("Settlement job found nothing to settle"),
            Ok(settled) => tracing::info!(settled, "Settlement job completed"),
            Err(e) => tracing::error!("Settlement job failed: {}", e),
        }
    }
}
