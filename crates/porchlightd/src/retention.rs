use chrono::{DateTime, Duration as ChronoDuration, Utc};
use porchlight_store::{HistoryStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Delete events older than `days` relative to `now`.
pub async fn purge_once(history: &dyn HistoryStore, days: u32, now: DateTime<Utc>) -> Result<u64, StoreError> {
    let cutoff = now - ChronoDuration::days(i64::from(days));
    let removed = history.delete_older_than(cutoff).await?;
    if removed > 0 {
        tracing::info!(removed, days, "expired history purged");
    }
    Ok(removed)
}

/// Hourly purge task; `None` when retention is disabled (`days == 0`).
pub fn spawn_retention(history: Arc<dyn HistoryStore>, days: u32) -> Option<JoinHandle<()>> {
    if days == 0 {
        tracing::info!("history retention disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = purge_once(history.as_ref(), days, Utc::now()).await {
                tracing::warn!(error = %e, "history purge failed");
            }
        }
    }))
}
