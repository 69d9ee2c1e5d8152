//! Long-polling update source.

use crate::protocol::Update;
use crate::telegram::TelegramClient;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

const POLL_RETRY_BASE_MS: u64 = 400;
const POLL_RETRY_MAX_MS: u64 = 30_000;

fn retry_delay_ms(attempt: u32) -> u64 {
    let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
    POLL_RETRY_BASE_MS.saturating_mul(exp).min(POLL_RETRY_MAX_MS)
}

/// Offset that acknowledges every update in `batch`.
fn next_offset(current: Option<i64>, batch: &[Update]) -> Option<i64> {
    batch
        .iter()
        .map(|update| update.update_id + 1)
        .max()
        .max(current)
}

/// Fetch updates with `getUpdates` and forward them to the dispatcher until
/// `shutdown` resolves or the dispatcher goes away.
pub async fn run_polling(
    client: &TelegramClient,
    updates: mpsc::Sender<Update>,
    poll_timeout_secs: u64,
    shutdown: impl Future<Output = &'static str>,
) {
    if let Err(error) = client.delete_webhook().await {
        tracing::warn!(error = %error, "Failed to remove webhook before polling");
    }

    tokio::pin!(shutdown);
    let mut offset: Option<i64> = None;
    let mut failures: u32 = 0;
    tracing::info!(poll_timeout_secs, "Polling for updates");

    loop {
        let batch = tokio::select! {
            signal = &mut shutdown => {
                tracing::info!(signal, "Stopping polling");
                return;
            }
            batch = client.get_updates(offset, poll_timeout_secs) => batch,
        };

        let batch = match batch {
            Ok(batch) => {
                failures = 0;
                batch
            }
            Err(error) => {
                failures = failures.saturating_add(1);
                let delay = retry_delay_ms(failures);
                tracing::warn!(error = %error, attempt = failures, retry_ms = delay, "getUpdates failed");
                tokio::select! {
                    signal = &mut shutdown => {
                        tracing::info!(signal, "Stopping polling");
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }
                continue;
            }
        };

        offset = next_offset(offset, &batch);
        for update in batch {
            tracing::debug!(update_id = update.update_id, "Received update");
            if updates.send(update).await.is_err() {
                tracing::warn!("Dispatcher stopped, ending polling");
                return;
            }
        }
    }
}
