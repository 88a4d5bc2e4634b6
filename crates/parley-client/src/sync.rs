//! History reconciliation.
//!
//! Decides per chat-open whether to serve the cache, download the whole
//! history, or walk server pages only until a known message shows up.
//! The stop-early rule relies on history being append-only and page
//! walks being strictly sequential: one already-cached message on a
//! page proves everything older is cached too.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use parley_net::ChatApi;
use parley_shared::constants::{PAGE_SIZE, SYNC_INTERVAL};
use parley_shared::Message;
use parley_store::Database;

use crate::error::ClientError;

/// Reconciliation knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cache freshness window; opens inside it skip the network.
    pub sync_interval: Duration,
    /// Messages requested per history page.
    pub page_size: u32,
    /// Retention cap per chat, `None` for unlimited.
    pub max_messages: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: SYNC_INTERVAL,
            page_size: PAGE_SIZE,
            max_messages: None,
        }
    }
}

/// Bring a chat's cached history up to date and return it, ascending.
///
/// The sync stamp only advances when a pass completes; a page failure
/// aborts the pass, keeps whatever pages already merged, and leaves the
/// stamp so the next open retries.
pub async fn reconcile(
    api: &dyn ChatApi,
    db: &Mutex<Database>,
    chat_id: i64,
    config: &SyncConfig,
    now: DateTime<Utc>,
) -> Result<Vec<Message>, ClientError> {
    let (last_synced, cached) = {
        let db = db.lock().unwrap_or_else(|e| e.into_inner());
        (db.last_synced_at(chat_id)?, db.history(chat_id)?)
    };

    let needs_sync = match last_synced {
        None => true,
        Some(stamp) => {
            now.timestamp_millis() - stamp > config.sync_interval.as_millis() as i64
        }
    };

    if !needs_sync {
        debug!(chat_id, "cache fresh, serving local history");
        return Ok(cached);
    }

    let merged = if cached.is_empty() {
        info!(chat_id, "no local history, fetching all pages");
        fetch_all(api, db, chat_id, config).await?
    } else {
        info!(chat_id, cached = cached.len(), "incremental sync");
        fetch_until_known(api, db, chat_id, cached, config).await?
    };

    db.lock()
        .unwrap_or_else(|e| e.into_inner())
        .set_last_synced_at(chat_id, now.timestamp_millis())?;

    Ok(merged)
}

/// Full fetch: walk every page, newest first, persisting the
/// accumulated set after each page so partial progress survives a
/// reload.
async fn fetch_all(
    api: &dyn ChatApi,
    db: &Mutex<Database>,
    chat_id: i64,
    config: &SyncConfig,
) -> Result<Vec<Message>, ClientError> {
    let mut merged: Vec<Message> = Vec::new();
    let mut page = 0;

    loop {
        let page_data = api.messages_page(chat_id, page, config.page_size).await?;
        let last = page_data.last;

        merged.extend(page_data.content.into_iter().map(|raw| raw.into_message()));
        merged = normalize(merged);

        db.lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace_history(chat_id, &merged)?;

        debug!(chat_id, page, total = merged.len(), "merged history page");

        if last {
            break;
        }
        page += 1;
    }

    Ok(merged)
}

/// Incremental fetch: keep only messages newer than the newest local
/// one and stop at the first page that contains a known message (or at
/// the last page).
async fn fetch_until_known(
    api: &dyn ChatApi,
    db: &Mutex<Database>,
    chat_id: i64,
    cached: Vec<Message>,
    config: &SyncConfig,
) -> Result<Vec<Message>, ClientError> {
    let latest_local = cached.iter().map(|m| m.order_key()).max().unwrap_or(0);

    let mut merged = cached;
    let mut page = 0;

    loop {
        let page_data = api.messages_page(chat_id, page, config.page_size).await?;
        let last = page_data.last;

        let mut found_known = false;
        for raw in page_data.content {
            let message = raw.into_message();
            if message.order_key() <= latest_local {
                found_known = true;
            } else {
                merged.push(message);
            }
        }
        merged = normalize(merged);

        db.lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace_history(chat_id, &merged)?;

        debug!(
            chat_id,
            page,
            total = merged.len(),
            found_known,
            "merged history page"
        );

        if found_known || last {
            if !found_known {
                warn!(chat_id, "walked all pages without meeting local history");
            }
            break;
        }
        page += 1;
    }

    Ok(merged)
}

/// Ascending order-key sort with duplicate fetches collapsed. Two rows
/// only count as the same message when key, sender, and body all match;
/// distinct id-less messages from the same second are all kept.
fn normalize(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by_key(Message::order_key);
    messages.dedup_by(|a, b| {
        a.order_key() == b.order_key() && a.sender == b.sender && a.message == b.message
    });
    messages
}
