use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use mc_model::{Agent, ChangeEvent, ResumeToken};
use mc_store::{DocumentStore, FeedEvent, ResumeTokenStore};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::sequence::SequenceTracker;

const INITIAL_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Identifies one watched feed — one per distinct `(database, collection)`
/// referenced by any enabled agent (§4.1 "Subscription lifecycle").
pub fn watcher_id(database: &str, collection: &str) -> String {
    format!("{database}:{collection}")
}

/// Drives one subscription's reconnect-with-backoff loop until `shutdown`
/// fires. Grounded on `fc-stream::watcher::MongoStreamWatcher::watch`, with
/// the teacher's direct-persist-on-batch swapped for the sequence-tagged
/// handoff required by §4.1's resume-token policy.
pub async fn run_subscription(
    database: String,
    collection: String,
    store: Arc<dyn DocumentStore>,
    resume_store: Arc<dyn ResumeTokenStore>,
    handoff: mpsc::Sender<ChangeEvent>,
    mut ack_rx: mpsc::UnboundedReceiver<u64>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let id = watcher_id(&database, &collection);
    let sequence = Arc::new(AtomicU64::new(0));
    let mut tracker = SequenceTracker::new();
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        if shutdown.try_recv().is_ok() {
            info!(watcher_id = %id, "subscription draining on shutdown");
            return;
        }

        let resume_token = match resume_store.load(&id).await {
            Ok(Some(t)) => Some(t.token),
            Ok(None) => None,
            Err(e) => {
                warn!(watcher_id = %id, error = %e, "failed to load resume token, starting from now");
                None
            }
        };

        let stream_result = store.subscribe(&database, &collection, resume_token).await;
        let mut stream = match stream_result {
            Ok(s) => {
                backoff_ms = INITIAL_BACKOFF_MS;
                info!(watcher_id = %id, "change feed subscription opened");
                s
            }
            Err(e) => {
                if is_stale_resume_token_error(&e) {
                    error!(watcher_id = %id, "resume token invalidated, restarting from now — events in the gap are lost");
                    let _ = resume_store
                        .save(&ResumeToken { watcher_id: id.clone(), token: String::new(), updated_at: chrono::Utc::now() })
                        .await;
                    backoff_ms = INITIAL_BACKOFF_MS;
                    continue;
                }
                warn!(watcher_id = %id, error = %e, backoff_ms, "failed to open change feed, retrying");
                if sleep_or_shutdown(backoff_ms, &mut shutdown).await {
                    return;
                }
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(watcher_id = %id, "subscription draining on shutdown");
                    return;
                }
                ack = ack_rx.recv() => {
                    if let Some(seq) = ack {
                        if let Some(token) = tracker.ack(seq) {
                            let record = ResumeToken { watcher_id: id.clone(), token, updated_at: chrono::Utc::now() };
                            if let Err(e) = resume_store.save(&record).await {
                                warn!(watcher_id = %id, error = %e, "failed to persist advanced resume token");
                            }
                        }
                    }
                }
                item = stream.next() => {
                    match item {
                        Some(Ok(feed_event)) => {
                            let event = to_change_event(&id, feed_event, &sequence);
                            tracker.observe(event.sequence, event.resume_token.clone());
                            if handoff.send(event).await.is_err() {
                                warn!(watcher_id = %id, "dispatcher handoff closed, stopping subscription");
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            if is_stale_resume_token_error(&e) {
                                error!(watcher_id = %id, "resume token invalidated mid-stream, restarting from now");
                                let _ = resume_store
                                    .save(&ResumeToken { watcher_id: id.clone(), token: String::new(), updated_at: chrono::Utc::now() })
                                    .await;
                                backoff_ms = INITIAL_BACKOFF_MS;
                            } else {
                                warn!(watcher_id = %id, error = %e, backoff_ms, "change feed error, reconnecting");
                                if sleep_or_shutdown(backoff_ms, &mut shutdown).await {
                                    return;
                                }
                                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                            }
                            break;
                        }
                        None => {
                            warn!(watcher_id = %id, backoff_ms, "change feed closed unexpectedly, reconnecting");
                            if sleep_or_shutdown(backoff_ms, &mut shutdown).await {
                                return;
                            }
                            backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn sleep_or_shutdown(backoff_ms: u64, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => false,
        _ = shutdown.recv() => true,
    }
}

fn to_change_event(watcher_id: &str, event: FeedEvent, sequence: &AtomicU64) -> ChangeEvent {
    let seq = sequence.fetch_add(1, Ordering::SeqCst);
    ChangeEvent {
        watcher_id: watcher_id.to_string(),
        resume_token: event.token,
        sequence: seq,
        operation: event.operation,
        database: event.database,
        collection: event.collection,
        document_id: event.document_id,
        full_document: event.full_document,
        cluster_time: event.cluster_time,
    }
}

fn is_stale_resume_token_error<E: std::fmt::Display>(e: &E) -> bool {
    let s = e.to_string().to_lowercase();
    (s.contains("changestream") && s.contains("history")) || s.contains("resume token") || s.contains("oplog") || s.contains("invalidate")
}

/// Desired `(database, collection)` set, derived from every currently
/// enabled agent's watch target (§4.1 "Membership changes").
pub fn desired_collections(agents: &[Agent]) -> std::collections::HashSet<(String, String)> {
    agents.iter().map(|a| (a.watch.database.clone(), a.watch.collection.clone())).collect()
}
