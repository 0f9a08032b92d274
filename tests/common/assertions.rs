//! Custom test assertions for integration tests

use book_dl::{DownloadId, DownloadManager, DownloadSnapshot, Event, Status};
use std::time::Duration;
use tokio::sync::broadcast;

/// Wait for the next event matching `predicate`
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    predicate: F,
) -> Option<Event>
where
    F: Fn(&Event) -> bool,
{
    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;

    result.ok().flatten()
}

/// Collect events for `id` until a terminal event (completed, failed, cancelled)
pub async fn collect_until_terminal(
    events: &mut broadcast::Receiver<Event>,
    id: &DownloadId,
    timeout: Duration,
) -> Vec<Event> {
    let mut collected = Vec::new();

    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            if event.id() != Some(id) {
                continue;
            }
            let terminal = matches!(
                event,
                Event::Completed { .. } | Event::Failed { .. } | Event::Cancelled { .. }
            );
            collected.push(event);
            if terminal {
                break;
            }
        }
    })
    .await;

    collected
}

/// Poll the manager until the download reaches `status`
pub async fn wait_for_status(
    manager: &DownloadManager,
    id: &DownloadId,
    status: Status,
    timeout: Duration,
) -> DownloadSnapshot {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(snapshot) = manager.snapshot_for(id)
            && snapshot.status == status
        {
            return snapshot;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "Timeout waiting for {} to reach {}; last snapshot {:?}",
                id,
                status,
                manager.snapshot_for(id)
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Event type names as they appear in JSON (`"queued"`, `"started"`, ...)
pub fn event_names(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .map(|e| {
            serde_json::to_value(e).expect("event serializes")["type"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

/// Assert `bytes_received` never decreases across the events
pub fn assert_monotonic_progress(events: &[Event]) {
    let progress: Vec<u64> = events
        .iter()
        .filter_map(|e| e.snapshot().map(|s| s.bytes_received))
        .collect();
    assert!(
        progress.windows(2).all(|w| w[0] <= w[1]),
        "bytes_received went backwards: {progress:?}"
    );
}
