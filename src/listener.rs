//! Listener registry and notification dispatch
//!
//! Transitions are published two ways:
//! - to every registered [`DownloadListener`], on a dedicated dispatch thread
//!   so a slow or panicking listener never stalls a transfer;
//! - to a `tokio::sync::broadcast` channel for async subscribers.
//!
//! Events are sent while the download's own lock is held, which makes the
//! channel order equal to the transition order for each identifier. At most
//! `listener_queue_capacity` progress events wait in the channel; further
//! progress is dropped until the dispatcher catches up. Lifecycle events are
//! never dropped.
//!
//! The dispatch thread runs until the last manager handle is dropped.

use crate::types::{DownloadSnapshot, Event, FailureCause};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};

/// Receives download transitions
///
/// Every method has an empty default, so implementors only override what
/// they care about. Callbacks run on the notification thread, one at a time.
pub trait DownloadListener: Send + Sync {
    /// Accepted and waiting for a worker slot
    fn download_queued(&self, _snapshot: &DownloadSnapshot) {}

    /// Worker slot acquired
    fn download_started(&self, _snapshot: &DownloadSnapshot) {}

    /// First body bytes arrived
    fn download_started_receiving_data(&self, _snapshot: &DownloadSnapshot) {}

    /// Progress (throttled)
    fn download_received_data(&self, _snapshot: &DownloadSnapshot) {}

    /// Stopped by `pause`
    fn download_paused(&self, _snapshot: &DownloadSnapshot) {}

    /// Re-queued by `resume`
    fn download_resumed(&self, _snapshot: &DownloadSnapshot) {}

    /// File complete and waiting to be taken
    fn download_completed(&self, _snapshot: &DownloadSnapshot) {}

    /// Download failed
    fn download_failed(&self, _snapshot: &DownloadSnapshot, _cause: &FailureCause) {}

    /// Download cancelled
    fn download_cancelled(&self, _snapshot: &DownloadSnapshot) {}

    /// A consumer took the file, which now lives at `file`
    fn download_completed_take(&self, _snapshot: &DownloadSnapshot, _file: &Path) {}

    /// Handing the file to the consumer failed
    fn download_completed_take_failed(&self, _snapshot: &DownloadSnapshot, _error: &str) {}

    /// The completed download is consumed
    fn download_completed_taken(&self, _snapshot: &DownloadSnapshot) {}

    /// Bookkeeping for the download was removed
    fn download_cleaned_up(&self, _snapshot: &DownloadSnapshot) {}
}

/// Handle returned by listener registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Route one event to the matching listener callback
fn deliver(listener: &dyn DownloadListener, event: &Event) {
    match event {
        Event::Queued { snapshot } => listener.download_queued(snapshot),
        Event::Started { snapshot } => listener.download_started(snapshot),
        Event::StartedReceivingData { snapshot } => {
            listener.download_started_receiving_data(snapshot)
        }
        Event::ReceivedData { snapshot } => listener.download_received_data(snapshot),
        Event::Paused { snapshot } => listener.download_paused(snapshot),
        Event::Resumed { snapshot } => listener.download_resumed(snapshot),
        Event::Completed { snapshot } => listener.download_completed(snapshot),
        Event::Failed { snapshot, cause } => listener.download_failed(snapshot, cause),
        Event::Cancelled { snapshot } => listener.download_cancelled(snapshot),
        Event::CompletedTake { snapshot, file } => {
            listener.download_completed_take(snapshot, file)
        }
        Event::CompletedTakeFailed { snapshot, error } => {
            listener.download_completed_take_failed(snapshot, error)
        }
        Event::CompletedTaken { snapshot } => listener.download_completed_taken(snapshot),
        Event::CleanedUp { snapshot } => listener.download_cleaned_up(snapshot),
        Event::Shutdown => {}
    }
}

type ListenerList = RwLock<Vec<(ListenerId, Arc<dyn DownloadListener>)>>;

/// State shared between the notifier and its dispatch thread
struct Shared {
    listeners: ListenerList,
    /// Progress events sent but not yet delivered
    pending_progress: AtomicUsize,
    dropped_progress: AtomicU64,
    progress_capacity: usize,
}

/// Fan-out point for all download events
pub(crate) struct Notifier {
    shared: Arc<Shared>,
    listener_tx: mpsc::UnboundedSender<Event>,
    event_tx: broadcast::Sender<Event>,
    next_listener_id: AtomicU64,
}

impl Notifier {
    /// Create the notifier and start its dispatch thread
    pub(crate) fn start(
        listener_queue_capacity: usize,
        event_channel_capacity: usize,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            listeners: RwLock::new(Vec::new()),
            pending_progress: AtomicUsize::new(0),
            dropped_progress: AtomicU64::new(0),
            progress_capacity: listener_queue_capacity.max(1),
        });
        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        let (event_tx, _rx) = broadcast::channel(event_channel_capacity.max(1));

        let worker = shared.clone();
        std::thread::Builder::new()
            .name("book-dl-notify".to_string())
            .spawn(move || dispatch_loop(worker, listener_rx))?;

        Ok(Self {
            shared,
            listener_tx,
            event_tx,
            next_listener_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn DownloadListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Publish an event without blocking
    pub(crate) fn emit(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine
        self.event_tx.send(event.clone()).ok();

        if event.is_progress() {
            let pending = self.shared.pending_progress.fetch_add(1, Ordering::AcqRel);
            if pending >= self.shared.progress_capacity {
                self.shared.pending_progress.fetch_sub(1, Ordering::AcqRel);
                self.shared.dropped_progress.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if self.listener_tx.send(event).is_err() {
            tracing::warn!("Notification dispatch thread is gone, dropping event");
        }
    }

    /// Number of progress events dropped because listeners fell behind
    pub(crate) fn dropped_progress(&self) -> u64 {
        self.shared.dropped_progress.load(Ordering::Relaxed)
    }
}

/// Deliver events until every sender is dropped
fn dispatch_loop(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.blocking_recv() {
        if event.is_progress() {
            shared.pending_progress.fetch_sub(1, Ordering::AcqRel);
        }

        let listeners: Vec<Arc<dyn DownloadListener>> = shared
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in &listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| deliver(listener.as_ref(), &event)));
            if outcome.is_err() {
                tracing::error!(
                    download_id = event.id().map(|id| id.as_str()).unwrap_or("-"),
                    "Download listener panicked; continuing dispatch"
                );
            }
        }
    }
    tracing::debug!("Notification dispatch thread exiting");
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DownloadId, Status};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Status, u64)>>,
    }

    impl Recorder {
        fn push(&self, name: &str, snap: &DownloadSnapshot) {
            self.seen
                .lock()
                .unwrap()
                .push((name.to_string(), snap.status, snap.bytes_received));
        }

        fn names(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|e| e.0.clone()).collect()
        }
    }

    impl DownloadListener for Recorder {
        fn download_queued(&self, s: &DownloadSnapshot) {
            self.push("queued", s)
        }
        fn download_received_data(&self, s: &DownloadSnapshot) {
            self.push("received", s)
        }
        fn download_completed(&self, s: &DownloadSnapshot) {
            self.push("completed", s)
        }
        fn download_failed(&self, s: &DownloadSnapshot, _cause: &FailureCause) {
            self.push("failed", s)
        }
    }

    struct Panicker;

    impl DownloadListener for Panicker {
        fn download_queued(&self, _s: &DownloadSnapshot) {
            panic!("listener bug");
        }
    }

    fn snap(status: Status, bytes: u64) -> DownloadSnapshot {
        let mut s = DownloadSnapshot::queued(DownloadId::from("book-1"));
        s.status = status;
        s.bytes_received = bytes;
        s
    }

    fn wait_for(pred: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "timed out waiting for dispatch");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn events_reach_listeners_in_order() {
        let notifier = Notifier::start(64, 64).unwrap();
        let recorder = Arc::new(Recorder::default());
        notifier.add_listener(recorder.clone());

        notifier.emit(Event::Queued {
            snapshot: snap(Status::Queued, 0),
        });
        for bytes in [100, 200, 300] {
            notifier.emit(Event::ReceivedData {
                snapshot: snap(Status::ReceivingData, bytes),
            });
        }
        notifier.emit(Event::Completed {
            snapshot: snap(Status::Completed, 300),
        });

        wait_for(|| recorder.names().len() == 5);
        assert_eq!(
            recorder.names(),
            ["queued", "received", "received", "received", "completed"]
        );
    }

    #[test]
    fn panicking_listener_does_not_stop_other_listeners() {
        let notifier = Notifier::start(64, 64).unwrap();
        let recorder = Arc::new(Recorder::default());
        notifier.add_listener(Arc::new(Panicker));
        notifier.add_listener(recorder.clone());

        notifier.emit(Event::Queued {
            snapshot: snap(Status::Queued, 0),
        });
        notifier.emit(Event::Completed {
            snapshot: snap(Status::Completed, 10),
        });

        wait_for(|| recorder.names().len() == 2);
        assert_eq!(recorder.names(), ["queued", "completed"]);
    }

    #[test]
    fn full_queue_drops_progress_but_keeps_lifecycle_events() {
        struct Blocker {
            gate: Mutex<()>,
            entered: AtomicBool,
            recorder: Recorder,
        }
        impl DownloadListener for Blocker {
            fn download_queued(&self, s: &DownloadSnapshot) {
                self.entered.store(true, Ordering::SeqCst);
                let _held = self.gate.lock().unwrap();
                self.recorder.push("queued", s);
            }
            fn download_received_data(&self, s: &DownloadSnapshot) {
                self.recorder.push("received", s);
            }
            fn download_completed(&self, s: &DownloadSnapshot) {
                self.recorder.push("completed", s);
            }
        }

        let notifier = Notifier::start(2, 64).unwrap();
        let blocker = Arc::new(Blocker {
            gate: Mutex::new(()),
            entered: AtomicBool::new(false),
            recorder: Recorder::default(),
        });
        notifier.add_listener(blocker.clone());

        // Park the dispatch thread inside the first callback
        let guard = blocker.gate.lock().unwrap();
        notifier.emit(Event::Queued {
            snapshot: snap(Status::Queued, 0),
        });
        wait_for(|| blocker.entered.load(Ordering::SeqCst));

        for bytes in 1..=10 {
            notifier.emit(Event::ReceivedData {
                snapshot: snap(Status::ReceivingData, bytes),
            });
        }
        notifier.emit(Event::Completed {
            snapshot: snap(Status::Completed, 10),
        });
        assert_eq!(notifier.dropped_progress(), 8);
        drop(guard);

        wait_for(|| blocker.recorder.names().last().map(String::as_str) == Some("completed"));

        let seen = blocker.recorder.seen.lock().unwrap().clone();
        let progress: Vec<u64> = seen
            .iter()
            .filter(|e| e.0 == "received")
            .map(|e| e.2)
            .collect();
        assert_eq!(progress, [1, 2]);
        assert_eq!(seen.first().map(|e| e.0.as_str()), Some("queued"));

        // Capacity is available again once the backlog is delivered
        notifier.emit(Event::ReceivedData {
            snapshot: snap(Status::ReceivingData, 11),
        });
        wait_for(|| blocker.recorder.names().len() == 5);
        assert_eq!(notifier.dropped_progress(), 8);
    }

    #[test]
    fn dispatch_thread_exits_when_notifier_is_dropped() {
        let notifier = Notifier::start(4, 4).unwrap();
        let recorder = Arc::new(Recorder::default());
        notifier.add_listener(recorder.clone());
        notifier.emit(Event::Queued {
            snapshot: snap(Status::Queued, 0),
        });

        drop(notifier);

        // The queued event is still delivered, then the thread lets go of the listener
        wait_for(|| Arc::strong_count(&recorder) == 1);
        assert_eq!(recorder.names(), ["queued"]);
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let notifier = Notifier::start(16, 16).unwrap();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let first_id = notifier.add_listener(first.clone());
        notifier.add_listener(second.clone());

        assert!(notifier.remove_listener(first_id));
        assert!(!notifier.remove_listener(first_id));

        notifier.emit(Event::Queued {
            snapshot: snap(Status::Queued, 0),
        });
        wait_for(|| second.names().len() == 1);
        assert!(first.names().is_empty());
    }

    #[tokio::test]
    async fn subscribers_receive_the_same_events() {
        let notifier = Notifier::start(16, 16).unwrap();
        let mut rx = notifier.subscribe();

        notifier.emit(Event::Queued {
            snapshot: snap(Status::Queued, 0),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Queued { .. }));
    }
}
