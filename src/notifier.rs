//! Change notifier: turns job record file events into debounced pushes.
//!
//! Watches the store's directory with `notify` while at least one
//! subscriber exists. Each event for `<uuid>.json` (re)arms a per-job timer;
//! when a timer fires the record is re-read from the store and the current
//! state is broadcast. Bursts of writes to one job therefore produce a single
//! notification carrying the latest state.
//!
//! The watcher, the event pump and every pending timer are torn down when the
//! last `Subscription` is dropped.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::jobs::model::Job;
use crate::store::JobStore;
use crate::store::file::job_id_from_path;

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    subscribers: usize,
    watcher: Option<RecommendedWatcher>,
    pump: Option<JoinHandle<()>>,
    timers: HashMap<Uuid, PendingTimer>,
    next_generation: u64,
}

/// Pushes debounced job snapshots to subscribers.
pub struct ChangeNotifier {
    store: Arc<dyn JobStore>,
    debounce: Duration,
    tx: broadcast::Sender<Job>,
    inner: Mutex<Inner>,
}

impl ChangeNotifier {
    pub fn new(store: Arc<dyn JobStore>, debounce: Duration) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            store,
            debounce,
            tx,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an observer. The first subscriber starts the watch.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let rx = self.tx.subscribe();
        let mut inner = self.lock();
        inner.subscribers += 1;
        if inner.subscribers == 1 {
            self.start(&mut inner);
        }
        Subscription {
            rx,
            notifier: Arc::clone(self),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers
    }

    pub fn is_watching(&self) -> bool {
        self.lock().watcher.is_some()
    }

    pub fn pending_timers(&self) -> usize {
        self.lock().timers.len()
    }

    /// Report a change to job `id` directly, bypassing the file watcher.
    ///
    /// Goes through the same debounce as file events. Ignored while nobody
    /// is subscribed.
    pub fn touch(self: &Arc<Self>, id: Uuid) {
        self.schedule(id);
    }

    fn start(self: &Arc<Self>, inner: &mut Inner) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        match self.store.watch_dir() {
            Some(dir) => match start_watcher(&dir, event_tx) {
                Ok(watcher) => {
                    info!(dir = %dir.display(), "Watching job records");
                    inner.watcher = Some(watcher);
                }
                Err(e) => warn!(
                    dir = %dir.display(),
                    error = %e,
                    "Failed to start job watcher; only direct touches will notify"
                ),
            },
            None => debug!("Job store has no watch directory"),
        }

        let notifier = Arc::downgrade(self);
        inner.pump = Some(tokio::spawn(async move {
            while let Some(id) = event_rx.recv().await {
                match notifier.upgrade() {
                    Some(notifier) => notifier.schedule(id),
                    None => break,
                }
            }
        }));
    }

    fn stop(inner: &mut Inner) {
        inner.watcher = None;
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        let cancelled = inner.timers.len();
        for (_, timer) in inner.timers.drain() {
            timer.handle.abort();
        }
        info!(cancelled_timers = cancelled, "Job watcher stopped");
    }

    fn unsubscribe(&self) {
        let mut inner = self.lock();
        inner.subscribers = inner.subscribers.saturating_sub(1);
        if inner.subscribers == 0 {
            Self::stop(&mut inner);
        }
    }

    /// (Re)arm the debounce timer for `id`.
    fn schedule(self: &Arc<Self>, id: Uuid) {
        let mut inner = self.lock();
        if inner.subscribers == 0 {
            return;
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let notifier: Weak<Self> = Arc::downgrade(self);
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(notifier) = notifier.upgrade() {
                notifier.fire(id, generation).await;
            }
        });

        if let Some(previous) = inner.timers.insert(id, PendingTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    async fn fire(&self, id: Uuid, generation: u64) {
        {
            let mut inner = self.lock();
            match inner.timers.get(&id) {
                Some(timer) if timer.generation == generation => {
                    inner.timers.remove(&id);
                }
                // Superseded or torn down.
                _ => return,
            }
        }

        match self.store.get(id).await {
            Ok(Some(job)) => {
                debug!(job_id = %id, stage = %job.stage, "Pushing job update");
                // Ok if every receiver is gone by now.
                let _ = self.tx.send(job);
            }
            Ok(None) => debug!(job_id = %id, "Changed job record vanished"),
            Err(e) => warn!(job_id = %id, error = %e, "Failed to re-read changed job"),
        }
    }
}

/// A registered observer. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<Job>,
    notifier: Arc<ChangeNotifier>,
}

impl Subscription {
    /// Next job snapshot. `Lagged` means updates were missed and the
    /// observer should re-sync from a full listing.
    pub async fn recv(&mut self) -> Result<Job, broadcast::error::RecvError> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Job, broadcast::error::TryRecvError> {
        self.rx.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.unsubscribe();
    }
}

/// Start a non-recursive watcher on the job directory.
///
/// Only create/modify events on `<uuid>.json` are forwarded; temp files
/// written before the atomic rename are ignored.
fn start_watcher(
    dir: &Path,
    tx: mpsc::UnboundedSender<Uuid>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                for id in event.paths.iter().filter_map(|p| job_id_from_path(p)) {
                    // Receiver gone means the notifier is stopping.
                    let _ = tx.send(id);
                }
            }
            Err(e) => {
                error!("Job watcher error: {}", e);
            }
        })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
