//! Service discovery, resolution and advertising engines.
//!
//! Discovery and resolution both run a *scan cycle* over a provider watch: the watch enumerates
//! matching instances, reports [`WatchEvent::EnumerationCompleted`], is stopped, and restarted once
//! it reports [`WatchEvent::Stopped`]. Every instance carries a [`Presence`] tag. Instances that
//! were not seen again during a whole cycle still carry [`Presence::Removed`] when the cycle ends
//! and are evicted.
//!
//! Each engine owns one worker thread. Provider events are funneled to it through a channel, so
//! consumer callbacks are only ever invoked from that worker, never from inside the provider.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    provider::{EventSink, PropertyBag, PropertyKey, Provider, Query, WatchEvent, Watcher},
    Error,
};

pub mod advertising;
pub mod discovery;
pub mod resolution;

/// Per-cycle presence tag of a tracked instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    /// First seen during the current cycle.
    Added,
    /// Seen again during the current cycle.
    Updated,
    /// Not (yet) seen during the current cycle.
    Removed,
}

/// Instances tracked by an engine, keyed by provider id.
///
/// Shared between the worker and snapshot readers. Never invoke a consumer callback while it is
/// locked: callbacks may take snapshots themselves.
pub(crate) type Tracked<T> = Arc<Mutex<BTreeMap<String, T>>>;

/// Copies the current contents of `tracked`.
pub(crate) fn snapshot<T: Clone>(tracked: &Tracked<T>) -> Vec<T> {
    lock(tracked).values().cloned().collect()
}

/// Locks `mutex`, ignoring poisoning.
///
/// A consumer callback that panicked must not take the whole engine down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The engine-specific half of a scan cycle.
pub(crate) trait ScanCycle: Send + 'static {
    /// Handles an added, updated or removed instance event. All three are treated alike.
    fn observe(&mut self, id: &str, properties: &PropertyBag);

    /// Called once the watcher has stopped at the end of a cycle.
    fn end_cycle(&mut self);

    /// Reports a watcher failure to the consumer. Called at most once.
    fn fail(&mut self, error: Error);
}

/// Blocks teardown until the worker has finished setting up its watch.
struct InitLatch {
    initializing: Mutex<bool>,
    cond: Condvar,
}

impl InitLatch {
    fn new() -> Self {
        Self {
            initializing: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    fn release(&self) {
        *lock(&self.initializing) = false;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let guard = lock(&self.initializing);
        drop(
            self.cond
                .wait_while(guard, |initializing| *initializing)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }
}

/// What a worker watches and how.
pub(crate) struct WatchSpec {
    pub(crate) name: String,
    pub(crate) query: Query,
    pub(crate) keys: &'static [PropertyKey],
    pub(crate) rescan_delay: Duration,
}

/// Handle to an engine's worker thread.
///
/// Dropping the handle stops the worker.
pub(crate) struct Worker {
    running: Arc<AtomicBool>,
    latch: Arc<InitLatch>,
    events: async_channel::Sender<WatchEvent>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a worker driving `cycle` over a watch created from `spec`.
    ///
    /// `running` must be the flag `cycle` checks before notifying the consumer.
    pub(crate) fn spawn<C: ScanCycle>(
        provider: Arc<dyn Provider>,
        spec: WatchSpec,
        running: Arc<AtomicBool>,
        cycle: C,
    ) -> Result<Self, Error> {
        let (tx, rx) = async_channel::unbounded();
        let latch = Arc::new(InitLatch::new());

        let thread = thread::Builder::new().name(spec.name.clone()).spawn({
            let sink = EventSink::from_channel(tx.clone());
            let latch = latch.clone();
            let running = running.clone();
            move || run(provider, spec, sink, rx, &latch, &running, cycle)
        })?;

        Ok(Self {
            running,
            latch,
            events: tx,
            thread: Some(thread),
        })
    }

    /// Stops the worker and its watch.
    ///
    /// Blocks until the watch has been set up (if that is still in progress) and the worker has
    /// exited. No consumer callback is invoked after this returns, except when called from such a
    /// callback: the worker then finishes on its own after the callback returns.
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.latch.wait();
        self.events.close();

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                log::debug!("engine stopped from its own callback");
                return;
            }
            if thread.join().is_err() {
                log::error!("engine worker panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<C: ScanCycle>(
    provider: Arc<dyn Provider>,
    spec: WatchSpec,
    sink: EventSink,
    events: async_channel::Receiver<WatchEvent>,
    latch: &InitLatch,
    running: &AtomicBool,
    mut cycle: C,
) {
    let mut watcher = match start_watch(&*provider, &spec, sink) {
        Ok(watcher) => watcher,
        Err(e) => {
            log::warn!("{}: failed to start watch for {}: {}", spec.name, spec.query, e);
            latch.release();
            cycle.fail(e);
            return;
        }
    };
    latch.release();
    log::debug!("{}: watching {}", spec.name, spec.query);

    while let Ok(event) = events.recv_blocking() {
        match event {
            WatchEvent::Added { id, properties }
            | WatchEvent::Updated { id, properties }
            | WatchEvent::Removed { id, properties } => cycle.observe(&id, &properties),
            WatchEvent::EnumerationCompleted => {
                log::trace!("{}: enumeration completed", spec.name);
                watcher.stop();
            }
            WatchEvent::Stopped => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                cycle.end_cycle();

                if !spec.rescan_delay.is_zero() {
                    thread::sleep(spec.rescan_delay);
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = watcher.start() {
                    log::warn!("{}: failed to restart watch: {}", spec.name, e);
                    cycle.fail(provider_init(e));
                    break;
                }
            }
        }
    }

    if watcher.status().is_active() {
        watcher.stop();
    }
    log::debug!("{}: stopped watching {}", spec.name, spec.query);
}

fn start_watch(
    provider: &dyn Provider,
    spec: &WatchSpec,
    sink: EventSink,
) -> Result<Box<dyn Watcher>, Error> {
    let mut watcher = provider
        .watch(&spec.query, spec.keys, sink)
        .map_err(provider_init)?;
    watcher.start().map_err(provider_init)?;
    Ok(watcher)
}

fn provider_init(e: Error) -> Error {
    match e {
        Error::ProviderInit(_) => e,
        e => Error::ProviderInit(e.to_string()),
    }
}

/// Engines of one kind, addressed by the opaque handles returned to the consumer.
pub(crate) struct Registry<T> {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, T>>,
}

impl<T> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Builds an entry under a fresh handle and inserts it, see [`Registry::insert_unless`].
    pub(crate) fn insert_new(
        &self,
        make: impl FnOnce(u64) -> Result<T, Error>,
    ) -> Result<u64, Error> {
        let mut entries = lock(&self.entries);
        let id = self.next_id();
        entries.insert(id, make(id)?);
        Ok(id)
    }

    pub(crate) fn remove(&self, id: u64) -> Option<T> {
        lock(&self.entries).remove(&id)
    }

    /// Calls `f` on an entry with the registry locked. `f` must not block on the engine.
    pub(crate) fn with<R>(&self, id: u64, f: impl FnOnce(&T) -> R) -> Option<R> {
        lock(&self.entries).get(&id).map(f)
    }

    /// Builds and inserts a new entry unless `conflicts` matches an existing one.
    ///
    /// The registry stays locked from the check until the entry is inserted. Anything `make`
    /// spawns that looks the entry up waits until then. Returns `Ok(None)` on a conflict.
    pub(crate) fn insert_unless(
        &self,
        mut conflicts: impl FnMut(&T) -> bool,
        make: impl FnOnce(u64) -> Result<T, Error>,
    ) -> Result<Option<u64>, Error> {
        let mut entries = lock(&self.entries);
        if entries.values().any(|entry| conflicts(entry)) {
            return Ok(None);
        }
        let id = self.next_id();
        entries.insert(id, make(id)?);
        Ok(Some(id))
    }

    /// Removes and returns every entry.
    pub(crate) fn drain(&self) -> Vec<T> {
        lock(&self.entries).drain().map(|(_, entry)| entry).collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}
