use std::collections::HashSet;
use std::fmt::Debug;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{metrics, Error, Result};

// Watchers that rely on the watch stream alone still re-list through the
// kube client backoff; the ticker needs a period regardless.
const NO_RESYNC: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How long runners wait for a cache to sync before giving up and letting
/// the supervisor back off and retry.
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Add,
    Update,
    Delete,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::Add => "add",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }
}

pub type EventHandler<K> = Box<dyn Fn(EventType, &K) + Send + Sync>;

/// Cache backed observer of a single kind on one API server, filtered by a
/// label selector and the namespace scope of the supplied `Api`.
///
/// Events are counted per watcher/kind/runner, reflected into the local
/// store and forwarded to the optional handler. Watchers without a handler
/// are cache-only and serve reverse lookups.
pub struct Watcher<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    name: String,
    kind: &'static str,
    runner: String,
    api: Api<K>,
    resync_period: Duration,
    label_selector: Option<String>,
    handler: Option<EventHandler<K>>,
    store: Store<K>,
    writer: Mutex<Option<Writer<K>>>,
    synced: AtomicBool,
    cancel: CancellationToken,
}

impl<K> Watcher<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        kind: &'static str,
        runner: &str,
        api: Api<K>,
        resync_period: Duration,
        handler: Option<EventHandler<K>>,
        label_selector: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        let (store, writer) = reflector::store();
        Self {
            name,
            kind,
            runner: runner.to_string(),
            api,
            resync_period,
            label_selector,
            handler,
            store,
            writer: Mutex::new(Some(writer)),
            synced: AtomicBool::new(false),
            cancel,
        }
    }

    /// Drives the watch until `stop` or until the stream dies. The
    /// underlying client retries transport failures; a terminated stream is
    /// surfaced so the owning runner can be restarted.
    pub async fn run(&self) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::WatcherRunning(self.name.clone()))?;

        info!(watcher = %self.name, "starting watcher");
        let mut config = watcher::Config::default();
        if let Some(selector) = &self.label_selector {
            config = config.labels(selector);
        }
        let stream = watcher(self.api.clone(), config).default_backoff();
        let mut stream = pin!(stream);

        let period = if self.resync_period.is_zero() { NO_RESYNC } else { self.resync_period };
        let mut resync = tokio::time::interval(period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resync.tick().await;

        // Objects seen during the current re-list, used to surface deletes
        // that happened while the watch was disconnected.
        let mut listed: HashSet<ObjectRef<K>> = HashSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(watcher = %self.name, "stopped watcher");
                    return Ok(());
                }
                _ = resync.tick() => self.resync(),
                event = stream.next() => match event {
                    Some(Ok(event)) => self.observe(&mut writer, event, &mut listed),
                    Some(Err(err)) => {
                        error!(watcher = %self.name, error = %err, "watch stream error");
                    }
                    None => return Err(Error::WatchStream(self.name.clone())),
                },
            }
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// True once the initial list has populated the cache.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Waits for the cache to sync, failing after `timeout` so the owning
    /// runner can back off and retry.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.store.wait_until_ready())
            .await
            .map_err(|_| Error::CacheSync(self.name.clone()))?
            .map_err(|_| Error::CacheSync(self.name.clone()))
    }

    /// Cache-only lookup; never reaches the API server.
    pub fn get(&self, name: &str, namespace: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name).within(namespace))
    }

    /// Snapshot of the cached objects.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    fn observe(&self, writer: &mut Writer<K>, event: watcher::Event<K>, listed: &mut HashSet<ObjectRef<K>>) {
        match &event {
            watcher::Event::Init => {
                listed.clear();
                writer.apply_watcher_event(&event);
            }
            watcher::Event::InitApply(obj) => {
                listed.insert(ObjectRef::from_obj(obj));
                let event_type = if self.cached(obj) { EventType::Update } else { EventType::Add };
                let obj = obj.clone();
                writer.apply_watcher_event(&event);
                self.dispatch(event_type, &obj);
            }
            watcher::Event::Apply(obj) => {
                let event_type = if self.cached(obj) { EventType::Update } else { EventType::Add };
                let obj = obj.clone();
                writer.apply_watcher_event(&event);
                self.dispatch(event_type, &obj);
            }
            watcher::Event::Delete(obj) => {
                let obj = obj.clone();
                writer.apply_watcher_event(&event);
                self.dispatch(EventType::Delete, &obj);
            }
            watcher::Event::InitDone => {
                // Anything cached but absent from the re-list was deleted
                // while the watch was down; surface those deletions.
                let deleted: Vec<Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .filter(|obj| !listed.contains(&ObjectRef::from_obj(obj.as_ref())))
                    .collect();
                writer.apply_watcher_event(&event);
                for obj in deleted {
                    self.dispatch(EventType::Delete, &obj);
                }
                if !self.synced.swap(true, Ordering::SeqCst) {
                    info!(watcher = %self.name, "cache synced");
                }
                metrics::set_watcher_objects(
                    &self.name,
                    self.kind,
                    &self.runner,
                    self.store.state().len(),
                );
            }
        }
    }

    fn cached(&self, obj: &K) -> bool {
        self.store.get(&ObjectRef::from_obj(obj)).is_some()
    }

    fn dispatch(&self, event_type: EventType, obj: &K) {
        metrics::inc_watcher_events(&self.name, self.kind, &self.runner, event_type.as_str());
        metrics::set_watcher_objects(&self.name, self.kind, &self.runner, self.store.state().len());
        if let Some(handler) = &self.handler {
            handler(event_type, obj);
        }
    }

    /// Re-delivers every cached object as an update so reconcilers converge
    /// even if a watch event was missed.
    fn resync(&self) {
        if !self.has_synced() {
            return;
        }
        debug!(watcher = %self.name, "resyncing cached objects");
        for obj in self.store.state() {
            self.dispatch(EventType::Update, &obj);
        }
    }
}
