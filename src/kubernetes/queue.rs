use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kube::ResourceExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::QueueMetrics;
use crate::Result;

// Per-item exponential backoff bounds, paired with an overall token bucket
// to cap bursts.
const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);
const BUCKET_RATE: f64 = 10.0;
const BUCKET_BURST: f64 = 100.0;

/// Named, rate-limited FIFO of `namespace/name` keys feeding a single
/// worker. Keys are de-duplicated: one pending instance exists at a time,
/// and keys added while in flight are re-queued once the current
/// reconcile finishes.
pub struct Queue {
    name: String,
    inner: Mutex<Inner>,
    notify: Notify,
    shutdown: CancellationToken,
    metrics: QueueMetrics,
}

struct Inner {
    pending: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    requeued: HashSet<String>,
    added_at: HashMap<String, Instant>,
    started_at: HashMap<String, Instant>,
    bucket: TokenBucket,
}

impl Queue {
    pub fn new(name: &str, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                requeued: HashSet::new(),
                added_at: HashMap::new(),
                started_at: HashMap::new(),
                bucket: TokenBucket::new(BUCKET_RATE, BUCKET_BURST),
            }),
            notify: Notify::new(),
            shutdown,
            metrics: QueueMetrics::new(name),
        })
    }

    /// Enqueues the key of the given object.
    pub fn add<K: ResourceExt>(&self, obj: &K) {
        let key = match obj.namespace() {
            Some(namespace) => format!("{}/{}", namespace, obj.name_any()),
            None => obj.name_any(),
        };
        self.add_key(key);
    }

    fn add_key(&self, key: String) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        self.metrics.inc_adds();
        if !inner.dirty.insert(key.clone()) {
            return;
        }
        inner.added_at.entry(key.clone()).or_insert_with(Instant::now);
        if inner.processing.contains(&key) {
            // Re-queued by done() once the in-flight reconcile finishes.
            return;
        }
        inner.pending.push_back(key);
        self.metrics.set_depth(inner.pending.len());
        drop(inner);
        self.notify.notify_one();
    }

    /// Processes keys until the queue is stopped and drained, invoking the
    /// reconcile function and rate-limiting failed keys.
    pub async fn run<F, Fut>(self: Arc<Self>, reconcile: F)
    where
        F: Fn(String, String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        info!(queue = %self.name, "queue worker started");
        while let Some(key) = self.next().await {
            let Some((namespace, name)) = key.split_once('/') else {
                error!(queue = %self.name, key = %key, "dropping malformed key");
                self.forget(&key);
                self.done(&key);
                continue;
            };
            info!(queue = %self.name, namespace = %namespace, name = %name, "reconciling item");
            match reconcile(name.to_string(), namespace.to_string()).await {
                Ok(()) => {
                    info!(queue = %self.name, namespace = %namespace, name = %name, "reconciled item");
                    self.forget(&key);
                }
                Err(err) => {
                    error!(
                        queue = %self.name,
                        namespace = %namespace,
                        name = %name,
                        error = %err,
                        "reconcile error, requeueing",
                    );
                    self.requeue(key.clone());
                }
            }
            self.done(&key);
        }
        info!(queue = %self.name, "queue shutdown");
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    async fn next(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.pending.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    if let Some(added) = inner.added_at.remove(&key) {
                        self.metrics.observe_latency(added.elapsed().as_secs_f64());
                    }
                    inner.started_at.insert(key.clone(), Instant::now());
                    self.metrics.set_depth(inner.pending.len());
                    self.update_work_gauges(&inner);
                    return Some(key);
                }
                if self.shutdown.is_cancelled() {
                    return None;
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
    }

    fn done(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.processing.remove(key);
        if let Some(started) = inner.started_at.remove(key) {
            self.metrics.observe_work_duration(started.elapsed().as_secs_f64());
        }
        self.update_work_gauges(&inner);
        if inner.dirty.contains(key) {
            inner.pending.push_back(key.to_string());
            inner.added_at.entry(key.to_string()).or_insert_with(Instant::now);
            self.metrics.set_depth(inner.pending.len());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Schedules the key for another attempt after its per-item backoff,
    /// tracking it in the requeued set until it is forgotten.
    fn requeue(self: &Arc<Self>, key: String) {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let backoff = backoff_for(*failures);
            *failures += 1;
            if inner.requeued.insert(key.clone()) {
                self.metrics.set_requeued(inner.requeued.len());
            }
            backoff.max(inner.bucket.reserve())
        };
        self.metrics.inc_retries();
        warn!(queue = %self.name, key = %key, delay_ms = delay.as_millis() as u64, "requeued item");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add_key(key),
                _ = queue.shutdown.cancelled() => {}
            }
        });
    }

    fn forget(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures.remove(key);
        if inner.requeued.remove(key) {
            self.metrics.set_requeued(inner.requeued.len());
        }
    }

    fn update_work_gauges(&self, inner: &Inner) {
        let mut unfinished = 0.0;
        let mut longest = 0.0f64;
        for started in inner.started_at.values() {
            let elapsed = started.elapsed().as_secs_f64();
            unfinished += elapsed;
            longest = longest.max(elapsed);
        }
        self.metrics.set_unfinished_work(unfinished);
        self.metrics.set_longest_running(longest);
    }
}

fn backoff_for(failures: u32) -> Duration {
    let delay = BASE_DELAY.as_secs_f64() * 2f64.powi(failures.min(63) as i32);
    Duration::from_secs_f64(delay.min(MAX_DELAY.as_secs_f64()))
}

struct TokenBucket {
    tokens: f64,
    last: Instant,
    rate: f64,
    burst: f64,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self { tokens: burst, last: Instant::now(), rate, burst }
    }

    /// Takes a token, returning how long the caller must wait for it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use k8s_openapi::api::core::v1::Service;
    use kube::api::ObjectMeta;

    use super::*;

    fn test_service(name: &str, namespace: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reconcile_success_and_stop() {
        let queue = Queue::new("test", CancellationToken::new());
        let count = Arc::new(AtomicU32::new(0));

        queue.add(&test_service("svc", "ns"));
        queue.stop();

        let counter = count.clone();
        queue
            .clone()
            .run(move |name, namespace| {
                let counter = counter.clone();
                async move {
                    assert_eq!(name, "svc");
                    assert_eq!(namespace, "ns");
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_coalesces_pending_keys() {
        let queue = Queue::new("test", CancellationToken::new());
        let count = Arc::new(AtomicU32::new(0));

        queue.add(&test_service("svc", "ns"));
        queue.add(&test_service("svc", "ns"));
        queue.add(&test_service("svc", "ns"));
        queue.stop();

        let counter = count.clone();
        queue
            .clone()
            .run(move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_requeues_with_backoff() {
        let queue = Queue::new("test", CancellationToken::new());
        let count = Arc::new(AtomicU32::new(0));

        queue.add(&test_service("svc", "ns"));

        let counter = count.clone();
        let worker = queue.clone();
        let stopper = queue.clone();
        let handle = tokio::spawn(worker.run(move |_, _| {
            let counter = counter.clone();
            let stopper = stopper.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(crate::Error::Other("transient".to_string()))
                } else {
                    stopper.stop();
                    Ok(())
                }
            }
        }));

        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_for(0), Duration::from_millis(5));
        assert_eq!(backoff_for(1), Duration::from_millis(10));
        assert_eq!(backoff_for(3), Duration::from_millis(40));
        assert_eq!(backoff_for(63), Duration::from_secs(1000));
    }
}
