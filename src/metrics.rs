use std::sync::atomic::AtomicU64;
use std::sync::{LazyLock, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::{Registry, Unit};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WatcherEventLabels {
    pub watcher: String,
    pub kind: String,
    pub event_type: String,
    pub runner: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WatcherObjectLabels {
    pub watcher: String,
    pub kind: String,
    pub runner: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub name: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpRequestLabels {
    pub host: String,
    pub code: String,
    pub method: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpDurationLabels {
    pub host: String,
    pub method: String,
}

static WATCHER_EVENTS: LazyLock<Family<WatcherEventLabels, Counter>> =
    LazyLock::new(Family::default);
static WATCHER_OBJECTS: LazyLock<Family<WatcherObjectLabels, Gauge>> =
    LazyLock::new(Family::default);
static QUEUE_DEPTH: LazyLock<Family<QueueLabels, Gauge>> = LazyLock::new(Family::default);
static QUEUE_ADDS: LazyLock<Family<QueueLabels, Counter>> = LazyLock::new(Family::default);
static QUEUE_LATENCY: LazyLock<Family<QueueLabels, Histogram>> = LazyLock::new(|| {
    Family::new_with_constructor(|| Histogram::new(exponential_buckets(0.001, 2.0, 14)))
});
static QUEUE_WORK_DURATION: LazyLock<Family<QueueLabels, Histogram>> = LazyLock::new(|| {
    Family::new_with_constructor(|| Histogram::new(exponential_buckets(0.001, 2.0, 14)))
});
static QUEUE_UNFINISHED_WORK: LazyLock<Family<QueueLabels, Gauge<f64, AtomicU64>>> =
    LazyLock::new(Family::default);
static QUEUE_LONGEST_RUNNING: LazyLock<Family<QueueLabels, Gauge<f64, AtomicU64>>> =
    LazyLock::new(Family::default);
static QUEUE_RETRIES: LazyLock<Family<QueueLabels, Counter>> = LazyLock::new(Family::default);
static QUEUE_REQUEUED: LazyLock<Family<QueueLabels, Gauge>> = LazyLock::new(Family::default);
static HTTP_REQUESTS: LazyLock<Family<HttpRequestLabels, Counter>> =
    LazyLock::new(Family::default);
static HTTP_DURATION: LazyLock<Family<HttpDurationLabels, Histogram>> = LazyLock::new(|| {
    Family::new_with_constructor(|| Histogram::new(exponential_buckets(0.001, 2.0, 12)))
});

pub static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "kube_watcher_events",
        "Number of events handled, by watcher, kind, event type and runner",
        WATCHER_EVENTS.clone(),
    );
    registry.register(
        "kube_watcher_objects",
        "Number of objects watched, by watcher, kind and runner",
        WATCHER_OBJECTS.clone(),
    );
    registry.register("queue_depth", "Workqueue depth, by queue name", QUEUE_DEPTH.clone());
    registry.register("queue_adds", "Workqueue adds, by queue name", QUEUE_ADDS.clone());
    registry.register_with_unit(
        "queue_latency",
        "Time keys spend queued before processing, by queue name",
        Unit::Seconds,
        QUEUE_LATENCY.clone(),
    );
    registry.register_with_unit(
        "queue_work_duration",
        "Time spent processing keys, by queue name",
        Unit::Seconds,
        QUEUE_WORK_DURATION.clone(),
    );
    registry.register_with_unit(
        "queue_unfinished_work",
        "Time spent on work that is still in flight, by queue name",
        Unit::Seconds,
        QUEUE_UNFINISHED_WORK.clone(),
    );
    registry.register_with_unit(
        "queue_longest_running_processor",
        "Age of the longest in flight key, by queue name",
        Unit::Seconds,
        QUEUE_LONGEST_RUNNING.clone(),
    );
    registry.register("queue_retries", "Workqueue retries, by queue name", QUEUE_RETRIES.clone());
    registry.register(
        "queue_requeued_items",
        "Items requeued but not reconciled yet, by queue name",
        QUEUE_REQUEUED.clone(),
    );
    registry.register(
        "kube_http_request",
        "Number of HTTP requests to the Kubernetes API, by host, code and method",
        HTTP_REQUESTS.clone(),
    );
    registry.register_with_unit(
        "kube_http_request_duration",
        "Latency of HTTP requests to the Kubernetes API, by host and method",
        Unit::Seconds,
        HTTP_DURATION.clone(),
    );
    RwLock::new(registry)
});

pub fn inc_watcher_events(watcher: &str, kind: &str, runner: &str, event_type: &str) {
    WATCHER_EVENTS
        .get_or_create(&WatcherEventLabels {
            watcher: watcher.to_string(),
            kind: kind.to_string(),
            event_type: event_type.to_string(),
            runner: runner.to_string(),
        })
        .inc();
}

pub fn set_watcher_objects(watcher: &str, kind: &str, runner: &str, count: usize) {
    WATCHER_OBJECTS
        .get_or_create(&WatcherObjectLabels {
            watcher: watcher.to_string(),
            kind: kind.to_string(),
            runner: runner.to_string(),
        })
        .set(count as i64);
}

pub fn observe_kube_http_request(host: &str, method: &str, code: u16, seconds: f64) {
    HTTP_REQUESTS
        .get_or_create(&HttpRequestLabels {
            host: host.to_string(),
            code: code.to_string(),
            method: method.to_string(),
        })
        .inc();
    HTTP_DURATION
        .get_or_create(&HttpDurationLabels {
            host: host.to_string(),
            method: method.to_string(),
        })
        .observe(seconds);
}

/// Queue metric handles bound to a queue name.
#[derive(Clone)]
pub struct QueueMetrics {
    labels: QueueLabels,
}

impl QueueMetrics {
    pub fn new(name: &str) -> Self {
        Self { labels: QueueLabels { name: name.to_string() } }
    }

    pub fn inc_adds(&self) {
        QUEUE_ADDS.get_or_create(&self.labels).inc();
    }

    pub fn set_depth(&self, depth: usize) {
        QUEUE_DEPTH.get_or_create(&self.labels).set(depth as i64);
    }

    pub fn observe_latency(&self, seconds: f64) {
        QUEUE_LATENCY.get_or_create(&self.labels).observe(seconds);
    }

    pub fn observe_work_duration(&self, seconds: f64) {
        QUEUE_WORK_DURATION.get_or_create(&self.labels).observe(seconds);
    }

    pub fn set_unfinished_work(&self, seconds: f64) {
        QUEUE_UNFINISHED_WORK.get_or_create(&self.labels).set(seconds);
    }

    pub fn set_longest_running(&self, seconds: f64) {
        QUEUE_LONGEST_RUNNING.get_or_create(&self.labels).set(seconds);
    }

    pub fn inc_retries(&self) {
        QUEUE_RETRIES.get_or_create(&self.labels).inc();
    }

    pub fn set_requeued(&self, count: usize) {
        QUEUE_REQUEUED.get_or_create(&self.labels).set(count as i64);
    }
}
