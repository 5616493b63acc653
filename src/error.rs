use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("in-cluster config error: {0}")]
    InCluster(#[from] kube::config::InClusterError),

    #[error("config error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("watcher {0} cache failed to sync")]
    CacheSync(String),

    #[error("watcher {0} stream terminated")]
    WatchStream(String),

    #[error("watcher {0} is already running")]
    WatcherRunning(String),

    #[error("mismatch between existing headless global service and {namespace}/{name}")]
    HeadlessMismatch { namespace: String, name: String },

    #[error("endpointslice {namespace}/{name} is missing the kubernetes.io/service-name label")]
    MissingServiceName { namespace: String, name: String },

    #[error("{0}")]
    Other(String),
}
