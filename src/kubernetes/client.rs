use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::{Request, Response};
use kube::client::ClientBuilder;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tower::{Layer, Service};
use tracing::info;

use crate::{metrics, Error, Result};

const REMOTE_CONTEXT: &str = "remote";

/// Client for the home cluster, from an explicit kubeconfig path or the
/// in-cluster service account environment.
pub async fn home_client(kubeconfig_path: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig_path {
        Some(path) => from_kubeconfig(path).await?,
        None => Config::incluster()?,
    };
    build_client(config)
}

/// Client for a remote cluster watched through an explicit kubeconfig.
pub async fn kubeconfig_client(path: &Path) -> Result<Client> {
    build_client(from_kubeconfig(path).await?)
}

/// Client for a remote cluster from an API URL, a CA certificate fetched
/// over HTTP and a service account token file.
pub async fn remote_client(api_url: &str, ca_url: &str, token_path: &Path) -> Result<Client> {
    let token = std::fs::read_to_string(token_path)?;
    if token.trim_end_matches('\n').is_empty() {
        return Err(Error::Config(format!(
            "service account token at {} is empty",
            token_path.display()
        )));
    }

    info!(url = %ca_url, "fetching remote CA certificate");
    let ca_pem = reqwest::get(ca_url).await?.error_for_status()?.bytes().await?;

    // Assembled in the kubeconfig wire format so the token file is re-read
    // by the client whenever the mounted token rotates.
    let kubeconfig: Kubeconfig = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": REMOTE_CONTEXT,
            "cluster": {
                "server": api_url,
                "certificate-authority-data": BASE64.encode(&ca_pem),
            },
        }],
        "users": [{
            "name": REMOTE_CONTEXT,
            "user": { "tokenFile": token_path },
        }],
        "contexts": [{
            "name": REMOTE_CONTEXT,
            "context": { "cluster": REMOTE_CONTEXT, "user": REMOTE_CONTEXT },
        }],
        "current-context": REMOTE_CONTEXT,
    }))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    build_client(config)
}

async fn from_kubeconfig(path: &Path) -> Result<Config> {
    let kubeconfig = Kubeconfig::read_from(path)?;
    Ok(Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?)
}

fn build_client(config: Config) -> Result<Client> {
    let host = config
        .cluster_url
        .authority()
        .map(|authority| authority.to_string())
        .unwrap_or_default();
    Ok(ClientBuilder::try_from(config)?
        .with_layer(&HttpMetricsLayer::new(host))
        .build())
}

/// Records request counts and latencies for every call the kube client
/// makes to an API server.
#[derive(Clone)]
pub struct HttpMetricsLayer {
    host: String,
}

impl HttpMetricsLayer {
    pub fn new(host: String) -> Self {
        Self { host }
    }
}

impl<S> Layer<S> for HttpMetricsLayer {
    type Service = HttpMetrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpMetrics { inner, host: self.host.clone() }
    }
}

pub struct HttpMetrics<S> {
    inner: S,
    host: String,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for HttpMetrics<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>>,
    S::Future: Send + 'static,
    S::Error: Send,
    ResB: Send,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<std::result::Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqB>) -> Self::Future {
        let host = self.host.clone();
        let method = request.method().to_string();
        let start = Instant::now();
        let future = self.inner.call(request);
        Box::pin(async move {
            let result = future.await;
            if let Ok(response) = &result {
                metrics::observe_kube_http_request(
                    &host,
                    &method,
                    response.status().as_u16(),
                    start.elapsed().as_secs_f64(),
                );
            }
            result
        })
    }
}
