use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use semaphore_service_mirror::config::{self, Overrides};
use semaphore_service_mirror::global::store::GlobalServiceStore;
use semaphore_service_mirror::global::GlobalRunner;
use semaphore_service_mirror::http;
use semaphore_service_mirror::kubernetes::{client, parse_selector};
use semaphore_service_mirror::mirror::MirrorRunner;
use semaphore_service_mirror::supervisor::{supervise, Readiness, RetryConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(version, about = "Mirrors Kubernetes services across clusters", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, env = "SSM_CONFIG")]
    config: PathBuf,

    /// Log level
    #[arg(long, env = "SSM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Label selector for services to mirror (overrides config)
    #[arg(long, env = "SSM_LABEL_SELECTOR")]
    label_selector: Option<String>,

    /// Label selector for global services (overrides config)
    #[arg(long, env = "SSM_GLOBAL_SVC_LABEL_SELECTOR")]
    global_svc_label_selector: Option<String>,

    /// Label marking services that opt into topology aware hints (overrides config)
    #[arg(long, env = "SSM_GLOBAL_SVC_ROUTING_STRATEGY_LABEL")]
    global_svc_routing_strategy_label: Option<String>,

    /// Namespace to mirror remote services into (overrides config)
    #[arg(long, env = "SSM_MIRROR_NS")]
    mirror_ns: Option<String>,

    /// Address for the health and metrics listener
    #[arg(long, env = "SSM_LISTEN_ADDRESS", default_value = "0.0.0.0:8080")]
    listen_address: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_subscriber(&cli.log_level);

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config.display()))?;
    let config = config::parse_config(
        &raw,
        Overrides {
            mirror_svc_label_selector: cli.label_selector,
            global_svc_label_selector: cli.global_svc_label_selector,
            global_svc_routing_strategy_label: cli.global_svc_routing_strategy_label,
            mirror_namespace: cli.mirror_ns,
        },
    )?;
    let routing_strategy_label =
        parse_selector(&config.global.global_svc_routing_strategy_label)?;

    let home = client::home_client(config.local_cluster.kube_config_path.as_deref())
        .await
        .context("creating home cluster client")?;

    let cancel = CancellationToken::new();
    let readiness = Readiness::default();
    let store = Arc::new(GlobalServiceStore::new());
    let mut runners: Vec<JoinHandle<()>> = Vec::new();

    // One global runner for the home cluster itself.
    let local_runner = Arc::new(GlobalRunner {
        home: home.clone(),
        watch: home.clone(),
        name: config.local_cluster.name.clone(),
        namespace: config.global.mirror_namespace.clone(),
        label_selector: config.global.global_svc_label_selector.clone(),
        resync_period: std::time::Duration::ZERO,
        store: store.clone(),
        local: true,
        routing_strategy_label: routing_strategy_label.clone(),
        sync: config.global.service_sync,
        zones: config.local_cluster.zones.clone(),
        initialised: readiness.register(&config.local_cluster.name),
        cancel: cancel.child_token(),
    });
    runners.push(supervise(local_runner, cancel.clone(), RetryConfig::default()));

    // One mirror runner and one global runner per remote cluster.
    for remote in &config.remote_clusters {
        let watch = match &remote.kube_config_path {
            Some(path) => client::kubeconfig_client(path).await,
            None => {
                let token_path = remote.remote_sa_token_path.as_deref().ok_or_else(|| {
                    anyhow::anyhow!("remote cluster {} is missing a token path", remote.name)
                })?;
                client::remote_client(&remote.remote_api_url, &remote.remote_ca_url, token_path)
                    .await
            }
        }
        .with_context(|| format!("creating client for remote cluster {}", remote.name))?;

        let mirror_runner = Arc::new(MirrorRunner {
            home: home.clone(),
            remote: watch.clone(),
            name: remote.name.clone(),
            namespace: config.global.mirror_namespace.clone(),
            prefix: remote.service_prefix.clone(),
            label_selector: config.global.mirror_svc_label_selector.clone(),
            resync_period: remote.resync_period,
            sync: config.global.service_sync,
            initialised: readiness.register(&format!("mirror-{}", remote.name)),
            cancel: cancel.child_token(),
        });
        runners.push(supervise(mirror_runner, cancel.clone(), RetryConfig::default()));

        let global_runner = Arc::new(GlobalRunner {
            home: home.clone(),
            watch,
            name: remote.name.clone(),
            namespace: config.global.mirror_namespace.clone(),
            label_selector: config.global.global_svc_label_selector.clone(),
            resync_period: std::time::Duration::ZERO,
            store: store.clone(),
            local: false,
            routing_strategy_label: routing_strategy_label.clone(),
            sync: config.global.service_sync,
            zones: config.local_cluster.zones.clone(),
            initialised: readiness.register(&format!("global-{}", remote.name)),
            cancel: cancel.child_token(),
        });
        runners.push(supervise(global_runner, cancel.clone(), RetryConfig::default()));
    }

    let mut http_handle =
        tokio::spawn(http::serve(cli.listen_address, readiness, cancel.child_token()));

    let http_exited = tokio::select! {
        handle = &mut http_handle => {
            match handle {
                Ok(Ok(())) => error!("http listener exited"),
                Ok(Err(err)) => error!(error = %err, "http listener failed"),
                Err(err) => error!(error = %err, "http listener task failed to complete"),
            }
            true
        }
        _ = shutdown_signal() => false,
    };

    info!("shutting down");
    cancel.cancel();
    for runner in runners {
        let _ = runner.await;
    }
    if http_exited {
        anyhow::bail!("http listener exited unexpectedly");
    }
    let _ = http_handle.await;
    Ok(())
}

fn setup_subscriber(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("semaphore_service_mirror={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
            info!("captured ctrl_c signal");
        }
        _ = terminate => {}
    }
}
