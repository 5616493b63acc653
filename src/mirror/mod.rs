use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{EndpointSubset, Endpoints, Service};
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::kubernetes::queue::Queue;
use crate::kubernetes::watcher::{EventHandler, Watcher, CACHE_SYNC_TIMEOUT};
use crate::kubernetes::{
    delete_service, generate_mirror_name, is_headless, is_not_found, mirror_label_selector,
    mirror_labels, new_service, service_ports, stale_object_names, update_service,
};
use crate::supervisor::{wait_for_tasks, Runner};
use crate::Result;

/// Watches a remote cluster and maintains one-to-one mirrors of its
/// selected services and endpoints in the home mirror namespace.
pub struct MirrorRunner {
    pub home: Client,
    pub remote: Client,
    pub name: String,
    pub namespace: String,
    pub prefix: String,
    pub label_selector: String,
    pub resync_period: Duration,
    pub sync: bool,
    pub initialised: Arc<AtomicBool>,
    pub cancel: CancellationToken,
}

impl Runner for MirrorRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialised(&self) -> bool {
        self.initialised.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run(&self) -> Result<()> {
        let cancel = self.cancel.child_token();
        let _guard = cancel.clone().drop_guard();

        let service_queue = Queue::new(&format!("{}-service", self.name), cancel.child_token());
        let endpoints_queue = Queue::new(&format!("{}-endpoints", self.name), cancel.child_token());

        let service_watcher = Arc::new(Watcher::new(
            format!("{}-service-watcher", self.name),
            "service",
            &self.name,
            Api::<Service>::all(self.remote.clone()),
            self.resync_period,
            Some(queue_handler(service_queue.clone())),
            Some(self.label_selector.clone()),
            cancel.child_token(),
        ));
        // Cache-only view of the mirrors we own, scoped by the owner labels
        // so the sync never touches unrelated objects.
        let mirror_service_watcher = Arc::new(Watcher::new(
            format!("{}-mirror-service-watcher", self.name),
            "service",
            &self.name,
            Api::<Service>::namespaced(self.home.clone(), &self.namespace),
            self.resync_period,
            None,
            Some(mirror_label_selector(&self.prefix)),
            cancel.child_token(),
        ));
        let endpoints_watcher = Arc::new(Watcher::new(
            format!("{}-endpoints-watcher", self.name),
            "endpoints",
            &self.name,
            Api::<Endpoints>::all(self.remote.clone()),
            self.resync_period,
            Some(queue_handler(endpoints_queue.clone())),
            Some(self.label_selector.clone()),
            cancel.child_token(),
        ));
        let mirror_endpoints_watcher = Arc::new(Watcher::new(
            format!("{}-mirror-endpoints-watcher", self.name),
            "endpoints",
            &self.name,
            Api::<Endpoints>::namespaced(self.home.clone(), &self.namespace),
            self.resync_period,
            None,
            Some(mirror_label_selector(&self.prefix)),
            cancel.child_token(),
        ));

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        {
            let watcher = service_watcher.clone();
            tasks.spawn(async move { watcher.run().await });
        }
        {
            let watcher = mirror_service_watcher.clone();
            tasks.spawn(async move { watcher.run().await });
        }
        // The runner is live once the service watchers have been launched.
        self.initialised.store(true, Ordering::SeqCst);

        // Service caches must sync before the endpoints watchers start, so
        // an Endpoints object is never created ahead of its Service.
        service_watcher.wait_for_sync(CACHE_SYNC_TIMEOUT).await?;
        mirror_service_watcher.wait_for_sync(CACHE_SYNC_TIMEOUT).await?;

        if self.sync {
            info!(runner = %self.name, "syncing services");
            if let Err(err) = self.service_sync(&service_watcher, &mirror_service_watcher).await {
                warn!(runner = %self.name, error = %err, "error syncing services, skipping");
            }
        }

        {
            let watcher = endpoints_watcher.clone();
            tasks.spawn(async move { watcher.run().await });
        }
        {
            let watcher = mirror_endpoints_watcher.clone();
            tasks.spawn(async move { watcher.run().await });
        }

        let reconciler = Arc::new(MirrorReconciler {
            service_api: Api::namespaced(self.home.clone(), &self.namespace),
            endpoints_api: Api::namespaced(self.home.clone(), &self.namespace),
            service_watcher: service_watcher.clone(),
            endpoints_watcher: endpoints_watcher.clone(),
            runner: self.name.clone(),
            namespace: self.namespace.clone(),
            prefix: self.prefix.clone(),
            mirror_labels: mirror_labels(&self.prefix),
        });
        {
            let queue = service_queue.clone();
            let reconciler = reconciler.clone();
            tasks.spawn(async move {
                queue
                    .run(move |name, namespace| {
                        let reconciler = reconciler.clone();
                        async move { reconciler.reconcile_service(&name, &namespace).await }
                    })
                    .await;
                Ok(())
            });
        }
        {
            let queue = endpoints_queue.clone();
            let reconciler = reconciler.clone();
            tasks.spawn(async move {
                queue
                    .run(move |name, namespace| {
                        let reconciler = reconciler.clone();
                        async move { reconciler.reconcile_endpoints(&name, &namespace).await }
                    })
                    .await;
                Ok(())
            });
        }

        wait_for_tasks(&self.name, &self.cancel, tasks).await
    }
}

impl MirrorRunner {
    /// Deletes owned mirrors whose remote counterpart no longer exists.
    /// Deleting a service cascades to its endpoints, but the endpoints
    /// reconciler also handles explicit deletion.
    async fn service_sync(
        &self,
        remote_services: &Watcher<Service>,
        mirror_services: &Watcher<Service>,
    ) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.home.clone(), &self.namespace);
        let expected: HashSet<String> = remote_services
            .list()
            .iter()
            .map(|svc| {
                generate_mirror_name(
                    &self.prefix,
                    &svc.namespace().unwrap_or_default(),
                    &svc.name_any(),
                )
            })
            .collect();
        let current: Vec<String> =
            mirror_services.list().iter().map(|svc| svc.name_any()).collect();
        for name in stale_object_names(&expected, current) {
            info!(runner = %self.name, service = %name, "deleting stale service and related endpoints");
            delete_service(&api, &name).await?;
        }
        Ok(())
    }
}

struct MirrorReconciler {
    service_api: Api<Service>,
    endpoints_api: Api<Endpoints>,
    service_watcher: Arc<Watcher<Service>>,
    endpoints_watcher: Arc<Watcher<Endpoints>>,
    runner: String,
    namespace: String,
    prefix: String,
    mirror_labels: BTreeMap<String, String>,
}

impl MirrorReconciler {
    async fn reconcile_service(&self, name: &str, namespace: &str) -> Result<()> {
        let mirror_name = generate_mirror_name(&self.prefix, namespace, name);

        let Some(remote) = self.service_watcher.get(name, namespace) else {
            info!(runner = %self.runner, namespace = %self.namespace, name = %mirror_name, "remote service not found, deleting mirror");
            return delete_service(&self.service_api, &mirror_name).await;
        };

        match self.service_api.get(&mirror_name).await {
            Err(err) if is_not_found(&err) => {
                info!(runner = %self.runner, namespace = %self.namespace, name = %mirror_name, "creating mirror service");
                let svc = new_service(
                    &mirror_name,
                    &self.namespace,
                    self.mirror_labels.clone(),
                    BTreeMap::new(),
                    service_ports(&remote),
                    is_headless(&remote),
                );
                self.service_api.create(&PostParams::default(), &svc).await?;
            }
            Err(err) => return Err(err.into()),
            Ok(existing) => {
                info!(runner = %self.runner, namespace = %self.namespace, name = %mirror_name, "updating mirror service");
                update_service(&self.service_api, existing, service_ports(&remote)).await?;
            }
        }
        Ok(())
    }

    async fn reconcile_endpoints(&self, name: &str, namespace: &str) -> Result<()> {
        let mirror_name = generate_mirror_name(&self.prefix, namespace, name);

        let Some(remote) = self.endpoints_watcher.get(name, namespace) else {
            info!(runner = %self.runner, namespace = %self.namespace, name = %mirror_name, "remote endpoints not found, deleting mirror");
            return delete_endpoints(&self.endpoints_api, &mirror_name).await;
        };

        let desired = new_endpoints(
            &mirror_name,
            &self.namespace,
            self.mirror_labels.clone(),
            remote.subsets.clone(),
        );
        match self.endpoints_api.get(&mirror_name).await {
            Err(err) if is_not_found(&err) => {
                info!(runner = %self.runner, namespace = %self.namespace, name = %mirror_name, "creating mirror endpoints");
                self.endpoints_api.create(&PostParams::default(), &desired).await?;
            }
            Err(err) => return Err(err.into()),
            Ok(existing) => {
                info!(runner = %self.runner, namespace = %self.namespace, name = %mirror_name, "updating mirror endpoints");
                let mut desired = desired;
                desired.metadata.resource_version = existing.metadata.resource_version;
                self.endpoints_api.replace(&mirror_name, &PostParams::default(), &desired).await?;
            }
        }
        Ok(())
    }
}

fn queue_handler<K>(queue: Arc<Queue>) -> EventHandler<K>
where
    K: ResourceExt,
{
    Box::new(move |_event, obj: &K| queue.add(obj))
}

/// Subsets are copied verbatim from the remote object.
fn new_endpoints(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    subsets: Option<Vec<EndpointSubset>>,
) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        subsets,
    }
}

async fn delete_endpoints(api: &Api<Endpoints>, name: &str) -> Result<()> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
