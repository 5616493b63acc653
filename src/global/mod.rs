pub mod store;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointHints, EndpointSlice, ForZone};
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::core::{Selector, SelectorExt};
use kube::{Client, ResourceExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kubernetes::watcher::{EventHandler, Watcher, CACHE_SYNC_TIMEOUT};
use crate::kubernetes::{
    delete_service, endpoint_slice_labels, endpoint_slice_mirror_label_selector,
    endpoint_slice_mirror_labels, generate_global_endpoint_slice_name,
    generate_global_service_name, is_not_found, new_service, stale_object_names, update_service,
    SERVICE_NAME_LABEL,
};
use crate::global::store::GlobalServiceStore;
use crate::kubernetes::queue::Queue;
use crate::supervisor::{wait_for_tasks, Runner};
use crate::{Error, Result};

// Zone written on endpoints copied from remote clusters so kube-proxy
// topology aware routing never selects them over local ones.
const REMOTE_ZONE: &str = "remote";

/// Fuses globally labelled services observed on one cluster into local
/// global services, and copies their endpoint slices into the mirror
/// namespace with rewritten zone hints.
pub struct GlobalRunner {
    pub home: Client,
    pub watch: Client,
    pub name: String,
    pub namespace: String,
    pub label_selector: String,
    pub resync_period: Duration,
    pub store: Arc<GlobalServiceStore>,
    /// True for the runner watching the home cluster itself.
    pub local: bool,
    pub routing_strategy_label: Selector,
    pub sync: bool,
    pub zones: Vec<String>,
    pub initialised: Arc<AtomicBool>,
    pub cancel: CancellationToken,
}

impl Runner for GlobalRunner {
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

        let service_queue = Queue::new(&format!("{}-gl-service", self.name), cancel.child_token());
        let slice_queue = Queue::new(&format!("{}-endpointslice", self.name), cancel.child_token());

        let service_watcher = Arc::new(Watcher::new(
            format!("gl-{}-service-watcher", self.name),
            "service",
            &self.name,
            Api::<Service>::all(self.watch.clone()),
            self.resync_period,
            Some(queue_handler(service_queue.clone())),
            Some(self.label_selector.clone()),
            cancel.child_token(),
        ));
        let slice_watcher = Arc::new(Watcher::new(
            format!("gl-{}-endpointslice-watcher", self.name),
            "endpointslice",
            &self.name,
            Api::<EndpointSlice>::all(self.watch.clone()),
            self.resync_period,
            Some(queue_handler(slice_queue.clone())),
            Some(self.label_selector.clone()),
            cancel.child_token(),
        ));
        // Cache-only view of the slices this runner owns on the home side,
        // used by the startup sync.
        let mirror_slice_watcher = Arc::new(Watcher::new(
            format!("mirror-{}-endpointslice-watcher", self.name),
            "endpointslice",
            &self.name,
            Api::<EndpointSlice>::namespaced(self.home.clone(), &self.namespace),
            self.resync_period,
            None,
            Some(endpoint_slice_mirror_label_selector(&self.name)),
            cancel.child_token(),
        ));

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        {
            let watcher = service_watcher.clone();
            tasks.spawn(async move { watcher.run().await });
        }
        // The runner is live once its service watcher has been launched.
        self.initialised.store(true, Ordering::SeqCst);
        service_watcher.wait_for_sync(CACHE_SYNC_TIMEOUT).await?;

        {
            let watcher = slice_watcher.clone();
            tasks.spawn(async move { watcher.run().await });
        }
        {
            let watcher = mirror_slice_watcher.clone();
            tasks.spawn(async move { watcher.run().await });
        }
        slice_watcher.wait_for_sync(CACHE_SYNC_TIMEOUT).await?;
        mirror_slice_watcher.wait_for_sync(CACHE_SYNC_TIMEOUT).await?;

        if self.sync {
            info!(runner = %self.name, "syncing endpointslices");
            if let Err(err) = self.endpoint_slice_sync(&slice_watcher, &mirror_slice_watcher).await
            {
                warn!(runner = %self.name, error = %err, "error syncing endpointslices, skipping");
            }
        }

        let reconciler = Arc::new(GlobalReconciler {
            service_api: Api::namespaced(self.home.clone(), &self.namespace),
            slice_api: Api::namespaced(self.home.clone(), &self.namespace),
            service_watcher: service_watcher.clone(),
            slice_watcher: slice_watcher.clone(),
            store: self.store.clone(),
            runner: self.name.clone(),
            namespace: self.namespace.clone(),
            local: self.local,
            zones: self.zones.clone(),
            routing_strategy_label: self.routing_strategy_label.clone(),
            mirror_labels: endpoint_slice_mirror_labels(&self.name),
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
            let queue = slice_queue.clone();
            let reconciler = reconciler.clone();
            tasks.spawn(async move {
                queue
                    .run(move |name, namespace| {
                        let reconciler = reconciler.clone();
                        async move { reconciler.reconcile_endpoint_slice(&name, &namespace).await }
                    })
                    .await;
                Ok(())
            });
        }

        wait_for_tasks(&self.name, &self.cancel, tasks).await
    }
}

impl GlobalRunner {
    async fn endpoint_slice_sync(
        &self,
        remote_slices: &Watcher<EndpointSlice>,
        mirror_slices: &Watcher<EndpointSlice>,
    ) -> Result<()> {
        let api: Api<EndpointSlice> = Api::namespaced(self.home.clone(), &self.namespace);
        let expected: HashSet<String> = remote_slices
            .list()
            .iter()
            .map(|slice| generate_global_endpoint_slice_name(&slice.name_any()))
            .collect();
        let current: Vec<String> =
            mirror_slices.list().iter().map(|slice| slice.name_any()).collect();
        for name in stale_object_names(&expected, current) {
            info!(runner = %self.name, endpointslice = %name, "deleting stale endpointslice");
            delete_endpoint_slice(&api, &name).await?;
        }
        Ok(())
    }
}

struct GlobalReconciler {
    service_api: Api<Service>,
    slice_api: Api<EndpointSlice>,
    service_watcher: Arc<Watcher<Service>>,
    slice_watcher: Arc<Watcher<EndpointSlice>>,
    store: Arc<GlobalServiceStore>,
    runner: String,
    namespace: String,
    local: bool,
    zones: Vec<String>,
    routing_strategy_label: Selector,
    mirror_labels: BTreeMap<String, String>,
}

impl GlobalReconciler {
    async fn reconcile_service(&self, name: &str, namespace: &str) -> Result<()> {
        let global_name = generate_global_service_name(name, namespace);
        match self.service_watcher.get(name, namespace) {
            None => {
                // Drop this cluster's contribution; the local object only
                // goes once the last contributor is gone.
                debug!(runner = %self.runner, namespace = %namespace, name = %name, "removing cluster from global store");
                if self.store.delete_cluster_service_target(name, namespace, &self.runner).is_none()
                {
                    info!(runner = %self.runner, namespace = %self.namespace, name = %global_name, "last contributor gone, deleting global service");
                    delete_service(&self.service_api, &global_name).await?;
                }
            }
            Some(remote) => {
                let topology_hint = self.routing_strategy_label.matches(remote.labels());
                self.store.add_or_update_cluster_service_target(
                    &remote,
                    &self.runner,
                    topology_hint,
                )?;
            }
        }

        let Some(record) = self.store.get(name, namespace) else {
            return Ok(());
        };

        match self.service_api.get(&global_name).await {
            Err(err) if is_not_found(&err) => {
                info!(runner = %self.runner, namespace = %self.namespace, name = %global_name, "creating global service");
                let svc = new_service(
                    &global_name,
                    &self.namespace,
                    record.labels.clone(),
                    record.annotations.clone(),
                    record.ports.clone(),
                    record.headless,
                );
                self.service_api.create(&PostParams::default(), &svc).await?;
            }
            Err(err) => return Err(err.into()),
            Ok(mut existing) => {
                info!(runner = %self.runner, namespace = %self.namespace, name = %global_name, "updating global service");
                existing.metadata.annotations = Some(record.annotations.clone());
                update_service(&self.service_api, existing, record.ports.clone()).await?;
            }
        }
        Ok(())
    }

    async fn reconcile_endpoint_slice(&self, name: &str, namespace: &str) -> Result<()> {
        let mirror_name = generate_global_endpoint_slice_name(name);
        let Some(remote) = self.slice_watcher.get(name, namespace) else {
            info!(runner = %self.runner, namespace = %namespace, name = %name, "remote endpointslice not found, removing local mirror");
            return delete_endpoint_slice(&self.slice_api, &mirror_name).await;
        };

        let Some(target_service) = remote.labels().get(SERVICE_NAME_LABEL) else {
            return Err(Error::MissingServiceName {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        };
        let target_global = generate_global_service_name(target_service, namespace);

        let desired = EndpointSlice {
            metadata: ObjectMeta {
                name: Some(mirror_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(endpoint_slice_labels(&self.mirror_labels, &target_global)),
                ..Default::default()
            },
            address_type: remote.address_type.clone(),
            endpoints: ensure_endpoint_slice_zones(
                self.local,
                &self.zones,
                remote.endpoints.clone(),
            ),
            ports: remote.ports.clone(),
        };

        match self.slice_api.get(&mirror_name).await {
            Err(err) if is_not_found(&err) => {
                info!(runner = %self.runner, namespace = %self.namespace, name = %mirror_name, "creating endpointslice");
                self.slice_api.create(&PostParams::default(), &desired).await?;
            }
            Err(err) => return Err(err.into()),
            Ok(existing) => {
                info!(runner = %self.runner, namespace = %self.namespace, name = %mirror_name, "updating endpointslice");
                let mut desired = desired;
                desired.metadata.resource_version = existing.metadata.resource_version;
                self.slice_api.replace(&mirror_name, &PostParams::default(), &desired).await?;
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

async fn delete_endpoint_slice(api: &Api<EndpointSlice>, name: &str) -> Result<()> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// kube-proxy only honours topology aware routing when every endpoint in a
/// slice carries hints. Remote endpoints get a synthetic zone that is never
/// selectable; local endpoints are hinted for the configured local zones.
fn ensure_endpoint_slice_zones(
    local: bool,
    zones: &[String],
    mut endpoints: Vec<Endpoint>,
) -> Vec<Endpoint> {
    if local {
        let for_zones: Vec<ForZone> =
            zones.iter().map(|zone| ForZone { name: zone.clone() }).collect();
        for endpoint in &mut endpoints {
            endpoint.hints =
                Some(EndpointHints { for_zones: Some(for_zones.clone()), ..Default::default() });
        }
    } else {
        for endpoint in &mut endpoints {
            endpoint.zone = Some(REMOTE_ZONE.to_string());
            endpoint.hints = Some(EndpointHints {
                for_zones: Some(vec![ForZone { name: REMOTE_ZONE.to_string() }]),
                ..Default::default()
            });
        }
    }
    endpoints
}

#[cfg(test)]
mod test {
    use k8s_openapi::api::discovery::v1::EndpointConditions;

    use super::*;

    fn test_endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint {
                addresses: vec!["10.2.0.1".to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(true),
                    ..Default::default()
                }),
                zone: Some("eu-1a".to_string()),
                ..Default::default()
            },
            Endpoint { addresses: vec!["10.2.0.2".to_string()], ..Default::default() },
        ]
    }

    #[test]
    fn test_remote_endpoints_get_unselectable_zone() {
        let endpoints = ensure_endpoint_slice_zones(false, &["eu-1a".to_string()], test_endpoints());
        for endpoint in &endpoints {
            assert_eq!(endpoint.zone.as_deref(), Some("remote"));
            let hints = endpoint.hints.as_ref().unwrap();
            let for_zones = hints.for_zones.as_ref().unwrap();
            assert_eq!(for_zones.len(), 1);
            assert_eq!(for_zones[0].name, "remote");
        }
    }

    #[test]
    fn test_local_endpoints_keep_zone_and_gain_local_hints() {
        let zones = vec!["eu-1a".to_string(), "eu-1b".to_string()];
        let endpoints = ensure_endpoint_slice_zones(true, &zones, test_endpoints());
        assert_eq!(endpoints[0].zone.as_deref(), Some("eu-1a"));
        assert_eq!(endpoints[1].zone, None);
        for endpoint in &endpoints {
            let for_zones = endpoint.hints.as_ref().unwrap().for_zones.as_ref().unwrap();
            let names: Vec<&str> = for_zones.iter().map(|zone| zone.name.as_str()).collect();
            assert_eq!(names, vec!["eu-1a", "eu-1b"]);
        }
    }

    #[test]
    fn test_stale_slice_names_after_sync() {
        let expected: HashSet<String> = ["test-slice".to_string()]
            .iter()
            .map(|name| generate_global_endpoint_slice_name(name))
            .collect();
        let current = vec!["gl-test-slice".to_string(), "gl-old-slice".to_string()];
        assert_eq!(stale_object_names(&expected, current), vec!["gl-old-slice".to_string()]);
    }
}
