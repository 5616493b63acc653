use std::collections::BTreeMap;
use std::sync::Mutex;

use ahash::{HashMap, HashMapExt};
use k8s_openapi::api::core::v1::{Service, ServicePort};
use kube::ResourceExt;

use crate::kubernetes::{generate_global_service_name, is_headless, service_ports};
use crate::{Error, Result};

pub const GLOBAL_SVC_LABEL: &str = "global-svc";
pub const GLOBAL_SVC_CLUSTERS_ANNOTATION: &str = "global-svc-clusters";
// Kube annotation enabling topology aware routing on the fused service.
pub const TOPOLOGY_AWARE_HINTS_ANNOTATION: &str = "service.kubernetes.io/topology-aware-hints";
pub const TOPOLOGY_AWARE_HINTS_AUTO: &str = "auto";

pub fn global_service_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(GLOBAL_SVC_LABEL.to_string(), "true".to_string())])
}

/// The fused record for one global service: the port set, headlessness and
/// the set of clusters currently contributing endpoints.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalService {
    pub name: String,
    pub namespace: String,
    pub ports: Vec<ServicePort>,
    pub headless: bool,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub clusters: Vec<String>,
}

/// In-memory table of global services, keyed by the generated local name.
/// Rebuilt from watcher caches on restart, shared by every global runner
/// and locked for the whole of each operation.
#[derive(Default)]
pub struct GlobalServiceStore {
    store: Mutex<HashMap<String, GlobalService>>,
}

impl GlobalServiceStore {
    pub fn new() -> Self {
        Self { store: Mutex::new(HashMap::new()) }
    }

    /// Appends a cluster to the service's contributor list, creating the
    /// record on first contribution. The annotation map is rebuilt from
    /// scratch on every call, so a contributor observed without the routing
    /// strategy label drops the topology annotation for the whole record.
    pub fn add_or_update_cluster_service_target(
        &self,
        svc: &Service,
        cluster: &str,
        topology_hint: bool,
    ) -> Result<GlobalService> {
        let name = svc.name_any();
        let namespace = svc.namespace().unwrap_or_default();
        let key = generate_global_service_name(&name, &namespace);

        let mut annotations = BTreeMap::new();
        if topology_hint {
            annotations.insert(
                TOPOLOGY_AWARE_HINTS_ANNOTATION.to_string(),
                TOPOLOGY_AWARE_HINTS_AUTO.to_string(),
            );
        }

        let mut store = self.store.lock().unwrap();
        match store.get_mut(&key) {
            None => {
                annotations
                    .insert(GLOBAL_SVC_CLUSTERS_ANNOTATION.to_string(), cluster.to_string());
                let gsvc = GlobalService {
                    name,
                    namespace,
                    ports: service_ports(svc),
                    headless: is_headless(svc),
                    labels: global_service_labels(),
                    annotations,
                    clusters: vec![cluster.to_string()],
                };
                store.insert(key, gsvc.clone());
                Ok(gsvc)
            }
            Some(gsvc) => {
                if gsvc.headless != is_headless(svc) {
                    return Err(Error::HeadlessMismatch { namespace, name });
                }
                if !gsvc.clusters.iter().any(|c| c == cluster) {
                    gsvc.clusters.push(cluster.to_string());
                }
                annotations.insert(
                    GLOBAL_SVC_CLUSTERS_ANNOTATION.to_string(),
                    gsvc.clusters.join(","),
                );
                gsvc.annotations = annotations;
                // Last writer wins on ports; there is no merge of differing
                // port sets across contributors.
                gsvc.ports = service_ports(svc);
                Ok(gsvc.clone())
            }
        }
    }

    /// Removes a cluster from the service's contributor list. Returns the
    /// remaining record, or `None` once the last contributor is gone and
    /// the record has been dropped.
    pub fn delete_cluster_service_target(
        &self,
        name: &str,
        namespace: &str,
        cluster: &str,
    ) -> Option<GlobalService> {
        let key = generate_global_service_name(name, namespace);
        let mut store = self.store.lock().unwrap();
        let gsvc = store.get_mut(&key)?;
        if let Some(position) = gsvc.clusters.iter().position(|c| c == cluster) {
            gsvc.clusters.swap_remove(position);
        }
        if gsvc.clusters.is_empty() {
            store.remove(&key);
            return None;
        }
        gsvc.annotations
            .insert(GLOBAL_SVC_CLUSTERS_ANNOTATION.to_string(), gsvc.clusters.join(","));
        Some(gsvc.clone())
    }

    pub fn get(&self, name: &str, namespace: &str) -> Option<GlobalService> {
        let key = generate_global_service_name(name, namespace);
        self.store.lock().unwrap().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use k8s_openapi::api::core::v1::ServiceSpec;
    use kube::api::ObjectMeta;

    use super::*;

    fn test_service(name: &str, namespace: &str, cluster_ip: &str, ports: &[i32]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .map(|port| ServicePort { port: *port, ..Default::default() })
                        .collect(),
                ),
                selector: Some(BTreeMap::from([("selector".to_string(), "x".to_string())])),
                cluster_ip: Some(cluster_ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn cluster_set(gsvc: &GlobalService) -> HashSet<String> {
        gsvc.annotations
            .get(GLOBAL_SVC_CLUSTERS_ANNOTATION)
            .map(|joined| joined.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_add_single_cluster() {
        let store = GlobalServiceStore::new();
        let svc = test_service("name", "namespace", "1.1.1.1", &[80]);
        store.add_or_update_cluster_service_target(&svc, "cluster", false).unwrap();
        assert_eq!(store.len(), 1);

        let gsvc = store.get("name", "namespace").unwrap();
        assert_eq!(gsvc.clusters, vec!["cluster".to_string()]);
        assert_eq!(
            gsvc.annotations.get(GLOBAL_SVC_CLUSTERS_ANNOTATION).map(String::as_str),
            Some("cluster")
        );
        assert_eq!(gsvc.labels.get(GLOBAL_SVC_LABEL).map(String::as_str), Some("true"));
        assert!(!gsvc.headless);
    }

    #[test]
    fn test_add_multiple_clusters_fuses_one_record() {
        let store = GlobalServiceStore::new();
        for cluster in ["a", "b", "c"] {
            let svc = test_service("name", "namespace", "1.1.1.1", &[80]);
            store.add_or_update_cluster_service_target(&svc, cluster, false).unwrap();
        }
        assert_eq!(store.len(), 1);
        let gsvc = store.get("name", "namespace").unwrap();
        assert_eq!(gsvc.clusters, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(
            gsvc.annotations.get(GLOBAL_SVC_CLUSTERS_ANNOTATION).map(String::as_str),
            Some("a,b,c")
        );
    }

    #[test]
    fn test_add_same_cluster_twice_is_idempotent() {
        let store = GlobalServiceStore::new();
        let svc = test_service("name", "namespace", "1.1.1.1", &[80]);
        store.add_or_update_cluster_service_target(&svc, "cluster", false).unwrap();
        store.add_or_update_cluster_service_target(&svc, "cluster", false).unwrap();
        let gsvc = store.get("name", "namespace").unwrap();
        assert_eq!(gsvc.clusters, vec!["cluster".to_string()]);
    }

    #[test]
    fn test_headless_mismatch_rejected_and_record_unchanged() {
        let store = GlobalServiceStore::new();
        let svc = test_service("name", "namespace", "1.1.1.1", &[80]);
        store.add_or_update_cluster_service_target(&svc, "a", false).unwrap();

        let headless = test_service("name", "namespace", "None", &[80]);
        let err = store.add_or_update_cluster_service_target(&headless, "b", false).unwrap_err();
        assert!(matches!(err, Error::HeadlessMismatch { .. }));

        let gsvc = store.get("name", "namespace").unwrap();
        assert_eq!(gsvc.clusters, vec!["a".to_string()]);
        assert!(!gsvc.headless);
    }

    #[test]
    fn test_ports_take_latest_writer() {
        let store = GlobalServiceStore::new();
        let svc = test_service("name", "namespace", "1.1.1.1", &[80]);
        store.add_or_update_cluster_service_target(&svc, "a", false).unwrap();
        let other = test_service("name", "namespace", "2.2.2.2", &[443]);
        store.add_or_update_cluster_service_target(&other, "b", false).unwrap();

        let gsvc = store.get("name", "namespace").unwrap();
        assert_eq!(gsvc.ports.len(), 1);
        assert_eq!(gsvc.ports[0].port, 443);
    }

    #[test]
    fn test_topology_annotation_requires_every_contributor() {
        let store = GlobalServiceStore::new();
        let svc = test_service("test-svc", "remote-ns", "1.1.1.1", &[80]);

        // First contributor opts in.
        let gsvc = store.add_or_update_cluster_service_target(&svc, "runnerA", true).unwrap();
        assert_eq!(
            gsvc.annotations.get(TOPOLOGY_AWARE_HINTS_ANNOTATION).map(String::as_str),
            Some(TOPOLOGY_AWARE_HINTS_AUTO)
        );

        // Second contributor without the label suppresses the annotation.
        let gsvc = store.add_or_update_cluster_service_target(&svc, "runnerB", false).unwrap();
        assert!(gsvc.annotations.get(TOPOLOGY_AWARE_HINTS_ANNOTATION).is_none());
        assert_eq!(cluster_set(&gsvc), HashSet::from(["runnerA".to_string(), "runnerB".to_string()]));

        // Re-observing the first contributor with the label set restores it.
        let gsvc = store.add_or_update_cluster_service_target(&svc, "runnerA", true).unwrap();
        assert_eq!(
            gsvc.annotations.get(TOPOLOGY_AWARE_HINTS_ANNOTATION).map(String::as_str),
            Some(TOPOLOGY_AWARE_HINTS_AUTO)
        );
    }

    #[test]
    fn test_delete_clusters_until_record_is_dropped() {
        let store = GlobalServiceStore::new();
        let svc = test_service("test-svc", "remote-ns", "1.1.1.1", &[80]);
        store.add_or_update_cluster_service_target(&svc, "runnerA", false).unwrap();
        store.add_or_update_cluster_service_target(&svc, "runnerB", false).unwrap();

        let gsvc = store.delete_cluster_service_target("test-svc", "remote-ns", "runnerA").unwrap();
        assert_eq!(gsvc.clusters, vec!["runnerB".to_string()]);
        assert_eq!(
            gsvc.annotations.get(GLOBAL_SVC_CLUSTERS_ANNOTATION).map(String::as_str),
            Some("runnerB")
        );

        assert!(store.delete_cluster_service_target("test-svc", "remote-ns", "runnerB").is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_delete_unknown_record_returns_none() {
        let store = GlobalServiceStore::new();
        assert!(store.delete_cluster_service_target("missing", "ns", "cluster").is_none());
    }

    #[test]
    fn test_add_then_remove_restores_prior_state() {
        let store = GlobalServiceStore::new();
        let svc = test_service("name", "namespace", "1.1.1.1", &[80]);
        store.add_or_update_cluster_service_target(&svc, "a", true).unwrap();
        let before = store.get("name", "namespace").unwrap();

        store.add_or_update_cluster_service_target(&svc, "b", true).unwrap();
        let after = store.delete_cluster_service_target("name", "namespace", "b").unwrap();

        assert_eq!(cluster_set(&before), cluster_set(&after));
        assert_eq!(before.annotations.get(TOPOLOGY_AWARE_HINTS_ANNOTATION), after.annotations.get(TOPOLOGY_AWARE_HINTS_ANNOTATION));
        assert_eq!(before.headless, after.headless);
    }
}
