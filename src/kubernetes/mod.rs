pub mod client;
pub mod queue;
pub mod watcher;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::{Expression, Selector};
use kube::ResourceExt;

use crate::{Error, Result};

/// Inserted between the namespace and name in mirror names to prevent
/// clashes with natural hyphenated names.
pub const SEPARATOR: &str = "73736d";

/// Label attached to every endpoint slice this controller manages.
pub const ENDPOINT_SLICE_MANAGED_BY: &str = "semaphore-service-mirror";

pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
pub const MANAGED_BY_LABEL: &str = "endpointslice.kubernetes.io/managed-by";

const MIRRORED_SVC_LABEL: &str = "mirrored-svc";
const MIRROR_PREFIX_LABEL: &str = "mirror-svc-prefix-sync";
const MIRRORED_ENDPOINT_SLICE_LABEL: &str = "mirrored-endpoint-slice";
const MIRROR_ENDPOINT_SLICE_SYNC_LABEL: &str = "mirror-endpointslice-sync-name";

/// Name for mirrored objects: `<prefix>-<namespace>-73736d-<name>`.
pub fn generate_mirror_name(prefix: &str, namespace: &str, name: &str) -> String {
    format!("{prefix}-{namespace}-{SEPARATOR}-{name}")
}

/// Splits a mirror name back into its `(namespace, name)` parts. The
/// prefix must be supplied by the caller: prefixes and namespaces may both
/// contain hyphens, so the name alone does not mark their boundary.
pub fn parse_mirror_name<'a>(prefix: &str, mirror_name: &'a str) -> Option<(&'a str, &'a str)> {
    let scoped = mirror_name.strip_prefix(prefix)?.strip_prefix('-')?;
    scoped.split_once(&format!("-{SEPARATOR}-"))
}

/// Name for a fused global service: `gl-<namespace>-73736d-<name>`.
pub fn generate_global_service_name(name: &str, namespace: &str) -> String {
    format!("gl-{namespace}-{SEPARATOR}-{name}")
}

/// Prefixes the remote endpoint slice name with `gl-`. Relies on the
/// kubernetes-generated suffix on slice names to avoid collisions.
pub fn generate_global_endpoint_slice_name(name: &str) -> String {
    format!("gl-{name}")
}

/// Owner labels carried by every mirrored service and endpoints object.
pub fn mirror_labels(prefix: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MIRRORED_SVC_LABEL.to_string(), "true".to_string()),
        (MIRROR_PREFIX_LABEL.to_string(), prefix.to_string()),
    ])
}

pub fn mirror_label_selector(prefix: &str) -> String {
    format!("{MIRRORED_SVC_LABEL}=true,{MIRROR_PREFIX_LABEL}={prefix}")
}

/// Owner labels carried by every mirrored endpoint slice of a runner.
pub fn endpoint_slice_mirror_labels(runner: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MIRRORED_ENDPOINT_SLICE_LABEL.to_string(), "true".to_string()),
        (MIRROR_ENDPOINT_SLICE_SYNC_LABEL.to_string(), runner.to_string()),
    ])
}

pub fn endpoint_slice_mirror_label_selector(runner: &str) -> String {
    format!("{MIRRORED_ENDPOINT_SLICE_LABEL}=true,{MIRROR_ENDPOINT_SLICE_SYNC_LABEL}={runner}")
}

/// Full label set for a mirrored endpoint slice, pointing kube-proxy at the
/// target global service.
pub fn endpoint_slice_labels(
    base: &BTreeMap<String, String>,
    target_service: &str,
) -> BTreeMap<String, String> {
    let mut labels = base.clone();
    labels.insert(SERVICE_NAME_LABEL.to_string(), target_service.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), ENDPOINT_SLICE_MANAGED_BY.to_string());
    labels
}

pub fn is_headless(svc: &Service) -> bool {
    svc.spec.as_ref().and_then(|spec| spec.cluster_ip.as_deref()) == Some("None")
}

pub fn service_ports(svc: &Service) -> Vec<ServicePort> {
    svc.spec.as_ref().and_then(|spec| spec.ports.clone()).unwrap_or_default()
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Parses an equality-based label selector ("k=v,k!=v,k,!k") into a
/// `Selector` usable for in-process matching.
pub fn parse_selector(selector: &str) -> Result<Selector> {
    let mut expressions = Vec::new();
    for requirement in selector.split(',') {
        let requirement = requirement.trim();
        if requirement.is_empty() {
            continue;
        }
        let expression = if let Some((key, value)) = requirement.split_once("!=") {
            Expression::NotEqual(key.trim().to_string(), value.trim().to_string())
        } else if let Some((key, value)) = requirement.split_once("==") {
            Expression::Equal(key.trim().to_string(), value.trim().to_string())
        } else if let Some((key, value)) = requirement.split_once('=') {
            Expression::Equal(key.trim().to_string(), value.trim().to_string())
        } else if let Some(key) = requirement.strip_prefix('!') {
            Expression::DoesNotExist(key.trim().to_string())
        } else {
            Expression::Exists(requirement.to_string())
        };
        expressions.push(expression);
    }
    if expressions.is_empty() {
        return Err(Error::Config(format!("empty label selector: {selector:?}")));
    }
    Ok(expressions.into_iter().collect())
}

/// Builds a clusterIP or headless service carrying the given labels and
/// annotations, with no selector so endpoints are managed by hand.
pub fn new_service(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    ports: Vec<ServicePort>,
    headless: bool,
) -> Service {
    Service {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(ports),
            selector: None,
            cluster_ip: headless.then(|| "None".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Updates service ports and re-asserts the nil selector. The clusterIP
/// field is left untouched as it is immutable.
pub async fn update_service(
    api: &Api<Service>,
    mut service: Service,
    ports: Vec<ServicePort>,
) -> Result<Service> {
    let name = service.name_any();
    match service.spec.as_mut() {
        Some(spec) => {
            spec.ports = Some(ports);
            spec.selector = None;
        }
        None => {
            service.spec = Some(ServiceSpec {
                ports: Some(ports),
                selector: None,
                ..Default::default()
            });
        }
    }
    Ok(api.replace(&name, &PostParams::default(), &service).await?)
}

/// Deletes a service, tolerating objects that are already gone.
pub async fn delete_service(api: &Api<Service>, name: &str) -> Result<()> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Names present locally that no longer have a remote counterpart and are
/// due for deletion by the startup sync.
pub fn stale_object_names<I>(expected: &std::collections::HashSet<String>, current: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    current.into_iter().filter(|name| !expected.contains(name)).collect()
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use kube::core::SelectorExt;

    use super::*;

    #[test]
    fn test_generate_mirror_name() {
        assert_eq!(
            generate_mirror_name("prefix", "remote-ns", "test-svc"),
            "prefix-remote-ns-73736d-test-svc"
        );
    }

    #[test]
    fn test_mirror_name_roundtrip() {
        let name = generate_mirror_name("prefix", "ns1", "svc");
        assert_eq!(parse_mirror_name("prefix", &name), Some(("ns1", "svc")));

        // Hyphenated prefixes and namespaces keep their boundaries.
        let name = generate_mirror_name("my-team", "remote-ns", "test-svc");
        assert_eq!(parse_mirror_name("my-team", &name), Some(("remote-ns", "test-svc")));

        let name = generate_mirror_name("prefix", "ns1", "svc");
        assert_eq!(parse_mirror_name("other", &name), None);
    }

    #[test]
    fn test_generate_global_service_name() {
        assert_eq!(
            generate_global_service_name("test-svc", "remote-ns"),
            "gl-remote-ns-73736d-test-svc"
        );
    }

    #[test]
    fn test_generate_global_endpoint_slice_name() {
        assert_eq!(generate_global_endpoint_slice_name("test-slice-abc12"), "gl-test-slice-abc12");
        // Slice names at the DNS subdomain limit still only gain the fixed
        // prefix; collision avoidance stays with the kubernetes suffix.
        let long = "a".repeat(253);
        assert_eq!(generate_global_endpoint_slice_name(&long), format!("gl-{long}"));
    }

    #[test]
    fn test_mirror_labels() {
        let labels = mirror_labels("prefix");
        assert_eq!(labels.get("mirrored-svc").map(String::as_str), Some("true"));
        assert_eq!(labels.get("mirror-svc-prefix-sync").map(String::as_str), Some("prefix"));
        assert_eq!(mirror_label_selector("prefix"), "mirrored-svc=true,mirror-svc-prefix-sync=prefix");
    }

    #[test]
    fn test_endpoint_slice_labels() {
        let labels =
            endpoint_slice_labels(&endpoint_slice_mirror_labels("runner-a"), "gl-ns-73736d-svc");
        assert_eq!(labels.get("mirrored-endpoint-slice").map(String::as_str), Some("true"));
        assert_eq!(
            labels.get("mirror-endpointslice-sync-name").map(String::as_str),
            Some("runner-a")
        );
        assert_eq!(
            labels.get("kubernetes.io/service-name").map(String::as_str),
            Some("gl-ns-73736d-svc")
        );
        assert_eq!(
            labels.get("endpointslice.kubernetes.io/managed-by").map(String::as_str),
            Some("semaphore-service-mirror")
        );
    }

    #[test]
    fn test_is_headless() {
        let mut svc = Service::default();
        assert!(!is_headless(&svc));
        svc.spec = Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            ..Default::default()
        });
        assert!(is_headless(&svc));
        svc.spec = Some(ServiceSpec {
            cluster_ip: Some("10.2.3.4".to_string()),
            ..Default::default()
        });
        assert!(!is_headless(&svc));
    }

    #[test]
    fn test_new_service_shape() {
        let ports = vec![ServicePort { port: 1, ..Default::default() }];
        let svc = new_service(
            "prefix-ns1-73736d-svc",
            "local-ns",
            mirror_labels("prefix"),
            BTreeMap::new(),
            ports.clone(),
            false,
        );
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.ports, Some(ports));
        assert_eq!(spec.selector, None);
        assert_eq!(spec.cluster_ip, None);

        let headless = new_service(
            "prefix-ns1-73736d-svc",
            "local-ns",
            mirror_labels("prefix"),
            BTreeMap::new(),
            vec![],
            true,
        );
        assert_eq!(headless.spec.as_ref().unwrap().cluster_ip.as_deref(), Some("None"));
    }

    #[test]
    fn test_parse_selector() {
        let labels = BTreeMap::from([
            ("uw.systems/test".to_string(), "true".to_string()),
            ("other".to_string(), "x".to_string()),
        ]);
        assert!(parse_selector("uw.systems/test=true").unwrap().matches(&labels));
        assert!(parse_selector("uw.systems/test").unwrap().matches(&labels));
        assert!(!parse_selector("uw.systems/test!=true").unwrap().matches(&labels));
        assert!(!parse_selector("missing").unwrap().matches(&labels));
        assert!(parse_selector("!missing").unwrap().matches(&labels));
        assert!(parse_selector("").is_err());
    }

    #[test]
    fn test_stale_object_names() {
        let expected: HashSet<String> =
            ["prefix-ns1-73736d-svc".to_string()].into_iter().collect();
        let current = vec![
            "prefix-ns1-73736d-svc".to_string(),
            "prefix-old-73736d-ns1".to_string(),
        ];
        assert_eq!(stale_object_names(&expected, current), vec!["prefix-old-73736d-ns1".to_string()]);
    }
}
