use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

fn default_resync_period() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_zones() -> Vec<String> {
    vec!["local".to_string()]
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Label selector for global services to fuse.
    #[serde(default)]
    pub global_svc_label_selector: String,
    /// Label marking services that opt into topology aware hints.
    #[serde(default, rename = "globalSvcRoutingStrategy")]
    pub global_svc_routing_strategy_label: String,
    /// Label selector for remote services to mirror.
    #[serde(default)]
    pub mirror_svc_label_selector: String,
    /// Local namespace to mirror remote services into.
    #[serde(default)]
    pub mirror_namespace: String,
    /// Delete stale owned objects on startup.
    #[serde(default)]
    pub service_sync: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalClusterConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kube_config_path: Option<PathBuf>,
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteClusterConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kube_config_path: Option<PathBuf>,
    #[serde(default, rename = "remoteAPIURL")]
    pub remote_api_url: String,
    #[serde(default, rename = "remoteCAURL")]
    pub remote_ca_url: String,
    #[serde(default, rename = "remoteSATokenPath")]
    pub remote_sa_token_path: Option<PathBuf>,
    #[serde(default = "default_resync_period", with = "humantime_serde")]
    pub resync_period: Duration,
    /// Prefix applied to objects mirrored from this cluster.
    #[serde(default)]
    pub service_prefix: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub local_cluster: LocalClusterConfig,
    #[serde(default)]
    pub remote_clusters: Vec<RemoteClusterConfig>,
}

/// Selector and namespace overrides from flags or environment variables.
/// Flags take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub mirror_svc_label_selector: Option<String>,
    pub global_svc_label_selector: Option<String>,
    pub global_svc_routing_strategy_label: Option<String>,
    pub mirror_namespace: Option<String>,
}

/// Parses and validates the JSON configuration, applying overrides first so
/// a flag can satisfy a selector the file omits.
pub fn parse_config(raw: &str, overrides: Overrides) -> Result<Config> {
    let mut config: Config = serde_json::from_str(raw)?;

    if let Some(selector) = overrides.mirror_svc_label_selector {
        config.global.mirror_svc_label_selector = selector;
    }
    if config.global.mirror_svc_label_selector.is_empty() {
        return Err(Error::Config(
            "label selector for service mirroring must be specified via the json config, env vars or flag".to_string(),
        ));
    }
    if let Some(selector) = overrides.global_svc_label_selector {
        config.global.global_svc_label_selector = selector;
    }
    if config.global.global_svc_label_selector.is_empty() {
        return Err(Error::Config(
            "label selector for global services must be specified via the json config, env vars or flag".to_string(),
        ));
    }
    if let Some(label) = overrides.global_svc_routing_strategy_label {
        config.global.global_svc_routing_strategy_label = label;
    }
    if config.global.global_svc_routing_strategy_label.is_empty() {
        return Err(Error::Config(
            "label to enable topology aware hints for global services must be specified via the json config, env vars or flag".to_string(),
        ));
    }
    if let Some(namespace) = overrides.mirror_namespace {
        config.global.mirror_namespace = namespace;
    }
    if config.global.mirror_namespace.is_empty() {
        return Err(Error::Config(
            "local mirroring namespace must be specified via the json config, env vars or flag".to_string(),
        ));
    }

    if config.local_cluster.name.is_empty() {
        return Err(Error::Config("configuration is missing the local cluster name".to_string()));
    }
    // Dummy zone default so kube-proxy accepts the hints we write.
    if config.local_cluster.zones.is_empty() {
        config.local_cluster.zones = default_zones();
    }

    if config.remote_clusters.is_empty() {
        return Err(Error::Config("no remote cluster configuration defined".to_string()));
    }
    let mut names = std::collections::HashSet::new();
    let mut prefixes = std::collections::HashSet::new();
    for remote in &config.remote_clusters {
        if remote.name.is_empty() {
            return Err(Error::Config("configuration is missing a remote cluster name".to_string()));
        }
        if remote.kube_config_path.is_none()
            && (remote.remote_api_url.is_empty()
                || remote.remote_ca_url.is_empty()
                || remote.remote_sa_token_path.is_none())
        {
            return Err(Error::Config(format!(
                "insufficient configuration to create a client for remote cluster {}: set kubeConfigPath or remoteAPIURL, remoteCAURL and remoteSATokenPath",
                remote.name
            )));
        }
        if remote.service_prefix.is_empty() {
            return Err(Error::Config(format!(
                "configuration is missing a service prefix for remote cluster {}",
                remote.name
            )));
        }
        if !names.insert(remote.name.clone()) {
            return Err(Error::Config(format!("duplicate remote cluster name {}", remote.name)));
        }
        if !prefixes.insert(remote.service_prefix.clone()) {
            return Err(Error::Config(format!(
                "duplicate service prefix {} for remote cluster {}",
                remote.service_prefix, remote.name
            )));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    const VALID: &str = r#"{
        "global": {
            "globalSvcLabelSelector": "global-svc=true",
            "globalSvcRoutingStrategy": "uw.systems/topology-aware-hints=true",
            "mirrorSvcLabelSelector": "uw.systems/test=true",
            "mirrorNamespace": "local-ns",
            "serviceSync": true
        },
        "localCluster": {
            "name": "local"
        },
        "remoteClusters": [
            {
                "name": "remote-a",
                "kubeConfigPath": "/etc/kube/config-a",
                "resyncPeriod": "10s",
                "servicePrefix": "prefix"
            }
        ]
    }"#;

    #[test]
    fn test_parse_valid_config() {
        let config = parse_config(VALID, Overrides::default()).unwrap();
        assert_eq!(config.global.mirror_namespace, "local-ns");
        assert!(config.global.service_sync);
        assert_eq!(config.local_cluster.zones, vec!["local".to_string()]);
        assert_eq!(config.remote_clusters.len(), 1);
        assert_eq!(config.remote_clusters[0].resync_period, Duration::from_secs(10));
        assert_eq!(config.remote_clusters[0].service_prefix, "prefix");
    }

    #[test]
    fn test_resync_period_defaults() {
        let raw = VALID.replace(r#""resyncPeriod": "10s","#, "");
        let config = parse_config(&raw, Overrides::default()).unwrap();
        assert_eq!(config.remote_clusters[0].resync_period, Duration::from_secs(3600));
    }

    #[test]
    fn test_missing_selectors_rejected() {
        let raw = VALID.replace(r#""mirrorSvcLabelSelector": "uw.systems/test=true","#, "");
        assert!(parse_config(&raw, Overrides::default()).is_err());

        // A flag override satisfies the requirement.
        let overrides = Overrides {
            mirror_svc_label_selector: Some("uw.systems/test=true".to_string()),
            ..Default::default()
        };
        assert!(parse_config(&raw, overrides).is_ok());
    }

    #[test]
    fn test_override_precedence() {
        let overrides = Overrides {
            mirror_namespace: Some("other-ns".to_string()),
            ..Default::default()
        };
        let config = parse_config(VALID, overrides).unwrap();
        assert_eq!(config.global.mirror_namespace, "other-ns");
    }

    #[test]
    fn test_empty_remote_clusters_rejected() {
        let raw = r#"{
            "global": {
                "globalSvcLabelSelector": "a=b",
                "globalSvcRoutingStrategy": "c=d",
                "mirrorSvcLabelSelector": "e=f",
                "mirrorNamespace": "ns"
            },
            "localCluster": {"name": "local"},
            "remoteClusters": []
        }"#;
        assert!(parse_config(raw, Overrides::default()).is_err());
    }

    #[test]
    fn test_remote_cluster_auth_modes() {
        let token_mode = VALID.replace(
            r#""kubeConfigPath": "/etc/kube/config-a","#,
            r#""remoteAPIURL": "https://remote", "remoteCAURL": "https://remote/ca", "remoteSATokenPath": "/var/run/token","#,
        );
        assert!(parse_config(&token_mode, Overrides::default()).is_ok());

        // Neither a kubeconfig nor the full url/ca/token triplet.
        let incomplete = VALID.replace(
            r#""kubeConfigPath": "/etc/kube/config-a","#,
            r#""remoteAPIURL": "https://remote","#,
        );
        assert!(parse_config(&incomplete, Overrides::default()).is_err());
    }

    #[test]
    fn test_duplicate_remote_names_rejected() {
        let raw = VALID.replace(
            r#""remoteClusters": ["#,
            r#""remoteClusters": [
            {
                "name": "remote-a",
                "kubeConfigPath": "/etc/kube/config-b",
                "servicePrefix": "other"
            },"#,
        );
        assert!(parse_config(&raw, Overrides::default()).is_err());
    }
}
