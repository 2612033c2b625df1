//! Registry detail lookup for builds pushing to an off-cluster registry.

use crate::cluster::ClusterClient;
use crate::errors::ClusterError;
use std::collections::BTreeMap;

pub const REGISTRY_SECRET: &str = "registry-secret";
const REGISTRY_ENV_PREFIX: &str = "SLIPWAY_REGISTRY_";

const ORGANIZATION_KEY: &str = "SLIPWAY_REGISTRY_ORGANIZATION";
const HOSTNAME_KEY: &str = "SLIPWAY_REGISTRY_HOSTNAME";

/// Read the registry secret and turn its entries into builder env
/// bindings. For off-cluster registries the image reference picks up the
/// configured organization and hostname prefixes; on-cluster locations
/// need no extra detail.
pub async fn registry_details(
    cluster: &dyn ClusterClient,
    image: &mut String,
    registry_location: &str,
    namespace: &str,
) -> Result<BTreeMap<String, String>, ClusterError> {
    let mut registry_env = BTreeMap::new();
    if registry_location != "off-cluster" {
        return Ok(registry_env);
    }

    let secret = cluster.get_secret(namespace, REGISTRY_SECRET).await?;
    for (key, value) in secret.data {
        registry_env.insert(format!("{REGISTRY_ENV_PREFIX}{}", key.to_uppercase()), value);
    }

    if let Some(org) = registry_env.get(ORGANIZATION_KEY)
        && !org.is_empty()
    {
        *image = format!("{org}/{image}");
    }
    if let Some(host) = registry_env.get(HOSTNAME_KEY)
        && !host.is_empty()
    {
        *image = format!("{host}/{image}");
    }
    Ok(registry_env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Secret;
    use crate::cluster::fake::FakeCluster;

    #[tokio::test]
    async fn off_cluster_lookup_maps_secret_keys_and_rewrites_image() {
        let fake = FakeCluster::new();
        fake.put_secret(Secret {
            name: REGISTRY_SECRET.to_string(),
            data: BTreeMap::from([
                ("organization".to_string(), "acme".to_string()),
                ("hostname".to_string(), "registry.example.com".to_string()),
                ("username".to_string(), "robot".to_string()),
            ]),
        });

        let mut image = "demo:git-0462cef5".to_string();
        let env = registry_details(&fake, &mut image, "off-cluster", "default")
            .await
            .unwrap();

        assert_eq!(image, "registry.example.com/acme/demo:git-0462cef5");
        assert_eq!(
            env.get("SLIPWAY_REGISTRY_USERNAME").map(String::as_str),
            Some("robot")
        );
    }

    #[tokio::test]
    async fn on_cluster_location_is_a_no_op() {
        let fake = FakeCluster::new();
        let mut image = "demo:git-0462cef5".to_string();
        let env = registry_details(&fake, &mut image, "on-cluster", "default")
            .await
            .unwrap();
        assert!(env.is_empty());
        assert_eq!(image, "demo:git-0462cef5");
        assert!(fake.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn missing_secret_surfaces_as_error() {
        let fake = FakeCluster::new();
        let mut image = "demo".to_string();
        let err = registry_details(&fake, &mut image, "off-cluster", "default")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound { .. }));
    }
}
