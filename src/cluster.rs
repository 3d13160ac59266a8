//! Cluster API boundary
//!
//! Everything the checks read or write goes through [`ClusterApi`], so the
//! validators can be exercised against mocks and in-memory fleets. The
//! production implementation, [`KubeCluster`], talks to the API server with
//! kube-rs. A 404 is reported as `None` (or `false` for deletes) because absence
//! is an ordinary intermediate state while the controller reconciles.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// API group of the provisioning group resource
pub const MACHINE_SET_GROUP: &str = "machine.openshift.io";
/// API version of the provisioning group resource
pub const MACHINE_SET_VERSION: &str = "v1beta1";
/// Kind of the provisioning group resource
pub const MACHINE_SET_KIND: &str = "MachineSet";

/// Connect timeout for the harness client
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for the harness client
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the convergence checks need from the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List nodes matching a label selector
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>, Error>;

    /// Get a ConfigMap, `None` if it does not exist
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Get a Secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Desired replica count of a provisioning group.
    ///
    /// `None` if the group does not exist; a group without an integer
    /// `spec.replicas` is an [`Error::Decode`].
    async fn get_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>, Error>;

    /// Write the desired replica count of a provisioning group
    async fn set_replicas(&self, namespace: &str, name: &str, replicas: i32)
        -> Result<(), Error>;

    /// Delete a provisioning group; returns `false` if it was already gone
    async fn delete_provisioning_group(&self, namespace: &str, name: &str)
        -> Result<bool, Error>;
}

/// [`ClusterApi`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    machine_sets: ApiResource,
}

impl KubeCluster {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            machine_sets: ApiResource::from_gvk(&GroupVersionKind {
                group: MACHINE_SET_GROUP.to_string(),
                version: MACHINE_SET_VERSION.to_string(),
                kind: MACHINE_SET_KIND.to_string(),
            }),
        }
    }

    /// Connect using a kubeconfig path, or the inferred config when `None`.
    ///
    /// Retries transient connection failures; failing here is a fatal setup
    /// error for the whole suite.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, Error> {
        let path = kubeconfig.map(Path::to_path_buf);
        let client = retry_with_backoff(&RetryConfig::default(), "create_kube_client", || {
            let path = path.clone();
            async move { create_client(path.as_deref()).await }
        })
        .await?;
        Ok(Self::new(client))
    }

    fn machine_set_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.machine_sets)
    }
}

async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::fatal("create_client", format!("failed to read kubeconfig: {}", e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::fatal("create_client", format!("failed to load kubeconfig: {}", e))
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::fatal("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Client::try_from(config)
        .map_err(|e| Error::fatal("create_client", format!("failed to create client: {}", e)))
}

/// Map a 404 to `None` and every other error to [`Error::Kube`]
fn optional<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read `spec.replicas` from a provisioning group object
pub fn replicas_of(obj: &DynamicObject) -> Option<i32> {
    obj.data
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(|r| r.as_i64())
        .and_then(|r| i32::try_from(r).ok())
}

/// Replica count of a fetched group; absent stays `None`, unset is an error
fn replicas_from(
    obj: Option<&DynamicObject>,
    namespace: &str,
    name: &str,
) -> Result<Option<i32>, Error> {
    let Some(obj) = obj else {
        return Ok(None);
    };
    replicas_of(obj).map(Some).ok_or_else(|| {
        Error::decode(
            format!("MachineSet {}/{}", namespace, name),
            "spec.replicas is unset or not an integer",
        )
    })
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        debug!(selector = %label_selector, count = nodes.items.len(), "listed nodes");
        Ok(nodes.items)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn get_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>, Error> {
        let obj = optional(self.machine_set_api(namespace).get(name).await)?;
        replicas_from(obj.as_ref(), namespace, name)
    }

    async fn set_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "spec": { "replicas": replicas }
        });
        self.machine_set_api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                Error::fatal(
                    "set_replicas",
                    format!("failed to update {}/{}: {}", namespace, name, e),
                )
            })?;
        info!(namespace = %namespace, machine_set = %name, replicas, "updated desired replicas");
        Ok(())
    }

    async fn delete_provisioning_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error> {
        match self
            .machine_set_api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(namespace = %namespace, machine_set = %name, "deleted MachineSet");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(namespace = %namespace, machine_set = %name, "MachineSet already deleted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
