use k8s_openapi::api::core::v1::{Event, Pod, PersistentVolumeClaim, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DynamicObject};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::error::{Error, Result};
use crate::k8s::volumesnapshot::volume_snapshot_api_resource;

/// Typed, namespace-scoped wrapper over the handful of cluster-API objects
/// the controllers touch.
///
/// Credential discovery follows §4.1: in-cluster service-account token
/// first, then an explicit kubeconfig path, then the default kubeconfig.
/// Failure to obtain any client is fatal at startup.
#[derive(Debug, Clone)]
pub struct K8sClient {
    client: Client,
    namespace: String,
}

impl K8sClient {
    /// Resolve cluster credentials and build a client scoped to `namespace`
    pub async fn try_new(namespace: impl Into<String>, kubeconfig_path: Option<&str>) -> Result<Self> {
        let client = match Client::try_default().await {
            Ok(client) => client,
            Err(in_cluster_err) => {
                let options = KubeConfigOptions::default();
                let config = if let Some(path) = kubeconfig_path {
                    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                        Error::Config(format!("failed to read kubeconfig {path}: {e}"))
                    })?;
                    Config::from_custom_kubeconfig(kubeconfig, &options)
                        .await
                        .map_err(|e| Error::Config(format!("failed to build config from {path}: {e}")))?
                } else {
                    Config::from_kubeconfig(&options).await.map_err(|e| {
                        Error::Config(format!(
                            "no in-cluster config ({in_cluster_err}) and no default kubeconfig: {e}"
                        ))
                    })?
                };
                Client::try_from(config).map_err(Error::Kube)?
            }
        };
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    /// The underlying typed client, for callers needing lower-level access
    /// (exec, log streaming, raw watches)
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The namespace this facade is scoped to
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Pods in the scoped namespace
    #[must_use]
    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Persistent volume claims in the scoped namespace
    #[must_use]
    pub fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Secrets in the scoped namespace
    #[must_use]
    pub fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Events in the scoped namespace
    #[must_use]
    pub fn events(&self) -> Api<Event> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Storage classes, a cluster-scoped, read-only object
    #[must_use]
    pub fn storage_classes(&self) -> Api<StorageClass> {
        Api::all(self.client.clone())
    }

    /// `VolumeSnapshot` objects in the scoped namespace, accessed as
    /// `DynamicObject` since the CRD is not a compiled `k8s-openapi` type
    #[must_use]
    pub fn volume_snapshots(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &volume_snapshot_api_resource())
    }

    /// Returns `true` if a named storage class exists
    pub async fn storage_class_exists(&self, name: &str) -> Result<bool> {
        match self.storage_classes().get(name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}
