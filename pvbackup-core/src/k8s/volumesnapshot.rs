use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;

/// The `snapshot.storage.k8s.io/v1` `VolumeSnapshot` resource is not a
/// compiled `k8s-openapi` type, so it is addressed through a hand-built
/// `ApiResource` plus `Api<DynamicObject>`, the same way any other
/// out-of-tree CRD without generated bindings is.
#[must_use]
pub fn volume_snapshot_api_resource() -> ApiResource {
    ApiResource {
        group: "snapshot.storage.k8s.io".to_owned(),
        version: "v1".to_owned(),
        api_version: "snapshot.storage.k8s.io/v1".to_owned(),
        kind: "VolumeSnapshot".to_owned(),
        plural: "volumesnapshots".to_owned(),
    }
}

/// Label recording which PVC a `VolumeSnapshot` was taken of, so retention
/// listing can use a label selector instead of scanning the whole namespace
pub const LABEL_SOURCE_PVC: &str = "pvbackup.datenlord.io/source-pvc";
/// Label recording which release created a resource
pub const LABEL_RELEASE: &str = "pvbackup.datenlord.io/release";

/// Build the `DynamicObject` body for a `VolumeSnapshot` create request
#[must_use]
pub fn new_volume_snapshot(
    name: &str,
    namespace: &str,
    release_name: &str,
    source_pvc: &str,
    snapshot_class: &str,
) -> DynamicObject {
    let api_resource = volume_snapshot_api_resource();
    let mut object = DynamicObject::new(name, &api_resource);
    object.metadata.namespace = Some(namespace.to_owned());
    object.metadata.labels = Some(
        [
            (LABEL_SOURCE_PVC.to_owned(), source_pvc.to_owned()),
            (LABEL_RELEASE.to_owned(), release_name.to_owned()),
        ]
        .into_iter()
        .collect(),
    );
    object.data = serde_json::json!({
        "spec": {
            "source": { "persistentVolumeClaimName": source_pvc },
            "volumeSnapshotClassName": snapshot_class,
        }
    });
    object
}

/// Read-side projection of a `VolumeSnapshot`, matching `SnapshotRef` (§3):
/// `(name, namespace, sourcePVC, creationTimestamp, readyToUse, restoreSize)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSnapshot {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Source PVC this snapshot was taken of
    pub source_pvc: String,
    /// Object creation timestamp
    pub creation_timestamp: DateTime<Utc>,
    /// Snapshot readiness and size, when status has been populated
    pub status: Option<VolumeSnapshotStatus>,
}

/// The subset of `VolumeSnapshot.status` this crate reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeSnapshotStatus {
    /// Whether the snapshot is ready to be used as a clone source
    pub ready_to_use: bool,
    /// Size in bytes a restore from this snapshot would occupy, when reported
    pub restore_size: Option<i64>,
}

impl VolumeSnapshot {
    /// Parse a `VolumeSnapshot` `DynamicObject` into the read-side projection
    #[must_use]
    pub fn from_dynamic(object: &DynamicObject) -> Option<Self> {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        let source_pvc = object
            .data
            .get("spec")?
            .get("source")?
            .get("persistentVolumeClaimName")?
            .as_str()?
            .to_owned();
        let creation_timestamp = object
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now);
        let status = object.data.get("status").map(|status| VolumeSnapshotStatus {
            ready_to_use: status
                .get("readyToUse")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
            restore_size: status
                .get("restoreSize")
                .and_then(serde_json::Value::as_i64),
        });

        Some(Self {
            name,
            namespace,
            source_pvc,
            creation_timestamp,
            status,
        })
    }

    /// Whether this snapshot currently reports ready
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status.is_some_and(|s| s.ready_to_use)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::core::{ObjectMeta, TypeMeta};

    fn sample(ready: bool) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "snapshot.storage.k8s.io/v1".to_owned(),
                kind: "VolumeSnapshot".to_owned(),
            }),
            metadata: ObjectMeta {
                name: Some("data-2024-01-15-00-00-00".to_owned()),
                namespace: Some("ns".to_owned()),
                ..Default::default()
            },
            data: serde_json::json!({
                "spec": { "source": { "persistentVolumeClaimName": "data" } },
                "status": { "readyToUse": ready, "restoreSize": 1024 }
            }),
        }
    }

    #[test]
    fn parses_ready_snapshot() {
        let snap = VolumeSnapshot::from_dynamic(&sample(true)).unwrap();
        assert_eq!(snap.source_pvc, "data");
        assert!(snap.is_ready());
        assert_eq!(snap.status.unwrap().restore_size, Some(1024));
    }

    #[test]
    fn pending_snapshot_is_not_ready() {
        let snap = VolumeSnapshot::from_dynamic(&sample(false)).unwrap();
        assert!(!snap.is_ready());
    }
}
