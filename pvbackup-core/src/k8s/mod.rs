//! Cluster client facade (§4.1).

mod client;
mod volumesnapshot;

pub use client::K8sClient;
pub use volumesnapshot::{
    new_volume_snapshot, volume_snapshot_api_resource, VolumeSnapshot, VolumeSnapshotStatus,
    LABEL_RELEASE, LABEL_SOURCE_PVC,
};
