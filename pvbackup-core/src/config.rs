use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top level configuration bundle mounted into a controller pod.
///
/// One `AppConfig` is delivered per managed application; the snapshot
/// controller reads `.snapshot`, the backup controller reads `.backup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Prefix for all resources this app creates
    pub release_name: String,
    /// DNS-safe identifier, used as archive-name prefix inside the repository
    pub app_name: String,
    /// Namespace where snapshots, clones, pods and hooks live
    pub namespace: String,
    /// Cron expression consumed by the external scheduler, not by this crate
    #[serde(default)]
    pub schedule: String,
    /// Snapshot specs, consumed by the snapshot controller
    #[serde(default)]
    pub snapshot: Vec<SnapshotSpec>,
    /// Backup configuration, consumed by the backup controller
    #[serde(default)]
    pub backup: Option<BackupConfig>,
}

/// One volume's snapshot schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSpec {
    /// Source PVC to snapshot
    pub pvc: String,
    /// `VolumeSnapshotClass` to use
    pub snapshot_class: String,
    /// Archive name prefix override, defaults to `{appName}-{pvc}` when absent
    #[serde(default)]
    pub archive_prefix: Option<String>,
    /// Deadline for the snapshot to become `readyToUse`, seconds
    #[serde(default = "default_snapshot_ready_timeout_seconds")]
    pub ready_timeout_seconds: u64,
    /// Retention policy applied to this spec's own snapshots
    #[serde(default)]
    pub retention: Retention,
    /// Hooks run before the snapshot is requested
    #[serde(default)]
    pub pre_hooks: Vec<Hook>,
    /// Hooks run after the snapshot becomes ready (or fails)
    #[serde(default)]
    pub post_hooks: Vec<Hook>,
}

/// The backup section of an `AppConfig`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// One entry per volume to back up, processed in this order
    pub specs: Vec<BackupSpec>,
    /// Local cache PVC shared across runner pods in this controller run
    pub cache: CacheConfig,
    /// Repository connection details
    pub repo: RepoConfig,
    /// Image used for the runner pod
    pub pod_image: String,
    /// Whether the runner pod is privileged; defaults to true
    #[serde(default = "default_true")]
    pub privileged: bool,
    /// Retention policy applied to archives in the repository
    #[serde(default)]
    pub retention: Retention,
}

/// One volume's backup job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Human-readable name for this backup, used to build resource names
    pub name: String,
    /// Source PVC whose latest ready snapshot is cloned and backed up
    pub pvc: String,
    /// Storage class used for the clone PVC
    pub clone_storage_class: String,
    /// Archive name prefix override, defaults to `{appName}-{name}`
    #[serde(default)]
    pub archive_prefix: Option<String>,
    /// Deadline for the runner pod, seconds
    pub timeout_seconds: u64,
    /// Deadline for clone-PVC readiness, seconds
    pub clone_bind_timeout_seconds: u64,
    /// Extra flags appended to `borg create`, defaults to `--stats`
    #[serde(default)]
    pub borg_flags: Option<Vec<String>>,
    /// Hooks run before the clone/backup sequence for this spec
    #[serde(default)]
    pub pre_hooks: Vec<Hook>,
    /// Hooks run after the backup attempt for this spec, regardless of outcome
    #[serde(default)]
    pub post_hooks: Vec<Hook>,
    /// CSI drivers known to require the post-bind volume-ready grace delay;
    /// empty means "skip the wait" for every driver
    #[serde(default)]
    pub csi_volume_ready_drivers: Vec<String>,
}

/// Local cache acceleration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Name of the `ReadWriteOncePod` cache PVC mounted into every runner pod
    pub pvc_name: String,
    /// Whether to rsync the cache in/out of the pod-local path around the transfer
    #[serde(default)]
    pub cache_the_cache: bool,
}

/// Repository connection details
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfig {
    /// Repository endpoint (passed to `borg` verbatim)
    pub endpoint: String,
    /// Repository passphrase
    pub passphrase: String,
    /// SSH private key used to reach the repository endpoint
    pub ssh_key: String,
}

/// Tiered retention counts; any tier may be zero to disable it
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Retention {
    /// Number of hourly buckets to keep
    #[serde(default)]
    pub hourly: u32,
    /// Number of daily buckets to keep
    #[serde(default)]
    pub daily: u32,
    /// Number of weekly buckets to keep
    #[serde(default)]
    pub weekly: u32,
    /// Number of monthly buckets to keep
    #[serde(default)]
    pub monthly: u32,
}

/// A single pre/post hook
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    /// Target pod name
    pub pod: String,
    /// Target container name; defaults to the first container in the pod
    #[serde(default)]
    pub container: Option<String>,
    /// Command to exec, argv-style
    pub command: Vec<String>,
    /// Whether this hook may run concurrently with its siblings in the same list
    #[serde(default)]
    pub parallel: bool,
}

/// The runner secret payload (§6 "Runner secret contents"): minted by the
/// backup controller and read back by the backup runner at startup. Shared
/// between both binaries so the wire format can't drift between writer and
/// reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Repository endpoint, passed to `borg` verbatim
    pub repo: String,
    /// Repository passphrase
    pub passphrase: String,
    /// SSH private key used to reach the repository endpoint
    pub ssh_key: String,
    /// This backup's archive-name prefix
    pub archive_prefix: String,
    /// `activeDeadlineSeconds` the pod was created with, for the runner's own bookkeeping
    pub timeout_seconds: u64,
    /// Flags appended to `borg create`
    pub borg_flags: Vec<String>,
    /// Retention policy applied to this archive prefix
    pub retention: Retention,
    /// Whether to rsync the repository cache in/out of a pod-local path
    pub cache_the_cache: bool,
}

impl RunnerConfig {
    /// Load the runner secret payload from its mounted path
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }
}

fn default_true() -> bool {
    true
}

fn default_snapshot_ready_timeout_seconds() -> u64 {
    300
}

impl AppConfig {
    /// Load and validate a config bundle from a YAML file on disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that violate the invariants in §4.6/§9:
    /// missing cache PVC name, empty backup list, two specs targeting the
    /// same source PVC within one run.
    pub fn validate(&self) -> Result<()> {
        if self.release_name.is_empty() {
            return Err(Error::Config("releaseName must not be empty".to_owned()));
        }
        if self.app_name.is_empty() {
            return Err(Error::Config("appName must not be empty".to_owned()));
        }
        if self.namespace.is_empty() {
            return Err(Error::Config("namespace must not be empty".to_owned()));
        }

        let mut seen_snapshot_pvcs = HashSet::new();
        for spec in &self.snapshot {
            if spec.pvc.is_empty() {
                return Err(Error::Config("snapshot spec pvc must not be empty".to_owned()));
            }
            if !seen_snapshot_pvcs.insert(spec.pvc.as_str()) {
                return Err(Error::Config(format!(
                    "two snapshot specs target the same pvc {:?} within one run",
                    spec.pvc
                )));
            }
        }

        if let Some(backup) = &self.backup {
            if backup.cache.pvc_name.is_empty() {
                return Err(Error::Config("backup.cache.pvcName must not be empty".to_owned()));
            }
            if backup.specs.is_empty() {
                return Err(Error::Config("backup.specs must not be empty".to_owned()));
            }
            if backup.repo.endpoint.is_empty() {
                return Err(Error::Config("backup.repo.endpoint must not be empty".to_owned()));
            }
            let mut seen_backup_pvcs = HashSet::new();
            for spec in &backup.specs {
                if spec.pvc.is_empty() {
                    return Err(Error::Config(format!(
                        "backup spec {:?} has an empty pvc",
                        spec.name
                    )));
                }
                if !seen_backup_pvcs.insert(spec.pvc.as_str()) {
                    return Err(Error::Config(format!(
                        "two backup specs target the same pvc {:?} within one run",
                        spec.pvc
                    )));
                }
            }
        }

        Ok(())
    }
}

impl SnapshotSpec {
    /// The archive-name prefix this spec's retention and archive naming use
    #[must_use]
    pub fn archive_prefix(&self, app_name: &str) -> String {
        self.archive_prefix
            .clone()
            .unwrap_or_else(|| format!("{app_name}-{}", self.pvc))
    }
}

impl BackupSpec {
    /// The archive-name prefix this spec's retention and archive naming use
    #[must_use]
    pub fn archive_prefix(&self, app_name: &str) -> String {
        self.archive_prefix
            .clone()
            .unwrap_or_else(|| format!("{app_name}-{}", self.name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
releaseName: rel
appName: app
namespace: ns
schedule: "0 * * * *"
snapshot:
  - pvc: data
    snapshotClass: csi-snap
    retention:
      hourly: 24
"#
    }

    #[test]
    fn load_minimal_config() {
        let config: AppConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.snapshot[0].archive_prefix("app"), "app-data");
    }

    #[test]
    fn rejects_duplicate_snapshot_pvc() {
        let mut config: AppConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        let dup = config.snapshot[0].clone();
        config.snapshot.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_cache_pvc_name() {
        let mut config: AppConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.backup = Some(BackupConfig {
            specs: vec![BackupSpec {
                name: "b".to_owned(),
                pvc: "data".to_owned(),
                clone_storage_class: "sc".to_owned(),
                archive_prefix: None,
                timeout_seconds: 60,
                clone_bind_timeout_seconds: 60,
                borg_flags: None,
                pre_hooks: vec![],
                post_hooks: vec![],
                csi_volume_ready_drivers: vec![],
            }],
            cache: CacheConfig {
                pvc_name: String::new(),
                cache_the_cache: false,
            },
            repo: RepoConfig {
                endpoint: "repo::host".to_owned(),
                passphrase: "secret".to_owned(),
                ssh_key: "key".to_owned(),
            },
            pod_image: "img".to_owned(),
            privileged: true,
            retention: Retention::default(),
        });
        assert!(config.validate().is_err());
    }
}
