//! Filesystem layout inside the runner pod.
//!
//! Mirrors the mounts `backup-controller/src/runner_pod.rs` wires up: the
//! same constants can't be shared across binary crates, so they are kept in
//! sync by hand here.

/// Where the clone volume is mounted, read-only
pub const CLONE_MOUNT_PATH: &str = "/data";
/// Where the shared cache volume is mounted
pub const CACHE_MOUNT_PATH: &str = "/cache";
/// Default path of the mounted runner secret (see
/// `backup-controller::secret::CONFIG_SECRET_KEY` and `SECRET_MOUNT_PATH`)
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pvbackup-runner/config.yaml";
/// Pod-local ephemeral path cache-the-cache rsyncs into/out of
pub const LOCAL_CACHE_PATH: &str = "/var/tmp/pvbackup-borg-cache";
/// Path the SSH private key is written to, mode 0600
pub const SSH_KEY_PATH: &str = "/var/tmp/pvbackup-runner-id";
