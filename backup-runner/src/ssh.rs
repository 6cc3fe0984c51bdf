//! Writes the mounted SSH private key to disk with the permissions `ssh`
//! requires and builds the `BORG_RSH` command line (§4.7).

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use pvbackup_core::error::{Error, Result};

use crate::paths::SSH_KEY_PATH;

/// Write `key` to `path` with mode 0600, truncating anything already there
pub fn write_key_at(path: &Path, key: &str) -> Result<()> {
    fs::write(path, key).map_err(Error::Load)?;
    let mut perms = fs::metadata(path).map_err(Error::Load)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms).map_err(Error::Load)?;
    Ok(())
}

/// Write `key` to the fixed [`SSH_KEY_PATH`]
pub fn write_key(key: &str) -> Result<()> {
    write_key_at(Path::new(SSH_KEY_PATH), key)
}

/// The `BORG_RSH` value for a key written at `path`: use only that key,
/// skip host-key prompts since the runner pod's host is never reused
#[must_use]
pub fn rsh_command(path: &Path) -> String {
    format!(
        "ssh -i {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
        path.display()
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writes_key_with_mode_0600() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_rsa");
        write_key_at(&path, "fake-key-material").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "fake-key-material");

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn rsh_command_pins_the_written_key() {
        let path = Path::new("/var/tmp/pvbackup-runner-id");
        let rsh = rsh_command(path);
        assert!(rsh.contains("-i /var/tmp/pvbackup-runner-id"));
        assert!(rsh.contains("StrictHostKeyChecking=no"));
    }
}
