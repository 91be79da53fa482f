use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};
use uuid::Uuid;

/// A uniquely named directory below the sandbox base, owned by one
/// execution.
///
/// It should be removed with [Sandbox::remove]. If it's dropped instead, for
/// example when the execution got cancelled, removal happens in the
/// background.
#[derive(Debug)]
pub struct Sandbox {
    path: PathBuf,
}

impl Sandbox {
    pub async fn create(base: &Path) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(base).await?;

        let path = base.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir(&path).await?;
        debug!(sandbox.path=?path, "created sandbox");

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the sandbox and everything in it.
    pub async fn remove(mut self) -> std::io::Result<()> {
        let path = std::mem::take(&mut self.path);
        tokio::task::spawn_blocking(move || remove_dir_all_forced(&path))
            .await
            .map_err(std::io::Error::other)?
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        // already removed
        if self.path.as_os_str().is_empty() {
            return;
        }

        let path = std::mem::take(&mut self.path);
        let remove = move || {
            if let Err(e) = remove_dir_all_forced(&path) {
                warn!(sandbox.path=?path, err=%e, "unable to remove sandbox");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

/// Removes the directory at `path` and everything below it, also if the
/// owner write permission was dropped from some of the directories.
pub(crate) fn remove_dir_all_forced(path: &Path) -> std::io::Result<()> {
    match make_removable(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }
    std::fs::remove_dir_all(path)
}

fn make_removable(path: &Path) -> std::io::Result<()> {
    let metadata = std::fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(());
    }

    let mode = metadata.permissions().mode();
    if mode & 0o700 != 0o700 {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o700))?;
    }

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            make_removable(&entry.path())?;
        }
    }
    Ok(())
}
