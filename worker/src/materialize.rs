//! Places a Directory tree from the CAS onto the local filesystem.
use std::{
    collections::BTreeSet,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::Path,
};

use filetime::FileTime;
use futures::future::{BoxFuture, FutureExt};
use rexec_castore::{
    blobservice::{get_message, BlobService, STORED_BLOB_MODE},
    proto::{Directory, NodeProperties},
    Digest,
};
use tracing::{debug, instrument, warn};

use crate::errors::{parse_digest, Error};

/// How file contents are placed when materializing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LinkStrategy {
    /// Hard-link from the CAS where the CAS allows it, copy otherwise.
    /// Files are copied as well if linking fails, for example because the
    /// CAS is on a different filesystem than the destination.
    #[default]
    #[value(name = "hardlink")]
    HardLink,
    /// Always write a private copy of every file.
    Copy,
}

impl LinkStrategy {
    fn default_file_mode(&self, is_executable: bool) -> u32 {
        let mode = match self {
            LinkStrategy::HardLink => STORED_BLOB_MODE,
            LinkStrategy::Copy => 0o644,
        };
        if is_executable {
            mode | 0o111
        } else {
            mode
        }
    }
}

/// Materializes `directory` into the existing directory at `dest`.
///
/// Returns the digests that couldn't be found in the CAS. Missing blobs don't
/// stop the walk, so all of them are reported in a single pass; the tree at
/// `dest` is incomplete if the returned list is non-empty.
///
/// Declared modes and mtimes are applied once the contents are in place, for
/// directories after all of their children.
#[instrument(skip_all, err, fields(dest=?dest, strategy=?strategy))]
pub async fn materialize(
    blob_service: &dyn BlobService,
    directory: &Directory,
    dest: &Path,
    strategy: LinkStrategy,
) -> Result<Vec<Digest>, Error> {
    let mut missing = BTreeSet::new();
    materialize_into(blob_service, directory, dest, strategy, &mut missing).await?;

    if !missing.is_empty() {
        debug!(missing=missing.len(), "materialized incomplete tree");
    }
    Ok(missing.into_iter().collect())
}

fn materialize_into<'a>(
    blob_service: &'a dyn BlobService,
    directory: &'a Directory,
    dest: &'a Path,
    strategy: LinkStrategy,
    missing: &'a mut BTreeSet<Digest>,
) -> BoxFuture<'a, Result<(), Error>> {
    async move {
        for file_node in &directory.files {
            let path = dest.join(validate_name(&file_node.name)?);
            let digest = parse_digest(file_node.digest.as_ref(), "file digest")?;
            let properties = file_node.node_properties.as_ref();

            let mode = match properties.and_then(|p| p.unix_mode) {
                Some(mode) if file_node.is_executable => mode | 0o111,
                Some(mode) => mode,
                None => strategy.default_file_mode(file_node.is_executable),
            };
            let mtime = properties.and_then(|p| p.mtime.as_ref());

            // Only a file keeping the stored mode and mtime may share the
            // inode with the CAS.
            let placed = if strategy == LinkStrategy::HardLink
                && mode == STORED_BLOB_MODE
                && mtime.is_none()
            {
                match blob_service.link_to(&digest, &path).await {
                    Ok(placed) => placed,
                    // the CAS might live on another filesystem.
                    Err(e) => {
                        warn!(path=?path, err=%e, "unable to link from the CAS, copying");
                        write_blob(blob_service, &digest, &path).await?
                    }
                }
            } else {
                write_blob(blob_service, &digest, &path).await?
            };

            if !placed {
                missing.insert(digest);
                continue;
            }

            set_mode(&path, mode).await?;
            if let Some(mtime) = mtime {
                set_mtime(&path, mtime).await?;
            }
        }

        for symlink_node in &directory.symlinks {
            let path = dest.join(validate_name(&symlink_node.name)?);
            if symlink_node.target.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "symlink {} has an empty target",
                    symlink_node.name
                )));
            }
            tokio::fs::symlink(&symlink_node.target, &path).await?;
        }

        for directory_node in &directory.directories {
            let path = dest.join(validate_name(&directory_node.name)?);
            let digest = parse_digest(directory_node.digest.as_ref(), "directory digest")?;

            tokio::fs::create_dir(&path).await?;

            match get_message::<Directory, _>(blob_service, &digest).await? {
                Some(child) => {
                    materialize_into(blob_service, &child, &path, strategy, missing).await?
                }
                None => {
                    missing.insert(digest);
                }
            }
        }

        if let Some(properties) = &directory.node_properties {
            apply_directory_properties(dest, properties).await?;
        }

        Ok(())
    }
    .boxed()
}

/// Writes a private copy of the blob to `path`. Returns false if the blob
/// is missing.
async fn write_blob(
    blob_service: &dyn BlobService,
    digest: &Digest,
    path: &Path,
) -> Result<bool, Error> {
    match blob_service.get(digest).await? {
        Some(data) => {
            tokio::fs::write(path, &data).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Node names must be a single normal path component.
fn validate_name(name: &str) -> Result<&str, Error> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(Error::InvalidArgument(format!(
            "invalid node name {:?}",
            name
        )));
    }
    Ok(name)
}

/// Sets the permission bits of a freshly placed file.
///
/// A file still sharing its inode with something else (a hard link into
/// the CAS) is replaced by a private copy first, so the shared inode keeps
/// its mode.
async fn set_mode(path: &Path, mode: u32) -> Result<(), Error> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    if metadata.permissions().mode() & 0o7777 == mode {
        return Ok(());
    }

    if metadata.nlink() > 1 {
        warn!(path=?path, mode=format!("{:o}", mode), "breaking hard link to change mode");
        let data = tokio::fs::read(path).await?;
        tokio::fs::remove_file(path).await?;
        tokio::fs::write(path, &data).await?;
    }

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

async fn apply_directory_properties(path: &Path, properties: &NodeProperties) -> Result<(), Error> {
    if let Some(mode) = properties.unix_mode {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    if let Some(mtime) = &properties.mtime {
        set_mtime(path, mtime).await?;
    }
    Ok(())
}

async fn set_mtime(path: &Path, mtime: &prost_types::Timestamp) -> Result<(), Error> {
    let mtime = FileTime::from_unix_time(mtime.seconds, u32::try_from(mtime.nanos).unwrap_or(0));
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || filetime::set_file_mtime(path, mtime))
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;
    Ok(())
}

/// Stages trees from the CAS onto disk, independent of any execution.
///
/// Files are hard-linked from the CAS where possible, see
/// [LinkStrategy::HardLink].
pub struct TreeRepository<BS> {
    blob_service: BS,
}

impl<BS> TreeRepository<BS>
where
    BS: BlobService,
{
    pub fn new(blob_service: BS) -> Self {
        Self { blob_service }
    }

    /// Materializes `directory` at `path`, creating `path` if needed.
    /// Returns the digests missing from the CAS.
    #[instrument(skip_all, err, fields(path=?path))]
    pub async fn materialize_directory(
        &self,
        path: &Path,
        directory: &Directory,
    ) -> Result<Vec<Digest>, Error> {
        tokio::fs::create_dir_all(path).await?;
        materialize(&self.blob_service, directory, path, LinkStrategy::HardLink).await
    }
}
