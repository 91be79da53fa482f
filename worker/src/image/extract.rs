//! Unpacks the tar stream of an exported container filesystem.
use std::{
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
};

use filetime::FileTime;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_stream::StreamExt;
use tokio_tar::{Archive, EntryType};
use tracing::{instrument, trace};

use super::ImageError;

/// Extracts the tar archive read from `reader` into the existing directory
/// `dest`.
///
/// Entry names and hard link targets are relative to `dest`. Relative
/// symlink targets are resolved from the directory containing the symlink,
/// absolute ones from `dest`, which is the root of the image. Anything
/// pointing outside of `dest`, or through a symlink extracted earlier, fails
/// the extraction with [ImageError::Escape].
///
/// Modes and mtimes are applied once the content of an entry is written.
/// Directories get theirs at the very end, deepest first, so read-only
/// directories can still be filled. Symlinks keep the defaults.
#[instrument(skip(reader), err)]
pub async fn extract<R>(reader: R, dest: &Path) -> Result<(), ImageError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut archive = Archive::new(reader);
    let mut entries = archive.entries()?;

    // (relative path, mode, mtime)
    let mut directories: Vec<(PathBuf, u32, u64)> = Vec::new();

    while let Some(mut entry) = entries.try_next().await? {
        let name: PathBuf = entry.path()?.into();
        let entry_type = entry.header().entry_type();

        if matches!(
            entry_type,
            EntryType::XGlobalHeader
                | EntryType::XHeader
                | EntryType::GNULongName
                | EntryType::GNULongLink
        ) {
            continue;
        }

        let relative = resolve(Path::new(""), &name, &name)?;
        if relative.as_os_str().is_empty() {
            // the archive root, which is `dest` itself.
            if entry_type == EntryType::Directory {
                continue;
            }
            return Err(ImageError::Escape(name));
        }
        check_ancestors(dest, &relative, &name).await?;

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mode = entry.header().mode()? & 0o7777;
        let mtime = entry.header().mtime()?;

        match entry_type {
            EntryType::Directory => {
                match tokio::fs::symlink_metadata(&target).await {
                    Ok(metadata) if metadata.is_dir() => {}
                    Ok(_) => {
                        tokio::fs::remove_file(&target).await?;
                        tokio::fs::create_dir(&target).await?;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tokio::fs::create_dir(&target).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
                directories.push((relative.clone(), mode, mtime));
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                remove_existing(&target).await?;

                let mut file = tokio::fs::File::create(&target).await?;
                tokio::io::copy(&mut entry, &mut file).await?;
                file.flush().await?;
                drop(file);

                tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode)).await?;
                set_mtime(&target, mtime).await?;
            }
            EntryType::Link => {
                let link_name = entry.link_name()?.ok_or_else(|| {
                    ImageError::UnsupportedEntry(name.clone(), "hard link without target".into())
                })?;
                let source = resolve(Path::new(""), &link_name, &name)?;
                check_ancestors(dest, &source, &name).await?;

                remove_existing(&target).await?;
                tokio::fs::hard_link(dest.join(source), &target).await?;
            }
            EntryType::Symlink => {
                let link_name = entry.link_name()?.ok_or_else(|| {
                    ImageError::UnsupportedEntry(name.clone(), "symlink without target".into())
                })?;

                if link_name.is_absolute() {
                    let below_root: PathBuf = link_name
                        .components()
                        .filter(|c| !matches!(c, Component::RootDir))
                        .collect();
                    resolve(Path::new(""), &below_root, &name)?;
                } else {
                    let parent = relative.parent().unwrap_or(Path::new(""));
                    resolve(parent, &link_name, &name)?;
                }

                remove_existing(&target).await?;
                tokio::fs::symlink(&link_name, &target).await?;
            }
            entry_type => {
                return Err(ImageError::UnsupportedEntry(
                    name,
                    format!("{:?}", entry_type),
                ))
            }
        }

        trace!(entry=?relative, "extracted");
    }

    directories.sort_by_key(|(path, _, _)| std::cmp::Reverse(path.components().count()));
    for (relative, mode, mtime) in directories {
        let target = dest.join(relative);
        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode)).await?;
        set_mtime(&target, mtime).await?;
    }

    Ok(())
}

/// Lexically resolves `path` relative to `base`, both relative to the
/// destination. `entry` names the archive entry in errors.
fn resolve(base: &Path, path: &Path, entry: &Path) -> Result<PathBuf, ImageError> {
    let mut resolved = base.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(ImageError::Escape(entry.to_path_buf()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ImageError::Escape(entry.to_path_buf()))
            }
        }
    }
    Ok(resolved)
}

/// Fails if any existing parent of `relative` below `dest` is a symlink,
/// which could redirect the write outside of `dest`.
async fn check_ancestors(dest: &Path, relative: &Path, entry: &Path) -> Result<(), ImageError> {
    let mut current = dest.to_path_buf();
    let mut components = relative.components().peekable();

    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);

        match tokio::fs::symlink_metadata(&current).await {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(ImageError::Escape(entry.to_path_buf()))
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Removes a non-directory at `path`, if there is one.
async fn remove_existing(path: &Path) -> Result<(), ImageError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Err(ImageError::UnsupportedEntry(
            path.to_path_buf(),
            "replaces a directory".into(),
        )),
        Ok(_) => Ok(tokio::fs::remove_file(path).await?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn set_mtime(path: &Path, mtime: u64) -> Result<(), ImageError> {
    let path = path.to_path_buf();
    let mtime = FileTime::from_unix_time(i64::try_from(mtime).unwrap_or(i64::MAX), 0);

    tokio::task::spawn_blocking(move || filetime::set_file_mtime(path, mtime))
        .await
        .map_err(std::io::Error::other)??;
    Ok(())
}
