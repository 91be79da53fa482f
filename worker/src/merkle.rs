//! Turns local output directories into Merkle trees in the CAS.
use std::{
    collections::{HashMap, HashSet},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use rexec_castore::{
    blobservice::{put_message, BlobService},
    proto::{Directory, DirectoryNode, FileNode, SymlinkNode, Tree},
    Digest,
};
use tracing::{instrument, Level};
use walkdir::WalkDir;

use crate::Error;

/// How file contents get into the CAS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upload {
    /// The file is adopted by the CAS and gone from its place afterwards.
    Move,
    /// The file is read and stays in place.
    Copy,
}

/// Puts the file at `path` into the CAS, returning its digest.
pub async fn upload_file(
    blob_service: &dyn BlobService,
    path: &Path,
    upload: Upload,
) -> Result<Digest, Error> {
    match upload {
        Upload::Move => {
            let digest = Digest::of_file(path).await?;
            blob_service.adopt(&digest, path).await?;
            Ok(digest)
        }
        Upload::Copy => Ok(blob_service.put(tokio::fs::read(path).await?.into()).await?),
    }
}

/// A directory and all directories below it, the directory itself first.
#[derive(Default)]
struct Subtree {
    directory: Directory,
    descendants: Vec<Directory>,
}

/// Walks the directory at `path` and uploads every file and every directory
/// found into the CAS. With [Upload::Move], files are moved away from `path`.
///
/// Returns the Directory for `path`, followed by all its descendants, parents
/// before their children. No timestamps or modes other than the executable
/// bit are recorded, so identical contents always produce identical
/// Directories.
#[instrument(skip(blob_service), ret(level = Level::TRACE), err)]
pub async fn build_tree(
    blob_service: &dyn BlobService,
    path: &Path,
    upload: Upload,
) -> Result<Vec<Directory>, Error> {
    if !tokio::fs::symlink_metadata(path).await?.is_dir() {
        return Err(Error::Internal(format!("{:?} is not a directory", path)));
    }

    // The walk yields children before their parent, sorted by name, so every
    // list in a Directory ends up sorted too.
    let walker = WalkDir::new(path)
        .follow_links(false)
        .follow_root_links(false)
        .contents_first(true)
        .sort_by_file_name();

    let mut subtrees: HashMap<PathBuf, Subtree> = HashMap::new();

    for entry in walker {
        let entry = entry.map_err(|e| Error::Internal(format!("unable to walk output: {}", e)))?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            let Subtree {
                directory,
                descendants,
            } = subtrees.remove(entry.path()).unwrap_or_default();

            let digest = put_message(blob_service, &directory).await?;

            let mut list = Vec::with_capacity(descendants.len() + 1);
            list.push(directory);
            list.extend(descendants);

            if entry.depth() == 0 {
                return Ok(list);
            }

            let parent = parent_subtree(&mut subtrees, entry.path());
            parent.directory.directories.push(DirectoryNode {
                name: entry_name(entry.path())?,
                digest: Some(digest.into()),
            });
            parent.descendants.extend(list);
        } else if file_type.is_file() {
            let is_executable = entry
                .metadata()
                .map_err(|e| Error::Internal(e.to_string()))?
                .permissions()
                .mode()
                & 0o111
                != 0;

            let digest = upload_file(blob_service, entry.path(), upload).await?;

            parent_subtree(&mut subtrees, entry.path())
                .directory
                .files
                .push(FileNode {
                    name: entry_name(entry.path())?,
                    digest: Some(digest.into()),
                    is_executable,
                    node_properties: None,
                });
        } else if file_type.is_symlink() {
            let target = tokio::fs::read_link(entry.path()).await?;

            parent_subtree(&mut subtrees, entry.path())
                .directory
                .symlinks
                .push(SymlinkNode {
                    name: entry_name(entry.path())?,
                    target: target
                        .to_str()
                        .ok_or_else(|| {
                            Error::Internal(format!(
                                "symlink target of {:?} is not valid UTF-8",
                                entry.path()
                            ))
                        })?
                        .to_owned(),
                    node_properties: None,
                });
        } else {
            return Err(Error::Internal(format!(
                "unsupported file type at {:?}",
                entry.path()
            )));
        }
    }

    Err(Error::Internal(format!("walk of {:?} ended early", path)))
}

fn parent_subtree<'a>(subtrees: &'a mut HashMap<PathBuf, Subtree>, path: &Path) -> &'a mut Subtree {
    // Entries below the root always have a parent.
    let parent = path.parent().unwrap_or(path);
    subtrees.entry(parent.to_path_buf()).or_default()
}

fn entry_name(path: &Path) -> Result<String, Error> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Error::Internal(format!("{:?} has no valid UTF-8 name", path)))
}

/// Uploads the output directory at `path` as a [Tree] message, returning the
/// digest of the Tree.
///
/// The Tree's children are de-duplicated by digest and not topologically
/// sorted.
#[instrument(skip(blob_service), err)]
pub async fn upload_output_directory(
    blob_service: &dyn BlobService,
    path: &Path,
    upload: Upload,
) -> Result<Digest, Error> {
    let mut directories = build_tree(blob_service, path, upload).await?.into_iter();
    let root = directories.next();

    let mut seen = HashSet::new();
    let children = directories
        .filter(|directory| seen.insert(directory.digest()))
        .collect();

    let tree = Tree { root, children };
    Ok(put_message(blob_service, &tree).await?)
}
