//! Fetches container images referenced by actions and keeps their root
//! filesystems unpacked below a base directory.
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use lazy_static::lazy_static;
use regex::Regex;
use rexec_castore::{
    proto::{Action, Command, Platform},
    Coalescer, TaskFailed,
};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::executor::remove_dir_all_forced;

mod extract;

pub use extract::extract;

/// Name of the platform property declaring the container image.
pub const CONTAINER_IMAGE_PROPERTY: &str = "container-image";

lazy_static! {
    static ref IMAGE_REFERENCE_RE: Regex =
        Regex::new(r"^docker://([a-zA-Z0-9][a-zA-Z0-9._\-/:]*)@sha256:([0-9a-f]{64})$")
            .expect("invalid image reference regex");
}

#[derive(Debug, Error, Clone)]
pub enum ImageError {
    #[error("invalid image reference {0:?}: must be docker://<name>@sha256:<hash>")]
    InvalidReference(String),

    #[error("{program} {action} failed: {stderr}")]
    Command {
        program: String,
        action: &'static str,
        stderr: String,
    },

    #[error("archive entry {0:?} points outside of the destination")]
    Escape(PathBuf),

    #[error("unsupported archive entry {0:?}: {1}")]
    UnsupportedEntry(PathBuf, String),

    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("fetch did not complete: {0}")]
    Aborted(#[from] TaskFailed),
}

impl From<std::io::Error> for ImageError {
    fn from(value: std::io::Error) -> Self {
        ImageError::Io(Arc::new(value))
    }
}

/// A container image reference pinned by its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// The reference as understood by the container tool, without the
    /// `docker://` scheme.
    pub name: String,
    /// Lowercase hex sha256 of the image.
    pub hash: String,
}

/// Parses `docker://<name>@sha256:<hash>`. References not pinned by hash
/// are rejected.
pub fn parse_image_reference(reference: &str) -> Result<ImageReference, ImageError> {
    let captures = IMAGE_REFERENCE_RE
        .captures(reference)
        .ok_or_else(|| ImageError::InvalidReference(reference.to_string()))?;

    Ok(ImageReference {
        name: format!("{}@sha256:{}", &captures[1], &captures[2]),
        hash: captures[2].to_string(),
    })
}

/// Returns the container image declared by the action, or by the command
/// for clients predating platform properties on actions.
pub fn image_url(action: &Action, command: &Command) -> Option<String> {
    fn lookup(platform: Option<&Platform>) -> Option<String> {
        platform?
            .properties
            .iter()
            .find(|property| property.name == CONTAINER_IMAGE_PROPERTY)
            .map(|property| property.value.clone())
    }

    lookup(action.platform.as_ref()).or_else(|| lookup(command.platform.as_ref()))
}

/// Keeps unpacked container images in `<base_dir>/<hash>`.
///
/// An image directory that exists is complete, it's only ever created by
/// renaming a fully extracted temporary directory into place. Images are
/// never evicted.
pub struct ImageRepository {
    base_dir: PathBuf,

    /// The container tool, `docker` by default.
    program: String,

    fetches: Coalescer<String, Result<PathBuf, ImageError>>,
}

impl ImageRepository {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            program: "docker".into(),
            fetches: Coalescer::new(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Returns the directory holding the root filesystem of the image,
    /// fetching it first if needed. Concurrent fetches of the same image
    /// share one download.
    #[instrument(skip(self), err)]
    pub async fn fetch_image(&self, reference: &str) -> Result<PathBuf, ImageError> {
        let reference = parse_image_reference(reference)?;
        let image_dir = self.base_dir.join(&reference.hash);

        if tokio::fs::try_exists(&image_dir).await? {
            debug!(image.dir=?image_dir, "image already present");
            return Ok(image_dir);
        }

        let program = self.program.clone();
        let base_dir = self.base_dir.clone();

        self.fetches
            .run(reference.hash.clone(), move || async move {
                fetch(&program, &base_dir, &reference).await
            })
            .await?
    }
}

/// Creates a container from the image, exports its filesystem into
/// `<base_dir>/<hash>` and removes the container again.
#[instrument(skip(program, base_dir), err)]
async fn fetch(
    program: &str,
    base_dir: &Path,
    reference: &ImageReference,
) -> Result<PathBuf, ImageError> {
    let image_dir = base_dir.join(&reference.hash);
    // another unit might have finished between the check and joining.
    if tokio::fs::try_exists(&image_dir).await? {
        return Ok(image_dir);
    }
    tokio::fs::create_dir_all(base_dir).await?;

    let create = tokio::process::Command::new(program)
        .args(["create", &reference.name])
        .stdin(Stdio::null())
        .output()
        .await?;
    if !create.status.success() {
        return Err(ImageError::Command {
            program: program.to_string(),
            action: "create",
            stderr: String::from_utf8_lossy(&create.stderr).trim().to_string(),
        });
    }
    let container_id = String::from_utf8_lossy(&create.stdout).trim().to_string();
    debug!(container.id=%container_id, "created container");

    let result = export(program, &container_id, base_dir, &image_dir).await;

    match tokio::process::Command::new(program)
        .args(["rm", "-f", &container_id])
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            warn!(container.id=%container_id, stderr=%String::from_utf8_lossy(&output.stderr), "unable to remove container")
        }
        Err(e) => warn!(container.id=%container_id, err=%e, "unable to remove container"),
    }

    if result.is_ok() {
        info!(image=%reference.name, image.dir=?image_dir, "fetched image");
    }
    result.map(|()| image_dir)
}

/// Streams the filesystem of the container into a temporary directory and
/// renames it to `image_dir` once complete.
async fn export(
    program: &str,
    container_id: &str,
    base_dir: &Path,
    image_dir: &Path,
) -> Result<(), ImageError> {
    let tmp_dir = base_dir.join(format!(".tmp-{}", Uuid::new_v4()));
    tokio::fs::create_dir(&tmp_dir).await?;

    let result = async {
        let mut child = tokio::process::Command::new(program)
            .args(["export", container_id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            return Err(ImageError::Io(Arc::new(std::io::Error::other(
                "container tool output not captured",
            ))));
        };

        let tmp = &tmp_dir;
        let mut stderr_buf = Vec::new();
        let (extracted, _) = tokio::join!(
            async move {
                let extracted = async {
                    extract(&mut stdout, tmp).await?;
                    // padding after the end of the archive.
                    tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await?;
                    Ok::<_, ImageError>(())
                }
                .await;
                // closes the pipe, so the tool can't block writing the rest
                // of a rejected archive.
                drop(stdout);
                extracted
            },
            stderr.read_to_end(&mut stderr_buf)
        );

        let status = child.wait().await?;
        match extracted {
            // the tool usually dies from the closed pipe then.
            Err(e @ (ImageError::Escape(_) | ImageError::UnsupportedEntry(..))) => return Err(e),
            _ if !status.success() => {
                return Err(ImageError::Command {
                    program: program.to_string(),
                    action: "export",
                    stderr: String::from_utf8_lossy(&stderr_buf).trim().to_string(),
                })
            }
            extracted => extracted?,
        }

        match tokio::fs::rename(&tmp_dir, image_dir).await {
            Ok(()) => Ok(()),
            // someone else put the image in place meanwhile.
            Err(_) if tokio::fs::try_exists(image_dir).await? => {
                let tmp_dir = tmp_dir.clone();
                let _ = tokio::task::spawn_blocking(move || remove_dir_all_forced(&tmp_dir)).await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
    .await;

    if result.is_err() {
        let tmp_dir = tmp_dir.clone();
        let _ = tokio::task::spawn_blocking(move || remove_dir_all_forced(&tmp_dir)).await;
    }
    result
}
