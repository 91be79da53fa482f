use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tonic::async_trait;
use tracing::{debug, instrument};

use super::{check_adopt_size, BlobService};
use crate::{Digest, Error};

/// Mode of every blob file in the store.
///
/// Blobs are read-only so that hard links handed out by
/// [BlobService::link_to] can never be used to alter stored contents, and
/// so that changing the mode of a linked file is always visible to the
/// caller as a mismatch with this value.
pub const STORED_BLOB_MODE: u32 = 0o444;

/// A BlobService on an existing path backed by a POSIX-compliant filesystem.
///
/// It takes an existing path, builds a `tmp` directory and a `blobs`
/// directory inside of it. All blobs received are staged in that `tmp`
/// directory, then they are moved **atomically** into
/// `blobs/HASH[:2]/HASH` in a sharding style, e.g. `abcdef` gets turned into
/// `ab/abcdef`.
///
/// Because blobs are plain files, [BlobService::link_to] hard-links them and
/// [BlobService::adopt] renames the adopted file into place, so
/// materializing and collecting outputs doesn't copy any bytes as long as
/// everything lives on the same filesystem.
#[derive(Clone)]
pub struct SimpleFilesystemBlobService {
    /// Where the blobs are located on a filesystem already mounted.
    path: PathBuf,
}

impl SimpleFilesystemBlobService {
    pub async fn new(path: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&path).await?;
        tokio::fs::create_dir_all(path.join("tmp")).await?;
        tokio::fs::create_dir_all(path.join("blobs")).await?;

        Ok(Self { path })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hash = digest.hash_hex();
        self.path.join("blobs").join(&hash[..2]).join(hash)
    }

    async fn new_tempfile(&self) -> std::io::Result<async_tempfile::TempFile> {
        new_tempfile_in(self.path.join("tmp")).await
    }

    /// Makes `staged` read-only and moves it to the location of `digest`.
    async fn persist(&self, staged: &Path, digest: &Digest) -> std::io::Result<()> {
        let dst_path = self.blob_path(digest);
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::set_permissions(
            staged,
            std::fs::Permissions::from_mode(STORED_BLOB_MODE),
        )
        .await?;
        tokio::fs::rename(staged, dst_path).await
    }
}

/// Creates a temporary file inside `dir`, removed again when dropped.
pub(crate) async fn new_tempfile_in(dir: PathBuf) -> std::io::Result<async_tempfile::TempFile> {
    async_tempfile::TempFile::new_in(dir)
        .await
        .map_err(|e| match e {
            async_tempfile::Error::Io(io_error) => io_error,
            async_tempfile::Error::InvalidFile => std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "invalid or missing file specified",
            ),
            async_tempfile::Error::InvalidDirectory => std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "invalid or missing directory specified",
            ),
        })
}

#[async_trait]
impl BlobService for SimpleFilesystemBlobService {
    #[instrument(skip_all, ret, err, fields(blob.digest=%digest))]
    async fn has(&self, digest: &Digest) -> Result<bool, Error> {
        Ok(tokio::fs::try_exists(self.blob_path(digest)).await?)
    }

    #[instrument(skip_all, err, fields(blob.digest=%digest))]
    async fn get(&self, digest: &Digest) -> Result<Option<Bytes>, Error> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(data) => Ok(Some(data.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip_all, err, fields(blob.size=data.len()))]
    async fn put(&self, data: Bytes) -> Result<Digest, Error> {
        let digest = Digest::of(&data);
        if self.has(&digest).await? {
            return Ok(digest);
        }

        let mut file = self.new_tempfile().await?;
        file.write_all(&data).await?;
        file.flush().await?;
        file.sync_all().await?;

        self.persist(file.file_path(), &digest).await?;

        Ok(digest)
    }

    #[instrument(skip_all, err, fields(blob.digest=%digest, path=?path))]
    async fn adopt(&self, digest: &Digest, path: &Path) -> Result<(), Error> {
        check_adopt_size(digest, path).await?;

        if self.has(digest).await? {
            tokio::fs::remove_file(path).await?;
            return Ok(());
        }

        if let Err(e) = self.persist(path, digest).await {
            // Most likely the file lives on another filesystem, stage a copy.
            debug!(err=%e, "unable to move file into the store, copying");
            let file = self.new_tempfile().await?;
            tokio::fs::copy(path, file.file_path()).await?;
            self.persist(file.file_path(), digest).await?;
            tokio::fs::remove_file(path).await?;
        }

        Ok(())
    }

    #[instrument(skip_all, err, fields(blob.digest=%digest, dest=?dest))]
    async fn link_to(&self, digest: &Digest, dest: &Path) -> Result<bool, Error> {
        let src = self.blob_path(digest);
        if !tokio::fs::try_exists(&src).await? {
            return Ok(false);
        }

        tokio::fs::hard_link(src, dest).await?;
        Ok(true)
    }
}
